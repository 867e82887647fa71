//! Error taxonomy for the comparison and clustering engine.
//!
//! Every user-visible failure is an explicit variant; panics are reserved
//! for violated internal invariants. Readers surface [`CoreError::NotFound`]
//! and [`CoreError::QualityTooLow`] directly; anything else they encounter
//! is collapsed to [`CoreError::Internal`] before leaving the engine.

use thiserror::Error;

use crate::core::types::Guid;
use crate::persist::PersistenceError;

#[derive(Error, Debug)]
pub enum CoreError {
    /// Wrong length, non-IUPAC character, malformed guid
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Unknown guid or cluster id
    #[error("not found: {0}")]
    NotFound(String),

    /// Sequence was stored but is too low-quality to participate in
    /// distances or clusters
    #[error("sequence {guid} is invalid (quality {quality:.3})")]
    QualityTooLow { guid: Guid, quality: f64 },

    /// I/O failure at the persistence port
    #[error("persistence failure: {0}")]
    Persistence(#[from] PersistenceError),

    /// Bad mask position, impossible threshold, malformed config
    #[error("configuration error: {0}")]
    Config(String),

    /// A programming invariant was violated
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Collapse internal detail before handing an error to a caller.
    ///
    /// `NotFound`, `QualityTooLow` and `InvalidInput` describe the caller's
    /// request and pass through; persistence and configuration failures
    /// describe the server and are reported opaquely.
    #[must_use]
    pub fn for_caller(self) -> Self {
        match self {
            e @ (Self::InvalidInput(_) | Self::NotFound(_) | Self::QualityTooLow { .. }) => e,
            Self::Persistence(e) => Self::Internal(format!("persistence: {e}")),
            Self::Config(msg) => Self::Internal(format!("configuration: {msg}")),
            e @ Self::Internal(_) => e,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_passes_through() {
        let e = CoreError::NotFound("g1".into()).for_caller();
        assert!(matches!(e, CoreError::NotFound(_)));
    }

    #[test]
    fn test_config_error_is_opaque_to_callers() {
        let e = CoreError::Config("threshold above ceiling".into()).for_caller();
        assert!(matches!(e, CoreError::Internal(_)));
    }
}
