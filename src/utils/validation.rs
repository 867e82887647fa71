//! Centralized validation helpers.

use crate::core::errors::CoreError;

/// Maximum accepted guid length
pub const MAX_GUID_LENGTH: usize = 128;

/// Check whether a string is usable as a guid.
///
/// Guids are opaque to the engine but become path components of
/// persistence keys, so the separator and whitespace are forbidden.
#[must_use]
pub fn is_valid_guid(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= MAX_GUID_LENGTH
        && s.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Validate a guid supplied with an insert payload.
///
/// # Errors
///
/// Returns `CoreError::InvalidInput` naming the problem.
pub fn validate_guid(s: &str) -> Result<(), CoreError> {
    if s.is_empty() {
        return Err(CoreError::InvalidInput("guid cannot be empty".to_string()));
    }
    if s.len() > MAX_GUID_LENGTH {
        return Err(CoreError::InvalidInput(format!(
            "guid exceeds {MAX_GUID_LENGTH} characters"
        )));
    }
    if !is_valid_guid(s) {
        return Err(CoreError::InvalidInput(format!(
            "guid '{s}' contains characters outside [A-Za-z0-9._-]"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_typical_guids() {
        assert!(is_valid_guid("e1b9c47e-6a0d-4f2b-9f3e-000000000001"));
        assert!(is_valid_guid("sample_07.v2"));
    }

    #[test]
    fn test_rejects_bad_guids() {
        assert!(!is_valid_guid(""));
        assert!(!is_valid_guid("has space"));
        assert!(!is_valid_guid("key/injection"));
        assert!(!is_valid_guid(&"x".repeat(MAX_GUID_LENGTH + 1)));
    }

    #[test]
    fn test_validate_guid_error_kind() {
        assert!(matches!(validate_guid("a/b"), Err(CoreError::InvalidInput(_))));
        assert!(validate_guid("fine-1").is_ok());
    }
}
