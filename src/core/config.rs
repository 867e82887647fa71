//! Server configuration.
//!
//! Deserialized from JSON supplied by the operator; every optional knob has
//! a serde default so a minimal config is a valid config.

use serde::{Deserialize, Serialize};

use crate::core::errors::CoreError;
use crate::core::types::{MixturePolicy, UncertainChar};

/// One clustering algorithm: single linkage at `threshold` SNV, with a
/// mixture policy and the uncertain-character class its statistics use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusteringConfig {
    pub name: String,

    /// Maximum SNV distance along which membership propagates
    pub threshold: u32,

    /// Characters counted as uncertain by the mixture statistics
    #[serde(default = "default_uncertain_char")]
    pub uncertain_char: UncertainChar,

    #[serde(default = "default_mixture_policy")]
    pub mixture_policy: MixturePolicy,
}

fn default_uncertain_char() -> UncertainChar {
    UncertainChar::N
}
fn default_mixture_policy() -> MixturePolicy {
    MixturePolicy::IncludeMixed
}

/// Full engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Maximum SNV distance stored in the sparse matrix
    pub snv_ceiling: u32,

    /// Sequences whose uncertain-base proportion exceeds this are flagged
    /// invalid and excluded from edges and clusters
    #[serde(default = "default_max_n_percent")]
    pub max_n_percent: f64,

    #[serde(default)]
    pub clustering: Vec<ClusteringConfig>,

    /// Significance threshold for the mixed flag
    #[serde(default = "default_mixture_alpha")]
    pub mixture_alpha: f64,

    /// Soft upper bound on expanded sequences held in RAM
    #[serde(default = "default_working_set_capacity")]
    pub working_set_capacity: usize,

    /// Enables `reset`, `server_config` and `raise_error`
    #[serde(default)]
    pub debug_mode: bool,

    #[serde(default = "default_server_name")]
    pub server_name: String,

    #[serde(default)]
    pub description: String,
}

fn default_max_n_percent() -> f64 {
    0.85
}
fn default_mixture_alpha() -> f64 {
    0.001
}
fn default_working_set_capacity() -> usize {
    10_000
}
fn default_server_name() -> String {
    "snv-server".to_string()
}

impl ServerConfig {
    /// Parse a configuration from JSON.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Config` if the JSON is malformed or the parsed
    /// values fail validation.
    pub fn from_json(json: &str) -> Result<Self, CoreError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| CoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for impossible values.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Config` naming the first offending field.
    pub fn validate(&self) -> Result<(), CoreError> {
        if !(0.0..=1.0).contains(&self.max_n_percent) {
            return Err(CoreError::Config(format!(
                "max_n_percent must lie in [0,1], got {}",
                self.max_n_percent
            )));
        }
        if !(0.0..=1.0).contains(&self.mixture_alpha) {
            return Err(CoreError::Config(format!(
                "mixture_alpha must lie in [0,1], got {}",
                self.mixture_alpha
            )));
        }
        if self.working_set_capacity == 0 {
            return Err(CoreError::Config(
                "working_set_capacity must be at least 1".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for clustering in &self.clustering {
            if clustering.name.is_empty() {
                return Err(CoreError::Config(
                    "clustering algorithm name cannot be empty".to_string(),
                ));
            }
            if !seen.insert(clustering.name.as_str()) {
                return Err(CoreError::Config(format!(
                    "duplicate clustering algorithm name '{}'",
                    clustering.name
                )));
            }
            // Edges above the ceiling are never stored, so such a threshold
            // could never be satisfied.
            if clustering.threshold > self.snv_ceiling {
                return Err(CoreError::Config(format!(
                    "clustering '{}' threshold {} exceeds snv_ceiling {}",
                    clustering.name, clustering.threshold, self.snv_ceiling
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_parses_with_defaults() {
        let config = ServerConfig::from_json(r#"{"snv_ceiling": 20}"#).unwrap();
        assert_eq!(config.snv_ceiling, 20);
        assert!(config.clustering.is_empty());
        assert!(!config.debug_mode);
        assert_eq!(config.server_name, "snv-server");
        assert!((config.max_n_percent - 0.85).abs() < f64::EPSILON);
    }

    #[test]
    fn test_full_config_parses() {
        let json = r#"{
            "snv_ceiling": 12,
            "max_n_percent": 0.3,
            "mixture_alpha": 0.01,
            "working_set_capacity": 500,
            "debug_mode": true,
            "server_name": "tb-relatedness",
            "description": "M. tuberculosis relatedness server",
            "clustering": [
                {"name": "snv12_ignore", "threshold": 12,
                 "uncertain_char": "n", "mixture_policy": "include_mixed"},
                {"name": "snv12_exclude", "threshold": 12,
                 "uncertain_char": "n_or_m", "mixture_policy": "exclude_mixed"}
            ]
        }"#;
        let config = ServerConfig::from_json(json).unwrap();
        assert_eq!(config.clustering.len(), 2);
        assert_eq!(config.clustering[1].mixture_policy, MixturePolicy::ExcludeMixed);
    }

    #[test]
    fn test_threshold_above_ceiling_rejected() {
        let json = r#"{
            "snv_ceiling": 5,
            "clustering": [{"name": "wide", "threshold": 6}]
        }"#;
        let err = ServerConfig::from_json(json).unwrap_err();
        assert!(matches!(err, CoreError::Config(_)));
    }

    #[test]
    fn test_duplicate_algorithm_name_rejected() {
        let json = r#"{
            "snv_ceiling": 5,
            "clustering": [
                {"name": "a", "threshold": 1},
                {"name": "a", "threshold": 2}
            ]
        }"#;
        assert!(ServerConfig::from_json(json).is_err());
    }

    #[test]
    fn test_bad_proportion_rejected() {
        let err = ServerConfig::from_json(r#"{"snv_ceiling": 5, "max_n_percent": 1.5}"#);
        assert!(err.is_err());
    }
}
