//! Engine configuration.
//!
//! # Responsibility
//! - Hold tunables shared by every collection engine in the process.
//! - Load them from JSON with per-field defaults.
//!
//! # Invariants
//! - A config that passed `validate` has a non-empty owner field.

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};

pub const DEFAULT_THROTTLE_WINDOW_MS: u64 = 1_000;
pub const DEFAULT_OWNER_FIELD: &str = "owner_uid";

/// Configuration parse/validation errors.
#[derive(Debug)]
pub enum ConfigError {
    Parse(serde_json::Error),
    Invalid(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parse(err) => write!(f, "invalid engine config: {err}"),
            Self::Invalid(message) => write!(f, "invalid engine config: {message}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Parse(err) => Some(err),
            Self::Invalid(_) => None,
        }
    }
}

/// Tunables for `SyncEngine` and `SyncService`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Minimum time since the last completed reconciliation before a remote
    /// change notification may start another one.
    pub throttle_window_ms: u64,
    /// Document field carrying the owning user's id on the remote side.
    pub owner_field: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            throttle_window_ms: DEFAULT_THROTTLE_WINDOW_MS,
            owner_field: DEFAULT_OWNER_FIELD.to_string(),
        }
    }
}

impl EngineConfig {
    /// Parses and validates a JSON config. Missing fields take defaults.
    pub fn from_json_str(value: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(value).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.owner_field.trim().is_empty() {
            return Err(ConfigError::Invalid("owner_field cannot be empty".to_string()));
        }
        Ok(())
    }

    /// Whether a remote change arriving `elapsed_ms` after the last
    /// completed reconciliation falls inside the throttle window.
    pub fn throttles(&self, elapsed_ms: i64) -> bool {
        u64::try_from(elapsed_ms).map_or(true, |elapsed| elapsed <= self.throttle_window_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::{ConfigError, EngineConfig, DEFAULT_OWNER_FIELD};

    #[test]
    fn missing_fields_take_defaults() {
        let config = EngineConfig::from_json_str(r#"{"throttle_window_ms": 250}"#).unwrap();
        assert_eq!(config.throttle_window_ms, 250);
        assert_eq!(config.owner_field, DEFAULT_OWNER_FIELD);
    }

    #[test]
    fn changes_inside_the_window_or_from_the_past_are_throttled() {
        let config = EngineConfig::default();
        assert!(config.throttles(0));
        assert!(config.throttles(1_000));
        assert!(!config.throttles(1_001));
        assert!(config.throttles(-5));
    }

    #[test]
    fn blank_owner_field_is_rejected() {
        let err = EngineConfig::from_json_str(r#"{"owner_field": "  "}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let err = EngineConfig::from_json_str("{").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
