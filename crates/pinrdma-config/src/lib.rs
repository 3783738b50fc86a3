//! Configuration plumbing for the pinrdma crates.
//!
//! A configuration type implements [`Config`]: it can be built from a parsed
//! TOML document, validated, and merged with a newer version where only the
//! hot-updatable fields are taken. [`ConfigManager`] holds the live snapshot.

mod manager;

pub use manager::ConfigManager;

use serde::de::DeserializeOwned;

/// Errors produced while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for `{key}`: {reason}")]
    InvalidValue { key: String, reason: String },
}

impl ConfigError {
    pub fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// A configuration section.
///
/// The provided `from_toml` goes through serde, so any
/// `DeserializeOwned` type with `#[serde(default)]` fields gets it for free.
pub trait Config: DeserializeOwned + Send + Sync + 'static {
    /// Build the configuration from a parsed TOML value.
    fn from_toml(value: &toml::Value) -> Result<Self, ConfigError> {
        Ok(<Self as serde::Deserialize>::deserialize(value.clone())?)
    }

    /// Reject configurations that would fail at run time.
    fn validate(&self) -> Result<(), ConfigError> {
        Ok(())
    }

    /// Copy the fields that may change while running from `newer`.
    fn hot_update(&mut self, newer: &Self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, Deserialize)]
    struct Sample {
        #[serde(default = "default_limit")]
        limit: u64,
        #[serde(default)]
        name: String,
    }

    fn default_limit() -> u64 {
        16
    }

    impl Config for Sample {
        fn validate(&self) -> Result<(), ConfigError> {
            if self.limit == 0 {
                return Err(ConfigError::invalid("limit", "must be positive"));
            }
            Ok(())
        }

        fn hot_update(&mut self, newer: &Self) {
            self.limit = newer.limit;
        }
    }

    #[test]
    fn test_from_toml_defaults() {
        let value: toml::Value = toml::from_str("name = \"a\"").unwrap();
        let cfg = Sample::from_toml(&value).unwrap();
        assert_eq!(cfg.limit, 16);
        assert_eq!(cfg.name, "a");
    }

    #[test]
    fn test_validate_rejects() {
        let value: toml::Value = toml::from_str("limit = 0").unwrap();
        let cfg = Sample::from_toml(&value).unwrap();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("limit"));
    }

    #[test]
    fn test_hot_update_only_touches_hot_fields() {
        let mut cur = Sample { limit: 1, name: "old".into() };
        let newer = Sample { limit: 9, name: "new".into() };
        cur.hot_update(&newer);
        assert_eq!(cur.limit, 9);
        assert_eq!(cur.name, "old");
    }
}
