//! Connection and retry configuration.
//!
//! [`CheckpointConfig`] is built programmatically or parsed from a string
//! key-value map via [`from_properties`](CheckpointConfig::from_properties).
//!
//! # Keys
//!
//! | Key                    | Required | Default |
//! |------------------------|----------|---------|
//! | `url`                  | yes      |         |
//! | `database.name`        | yes      |         |
//! | `stream.identifier`    | yes      |         |
//! | `conflict.max.retries` | no       | `3`     |
//! | `conflict.backoff.ms`  | no       | `0`     |
//! | `connect.timeout.ms`   | no       | `10000` |

use std::collections::HashMap;
use std::time::Duration;

use crate::engine::ConflictRetryPolicy;
use crate::error::CheckpointError;

/// Settings consumed at connect time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointConfig {
    /// Storage connection URL.
    pub url: String,

    /// Database holding the checkpoint records. Must be non-empty.
    pub database_name: String,

    /// Stream identifier whose checkpoint this process advances.
    pub stream_identifier: String,

    /// Conflict retries after the first attempt.
    pub max_conflict_retries: u32,

    /// Sleep between conflict retries.
    pub conflict_backoff: Duration,

    /// Connection establishment timeout.
    pub connect_timeout: Duration,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            database_name: String::new(),
            stream_identifier: String::new(),
            max_conflict_retries: 3,
            conflict_backoff: Duration::ZERO,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl CheckpointConfig {
    /// Creates a config with default retry settings.
    #[must_use]
    pub fn new(
        url: impl Into<String>,
        database_name: impl Into<String>,
        stream_identifier: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            database_name: database_name.into(),
            stream_identifier: stream_identifier.into(),
            ..Default::default()
        }
    }

    /// Parses a config from string properties.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Configuration`] if a required key is
    /// missing, a value does not parse, or [`validate`](Self::validate) fails.
    #[allow(clippy::field_reassign_with_default)]
    pub fn from_properties(props: &HashMap<String, String>) -> Result<Self, CheckpointError> {
        let require = |key: &str| {
            props
                .get(key)
                .cloned()
                .ok_or_else(|| CheckpointError::Configuration(format!("missing required config: {key}")))
        };
        let parse_u64 = |key: &str, v: &str| {
            v.parse::<u64>().map_err(|_| {
                CheckpointError::Configuration(format!("invalid {key}: '{v}'"))
            })
        };

        let mut cfg = Self::default();
        cfg.url = require("url")?;
        cfg.database_name = require("database.name")?;
        cfg.stream_identifier = require("stream.identifier")?;

        if let Some(v) = props.get("conflict.max.retries") {
            cfg.max_conflict_retries = v.parse().map_err(|_| {
                CheckpointError::Configuration(format!("invalid conflict.max.retries: '{v}'"))
            })?;
        }
        if let Some(v) = props.get("conflict.backoff.ms") {
            cfg.conflict_backoff = Duration::from_millis(parse_u64("conflict.backoff.ms", v)?);
        }
        if let Some(v) = props.get("connect.timeout.ms") {
            cfg.connect_timeout = Duration::from_millis(parse_u64("connect.timeout.ms", v)?);
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Checks the connect-time preconditions.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Configuration`] if the database name or
    /// stream identifier is empty.
    pub fn validate(&self) -> Result<(), CheckpointError> {
        if self.database_name.trim().is_empty() {
            return Err(CheckpointError::Configuration(
                "database name is not defined".into(),
            ));
        }
        if self.stream_identifier.is_empty() {
            return Err(CheckpointError::Configuration(
                "stream identifier is not defined".into(),
            ));
        }
        Ok(())
    }

    /// Returns the retry policy described by this config.
    #[must_use]
    pub fn retry_policy(&self) -> ConflictRetryPolicy {
        ConflictRetryPolicy::new(self.max_conflict_retries, self.conflict_backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn required() -> Vec<(&'static str, &'static str)> {
        vec![
            ("url", "postgres://ingest@localhost"),
            ("database.name", "indexer"),
            ("stream.identifier", "chain-a"),
        ]
    }

    #[test]
    fn test_defaults() {
        let cfg = CheckpointConfig::new("memory://", "db", "s");
        assert_eq!(cfg.max_conflict_retries, 3);
        assert_eq!(cfg.conflict_backoff, Duration::ZERO);
        assert_eq!(cfg.connect_timeout, Duration::from_secs(10));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_from_properties_required_only() {
        let cfg = CheckpointConfig::from_properties(&props(&required())).unwrap();
        assert_eq!(cfg.url, "postgres://ingest@localhost");
        assert_eq!(cfg.database_name, "indexer");
        assert_eq!(cfg.stream_identifier, "chain-a");
        assert_eq!(cfg.max_conflict_retries, 3);
    }

    #[test]
    fn test_from_properties_all_keys() {
        let mut pairs = required();
        pairs.extend([
            ("conflict.max.retries", "5"),
            ("conflict.backoff.ms", "25"),
            ("connect.timeout.ms", "1500"),
        ]);
        let cfg = CheckpointConfig::from_properties(&props(&pairs)).unwrap();
        assert_eq!(cfg.max_conflict_retries, 5);
        assert_eq!(cfg.conflict_backoff, Duration::from_millis(25));
        assert_eq!(cfg.connect_timeout, Duration::from_millis(1500));

        let policy = cfg.retry_policy();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.max_attempts(), 6);
    }

    #[test]
    fn test_from_properties_missing_key() {
        let mut pairs = required();
        pairs.retain(|(k, _)| *k != "database.name");
        let err = CheckpointConfig::from_properties(&props(&pairs)).unwrap_err();
        assert!(matches!(err, CheckpointError::Configuration(_)));
        assert!(err.to_string().contains("database.name"));
    }

    #[test]
    fn test_from_properties_bad_number() {
        let mut pairs = required();
        pairs.push(("conflict.max.retries", "lots"));
        let err = CheckpointConfig::from_properties(&props(&pairs)).unwrap_err();
        assert!(err.to_string().contains("conflict.max.retries"));
    }

    #[test]
    fn test_empty_database_name_rejected() {
        let cfg = CheckpointConfig::new("postgres://localhost", "", "s");
        assert!(matches!(
            cfg.validate(),
            Err(CheckpointError::Configuration(_))
        ));

        let cfg = CheckpointConfig::new("postgres://localhost", "  ", "s");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_empty_identifier_rejected() {
        let cfg = CheckpointConfig::new("postgres://localhost", "db", "");
        assert!(cfg.validate().is_err());
    }
}
