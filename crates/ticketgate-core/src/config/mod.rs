//! Configuration parsing and management.
//!
//! Engine settings live in a TOML file. Every section has defaults, so an
//! empty file is a valid configuration:
//!
//! ```toml
//! [database]
//! path = "ticketgate.db"
//! busy_timeout_ms = 5000
//!
//! [redemption]
//! fare_amount = 1000
//! lookup_retries = 1
//! default_utc_offset_minutes = 0
//!
//! [transfer]
//! window_hours = 24
//!
//! [severity]
//! medium_at = 2
//! high_at = 4
//! critical_at = 6
//!
//! [[contexts]]
//! id = "unit-12"
//! utc_offset_minutes = -420
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::forensics::SeverityPolicy;

/// Largest UTC offset accepted for a context, in minutes.
const MAX_UTC_OFFSET_MINUTES: i32 = 18 * 60;

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config: {0}")]
    Io(#[source] std::io::Error),

    /// The TOML is malformed.
    #[error("failed to parse config: {0}")]
    Parse(#[source] toml::de::Error),

    /// The configuration could not be serialized.
    #[error("failed to serialize config: {0}")]
    Serialize(#[source] toml::ser::Error),

    /// A value is out of range or inconsistent.
    #[error("invalid config: {0}")]
    Validation(String),
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Storage settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Redemption policy.
    #[serde(default)]
    pub redemption: RedemptionConfig,

    /// Transfer policy.
    #[serde(default)]
    pub transfer: TransferConfig,

    /// Fraud severity thresholds.
    #[serde(default)]
    pub severity: SeverityPolicy,

    /// Registered redeeming contexts.
    #[serde(default)]
    pub contexts: Vec<ContextConfig>,
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Checks ranges and cross-field consistency.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.severity
            .validate()
            .map_err(|reason| ConfigError::Validation(format!("[severity] {reason}")))?;

        if self.transfer.window_hours == 0 {
            return Err(ConfigError::Validation(
                "[transfer] window_hours must be at least 1".to_string(),
            ));
        }

        check_offset(
            "redemption.default_utc_offset_minutes",
            self.redemption.default_utc_offset_minutes,
        )?;

        let mut seen = HashSet::new();
        for context in &self.contexts {
            if context.id.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "[[contexts]] id must not be empty".to_string(),
                ));
            }
            if !seen.insert(context.id.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "[[contexts]] duplicate id '{}'",
                    context.id
                )));
            }
            check_offset(
                &format!("contexts.{}.utc_offset_minutes", context.id),
                context.utc_offset_minutes,
            )?;
        }

        Ok(())
    }

    /// UTC offset whose local midnight starts a context's operating day.
    ///
    /// Unregistered contexts use `redemption.default_utc_offset_minutes`.
    #[must_use]
    pub fn day_offset_for(&self, context_id: &str) -> FixedOffset {
        let minutes = self
            .contexts
            .iter()
            .find(|c| c.id == context_id)
            .map_or(self.redemption.default_utc_offset_minutes, |c| c.utc_offset_minutes);

        // Validated offsets are always in range; fall back to UTC otherwise.
        FixedOffset::east_opt(minutes * 60).unwrap_or_else(|| Utc.fix())
    }
}

fn check_offset(field: &str, minutes: i32) -> Result<(), ConfigError> {
    if minutes.abs() > MAX_UTC_OFFSET_MINUTES {
        return Err(ConfigError::Validation(format!(
            "{field} = {minutes} is outside ±{MAX_UTC_OFFSET_MINUTES} minutes"
        )));
    }
    Ok(())
}

/// Storage settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Path to the `SQLite` database file.
    #[serde(default = "default_database_path")]
    pub path: PathBuf,

    /// How long a writer waits for a competing writer, in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl DatabaseConfig {
    /// Busy timeout as a [`Duration`].
    #[must_use]
    pub const fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("ticketgate.db")
}

const fn default_busy_timeout_ms() -> u64 {
    5_000
}

/// Redemption policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedemptionConfig {
    /// Fare charged per redemption, in minor currency units. Used for the
    /// operator's daily revenue total.
    #[serde(default = "default_fare_amount")]
    pub fare_amount: u64,

    /// Extra attempts for the initial ticket lookup after a transient
    /// storage failure. No other step is ever retried.
    #[serde(default = "default_lookup_retries")]
    pub lookup_retries: u32,

    /// Day-boundary offset for contexts without a registered offset.
    #[serde(default)]
    pub default_utc_offset_minutes: i32,
}

impl Default for RedemptionConfig {
    fn default() -> Self {
        Self {
            fare_amount: default_fare_amount(),
            lookup_retries: default_lookup_retries(),
            default_utc_offset_minutes: 0,
        }
    }
}

const fn default_fare_amount() -> u64 {
    1_000
}

const fn default_lookup_retries() -> u32 {
    1
}

/// Transfer policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransferConfig {
    /// Length of a transfer window in hours.
    #[serde(default = "default_window_hours")]
    pub window_hours: u32,
}

impl TransferConfig {
    /// Window length as a chrono duration.
    #[must_use]
    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.window_hours))
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            window_hours: default_window_hours(),
        }
    }
}

const fn default_window_hours() -> u32 {
    24
}

/// A registered redeeming context (vehicle, terminal).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContextConfig {
    /// Context identifier as supplied by the identity service.
    pub id: String,

    /// Offset from UTC of the context's operating timezone, in minutes.
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;
    use crate::forensics::Severity;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = EngineConfig::from_toml("").unwrap();

        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.database.path, PathBuf::from("ticketgate.db"));
        assert_eq!(config.database.busy_timeout(), Duration::from_secs(5));
        assert_eq!(config.redemption.fare_amount, 1_000);
        assert_eq!(config.redemption.lookup_retries, 1);
        assert_eq!(config.transfer.window(), chrono::Duration::hours(24));
        assert_eq!(config.severity, SeverityPolicy::default());
    }

    #[test]
    fn test_full_config_parses() {
        let toml = r#"
            [database]
            path = "/var/lib/ticketgate/tickets.db"
            busy_timeout_ms = 250

            [redemption]
            fare_amount = 1150
            lookup_retries = 2
            default_utc_offset_minutes = -420

            [transfer]
            window_hours = 12

            [severity]
            medium_at = 3
            high_at = 5
            critical_at = 8

            [[contexts]]
            id = "unit-12"
            utc_offset_minutes = -360
        "#;

        let config = EngineConfig::from_toml(toml).unwrap();

        assert_eq!(config.redemption.fare_amount, 1150);
        assert_eq!(config.transfer.window_hours, 12);
        assert_eq!(config.severity.classify(7), Severity::High);
        assert_eq!(config.day_offset_for("unit-12").local_minus_utc(), -360 * 60);
        assert_eq!(config.day_offset_for("unit-99").local_minus_utc(), -420 * 60);
    }

    #[test]
    fn test_round_trip_through_toml() {
        let mut config = EngineConfig::default();
        config.contexts.push(ContextConfig {
            id: "unit-1".to_string(),
            utc_offset_minutes: 60,
        });

        let text = config.to_toml().unwrap();
        assert_eq!(EngineConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let err = EngineConfig::from_toml("[transfer]\nwindow_days = 1\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_zero_window_rejected() {
        let err = EngineConfig::from_toml("[transfer]\nwindow_hours = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(msg) if msg.contains("window_hours")));
    }

    #[test]
    fn test_unordered_thresholds_rejected() {
        let err = EngineConfig::from_toml("[severity]\nmedium_at = 4\nhigh_at = 4\ncritical_at = 6\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(msg) if msg.contains("severity")));
    }

    #[test]
    fn test_offset_out_of_range_rejected() {
        let toml = "[[contexts]]\nid = \"unit-1\"\nutc_offset_minutes = 1200\n";
        assert!(matches!(
            EngineConfig::from_toml(toml),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_duplicate_context_rejected() {
        let toml = "[[contexts]]\nid = \"unit-1\"\n[[contexts]]\nid = \"unit-1\"\n";
        let err = EngineConfig::from_toml(toml).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(msg) if msg.contains("duplicate")));
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[redemption]\nfare_amount = 900").unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.redemption.fare_amount, 900);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = EngineConfig::from_file(Path::new("/nonexistent/ticketgate.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
