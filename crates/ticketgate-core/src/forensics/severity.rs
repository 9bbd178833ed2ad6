//! Severity classification for repeated redemption attempts.

use std::fmt;
use std::str::FromStr;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

/// How alarming a fraud attempt is, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// First offence for the holder.
    Low,
    /// A few repeat attempts.
    Medium,
    /// Persistent reuse.
    High,
    /// Systematic reuse; operators should act.
    Critical,
}

impl Severity {
    /// Returns the persisted string form.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            _ => Err(format!("invalid severity: {s}")),
        }
    }
}

impl ToSql for Severity {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Severity {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

/// Holder-attempt thresholds at which severity escalates.
///
/// Each threshold is the smallest inclusive attempt count that reaches the
/// level. With the defaults, one attempt is `low`, two or three are
/// `medium`, four or five are `high` and six or more are `critical`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SeverityPolicy {
    /// Attempts needed for [`Severity::Medium`].
    #[serde(default = "default_medium_at")]
    pub medium_at: u64,

    /// Attempts needed for [`Severity::High`].
    #[serde(default = "default_high_at")]
    pub high_at: u64,

    /// Attempts needed for [`Severity::Critical`].
    #[serde(default = "default_critical_at")]
    pub critical_at: u64,
}

const fn default_medium_at() -> u64 {
    2
}

const fn default_high_at() -> u64 {
    4
}

const fn default_critical_at() -> u64 {
    6
}

impl Default for SeverityPolicy {
    fn default() -> Self {
        Self {
            medium_at: default_medium_at(),
            high_at: default_high_at(),
            critical_at: default_critical_at(),
        }
    }
}

impl SeverityPolicy {
    /// Classifies an inclusive holder attempt count.
    #[must_use]
    pub const fn classify(&self, holder_attempts: u64) -> Severity {
        if holder_attempts >= self.critical_at {
            Severity::Critical
        } else if holder_attempts >= self.high_at {
            Severity::High
        } else if holder_attempts >= self.medium_at {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    /// Checks that thresholds are positive and strictly ascending.
    ///
    /// # Errors
    ///
    /// Returns a description of the first violated rule.
    pub fn validate(&self) -> Result<(), String> {
        if self.medium_at == 0 {
            return Err("severity.medium_at must be at least 1".to_string());
        }
        if self.medium_at >= self.high_at || self.high_at >= self.critical_at {
            return Err(format!(
                "severity thresholds must be strictly ascending (got {}, {}, {})",
                self.medium_at, self.high_at, self.critical_at
            ));
        }
        Ok(())
    }
}
