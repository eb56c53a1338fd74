//! Runtime Configuration
//!
//! The engine has very little to configure: how defects are handled in
//! release builds and whether every notification is traced. The
//! configuration is installed once per process and read through
//! [`current`]. If nothing is installed the defaults apply.

use std::str::FromStr;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable selecting the [`DefectPolicy`].
pub const DEFECT_POLICY_ENV: &str = "TRELLIS_DEFECT_POLICY";

/// Environment variable enabling notification tracing.
pub const TRACE_NOTIFICATIONS_ENV: &str = "TRELLIS_TRACE_NOTIFICATIONS";

/// What to do with a defect outside of debug builds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefectPolicy {
    /// Log at error level and ignore the offending operation.
    #[default]
    Log,

    /// Panic, as debug builds do.
    Panic,
}

impl FromStr for DefectPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "log" => Ok(Self::Log),
            "panic" => Ok(Self::Panic),
            _ => Err(ConfigError::InvalidValue {
                key: DEFECT_POLICY_ENV,
                value: s.to_string(),
            }),
        }
    }
}

/// Process-wide engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub defect_policy: DefectPolicy,

    /// Emit a `trace` event for every notification a node forwards.
    pub trace_notifications: bool,
}

impl RuntimeConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Build a configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup(DEFECT_POLICY_ENV) {
            config.defect_policy = value.parse()?;
        }

        if let Some(value) = lookup(TRACE_NOTIFICATIONS_ENV) {
            config.trace_notifications = match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" | "" => false,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: TRACE_NOTIFICATIONS_ENV,
                        value,
                    })
                }
            };
        }

        Ok(config)
    }
}

/// Errors raised while loading or installing a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },

    #[error("runtime configuration is already installed")]
    AlreadyInstalled,
}

static CONFIG: OnceLock<RuntimeConfig> = OnceLock::new();

/// Install the process-wide configuration.
///
/// Fails if a configuration was already installed or if [`current`] was
/// called before, which locks in the defaults.
pub fn install(config: RuntimeConfig) -> Result<(), ConfigError> {
    CONFIG.set(config).map_err(|_| ConfigError::AlreadyInstalled)?;
    tracing::debug!(config = ?current(), "runtime configuration installed");
    Ok(())
}

/// The active configuration.
pub fn current() -> &'static RuntimeConfig {
    CONFIG.get_or_init(RuntimeConfig::default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_fields_default_when_missing() {
        let config = RuntimeConfig::from_json_str("{}").unwrap();
        assert_eq!(config, RuntimeConfig::default());

        let config = RuntimeConfig::from_json_str(r#"{"defect_policy": "panic"}"#).unwrap();
        assert_eq!(config.defect_policy, DefectPolicy::Panic);
        assert!(!config.trace_notifications);
    }

    #[test]
    fn invalid_json_is_rejected() {
        let err = RuntimeConfig::from_json_str(r#"{"defect_policy": "explode"}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Json(_)));
    }

    #[test]
    fn lookup_reads_both_keys() {
        let config = RuntimeConfig::from_lookup(|key| match key {
            DEFECT_POLICY_ENV => Some("Panic".to_string()),
            TRACE_NOTIFICATIONS_ENV => Some("yes".to_string()),
            _ => None,
        })
        .unwrap();

        assert_eq!(config.defect_policy, DefectPolicy::Panic);
        assert!(config.trace_notifications);
    }

    #[test]
    fn lookup_rejects_unknown_values() {
        let err = RuntimeConfig::from_lookup(|key| {
            (key == TRACE_NOTIFICATIONS_ENV).then(|| "maybe".to_string())
        })
        .unwrap_err();

        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: TRACE_NOTIFICATIONS_ENV,
                ..
            }
        ));
    }

    #[test]
    fn round_trips_through_json() {
        let config = RuntimeConfig {
            defect_policy: DefectPolicy::Panic,
            trace_notifications: true,
        };
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(RuntimeConfig::from_json_str(&json).unwrap(), config);
    }
}
