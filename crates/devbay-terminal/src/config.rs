//! Configuration for the terminal session registry

use serde::{Deserialize, Serialize};
use thiserror::Error;

const fn default_max_sessions_per_project() -> usize {
    3
}

const fn default_max_sessions_per_user() -> usize {
    8
}

/// Terminal registry configuration is out of range
#[derive(Debug, Clone, Error)]
#[error("invalid terminal configuration: {message}")]
pub struct ConfigError {
    /// What is wrong with the configuration
    pub message: String,
}

impl ConfigError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Session cap configuration for the terminal registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalConfig {
    /// Maximum concurrent sessions per project
    #[serde(default = "default_max_sessions_per_project")]
    pub max_sessions_per_project: usize,

    /// Maximum concurrent sessions per user, across all their projects
    #[serde(default = "default_max_sessions_per_user")]
    pub max_sessions_per_user: usize,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            max_sessions_per_project: default_max_sessions_per_project(),
            max_sessions_per_user: default_max_sessions_per_user(),
        }
    }
}

impl TerminalConfig {
    /// Load configuration from `DEVBAY_*` environment variables, falling back
    /// to defaults for anything unset.
    ///
    /// # Errors
    ///
    /// Fails if a variable is present but malformed, or if the resulting
    /// configuration fails [`validate`](Self::validate).
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = env_var("DEVBAY_MAX_SESSIONS_PER_PROJECT") {
            config.max_sessions_per_project = v.parse().map_err(|_| {
                ConfigError::new(format!("invalid DEVBAY_MAX_SESSIONS_PER_PROJECT: {v}"))
            })?;
        }
        if let Some(v) = env_var("DEVBAY_MAX_SESSIONS_PER_USER") {
            config.max_sessions_per_user = v.parse().map_err(|_| {
                ConfigError::new(format!("invalid DEVBAY_MAX_SESSIONS_PER_USER: {v}"))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Fails when either cap is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_sessions_per_project == 0 {
            return Err(ConfigError::new("max_sessions_per_project must be > 0"));
        }
        if self.max_sessions_per_user == 0 {
            return Err(ConfigError::new("max_sessions_per_user must be > 0"));
        }
        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = TerminalConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_sessions_per_project, 3);
        assert_eq!(config.max_sessions_per_user, 8);
    }

    #[test]
    fn test_validation_rejects_zero_caps() {
        let bad = TerminalConfig {
            max_sessions_per_project: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        let bad = TerminalConfig {
            max_sessions_per_user: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = TerminalConfig {
            max_sessions_per_project: 5,
            max_sessions_per_user: 12,
        };
        let toml_str = toml::to_string(&config).expect("serialize");
        let parsed: TerminalConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.max_sessions_per_project, 5);
        assert_eq!(parsed.max_sessions_per_user, 12);
    }
}
