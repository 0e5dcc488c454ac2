//! Binding configuration
//!
//! Defaults, overridden by an optional settings file, overridden by
//! `TILEBIND_*` environment variables.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{BindingError, Result};

const ENV_PREFIX: &str = "TILEBIND";

/// Parameters of the full-jitter backoff used while waiting for a track to
/// report its dimensions
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackoffConfig {
    /// Minimum wait added to every retry
    pub fixed_wait_ms: u64,
    /// Ceiling of the random component on the first retry
    pub short_bound_ms: u64,
    /// Largest the random component's ceiling may grow to
    pub long_bound_ms: u64,
    /// Give up after this many retries. `None` retries until the track ends.
    pub max_attempts: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            fixed_wait_ms: 0,
            short_bound_ms: 10,
            long_bound_ms: 1000,
            max_attempts: Some(20),
        }
    }
}

impl BackoffConfig {
    pub fn fixed_wait(&self) -> Duration {
        Duration::from_millis(self.fixed_wait_ms)
    }

    pub fn short_bound(&self) -> Duration {
        Duration::from_millis(self.short_bound_ms)
    }

    pub fn long_bound(&self) -> Duration {
        Duration::from_millis(self.long_bound_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.short_bound_ms == 0 {
            return Err(BindingError::InvalidConfig(
                "backoff.short_bound_ms must be greater than zero".to_string(),
            ));
        }
        if self.short_bound_ms > self.long_bound_ms {
            return Err(BindingError::InvalidConfig(format!(
                "backoff.short_bound_ms ({}) exceeds backoff.long_bound_ms ({})",
                self.short_bound_ms, self.long_bound_ms
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BindingConfig {
    /// How long to wait for a presence event carrying the attendee's
    /// external user id before leaving the tile unbound
    pub presence_timeout_ms: u64,
    pub backoff: BackoffConfig,
}

impl Default for BindingConfig {
    fn default() -> Self {
        Self {
            presence_timeout_ms: 10_000,
            backoff: BackoffConfig::default(),
        }
    }
}

impl BindingConfig {
    pub fn presence_timeout(&self) -> Duration {
        Duration::from_millis(self.presence_timeout_ms)
    }

    /// Load configuration from an optional file plus the environment.
    ///
    /// A missing file is not an error. Environment variables use the
    /// `TILEBIND_` prefix and `__` between nested keys, e.g.
    /// `TILEBIND_BACKOFF__MAX_ATTEMPTS=5`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Self::default())?);

        if let Some(path) = path {
            tracing::debug!("Reading binding settings from {:?}", path);
            builder = builder.add_source(config::File::from(path).required(false));
        }

        let loaded: Self = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        loaded.validate()?;

        if loaded.backoff.max_attempts.is_none() {
            tracing::warn!(
                "backoff.max_attempts is unset; tracks that never report dimensions will retry until they end"
            );
        }

        Ok(loaded)
    }

    pub fn validate(&self) -> Result<()> {
        self.backoff.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_defaults_are_valid() {
        let config = BindingConfig::default();
        assert_ok!(config.validate());
        assert_eq!(config.presence_timeout(), Duration::from_secs(10));
        assert_eq!(config.backoff.max_attempts, Some(20));
    }

    #[test]
    fn test_rejects_inverted_bounds() {
        let backoff = BackoffConfig {
            short_bound_ms: 500,
            long_bound_ms: 100,
            ..Default::default()
        };
        assert_err!(backoff.validate());

        let zero = BackoffConfig {
            short_bound_ms: 0,
            ..Default::default()
        };
        assert_err!(zero.validate());
    }

    #[test]
    fn test_load_from_file() {
        let dir = std::env::temp_dir().join(format!("tilebind-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("binding.json");
        std::fs::write(
            &path,
            r#"{ "presence_timeout_ms": 2500, "backoff": { "long_bound_ms": 400 } }"#,
        )
        .unwrap();

        let config = BindingConfig::load(Some(&path)).unwrap();
        assert_eq!(config.presence_timeout_ms, 2500);
        assert_eq!(config.backoff.long_bound_ms, 400);
        // Untouched keys keep their defaults
        assert_eq!(config.backoff.short_bound_ms, 10);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let path = std::env::temp_dir().join("tilebind-does-not-exist.toml");
        let config = BindingConfig::load(Some(&path)).unwrap();
        assert_eq!(config, BindingConfig::default());
    }
}
