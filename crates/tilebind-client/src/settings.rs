//! Binding configuration discovery
//!
//! The binding configuration lives next to the user's other settings in
//! `<config_dir>/tilebind/binding.toml`. It is optional: defaults plus
//! `TILEBIND_*` environment overrides apply when it is missing.

use std::path::{Path, PathBuf};

use anyhow::Result;
use tilebind_media::BindingConfig;

const CONFIG_DIR: &str = "tilebind";
const CONFIG_FILE: &str = "binding.toml";

/// Default location of the binding configuration file
pub fn binding_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join(CONFIG_DIR).join(CONFIG_FILE))
}

/// Load the binding configuration.
///
/// An explicit path must exist. Without one the default location is used
/// when present.
pub fn load_binding_config(explicit: Option<&Path>) -> Result<BindingConfig> {
    if let Some(path) = explicit {
        if !path.exists() {
            anyhow::bail!("Config file {:?} does not exist", path);
        }
        tracing::info!("Loading binding config from {:?}", path);
        return Ok(BindingConfig::load(Some(path))?);
    }

    match binding_config_path() {
        Some(path) if path.exists() => {
            tracing::info!("Loading binding config from {:?}", path);
            Ok(BindingConfig::load(Some(&path))?)
        }
        Some(path) => {
            tracing::debug!("No config file at {:?}, using defaults", path);
            Ok(BindingConfig::load(None)?)
        }
        None => {
            tracing::warn!("Could not determine config directory");
            Ok(BindingConfig::load(None)?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_path_ends_with_binding_file() {
        if let Some(path) = binding_config_path() {
            assert!(path.ends_with("tilebind/binding.toml"));
        }
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let path = std::env::temp_dir().join("tilebind-settings-missing.toml");
        let _ = std::fs::remove_file(&path);
        assert!(load_binding_config(Some(&path)).is_err());
    }

    #[test]
    fn test_explicit_toml_file() {
        let path = std::env::temp_dir().join(format!("tilebind-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "presence_timeout_ms = 2500\n\n[backoff]\nlong_bound_ms = 400\n")
            .unwrap();

        let config = load_binding_config(Some(&path)).unwrap();
        assert_eq!(config.presence_timeout_ms, 2500);
        assert_eq!(config.backoff.long_bound_ms, 400);
        assert_eq!(config.backoff.short_bound_ms, 10);

        std::fs::remove_file(&path).unwrap();
    }
}
