mod types;

pub use types::*;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Returns the config directory, e.g. ~/.config/rotor/ on Linux.
pub fn config_dir() -> Result<PathBuf> {
    let dir = dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?
        .join("rotor");
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Returns the config file path inside [`config_dir`].
pub fn config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

/// Reads and validates the config at `path`. `None` if there is no file.
pub fn load_from(path: &Path) -> Result<Option<AppConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Could not read {}", path.display()))?;
    let config: AppConfig = toml::from_str(&contents)
        .with_context(|| format!("Invalid config at {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Rejected config at {}", path.display()))?;
    Ok(Some(config))
}

/// Writes `config` to `path` after validating it.
pub fn save_to(config: &AppConfig, path: &Path) -> Result<()> {
    config.validate().context("Refusing to save an invalid config")?;
    let contents = toml::to_string_pretty(config)?;
    std::fs::write(path, contents)
        .with_context(|| format!("Could not write {}", path.display()))?;
    Ok(())
}

/// Loads the user's config.
pub fn load_config() -> Result<AppConfig> {
    load_or_init(&config_path()?)
}

/// Loads the config at `path`. When there is no file yet the defaults are
/// written out so they can be edited, and returned. An existing file is
/// never rewritten.
pub fn load_or_init(path: &Path) -> Result<AppConfig> {
    match load_from(path)? {
        Some(config) => {
            info!(?path, "Loaded config");
            Ok(config)
        }
        None => {
            let config = AppConfig::default();
            match save_to(&config, path) {
                Ok(()) => info!(?path, "No config found, wrote defaults"),
                Err(e) => warn!(?e, "No config found, using defaults"),
            }
            Ok(config)
        }
    }
}
