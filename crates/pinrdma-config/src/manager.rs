use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::{Config, ConfigError};

/// Holds the live configuration and swaps it atomically on update.
///
/// Readers take a cheap snapshot with [`get`](Self::get); sessions that are
/// already running keep the snapshot they started with.
pub struct ConfigManager<T: Config> {
    config: ArcSwap<T>,
    path: Option<PathBuf>,
}

impl<T: Config> ConfigManager<T> {
    pub fn new(config: T) -> Self {
        Self {
            config: ArcSwap::from_pointee(config),
            path: None,
        }
    }

    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let config = read_file::<T>(path)?;
        tracing::info!(path = %path.display(), "config loaded");
        Ok(Self {
            config: ArcSwap::from_pointee(config),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn get(&self) -> Arc<T> {
        self.config.load_full()
    }
}

impl<T: Config + Clone> ConfigManager<T> {
    /// Re-read the backing file and apply its hot-updatable fields.
    ///
    /// A manager created with [`new`](Self::new) has no file; reload is a no-op.
    pub fn reload(&self) -> Result<(), ConfigError> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        let newer = read_file::<T>(path)?;
        let mut current = (*self.config.load_full()).clone();
        current.hot_update(&newer);
        self.config.store(Arc::new(current));
        tracing::info!(path = %path.display(), "config reloaded");
        Ok(())
    }
}

fn read_file<T: Config>(path: &Path) -> Result<T, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let value: toml::Value = toml::from_str(&content)?;
    let config = T::from_toml(&value)?;
    config.validate()?;
    Ok(config)
}
