//! Gateway configuration and on-disk layout
//!
//! The TOML config lives at `$XDG_CONFIG_HOME/tether/config.toml` unless
//! `--config` points elsewhere. Runtime state (the session database and the
//! audit log) lives under `$XDG_STATE_HOME/tether`, falling back to the local
//! data directory on platforms without a state dir.

pub mod schema;

pub use schema::Config;

use crate::error::{TetherError, TetherResult};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Reads and writes one gateway config file
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    pub fn new() -> Self {
        Self {
            config_path: Self::default_config_path(),
        }
    }

    /// Use the file given by `--config` or `TETHER_CONFIG`
    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tether")
            .join("config.toml")
    }

    /// Directory holding the session database and audit log
    pub fn state_dir() -> PathBuf {
        dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tether")
    }

    pub fn default_store_path() -> PathBuf {
        Self::state_dir().join("sessions.db")
    }

    /// `[store] path` if set, otherwise `sessions.db` in the state directory
    pub fn store_path(config: &Config) -> PathBuf {
        config
            .store
            .path
            .clone()
            .unwrap_or_else(Self::default_store_path)
    }

    pub fn audit_log_path() -> PathBuf {
        Self::state_dir().join("audit.log")
    }

    /// Read the gateway config; a missing file means every default applies
    pub async fn load(&self) -> TetherResult<Config> {
        match fs::read_to_string(&self.config_path).await {
            Ok(content) => self.parse(&self.config_path, &content),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.config_path.display(), "No config file, using defaults");
                Ok(Config::default())
            }
            Err(e) => Err(TetherError::io(
                format!("reading config from {}", self.config_path.display()),
                e,
            )),
        }
    }

    fn parse(&self, path: &Path, content: &str) -> TetherResult<Config> {
        toml::from_str(content).map_err(|e| TetherError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Write `config` as TOML, creating the tether config directory first
    pub async fn save(&self, config: &Config) -> TetherResult<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| TetherError::ConfigDirCreate {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }

        let content = toml::to_string_pretty(config)?;
        fs::write(&self.config_path, content).await.map_err(|e| {
            TetherError::io(
                format!("writing config to {}", self.config_path.display()),
                e,
            )
        })?;

        info!(path = %self.config_path.display(), "Gateway config written");
        Ok(())
    }

    /// Create the state directory before the store or audit log opens
    pub async fn ensure_state_dirs() -> TetherResult<()> {
        let dir = Self::state_dir();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| TetherError::io(format!("creating directory {}", dir.display()), e))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_default_when_missing() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nonexistent.toml");
        let manager = ConfigManager::with_path(path);

        let config = manager.load().await.unwrap();
        assert_eq!(config.retry.max_attempts, 100);
    }

    #[tokio::test]
    async fn save_and_load_roundtrip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("config.toml");
        let manager = ConfigManager::with_path(path);

        let mut config = Config::default();
        config.gateway.bind = "0.0.0.0:4000".to_string();

        manager.save(&config).await.unwrap();
        let loaded = manager.load().await.unwrap();

        assert_eq!(loaded.gateway.bind, "0.0.0.0:4000");
    }

    #[tokio::test]
    async fn invalid_file_reports_path() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        tokio::fs::write(&path, "[retry]\nmax_attempts = \"many\"\n")
            .await
            .unwrap();

        let err = ConfigManager::with_path(path.clone())
            .load()
            .await
            .unwrap_err();
        match err {
            TetherError::ConfigInvalid { path: p, .. } => assert_eq!(p, path),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn store_path_prefers_config() {
        let mut config = Config::default();
        assert_eq!(
            ConfigManager::store_path(&config),
            ConfigManager::default_store_path()
        );

        config.store.path = Some(PathBuf::from("/srv/tether.db"));
        assert_eq!(
            ConfigManager::store_path(&config),
            PathBuf::from("/srv/tether.db")
        );
    }
}
