//! Engine configuration and its on-disk persistence
//!
//! Configuration is stored as pretty JSON and replaced atomically via a
//! temporary file, an fsync, and a rename.

use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file does not exist
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Config file is not valid JSON for [`EngineConfig`]
    #[error("Config file {path} is malformed: {detail}")]
    Parse {
        /// Offending file
        path: PathBuf,
        /// Parser message
        detail: String,
    },

    /// Atomic write failed
    #[error("Atomic write failed for {path}: {detail}")]
    AtomicWriteFailed {
        /// Path where write failed
        path: PathBuf,
        /// Error details
        detail: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Convenience result alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Settings for session-call activities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivityConfig {
    /// Task queue session-call activities are scheduled on.
    pub task_queue: String,
    /// Schedule-to-close timeout in milliseconds.
    pub schedule_to_close_ms: u64,
    /// Heartbeat timeout in milliseconds.
    pub heartbeat_ms: u64,
    /// Attempts one activity execution may make before asking to be re-run.
    pub max_attempts_per_activity: u32,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            task_queue: "session-calls".to_string(),
            schedule_to_close_ms: 24 * 60 * 60 * 1000,
            heartbeat_ms: 5 * 60 * 1000,
            max_attempts_per_activity: 100,
        }
    }
}

impl ActivityConfig {
    /// Schedule-to-close timeout.
    pub fn schedule_to_close(&self) -> Duration {
        Duration::from_millis(self.schedule_to_close_ms)
    }

    /// Heartbeat timeout.
    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }
}

/// Settings for the language catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Scoped instances kept per language before the least recently used is evicted.
    pub max_cached_scopes: usize,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            max_cached_scopes: 1024,
        }
    }
}

/// Settings for the remote language backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Bound on the explicit cancel request and on draining the final state.
    pub cancel_timeout_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            cancel_timeout_ms: 5_000,
        }
    }
}

impl RemoteConfig {
    /// Cancel timeout.
    pub fn cancel_timeout(&self) -> Duration {
        Duration::from_millis(self.cancel_timeout_ms)
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Session-call activity settings
    pub activity: ActivityConfig,
    /// Catalog settings
    pub catalog: CatalogConfig,
    /// Remote backend settings
    pub remote: RemoteConfig,
}

impl EngineConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(ConfigError::NotFound(path.to_path_buf()));
            }
            Err(err) => return Err(err.into()),
        };
        serde_json::from_slice(&data).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })
    }

    /// Load configuration, falling back to defaults when the file is missing
    pub fn load_or_default(path: &Path) -> ConfigResult<Self> {
        match Self::load(path) {
            Err(ConfigError::NotFound(_)) => Ok(Self::default()),
            other => other,
        }
    }

    /// Write configuration to a JSON file atomically
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let json = serde_json::to_vec_pretty(self).map_err(|e| ConfigError::AtomicWriteFailed {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        write_atomic(path, &json)
    }
}

/// Write data atomically to a file
///
/// Creates a temporary file, writes the data, syncs, then renames
pub fn write_atomic(path: &Path, data: &[u8]) -> ConfigResult<()> {
    let temp_path = path.with_extension("tmp");
    let failed = |detail: String| ConfigError::AtomicWriteFailed {
        path: path.to_path_buf(),
        detail,
    };

    let mut file = File::create(&temp_path)
        .map_err(|e| failed(format!("create {:?}: {}", temp_path, e)))?;
    file.write_all(data)
        .map_err(|e| failed(format!("write: {}", e)))?;
    file.sync_all()
        .map_err(|e| failed(format!("sync: {}", e)))?;
    drop(file);

    fs::rename(&temp_path, path)
        .map_err(|e| failed(format!("rename {:?}: {}", temp_path, e)))?;

    // Sync parent directory
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        let dir = OpenOptions::new().read(true).open(parent)?;
        dir.sync_all()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load_config() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("akrun.json");

        let mut config = EngineConfig::default();
        config.activity.max_attempts_per_activity = 7;
        config.catalog.max_cached_scopes = 3;
        config.remote.cancel_timeout_ms = 250;

        config.save(&path).unwrap();
        let loaded = EngineConfig::load(&path).unwrap();

        assert_eq!(loaded, config);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_missing_config() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("missing.json");

        assert!(matches!(EngineConfig::load(&path), Err(ConfigError::NotFound(_))));
        assert_eq!(EngineConfig::load_or_default(&path).unwrap(), EngineConfig::default());
    }

    #[test]
    fn test_malformed_config() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("bad.json");
        fs::write(&path, b"{ not json").unwrap();

        assert!(matches!(EngineConfig::load(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("partial.json");
        fs::write(&path, br#"{"catalog": {"max_cached_scopes": 2}}"#).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.catalog.max_cached_scopes, 2);
        assert_eq!(loaded.activity, ActivityConfig::default());
    }
}
