//! Lock configuration file and timing constants
//!
//! Stored as JSON in `PARKLOCK_HOME` (default `~/.parklock`).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Delays used by the link and session, in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    /// Turn ack to verification check
    pub status_verification_ms: u64,
    /// Scan start after returning from the background
    pub scan_restart_ms: u64,
    /// Replay of an unanswered Gen2 write after returning from the background
    pub write_replay_ms: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            status_verification_ms: 5_000,
            scan_restart_ms: 1_400,
            write_replay_ms: 800,
        }
    }
}

impl Timings {
    pub fn status_verification(&self) -> Duration {
        Duration::from_millis(self.status_verification_ms)
    }

    pub fn scan_restart(&self) -> Duration {
        Duration::from_millis(self.scan_restart_ms)
    }

    pub fn write_replay(&self) -> Duration {
        Duration::from_millis(self.write_replay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockConfig {
    /// Lock MAC, `AA:BB:CC:DD:EE:FF`
    pub device_id: String,
    /// `V1` or `V2`
    pub lock_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    #[serde(default)]
    pub timings: Timings,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("no home directory, set PARKLOCK_HOME")]
    NoHome,
    #[error("failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// `$PARKLOCK_HOME`, or `~/.parklock`
pub fn parklock_home() -> Result<PathBuf, ConfigError> {
    match std::env::var("PARKLOCK_HOME") {
        Ok(home) => Ok(PathBuf::from(home)),
        Err(_) => dirs::home_dir()
            .map(|home| home.join(".parklock"))
            .ok_or(ConfigError::NoHome),
    }
}

impl LockConfig {
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        Ok(parklock_home()?.join("config.json"))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load if the file exists
    pub fn load_optional(path: &Path) -> Result<Option<Self>, ConfigError> {
        if path.exists() {
            Self::load(path).map(Some)
        } else {
            Ok(None)
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(io_err)?;
        }
        let data = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, data).map_err(io_err)
    }
}
