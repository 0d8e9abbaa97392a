use log::warn;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{CoreError, Result};

const SETTINGS_FILENAME: &str = "settings.json";

fn default_attempts() -> u32 {
    10
}

fn default_connect_timeout() -> u64 {
    2000
}

fn default_backoff() -> u64 {
    1000
}

fn default_stop_timeout() -> u64 {
    3000
}

fn default_child_stop_timeout() -> u64 {
    1000
}

fn default_startup_grace() -> u64 {
    500
}

fn default_log_rotation() -> String {
    "daily".to_string()
}

fn default_log_keep() -> usize {
    3
}

fn default_engine_log_level() -> String {
    "warning".to_string()
}

fn default_clash_start_port() -> u16 {
    1080
}

fn default_event_capacity() -> usize {
    1024
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SupervisorSettings {
    // Directories
    #[serde(default)]
    pub bin_dir: PathBuf,
    #[serde(default)]
    pub work_dir: PathBuf,
    #[serde(default)]
    pub log_dir: PathBuf,

    // Port activation polling
    #[serde(default = "default_attempts")]
    pub port_check_attempts: u32,
    #[serde(default = "default_connect_timeout")]
    pub port_check_timeout_ms: u64,
    #[serde(default = "default_backoff")]
    pub port_check_backoff_ms: u64,

    // Process lifecycle
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_ms: u64,
    #[serde(default = "default_child_stop_timeout")]
    pub child_stop_timeout_ms: u64,
    #[serde(default = "default_startup_grace")]
    pub startup_grace_ms: u64,

    // Logging
    /// `minutely`, `hourly`, `daily` or `never`.
    #[serde(default = "default_log_rotation")]
    pub log_rotation: String,
    #[serde(default = "default_log_keep")]
    pub log_keep: usize,
    #[serde(default = "default_engine_log_level")]
    pub engine_log_level: String,

    #[serde(default = "default_clash_start_port")]
    pub clash_start_port: u16,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::with_data_dir(Path::new("."))
    }
}

impl SupervisorSettings {
    /// Defaults rooted at `data_dir`: `bin/`, `work/` and `logs/` beneath it.
    pub fn with_data_dir(data_dir: &Path) -> Self {
        Self {
            bin_dir: data_dir.join("bin"),
            work_dir: data_dir.join("work"),
            log_dir: data_dir.join("logs"),
            port_check_attempts: default_attempts(),
            port_check_timeout_ms: default_connect_timeout(),
            port_check_backoff_ms: default_backoff(),
            stop_timeout_ms: default_stop_timeout(),
            child_stop_timeout_ms: default_child_stop_timeout(),
            startup_grace_ms: default_startup_grace(),
            log_rotation: default_log_rotation(),
            log_keep: default_log_keep(),
            engine_log_level: default_engine_log_level(),
            clash_start_port: default_clash_start_port(),
            event_capacity: default_event_capacity(),
        }
    }

    pub fn path_in(data_dir: &Path) -> PathBuf {
        data_dir.join(SETTINGS_FILENAME)
    }

    /// Reads `settings.json` from `data_dir`. Missing or broken files fall back
    /// to defaults; empty directory fields are filled relative to `data_dir`.
    pub fn load(data_dir: &Path) -> Self {
        let path = Self::path_in(data_dir);
        let defaults = Self::with_data_dir(data_dir);
        if !path.exists() {
            return defaults;
        }
        let mut settings = match fs::read_to_string(&path)
            .map_err(|e| e.to_string())
            .and_then(|content| {
                serde_json::from_str::<SupervisorSettings>(&content).map_err(|e| e.to_string())
            }) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to load settings from {:?}: {}", path, e);
                return defaults;
            }
        };

        if settings.bin_dir.as_os_str().is_empty() {
            settings.bin_dir = defaults.bin_dir;
        }
        if settings.work_dir.as_os_str().is_empty() {
            settings.work_dir = defaults.work_dir;
        }
        if settings.log_dir.as_os_str().is_empty() {
            settings.log_dir = defaults.log_dir;
        }
        settings
    }

    pub fn save(&self, data_dir: &Path) -> Result<()> {
        let path = Self::path_in(data_dir);
        if !data_dir.exists() {
            fs::create_dir_all(data_dir).map_err(|source| CoreError::ConfigIo {
                path: data_dir.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|source| CoreError::ConfigParse {
            path: path.clone(),
            source,
        })?;
        fs::write(&path, json).map_err(|source| CoreError::ConfigIo { path, source })?;
        Ok(())
    }
}
