//! Centralized directory paths for the updater.
//!
//! Uses the [`dirs`] crate for platform-appropriate resolution.
//!
//! # Environment Overrides
//!
//! - `FNB_UPDATER_DATA_DIR` overrides [`data_dir`]
//! - `FNB_UPDATER_CONFIG_DIR` overrides [`config_dir`]
//! - `FNB_UPDATER_CACHE_DIR` overrides [`cache_dir`]

use std::path::PathBuf;

const APP_DIR_NAME: &str = "fnb-updater";

/// Application data root directory.
///
/// Holds the swap executor's log files. Resolves to
/// `dirs::data_dir()/fnb-updater/` by default.
#[must_use]
pub fn data_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("FNB_UPDATER_DATA_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::data_dir()
        .map(|d| d.join(APP_DIR_NAME))
        .unwrap_or_else(|| std::env::temp_dir().join("fnb-updater-data"))
}

/// Application config directory.
#[must_use]
pub fn config_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("FNB_UPDATER_CONFIG_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::config_dir()
        .map(|d| d.join(APP_DIR_NAME))
        .unwrap_or_else(|| std::env::temp_dir().join("fnb-updater-config"))
}

/// Application cache directory.
///
/// Downloaded artifacts land in `cache_dir()/downloads/` unless the config
/// names another directory.
#[must_use]
pub fn cache_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("FNB_UPDATER_CACHE_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::cache_dir()
        .map(|d| d.join(APP_DIR_NAME))
        .unwrap_or_else(|| std::env::temp_dir().join("fnb-updater-cache"))
}

/// Log file directory (`data_dir()/logs/`).
#[must_use]
pub fn logs_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Default download directory (`cache_dir()/downloads/`).
#[must_use]
pub fn downloads_dir() -> PathBuf {
    cache_dir().join("downloads")
}

/// Main config file path (`config_dir()/updater.toml`).
#[must_use]
pub fn config_file() -> PathBuf {
    config_dir().join("updater.toml")
}
