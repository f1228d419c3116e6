//! Configuration types for the update orchestrator.

use crate::error::{Result, UpdateError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Repository identifier shipped as a placeholder before a real feed is set.
pub const PLACEHOLDER_REPOSITORY: &str = "username/repository";

/// Top-level updater configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdaterConfig {
    /// Release feed settings.
    pub feed: FeedConfig,
    /// Artifact download settings.
    pub download: DownloadConfig,
    /// Background check scheduling.
    pub schedule: ScheduleConfig,
    /// Swap executor settings.
    pub swap: SwapConfig,
}

/// Release feed configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Repository identifier in `owner/name` form.
    pub repository: String,
    /// Base URL of the GitHub-compatible releases API.
    pub api_base: String,
    /// Filename suffixes that count as installable assets (case-insensitive).
    pub accepted_suffixes: Vec<String>,
    /// `User-Agent` header sent with every request.
    pub user_agent: String,
    /// Upper bound for the whole feed request in seconds.
    pub timeout_secs: u64,
    /// Whether entries flagged as pre-releases are eligible.
    pub allow_prerelease: bool,
    /// Total feed query attempts on transient network errors (minimum 1).
    pub retry_attempts: u32,
    /// Delay before the first retry; doubles on every further attempt.
    pub retry_base_delay_ms: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            repository: "cowebsLB/marwan-managment-CRM-FnB".to_owned(),
            api_base: "https://api.github.com".to_owned(),
            accepted_suffixes: vec![".exe".to_owned(), ".zip".to_owned()],
            user_agent: format!("fnb-updater/{}", env!("CARGO_PKG_VERSION")),
            timeout_secs: 10,
            allow_prerelease: false,
            retry_attempts: 3,
            retry_base_delay_ms: 500,
        }
    }
}

impl FeedConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Check that the repository identifier is usable.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Config`] for the shipped placeholder and for
    /// anything that is not `owner/name`.
    pub fn validate_repository(&self) -> Result<()> {
        let repo = self.repository.trim();
        if repo == PLACEHOLDER_REPOSITORY {
            return Err(UpdateError::Config(
                "release feed repository is not configured".to_owned(),
            ));
        }
        let mut parts = repo.split('/');
        let well_formed = matches!(
            (parts.next(), parts.next(), parts.next()),
            (Some(owner), Some(name), None) if !owner.is_empty() && !name.is_empty()
        );
        if !well_formed {
            return Err(UpdateError::Config(format!(
                "repository must be `owner/name`, got {repo:?}"
            )));
        }
        Ok(())
    }
}

/// Artifact download configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Destination directory (None = `app_dirs::downloads_dir()`).
    pub directory: Option<PathBuf>,
    /// Upper bound for the whole download in seconds.
    pub timeout_secs: u64,
    /// Abort if no bytes arrive for this many seconds.
    pub inactivity_timeout_secs: u64,
    /// Free space to keep on top of the artifact size.
    pub min_free_bytes: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            directory: None,
            timeout_secs: 30 * 60,
            inactivity_timeout_secs: 60,
            min_free_bytes: 50 * 1024 * 1024,
        }
    }
}

impl DownloadConfig {
    pub fn directory(&self) -> PathBuf {
        self.directory
            .clone()
            .unwrap_or_else(crate::app_dirs::downloads_dir)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }
}

/// How an available update gets confirmed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoUpdatePreference {
    /// Wait for `confirm_download()` from the UI (default).
    #[default]
    Ask,
    /// Download and hand off without asking.
    Always,
}

impl std::fmt::Display for AutoUpdatePreference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ask => write!(f, "ask"),
            Self::Always => write!(f, "always"),
        }
    }
}

/// Background check scheduling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Whether the host runs scheduled checks at all.
    pub enabled: bool,
    /// Delay after startup before the first check.
    pub startup_delay_secs: u64,
    /// Interval between checks after the first one.
    pub interval_hours: u64,
    /// Confirmation policy for available updates.
    pub auto_update: AutoUpdatePreference,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            startup_delay_secs: 2,
            interval_hours: 24,
            auto_update: AutoUpdatePreference::Ask,
        }
    }
}

impl ScheduleConfig {
    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs(self.startup_delay_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_hours.max(1) * 3600)
    }
}

/// Swap executor configuration.
///
/// The executor reads this section from the same config file as the host and
/// falls back to the defaults if the file is unreadable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwapConfig {
    /// Upper bound on waiting for the host process to exit.
    pub exit_wait_secs: u64,
    /// Liveness poll interval.
    pub poll_interval_ms: u64,
    /// How long a relaunched process must survive to count as started.
    pub relaunch_grace_ms: u64,
}

impl Default for SwapConfig {
    fn default() -> Self {
        Self {
            exit_wait_secs: 30,
            poll_interval_ms: 250,
            relaunch_grace_ms: 1500,
        }
    }
}

impl SwapConfig {
    pub fn exit_wait(&self) -> Duration {
        Duration::from_secs(self.exit_wait_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }

    pub fn relaunch_grace(&self) -> Duration {
        Duration::from_millis(self.relaunch_grace_ms)
    }
}

impl UpdaterConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            UpdateError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        toml::from_str(&content).map_err(|e| UpdateError::Config(e.to_string()))
    }

    /// Load from [`UpdaterConfig::default_config_path`], falling back to the
    /// defaults when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be parsed.
    pub fn load_or_default() -> Result<Self> {
        let path = Self::default_config_path();
        if path.is_file() {
            Self::from_file(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| UpdateError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> PathBuf {
        crate::app_dirs::config_file()
    }
}
