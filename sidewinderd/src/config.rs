use sidewinderd_common::{tracing, MAX_PROFILE};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn, Level};

use crate::error::DriverResult;
use crate::keyboard::KeyboardSettings;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/sidewinderd.yaml";

/// Configuration manager for the sidewinderd daemon
pub struct ConfigManager {
    pub config_path: PathBuf,
    pub config: DaemonConfig,
}

/// Daemon configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub daemon: DaemonSettings,
    pub keyboard: KeyboardConfig,
}

/// Daemon-wide settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSettings {
    pub log_level: String,
    /// Root of the profile_N macro directories
    pub workdir: PathBuf,
}

/// Settings applied to every bound keyboard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyboardConfig {
    /// Record the pauses between keystrokes
    pub capture_delays: bool,
    /// Profile selected on bind, 1-based
    pub profile: u8,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            workdir: default_workdir(),
        }
    }
}

impl Default for KeyboardConfig {
    fn default() -> Self {
        Self {
            capture_delays: true,
            profile: 1,
        }
    }
}

/// `$XDG_DATA_HOME/sidewinderd`, else `~/.local/share/sidewinderd`
pub fn default_workdir() -> PathBuf {
    if let Some(data_home) = env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(data_home).join("sidewinderd");
    }

    match env::var_os("HOME").filter(|v| !v.is_empty()) {
        Some(home) => PathBuf::from(home).join(".local/share/sidewinderd"),
        None => PathBuf::from("/var/lib/sidewinderd"),
    }
}

impl DaemonConfig {
    /// Settings handed to each keyboard, with the profile clamped into range
    pub fn keyboard_settings(&self) -> KeyboardSettings {
        KeyboardSettings {
            capture_delays: self.keyboard.capture_delays,
            initial_profile: self.keyboard.profile.clamp(1, MAX_PROFILE) - 1,
            workdir: self.daemon.workdir.clone(),
        }
    }

    /// Configured log level, `INFO` when unrecognised
    pub fn log_level(&self) -> Level {
        self.daemon.log_level.parse().unwrap_or(Level::INFO)
    }
}

impl ConfigManager {
    pub fn new(config_path: impl AsRef<Path>) -> Self {
        Self {
            config_path: config_path.as_ref().to_path_buf(),
            config: DaemonConfig::default(),
        }
    }

    /// Load configuration from disk. A missing file is replaced by defaults.
    pub async fn load_config(&mut self) -> DriverResult<()> {
        info!("Loading configuration from {}", self.config_path.display());

        if fs::try_exists(&self.config_path).await.unwrap_or(false) {
            let content = fs::read_to_string(&self.config_path).await?;
            self.config = serde_yaml::from_str(&content)?;
            debug!("Loaded configuration from disk");
        } else {
            warn!("Configuration file not found, using defaults");
            if let Err(e) = self.save_config().await {
                warn!("Cannot write default configuration: {}", e);
            }
        }

        Ok(())
    }

    /// Save configuration to disk
    pub async fn save_config(&self) -> DriverResult<()> {
        info!("Saving configuration to {}", self.config_path.display());

        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let content = serde_yaml::to_string(&self.config)?;
        fs::write(&self.config_path, content).await?;

        debug!("Configuration saved");
        Ok(())
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DriverError;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_file_writes_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("etc/sidewinderd.yaml");

        let mut manager = ConfigManager::new(&config_path);
        manager.load_config().await.unwrap();

        assert!(config_path.exists());
        assert_eq!(manager.config().keyboard, KeyboardConfig::default());

        let mut reloaded = ConfigManager::new(&config_path);
        reloaded.load_config().await.unwrap();
        assert_eq!(reloaded.config, manager.config);
    }

    #[tokio::test]
    async fn test_partial_file_keeps_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("sidewinderd.yaml");
        std::fs::write(&config_path, "keyboard:\n  capture_delays: false\n").unwrap();

        let mut manager = ConfigManager::new(&config_path);
        manager.load_config().await.unwrap();

        assert!(!manager.config.keyboard.capture_delays);
        assert_eq!(manager.config.keyboard.profile, 1);
        assert_eq!(manager.config.daemon.log_level, "info");
    }

    #[tokio::test]
    async fn test_unparsable_file_is_error() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("sidewinderd.yaml");
        std::fs::write(&config_path, "keyboard: [1, 2\n").unwrap();

        let mut manager = ConfigManager::new(&config_path);
        assert!(matches!(manager.load_config().await, Err(DriverError::Config(_))));
    }

    #[test]
    fn test_profile_is_clamped_and_zero_based() {
        let mut config = DaemonConfig::default();
        config.daemon.workdir = PathBuf::from("/tmp/macros");

        for (configured, expected) in [(0, 0), (1, 0), (2, 1), (3, 2), (9, 2)] {
            config.keyboard.profile = configured;
            let settings = config.keyboard_settings();
            assert_eq!(settings.initial_profile, expected);
            assert_eq!(settings.workdir, PathBuf::from("/tmp/macros"));
        }
    }

    #[test]
    fn test_log_level_parsing() {
        let mut config = DaemonConfig::default();
        assert_eq!(config.log_level(), Level::INFO);

        config.daemon.log_level = "debug".to_string();
        assert_eq!(config.log_level(), Level::DEBUG);

        config.daemon.log_level = "chatty".to_string();
        assert_eq!(config.log_level(), Level::INFO);
    }
}
