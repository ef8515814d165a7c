//! Configuration management for MedSync.
//!
//! This module handles loading and saving client configuration to/from
//! a JSON file. The config directory can be customized.
//!
//! Sections:
//! - device_id: UUID7 identifying this installation (generated on first run)
//! - remote: API endpoint, credentials and timeouts
//! - queue: retry ceiling and backoff
//! - connectivity: reachability poll interval

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::EngineSettings;
use crate::error::{MedSyncError, MedSyncResult};

/// Remote API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// API base URL, empty until configured
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// OAuth access token, used when no API key is set
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Live query polling interval
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_health_path")]
    pub health_path: String,
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_poll_interval_secs() -> u64 {
    15
}

fn default_health_path() -> String {
    "/health".to_string()
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: None,
            access_token: None,
            request_timeout_secs: default_request_timeout_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            health_path: default_health_path(),
        }
    }
}

impl RemoteConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Queue retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    300_000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

/// Reachability polling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectivityConfig {
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
}

fn default_check_interval_secs() -> u64 {
    20
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval_secs(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigData {
    /// Path to the database file
    #[serde(default)]
    pub database_file: String,
    /// Device ID (UUID7 hex)
    #[serde(default = "generate_device_id")]
    pub device_id: String,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub connectivity: ConnectivityConfig,
}

fn generate_device_id() -> String {
    Uuid::now_v7().simple().to_string()
}

impl Default for ConfigData {
    fn default() -> Self {
        Self {
            database_file: String::new(),
            device_id: generate_device_id(),
            remote: RemoteConfig::default(),
            queue: QueueConfig::default(),
            connectivity: ConnectivityConfig::default(),
        }
    }
}

/// Configuration manager
pub struct Config {
    config_dir: PathBuf,
    config_file: PathBuf,
    data: ConfigData,
}

impl Config {
    /// Create a new configuration manager
    ///
    /// On mobile platforms (without the `desktop` feature), `config_dir` is required.
    pub fn new(config_dir: Option<PathBuf>) -> MedSyncResult<Self> {
        let config_dir = match config_dir {
            Some(dir) => dir,
            None => {
                #[cfg(feature = "desktop")]
                {
                    dirs::config_dir()
                        .unwrap_or_else(|| PathBuf::from("."))
                        .join("medsync")
                }
                #[cfg(not(feature = "desktop"))]
                {
                    return Err(MedSyncError::Config(
                        "config_dir is required on mobile platforms".to_string(),
                    ));
                }
            }
        };

        fs::create_dir_all(&config_dir)?;
        let config_file = config_dir.join("config.json");

        let default_data = || {
            let mut default = ConfigData::default();
            default.database_file = config_dir.join("medsync.db").to_string_lossy().to_string();
            default
        };

        let data = if config_file.exists() {
            match fs::read_to_string(&config_file) {
                Ok(content) => serde_json::from_str(&content).unwrap_or_else(|_| default_data()),
                Err(_) => default_data(),
            }
        } else {
            default_data()
        };

        let config = Self {
            config_dir,
            config_file,
            data,
        };

        // Save default config if it doesn't exist
        if !config.config_file.exists() {
            config.save()?;
        }

        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> MedSyncResult<()> {
        let content = serde_json::to_string_pretty(&self.data)?;
        fs::write(&self.config_file, content)?;
        Ok(())
    }

    /// Get the configuration directory path
    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Get the database file path
    pub fn database_file(&self) -> &str {
        &self.data.database_file
    }

    /// Get the device ID
    pub fn device_id(&self) -> MedSyncResult<Uuid> {
        Uuid::parse_str(&self.data.device_id)
            .map_err(|e| MedSyncError::Config(format!("Invalid device_id: {}", e)))
    }

    /// Get the device ID as hex string
    pub fn device_id_hex(&self) -> &str {
        &self.data.device_id
    }

    pub fn remote(&self) -> &RemoteConfig {
        &self.data.remote
    }

    pub fn queue(&self) -> &QueueConfig {
        &self.data.queue
    }

    pub fn connectivity(&self) -> &ConnectivityConfig {
        &self.data.connectivity
    }

    /// Poll interval for the reachability check
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.data.connectivity.check_interval_secs)
    }

    /// Set the API credentials. An API key takes precedence over a token.
    pub fn set_credentials(
        &mut self,
        api_key: Option<&str>,
        access_token: Option<&str>,
    ) -> MedSyncResult<()> {
        if api_key.is_none() && access_token.is_none() {
            return Err(MedSyncError::validation(
                "credentials",
                "either api_key or access_token must be provided",
            ));
        }
        self.data.remote.api_key = api_key.map(String::from);
        self.data.remote.access_token = access_token.map(String::from);
        self.save()
    }

    /// Set the retry ceiling for queued operations
    pub fn set_max_retries(&mut self, max_retries: u32) -> MedSyncResult<()> {
        if max_retries == 0 {
            return Err(MedSyncError::validation("max_retries", "must be at least 1"));
        }
        self.data.queue.max_retries = max_retries;
        self.save()
    }

    /// Runtime settings for the sync engine
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            max_retries: self.data.queue.max_retries,
            backoff_base: Duration::from_millis(self.data.queue.backoff_base_ms),
            backoff_max: Duration::from_millis(self.data.queue.backoff_max_ms),
            request_timeout: self.data.remote.request_timeout(),
        }
    }

    /// Get a configuration value
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "database_file" => Some(self.data.database_file.clone()),
            "device_id" => Some(self.data.device_id.clone()),
            "base_url" => Some(self.data.remote.base_url.clone()),
            "health_path" => Some(self.data.remote.health_path.clone()),
            "max_retries" => Some(self.data.queue.max_retries.to_string()),
            _ => None,
        }
    }

    /// Set a configuration value
    pub fn set(&mut self, key: &str, value: &str) -> MedSyncResult<()> {
        match key {
            "database_file" => self.data.database_file = value.to_string(),
            "base_url" => self.data.remote.base_url = value.trim_end_matches('/').to_string(),
            "health_path" => self.data.remote.health_path = value.to_string(),
            "max_retries" => {
                let parsed = value
                    .parse::<u32>()
                    .map_err(|e| MedSyncError::Config(format!("Invalid max_retries: {}", e)))?;
                return self.set_max_retries(parsed);
            }
            _ => return Err(MedSyncError::Config(format!("Unknown config key: {}", key))),
        }
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::new(Some(temp_dir.path().to_path_buf())).unwrap();

        assert!(config.device_id().is_ok());
        assert!(config.database_file().ends_with("medsync.db"));
        assert_eq!(config.queue().max_retries, 3);
        assert_eq!(config.remote().request_timeout_secs, 30);
        assert_eq!(config.remote().health_path, "/health");
        assert_eq!(config.check_interval(), Duration::from_secs(20));
        assert!(temp_dir.path().join("config.json").exists());
    }

    #[test]
    fn test_engine_settings() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::new(Some(temp_dir.path().to_path_buf())).unwrap();

        let settings = config.engine_settings();
        assert_eq!(settings.max_retries, 3);
        assert_eq!(settings.backoff_base, Duration::from_secs(1));
        assert_eq!(settings.backoff_max, Duration::from_secs(300));
        assert_eq!(settings.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_config_persistence() {
        let temp_dir = TempDir::new().unwrap();

        let device_id = {
            let mut config = Config::new(Some(temp_dir.path().to_path_buf())).unwrap();
            config.set("base_url", "https://api.example.com/").unwrap();
            config.set_credentials(Some("key-123"), None).unwrap();
            config.set_max_retries(5).unwrap();
            config.device_id_hex().to_string()
        };

        {
            let config = Config::new(Some(temp_dir.path().to_path_buf())).unwrap();
            assert_eq!(config.device_id_hex(), device_id);
            assert_eq!(config.remote().base_url, "https://api.example.com");
            assert_eq!(config.remote().api_key.as_deref(), Some("key-123"));
            assert_eq!(config.get("max_retries"), Some("5".to_string()));
        }
    }

    #[test]
    fn test_partial_config_file_fills_defaults() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(
            temp_dir.path().join("config.json"),
            r#"{"queue": {"max_retries": 4}}"#,
        )
        .unwrap();

        let config = Config::new(Some(temp_dir.path().to_path_buf())).unwrap();
        assert_eq!(config.queue().max_retries, 4);
        assert_eq!(config.queue().backoff_base_ms, 1_000);
        assert_eq!(config.remote().poll_interval_secs, 15);
    }

    #[test]
    fn test_corrupt_config_falls_back_to_defaults() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("config.json"), "not json").unwrap();

        let config = Config::new(Some(temp_dir.path().to_path_buf())).unwrap();
        assert_eq!(config.queue().max_retries, 3);
        assert!(config.database_file().ends_with("medsync.db"));
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::new(Some(temp_dir.path().to_path_buf())).unwrap();

        assert!(config.set_max_retries(0).is_err());
        assert!(config.set("max_retries", "many").is_err());
        assert!(config.set("unknown_key", "x").is_err());
        assert!(config.set_credentials(None, None).is_err());
    }
}
