//! Configuration management for the Sorta Mail sync core

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{SortaError, SortaResult};

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Application settings
    pub app: AppConfig,
    /// Remote account settings
    pub account: AccountConfig,
    /// Remote folder names
    pub folders: FolderConfig,
    /// Sync settings
    pub sync: SyncConfig,
    /// Gateway settings
    pub gateway: GatewayConfig,
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Log level
    pub log_level: String,
    /// Configuration directory
    pub config_dir: PathBuf,
    /// Data directory (cache database lives here)
    pub data_dir: PathBuf,
}

/// Remote account configuration.
///
/// The password is never written back to disk; it is supplied by the
/// environment at load time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountConfig {
    /// IMAP host
    pub host: String,
    /// IMAP port
    pub port: u16,
    /// Login name
    pub username: String,
    /// Password or app password
    #[serde(skip)]
    pub password: Option<String>,
}

/// Remote folder names
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FolderConfig {
    pub inbox: String,
    pub archive: String,
    pub drafts: String,
    /// Sent folder; sent sync is skipped when unset
    pub sent: Option<String>,
}

/// Sync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Background sync interval (seconds)
    pub sync_interval: u64,
    /// Oldest message date pulled into the cache
    pub start_date: NaiveDate,
    /// Include flagged messages older than the start date
    pub include_starred: bool,
    /// Minimum seconds between read-path refreshes of one bucket
    pub bucket_refresh_window: u64,
    /// Maximum rows checked per orphan cleanup pass
    pub orphan_sample_limit: usize,
    /// Maximum rows given a thread key per backfill pass
    pub backfill_batch: usize,
}

/// Gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Timeout for flag and position commands (seconds)
    pub command_timeout: u64,
    /// Timeout for body fetches and searches (seconds)
    pub fetch_timeout: u64,
    /// Identities per SEARCH command when checking existence
    pub search_batch: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            config_dir: crate::get_config_dir()
                .unwrap_or_else(|_| PathBuf::from("~/.config/sorta-mail")),
            data_dir: crate::get_data_dir()
                .unwrap_or_else(|_| PathBuf::from("~/.local/share/sorta-mail")),
        }
    }
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 993,
            username: String::new(),
            password: None,
        }
    }
}

impl Default for FolderConfig {
    fn default() -> Self {
        Self {
            inbox: "INBOX".to_string(),
            archive: "Archive".to_string(),
            drafts: "Drafts".to_string(),
            sent: None,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval: 300, // 5 minutes
            start_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap_or_default(),
            include_starred: true,
            bucket_refresh_window: 60,
            orphan_sample_limit: 50,
            backfill_batch: 500,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            command_timeout: 15,
            fetch_timeout: 60,
            search_batch: 25,
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval)
    }

    pub fn refresh_window(&self) -> Duration {
        Duration::from_secs(self.bucket_refresh_window)
    }
}

impl GatewayConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout)
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults
    pub fn load(config_path: &Path) -> SortaResult<Self> {
        if config_path.exists() {
            let content = std::fs::read_to_string(config_path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, config_path: &Path) -> SortaResult<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    /// Apply environment overrides on top of this configuration
    pub fn apply_env(mut self) -> Self {
        if let Ok(log_level) = std::env::var("SORTA_MAIL_LOG_LEVEL") {
            self.app.log_level = log_level;
        }

        if let Ok(data_dir) = std::env::var("SORTA_MAIL_DATA_DIR") {
            self.app.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(host) = std::env::var("SORTA_MAIL_IMAP_HOST") {
            self.account.host = host;
        }

        if let Ok(port) = std::env::var("SORTA_MAIL_IMAP_PORT") {
            if let Ok(port) = port.parse() {
                self.account.port = port;
            }
        }

        if let Ok(username) = std::env::var("SORTA_MAIL_IMAP_USER") {
            self.account.username = username;
        }

        if let Ok(password) = std::env::var("SORTA_MAIL_IMAP_PASSWORD") {
            self.account.password = Some(password);
        }

        if let Ok(sent) = std::env::var("SORTA_MAIL_SENT_FOLDER") {
            self.folders.sent = if sent.is_empty() { None } else { Some(sent) };
        }

        if let Ok(start) = std::env::var("SORTA_MAIL_SYNC_START_DATE") {
            if let Ok(date) = NaiveDate::parse_from_str(&start, "%Y-%m-%d") {
                self.sync.start_date = date;
            }
        }

        if let Ok(starred) = std::env::var("SORTA_MAIL_INCLUDE_STARRED") {
            self.sync.include_starred = starred == "1" || starred.to_lowercase() == "true";
        }

        if let Ok(interval) = std::env::var("SORTA_MAIL_SYNC_INTERVAL_SECONDS") {
            if let Ok(interval) = interval.parse() {
                self.sync.sync_interval = interval;
            }
        }

        self
    }

    /// Load `config.toml` from the config directory, then apply the environment
    pub fn load_from_env() -> SortaResult<Self> {
        let path = crate::get_config_dir()?.join("config.toml");
        Ok(Self::load(&path)?.apply_env())
    }

    /// Get the configuration file path
    pub fn config_file_path(&self) -> PathBuf {
        self.app.config_dir.join("config.toml")
    }

    /// Get the cache database path
    pub fn database_file_path(&self) -> PathBuf {
        self.app.data_dir.join(crate::DB_FILENAME)
    }

    /// Validate the configuration
    pub fn validate(&self) -> SortaResult<()> {
        if self.sync.sync_interval == 0 {
            return Err(SortaError::config("Sync interval cannot be zero"));
        }

        if self.gateway.command_timeout == 0 || self.gateway.fetch_timeout == 0 {
            return Err(SortaError::config("Gateway timeouts cannot be zero"));
        }

        if self.gateway.search_batch == 0 {
            return Err(SortaError::config("Search batch cannot be zero"));
        }

        if self.folders.inbox.is_empty() || self.folders.archive.is_empty() {
            return Err(SortaError::config("Inbox and archive folders are required"));
        }

        if self.folders.inbox == self.folders.archive {
            return Err(SortaError::config("Archive folder must differ from inbox"));
        }

        Ok(())
    }

    /// Validate that the remote account can be reached
    pub fn validate_account(&self) -> SortaResult<()> {
        if self.account.host.is_empty() || self.account.username.is_empty() {
            return Err(SortaError::config("IMAP host and username are required"));
        }
        if self.account.password.is_none() {
            return Err(SortaError::config(
                "IMAP password missing (set SORTA_MAIL_IMAP_PASSWORD)",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.folders.inbox, "INBOX");
        assert_eq!(config.folders.archive, "Archive");
        assert!(config.folders.sent.is_none());
        assert!(config.sync.include_starred);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_save_load_never_writes_password() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");

        let mut config = Config::default();
        config.account.host = "imap.example.com".to_string();
        config.account.password = Some("hunter2".to_string());
        config.folders.sent = Some("Sent".to_string());

        config.save(&config_path).unwrap();
        let content = std::fs::read_to_string(&config_path).unwrap();
        assert!(!content.contains("hunter2"));

        let loaded = Config::load(&config_path).unwrap();
        assert_eq!(loaded.account.host, "imap.example.com");
        assert_eq!(loaded.folders.sent.as_deref(), Some("Sent"));
        assert!(loaded.account.password.is_none());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.sync.sync_interval = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.folders.archive = "INBOX".to_string();
        assert!(config.validate().is_err());

        let config = Config::default();
        assert!(config.validate_account().is_err());
    }

    #[test]
    fn test_config_from_env() {
        std::env::set_var("SORTA_MAIL_SYNC_START_DATE", "2023-06-01");
        std::env::set_var("SORTA_MAIL_INCLUDE_STARRED", "false");
        std::env::set_var("SORTA_MAIL_SENT_FOLDER", "Sent Items");

        let config = Config::default().apply_env();
        assert_eq!(config.sync.start_date, NaiveDate::from_ymd_opt(2023, 6, 1).unwrap());
        assert!(!config.sync.include_starred);
        assert_eq!(config.folders.sent.as_deref(), Some("Sent Items"));

        std::env::remove_var("SORTA_MAIL_SYNC_START_DATE");
        std::env::remove_var("SORTA_MAIL_INCLUDE_STARRED");
        std::env::remove_var("SORTA_MAIL_SENT_FOLDER");
    }
}
