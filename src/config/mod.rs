use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::types::error::{CacheError, Result};

/// Settings file name inside the cache directory
pub const SETTINGS_FILE: &str = "settings.toml";

/// Shortest interval between two sync passes of one account
pub const MIN_SYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Accepted range of [`CacheSettings::max_size_mb`]
pub const MIN_CACHE_SIZE_MB: u64 = 50;
pub const MAX_CACHE_SIZE_MB: u64 = 10_000;

const MB: u64 = 1024 * 1024;
const DAY_SECS: u64 = 24 * 60 * 60;

/// Cache behaviour, persisted as TOML next to the account databases
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Master switch; when off every store accessor reports a miss
    pub enabled: bool,

    /// Minutes between background sync passes (at least one)
    pub sync_interval_minutes: u64,

    /// Number of recent messages pulled per pass
    pub email_page_size: usize,

    /// Days before a cached contact photo expires
    pub photo_ttl_days: u64,

    /// Defer failed mutations instead of reporting them as errors
    pub offline_queue_enabled: bool,

    /// Start one sync loop per account on startup
    pub background_sync_enabled: bool,

    /// Disk budget for all account databases together
    pub max_size_mb: u64,

    /// Days of mail fetched by the first sync of an account
    pub initial_sync_days: u64,

    /// Keep downloaded attachments on disk
    pub attachment_cache_enabled: bool,

    /// Disk budget for cached attachment content
    pub attachment_max_size_mb: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            sync_interval_minutes: 5,
            email_page_size: 100,
            photo_ttl_days: 30,
            offline_queue_enabled: true,
            background_sync_enabled: true,
            max_size_mb: 500,
            initial_sync_days: 30,
            attachment_cache_enabled: true,
            attachment_max_size_mb: 100,
        }
    }
}

impl CacheSettings {
    /// Load `<base>/settings.toml`, writing the defaults if it does not
    /// exist. A file with out-of-range values is a [`CacheError::Config`].
    pub fn load_or_create(base_path: &Path) -> Result<Self> {
        let path = base_path.join(SETTINGS_FILE);

        if !path.exists() {
            info!("No cache settings at {:?}, writing defaults", path);
            let settings = Self::default();
            settings.save(base_path)?;
            return Ok(settings);
        }

        let content = fs::read_to_string(&path)
            .map_err(|e| CacheError::Config(format!("Failed to read settings: {}", e)))?;
        let settings: CacheSettings = toml::from_str(&content)
            .map_err(|e| CacheError::Config(format!("Failed to parse settings: {}", e)))?;
        settings.validate()?;

        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if !(MIN_CACHE_SIZE_MB..=MAX_CACHE_SIZE_MB).contains(&self.max_size_mb) {
            return Err(CacheError::Config(format!(
                "max_size_mb must be between {} and {}, got {}",
                MIN_CACHE_SIZE_MB, MAX_CACHE_SIZE_MB, self.max_size_mb
            )));
        }

        let at_least_one = [
            ("sync_interval_minutes", self.sync_interval_minutes),
            ("photo_ttl_days", self.photo_ttl_days),
            ("initial_sync_days", self.initial_sync_days),
            ("email_page_size", self.email_page_size as u64),
            ("attachment_max_size_mb", self.attachment_max_size_mb),
        ];
        for (name, value) in at_least_one {
            if value < 1 {
                return Err(CacheError::Config(format!("{} must be at least 1", name)));
            }
        }
        Ok(())
    }

    /// Apply `change`, validate and persist. On error nothing changes.
    pub fn update<F>(&mut self, base_path: &Path, change: F) -> Result<()>
    where
        F: FnOnce(&mut CacheSettings),
    {
        let mut next = self.clone();
        change(&mut next);
        next.validate()?;
        next.save(base_path)?;
        *self = next;
        Ok(())
    }

    /// Persist and return the defaults
    pub fn reset(base_path: &Path) -> Result<Self> {
        let settings = Self::default();
        settings.save(base_path)?;
        info!("Cache settings reset to defaults");
        Ok(settings)
    }

    pub fn save(&self, base_path: &Path) -> Result<()> {
        fs::create_dir_all(base_path)?;
        let content = toml::to_string_pretty(self)?;
        fs::write(base_path.join(SETTINGS_FILE), content)?;
        Ok(())
    }

    /// Effective interval, never below [`MIN_SYNC_INTERVAL`]
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_minutes.saturating_mul(60)).max(MIN_SYNC_INTERVAL)
    }

    pub fn photo_ttl(&self) -> Duration {
        Duration::from_secs(self.photo_ttl_days.saturating_mul(DAY_SECS))
    }

    pub fn initial_sync(&self) -> Duration {
        Duration::from_secs(self.initial_sync_days.saturating_mul(DAY_SECS))
    }

    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_mb.saturating_mul(MB)
    }

    pub fn attachment_max_size_bytes(&self) -> u64 {
        self.attachment_max_size_mb.saturating_mul(MB)
    }
}

/// Where the cache lives and how it behaves
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub base_path: PathBuf,
    pub settings: CacheSettings,
}

impl CacheConfig {
    pub fn new(base_path: impl Into<PathBuf>, settings: CacheSettings) -> Self {
        Self {
            base_path: base_path.into(),
            settings,
        }
    }

    /// Default location with settings loaded (or created) from disk
    pub fn load_default() -> Result<Self> {
        let base_path = default_base_path()?;
        let settings = CacheSettings::load_or_create(&base_path)?;
        Ok(Self {
            base_path,
            settings,
        })
    }
}

/// Platform data directory, e.g. `~/.local/share/air/cache` on Linux
pub fn default_base_path() -> Result<PathBuf> {
    dirs::data_local_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".local").join("share")))
        .map(|dir| dir.join("air").join("cache"))
        .ok_or_else(|| CacheError::Config("Could not determine data directory".to_string()))
}
