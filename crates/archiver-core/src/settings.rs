//! Archiver settings and the store they persist to

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{Error, Result};

/// Default auto-backup interval in hours
pub const DEFAULT_INTERVAL_HOURS: u32 = 24;

/// Default maximum number of archives kept
pub const DEFAULT_MAX_BACKUPS: u32 = 30;

/// File name of the JSON settings file inside the catalog directory
pub const SETTINGS_FILE_NAME: &str = "backup_settings.json";

/// Default catalog directory: `<local data dir>/store-archiver/backups`
pub fn default_catalog_dir() -> Option<PathBuf> {
    dirs::data_local_dir().map(|dir| dir.join("store-archiver").join("backups"))
}

/// Process-wide archiver configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiverSettings {
    /// Whether scheduled backups run
    pub autobackup_enabled: bool,
    /// Hours between scheduled backups
    pub autobackup_interval_hours: u32,
    /// Maximum number of archives to keep
    pub max_backups: u32,
    /// When the last backup completed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_backup_at: Option<DateTime<Utc>>,
}

impl Default for ArchiverSettings {
    fn default() -> Self {
        Self {
            autobackup_enabled: true,
            autobackup_interval_hours: DEFAULT_INTERVAL_HOURS,
            max_backups: DEFAULT_MAX_BACKUPS,
            last_backup_at: None,
        }
    }
}

impl ArchiverSettings {
    /// Replace out-of-range values with defaults
    pub fn normalized(mut self) -> Self {
        if self.autobackup_interval_hours == 0 {
            tracing::warn!(
                "autobackup_interval_hours must be positive, using {}",
                DEFAULT_INTERVAL_HOURS
            );
            self.autobackup_interval_hours = DEFAULT_INTERVAL_HOURS;
        }
        if self.max_backups == 0 {
            tracing::warn!("max_backups must be positive, using {}", DEFAULT_MAX_BACKUPS);
            self.max_backups = DEFAULT_MAX_BACKUPS;
        }
        self
    }
}

/// Persistence seam for [`ArchiverSettings`]
pub trait SettingsStore: Send + Sync {
    /// Load settings; `Ok(None)` when nothing has been saved yet
    fn load(&self) -> Result<Option<ArchiverSettings>>;

    /// Save settings, replacing whatever was stored
    fn save(&self, settings: &ArchiverSettings) -> Result<()>;
}

/// Settings stored as a pretty-printed JSON file
#[derive(Debug, Clone)]
pub struct JsonSettingsStore {
    path: PathBuf,
}

impl JsonSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Settings file inside a catalog directory
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(SETTINGS_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for JsonSettingsStore {
    fn load(&self) -> Result<Option<ArchiverSettings>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path)
            .map_err(|e| Error::ConfigIo(format!("Cannot read {}: {}", self.path.display(), e)))?;
        let settings = serde_json::from_str(&content)
            .map_err(|e| Error::ConfigIo(format!("Invalid {}: {}", self.path.display(), e)))?;
        Ok(Some(settings))
    }

    fn save(&self, settings: &ArchiverSettings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::ConfigIo(format!("Cannot create {}: {}", parent.display(), e))
            })?;
        }
        let content = serde_json::to_string_pretty(settings)
            .map_err(|e| Error::ConfigIo(format!("Failed to serialize settings: {}", e)))?;

        // Write beside the target and rename so readers never see a partial file
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content)
            .map_err(|e| Error::ConfigIo(format!("Cannot write {}: {}", tmp.display(), e)))?;
        fs::rename(&tmp, &self.path)
            .map_err(|e| Error::ConfigIo(format!("Cannot write {}: {}", self.path.display(), e)))?;
        Ok(())
    }
}

/// Settings held in memory
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    inner: Mutex<Option<ArchiverSettings>>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with `settings`
    pub fn with_settings(settings: ArchiverSettings) -> Self {
        Self {
            inner: Mutex::new(Some(settings)),
        }
    }
}

impl SettingsStore for MemorySettingsStore {
    fn load(&self) -> Result<Option<ArchiverSettings>> {
        let guard = self
            .inner
            .lock()
            .map_err(|_| Error::ConfigIo("settings lock poisoned".to_string()))?;
        Ok(guard.clone())
    }

    fn save(&self, settings: &ArchiverSettings) -> Result<()> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| Error::ConfigIo("settings lock poisoned".to_string()))?;
        *guard = Some(settings.clone());
        Ok(())
    }
}

/// Load settings from `store`, falling back to defaults on any failure
pub fn load_or_default(store: &dyn SettingsStore) -> ArchiverSettings {
    match store.load() {
        Ok(Some(settings)) => settings.normalized(),
        Ok(None) => ArchiverSettings::default(),
        Err(e) => {
            tracing::error!("Failed to load archiver settings, using defaults: {}", e);
            ArchiverSettings::default()
        }
    }
}
