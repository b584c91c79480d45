//! Archive manager: settings, scheduling, job exclusion and the catalog
//!
//! The manager owns no background thread of its own. Scheduled backups are
//! driven by calling [`ArchiveManager::tick`] from whatever timer the caller
//! runs; each backup or restore runs on its own worker through [`JobHandle`].

use chrono::{DateTime, Duration, Local, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration as StdDuration;

use crate::archive::{format_size, verify_archive, ArchiveKind, VerifyReport, DATA_STORE_ENTRY};
use crate::catalog::{self, ArchiveName, ArchiveOrigin, ArchiveRecord, ARCHIVE_EXTENSION};
use crate::error::{Error, Result};
use crate::job::{sweep_stale_staging, BackupJob, JobHandle, JobKind, ProgressSink, RestoreJob};
use crate::retention;
use crate::settings::{load_or_default, ArchiverSettings, JsonSettingsStore, SettingsStore};

/// Staging directories untouched for this long belong to a dead process
const STALE_STAGING_AGE: StdDuration = StdDuration::from_secs(24 * 60 * 60);

/// Locations the manager works with
#[derive(Debug, Clone)]
pub struct ArchivePaths {
    /// The live data store file
    pub data_store: PathBuf,
    /// Resource tree included in full backups
    pub resources: Option<PathBuf>,
    /// Directory holding the archives
    pub catalog_dir: PathBuf,
}

/// Size and modification time of the live data store
#[derive(Debug, Clone, Serialize)]
pub struct StoreInfo {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub size_mb: f64,
    pub last_modified: Option<DateTime<Utc>>,
}

impl StoreInfo {
    pub fn size_display(&self) -> String {
        format_size(self.size_bytes)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Marks the single job slot as taken; released on drop
struct ActiveJob {
    active: Arc<AtomicBool>,
    restoring_from: Arc<Mutex<Option<PathBuf>>>,
}

impl Drop for ActiveJob {
    fn drop(&mut self) {
        *lock(&self.restoring_from) = None;
        self.active.store(false, Ordering::SeqCst);
    }
}

/// Orchestrates backups and restores of one data store
pub struct ArchiveManager {
    paths: ArchivePaths,
    settings: Arc<Mutex<ArchiverSettings>>,
    store: Arc<dyn SettingsStore>,
    active: Arc<AtomicBool>,
    restoring_from: Arc<Mutex<Option<PathBuf>>>,
}

impl ArchiveManager {
    /// Create a manager, loading settings from `store`.
    ///
    /// Settings failures fall back to defaults. When no backup time has been
    /// recorded yet, it is taken from the newest archive in the catalog.
    /// Staging directories abandoned by a crashed process are removed.
    pub fn new(paths: ArchivePaths, store: Arc<dyn SettingsStore>) -> Self {
        if let Err(e) = fs::create_dir_all(&paths.catalog_dir) {
            tracing::warn!(
                "Cannot create catalog directory {}: {}",
                paths.catalog_dir.display(),
                e
            );
        }
        sweep_stale_staging(&paths.catalog_dir, STALE_STAGING_AGE);
        if let Some(parent) = paths.data_store.parent() {
            if !parent.as_os_str().is_empty() && parent != paths.catalog_dir {
                sweep_stale_staging(parent, STALE_STAGING_AGE);
            }
        }

        let mut settings = load_or_default(store.as_ref());
        if settings.last_backup_at.is_none() {
            match catalog::list_archives(&paths.catalog_dir) {
                Ok(records) => {
                    settings.last_backup_at = records.first().map(|r| r.created_at);
                }
                Err(e) => tracing::warn!("Cannot scan catalog: {}", e),
            }
        }

        Self {
            paths,
            settings: Arc::new(Mutex::new(settings)),
            store,
            active: Arc::new(AtomicBool::new(false)),
            restoring_from: Arc::new(Mutex::new(None)),
        }
    }

    /// Create a manager whose settings live in the catalog directory
    pub fn with_json_settings(paths: ArchivePaths) -> Self {
        let store = Arc::new(JsonSettingsStore::in_dir(&paths.catalog_dir));
        Self::new(paths, store)
    }

    pub fn paths(&self) -> &ArchivePaths {
        &self.paths
    }

    pub fn catalog_dir(&self) -> &Path {
        &self.paths.catalog_dir
    }

    /// Snapshot of the current settings
    pub fn settings(&self) -> ArchiverSettings {
        lock(&self.settings).clone()
    }

    pub fn set_auto_backup_enabled(&self, enabled: bool) {
        self.update_settings(|s| s.autobackup_enabled = enabled);
    }

    pub fn set_interval_hours(&self, hours: u32) -> Result<()> {
        if hours == 0 {
            return Err(Error::InvalidSetting(
                "autobackup_interval_hours must be at least 1".to_string(),
            ));
        }
        self.update_settings(|s| s.autobackup_interval_hours = hours);
        Ok(())
    }

    pub fn set_max_backups(&self, count: u32) -> Result<()> {
        if count == 0 {
            return Err(Error::InvalidSetting("max_backups must be at least 1".to_string()));
        }
        self.update_settings(|s| s.max_backups = count);
        Ok(())
    }

    fn update_settings(&self, apply: impl FnOnce(&mut ArchiverSettings)) {
        let mut settings = lock(&self.settings);
        apply(&mut settings);
        persist(self.store.as_ref(), &settings);
    }

    /// Whether a backup or restore is running
    pub fn is_busy(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn acquire(&self) -> Result<ActiveJob> {
        self.active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| Error::Busy)?;
        Ok(ActiveJob {
            active: Arc::clone(&self.active),
            restoring_from: Arc::clone(&self.restoring_from),
        })
    }

    /// Start a manual backup.
    ///
    /// Without `destination` the archive gets a generated name in the
    /// catalog. After the archive is in place the backup time is recorded
    /// and retention runs over the catalog.
    pub fn create_backup(
        &self,
        include_resources: bool,
        destination: Option<PathBuf>,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<JobHandle> {
        self.launch_backup(
            ArchiveOrigin::Manual,
            ArchiveKind::from_include_resources(include_resources),
            destination,
            sink,
        )
    }

    fn launch_backup(
        &self,
        origin: ArchiveOrigin,
        kind: ArchiveKind,
        destination: Option<PathBuf>,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<JobHandle> {
        let guard = self.acquire()?;

        let destination = destination.unwrap_or_else(|| {
            ArchiveName::new(origin, kind, Local::now().naive_local())
                .unique_path_in(&self.paths.catalog_dir)
        });
        let job = BackupJob::new(destination, &self.paths.data_store, kind)
            .with_resources(self.paths.resources.clone());
        tracing::info!(
            "Starting {} {} backup to {}",
            origin,
            job.kind(),
            job.destination().display()
        );
        let settings = Arc::clone(&self.settings);
        let store = Arc::clone(&self.store);
        let catalog_dir = self.paths.catalog_dir.clone();
        let restoring_from = Arc::clone(&self.restoring_from);

        JobHandle::spawn(JobKind::Backup, sink, move |cancel, sink| {
            let _guard = guard;
            let report = job.run(cancel, sink)?;

            {
                let mut settings = lock(&settings);
                settings.last_backup_at = Some(Utc::now());
                persist(store.as_ref(), &settings);
            }

            let max_count = lock(&settings).max_backups as usize;
            let mut protected = vec![canonical(&report.path)];
            if let Some(source) = lock(&restoring_from).clone() {
                protected.push(source);
            }
            apply_retention(&catalog_dir, max_count, &protected);

            Ok(format!("Backup created: {}", report.path.display()))
        })
    }

    /// Start restoring `archive` over the live data store.
    ///
    /// `destination_dir` redirects the restore: the data store and the
    /// resource tree keep their names but land inside that directory.
    pub fn restore_from_backup(
        &self,
        archive: &Path,
        destination_dir: Option<PathBuf>,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<JobHandle> {
        let guard = self.acquire()?;
        *lock(&self.restoring_from) = Some(canonical(archive));

        let (data_store, resources) = match destination_dir {
            Some(dir) => {
                let store_name = self
                    .paths
                    .data_store
                    .file_name()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(DATA_STORE_ENTRY));
                let resources_name = self
                    .paths
                    .resources
                    .as_ref()
                    .and_then(|r| r.file_name())
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("resources"));
                (dir.join(store_name), Some(dir.join(resources_name)))
            }
            None => (self.paths.data_store.clone(), self.paths.resources.clone()),
        };
        tracing::info!(
            "Starting restore of {} to {}",
            archive.display(),
            data_store.display()
        );

        let job = RestoreJob::new(archive, data_store).with_resources(resources);
        let archive_name = job
            .archive()
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| job.archive().display().to_string());

        JobHandle::spawn(JobKind::Restore, sink, move |cancel, sink| {
            let _guard = guard;
            let report = job.run(cancel, sink)?;

            let mut message = format!("Data restored from {}", archive_name);
            if let Some(copy) = &report.safety_copy {
                message.push_str(&format!(". Previous data store saved to {}", copy.display()));
            }
            message.push_str(". Restart the application to load the restored data.");
            Ok(message)
        })
    }

    /// Archives in the catalog, newest first
    pub fn list_archives(&self) -> Result<Vec<ArchiveRecord>> {
        catalog::list_archives(&self.paths.catalog_dir)
    }

    pub fn verify_archive(&self, path: &Path) -> VerifyReport {
        verify_archive(path)
    }

    /// Delete one archive file
    pub fn delete_archive(&self, path: &Path) -> Result<()> {
        if path.extension().map(|e| e != ARCHIVE_EXTENSION).unwrap_or(true) {
            return Err(Error::invalid_archive(path, "not an archive file"));
        }
        if lock(&self.restoring_from).as_deref() == Some(canonical(path).as_path()) {
            return Err(Error::Busy);
        }

        fs::remove_file(path).map_err(|source| Error::CleanupFailure {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!("Deleted archive {}", path.display());
        Ok(())
    }

    /// Whether a scheduled backup is due at `now`
    pub fn needs_scheduled_backup(&self, now: DateTime<Utc>) -> bool {
        let settings = lock(&self.settings);
        if !settings.autobackup_enabled {
            return false;
        }
        match settings.last_backup_at {
            None => true,
            Some(last) => {
                now - last >= Duration::hours(i64::from(settings.autobackup_interval_hours))
            }
        }
    }

    /// One scheduler tick: start a data-store-only backup if one is due.
    ///
    /// Never prompts and never fails; a backup that could not start is
    /// logged and tried again on the next tick.
    pub fn tick(&self, now: DateTime<Utc>, sink: Arc<dyn ProgressSink>) -> Option<JobHandle> {
        if !self.needs_scheduled_backup(now) {
            return None;
        }

        match self.launch_backup(ArchiveOrigin::Auto, ArchiveKind::DbOnly, None, sink) {
            Ok(handle) => Some(handle),
            Err(Error::Busy) => {
                tracing::debug!("Scheduled backup deferred: another job is running");
                None
            }
            Err(e) => {
                tracing::error!("Scheduled backup could not start: {}", e);
                None
            }
        }
    }

    /// Size and modification time of the live data store
    pub fn store_info(&self) -> Result<StoreInfo> {
        let path = &self.paths.data_store;
        let metadata = fs::metadata(path).map_err(|_| Error::SourceMissing { path: path.clone() })?;
        let size_bytes = metadata.len();

        Ok(StoreInfo {
            path: path.clone(),
            size_bytes,
            size_mb: (size_bytes as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0,
            last_modified: metadata.modified().ok().map(DateTime::<Utc>::from),
        })
    }

    pub fn auto_backup_status(&self) -> String {
        let settings = lock(&self.settings);
        if settings.autobackup_enabled {
            format!(
                "Auto-backup enabled (every {} h)",
                settings.autobackup_interval_hours
            )
        } else {
            "Auto-backup disabled".to_string()
        }
    }
}

fn persist(store: &dyn SettingsStore, settings: &ArchiverSettings) {
    if let Err(e) = store.save(settings) {
        tracing::error!("Failed to save archiver settings: {}", e);
    }
}

fn canonical(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Delete archives beyond `max_count`, never touching `protected` paths
fn apply_retention(catalog_dir: &Path, max_count: usize, protected: &[PathBuf]) {
    let records = match catalog::list_archives(catalog_dir) {
        Ok(records) => records,
        Err(e) => {
            tracing::warn!("Retention skipped, cannot list {}: {}", catalog_dir.display(), e);
            return;
        }
    };

    for record in retention::select(&records, max_count) {
        if protected.contains(&record.path) {
            continue;
        }
        match fs::remove_file(&record.path) {
            Ok(()) => tracing::info!("Removed old backup {}", record.name),
            Err(source) => {
                let err = Error::CleanupFailure {
                    path: record.path.clone(),
                    source,
                };
                tracing::warn!("{}", err);
            }
        }
    }
}
