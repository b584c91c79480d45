//! # archiver-core
//!
//! Backup and restore of a single file-based data store plus an optional
//! resource tree.
//!
//! This crate provides:
//! - A versioned, self-describing ZIP archive format with integrity checks
//! - Cancellable backup and restore jobs running on worker threads
//! - A retention policy bounding the number of archives kept
//! - An [`ArchiveManager`] that serializes jobs, schedules backups through
//!   an explicit `tick` and exposes the archive catalog
//!
//! ## Modules
//!
//! - [`archive`] - Archive container layout, write/verify/extract
//! - [`catalog`] - Archive file naming and catalog listing
//! - [`error`] - Error types and Result alias
//! - [`job`] - Backup/restore jobs, progress sinks and cancellation
//! - [`manager`] - Orchestration of jobs, settings and retention
//! - [`retention`] - Selection of archives to delete
//! - [`settings`] - Persisted archiver settings
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use archiver_core::{ArchiveManager, ArchivePaths, NullSink};
//!
//! let manager = ArchiveManager::with_json_settings(ArchivePaths {
//!     data_store: "app/database.db".into(),
//!     resources: Some("app/files".into()),
//!     catalog_dir: "app/backups".into(),
//! });
//!
//! let handle = manager
//!     .create_backup(true, None, Arc::new(NullSink))
//!     .expect("another job is running");
//! let outcome = handle.wait();
//! println!("{}", outcome.message);
//! ```

pub mod archive;
pub mod catalog;
pub mod error;
pub mod job;
pub mod manager;
pub mod retention;
pub mod settings;

// Error types
pub use error::{Error, Result};

// Archive format
pub use archive::{
    extract_archive, format_size, read_metadata, verify_archive, write_archive, ArchiveKind,
    ArchiveMetadata, VerifyReport, FORMAT_VERSION,
};

// Catalog
pub use catalog::{list_archives, ArchiveName, ArchiveOrigin, ArchiveRecord};

// Jobs
pub use job::{
    safety_copy_path, BackupJob, BackupReport, CancellationToken, ChannelSink, JobEvent,
    JobHandle, JobKind, JobOutcome, JobState, NullSink, ProgressSink, RestoreJob, RestoreReport,
};

// Orchestration
pub use manager::{ArchiveManager, ArchivePaths, StoreInfo};

// Settings
pub use settings::{
    default_catalog_dir, ArchiverSettings, JsonSettingsStore, MemorySettingsStore, SettingsStore,
};
