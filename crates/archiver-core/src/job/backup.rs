//! Backup job: live data store -> archive in the catalog

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::archive::{
    sha256_file, write_archive, ArchiveKind, ArchiveMetadata, DATA_STORE_ENTRY,
};
use crate::error::{Error, Result};

use super::{
    copy_error, copy_file_tolerant, copy_tree, discard_temp_dir, CancellationToken, Checkpoints,
    JobHandle, JobKind, ProgressSink,
};

/// Result of a successful backup
#[derive(Debug, Clone)]
pub struct BackupReport {
    /// Where the archive was placed
    pub path: PathBuf,
    /// Metadata embedded in the archive
    pub metadata: ArchiveMetadata,
}

/// Produces one archive from the live data store.
///
/// Everything is staged in a private directory beside the destination and
/// the finished container is renamed into place as the last step, so the
/// destination path only ever holds a complete archive.
#[derive(Debug, Clone)]
pub struct BackupJob {
    destination: PathBuf,
    data_store: PathBuf,
    resources: Option<PathBuf>,
    kind: ArchiveKind,
}

impl BackupJob {
    pub fn new(
        destination: impl Into<PathBuf>,
        data_store: impl Into<PathBuf>,
        kind: ArchiveKind,
    ) -> Self {
        Self {
            destination: destination.into(),
            data_store: data_store.into(),
            resources: None,
            kind,
        }
    }

    /// Resource tree to include when `kind` is [`ArchiveKind::Full`]
    pub fn with_resources(mut self, resources: Option<PathBuf>) -> Self {
        self.resources = resources;
        self
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub fn kind(&self) -> ArchiveKind {
        self.kind
    }

    /// Run the backup on the current thread
    pub fn run(&self, cancel: &CancellationToken, sink: &dyn ProgressSink) -> Result<BackupReport> {
        let mut checkpoints = Checkpoints::new(cancel, sink);
        checkpoints.reach(0, "Preparing backup...")?;

        if !self.data_store.is_file() {
            return Err(Error::SourceMissing {
                path: self.data_store.clone(),
            });
        }

        let parent = match self.destination.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).map_err(|e| Error::write_failure(&parent, e))?;

        let staging = tempfile::Builder::new()
            .prefix(".archiver-backup-")
            .tempdir_in(&parent)
            .map_err(|e| Error::write_failure(&parent, e))?;

        let result = self.build(staging.path(), &mut checkpoints);
        discard_temp_dir(staging);
        result
    }

    fn build(&self, staging: &Path, checkpoints: &mut Checkpoints<'_>) -> Result<BackupReport> {
        checkpoints.reach(20, "Copying data store...")?;
        let staged_store = staging.join(DATA_STORE_ENTRY);
        copy_file_tolerant(&self.data_store, &staged_store).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound && !self.data_store.exists() {
                Error::SourceMissing {
                    path: self.data_store.clone(),
                }
            } else {
                copy_error(&self.data_store, &staged_store, e)
            }
        })?;

        checkpoints.reach(40, "Writing metadata...")?;
        let size = fs::metadata(&staged_store)
            .map_err(|e| Error::read_failure(&staged_store, e))?
            .len();
        let checksum = sha256_file(&staged_store)?;
        let metadata = ArchiveMetadata::new(self.kind, size, Some(checksum));

        let staged_resources = if self.kind.includes_resources() {
            checkpoints.reach(60, "Copying resources...")?;
            self.stage_resources(staging)?
        } else {
            None
        };

        checkpoints.reach(80, "Packaging archive...")?;
        let container = staging.join("archive.partial");
        write_archive(
            &container,
            &staged_store,
            staged_resources.as_deref(),
            &metadata,
        )?;

        checkpoints.reach(90, "Finalizing...")?;
        fs::rename(&container, &self.destination)
            .map_err(|e| Error::write_failure(&self.destination, e))?;

        checkpoints.report(100, "Backup completed");
        tracing::info!(
            "Created {} backup {} ({} bytes)",
            self.kind,
            self.destination.display(),
            size
        );

        Ok(BackupReport {
            path: self.destination.clone(),
            metadata,
        })
    }

    fn stage_resources(&self, staging: &Path) -> Result<Option<PathBuf>> {
        match &self.resources {
            Some(src) if src.is_dir() => {
                let dst = staging.join("resources");
                let files = copy_tree(src, &dst)?;
                tracing::debug!("Staged {} resource files from {}", files, src.display());
                Ok(Some(dst))
            }
            Some(src) => {
                tracing::warn!(
                    "Resource directory {} not found, archiving data store only",
                    src.display()
                );
                Ok(None)
            }
            None => {
                tracing::warn!("No resource directory configured, archiving data store only");
                Ok(None)
            }
        }
    }

    /// Run the backup on a worker thread
    pub fn spawn(self, sink: Arc<dyn ProgressSink>) -> Result<JobHandle> {
        JobHandle::spawn(JobKind::Backup, sink, move |cancel, sink| {
            let report = self.run(cancel, sink)?;
            Ok(format!("Backup saved: {}", report.path.display()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{extract_archive, verify_archive};
    use crate::job::NullSink;
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(u8, String)>>,
    }

    impl ProgressSink for Recorder {
        fn on_progress(&self, percent: u8, message: &str) {
            self.events.lock().unwrap().push((percent, message.to_string()));
        }
        fn on_complete(&self, _success: bool, _message: &str) {}
    }

    /// Cancels as soon as a given progress percentage is reported
    struct CancelAt {
        percent: u8,
        token: CancellationToken,
    }

    impl ProgressSink for CancelAt {
        fn on_progress(&self, percent: u8, _message: &str) {
            if percent == self.percent {
                self.token.cancel();
            }
        }
        fn on_complete(&self, _success: bool, _message: &str) {}
    }

    fn staging_dirs(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| n.starts_with(".archiver-"))
            .collect()
    }

    #[test]
    fn test_db_only_backup_round_trip() {
        let temp_dir = tempdir().unwrap();
        let store = temp_dir.path().join("db.bin");
        let contents: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        fs::write(&store, &contents).unwrap();
        let catalog = temp_dir.path().join("catalog");
        let dest = catalog.join("manual_db_20260101_000000.archive");

        let recorder = Recorder::default();
        let report = BackupJob::new(&dest, &store, ArchiveKind::DbOnly)
            .run(&CancellationToken::new(), &recorder)
            .unwrap();

        assert_eq!(report.path, dest);
        assert_eq!(report.metadata.source_size_bytes, contents.len() as u64);

        let verified = verify_archive(&dest);
        assert!(verified.valid, "{:?}", verified.error);
        assert_eq!(verified.metadata.unwrap().source_size_bytes, contents.len() as u64);

        let out = temp_dir.path().join("out");
        extract_archive(&dest, &out).unwrap();
        assert_eq!(fs::read(out.join(DATA_STORE_ENTRY)).unwrap(), contents);

        let percents: Vec<u8> = recorder
            .events
            .lock()
            .unwrap()
            .iter()
            .map(|(p, _)| *p)
            .collect();
        assert_eq!(percents, vec![0, 20, 40, 80, 90, 100]);
        assert!(staging_dirs(&catalog).is_empty());
    }

    #[test]
    fn test_full_backup_includes_resources() {
        let temp_dir = tempdir().unwrap();
        let store = temp_dir.path().join("db.bin");
        fs::write(&store, b"rows").unwrap();
        let resources = temp_dir.path().join("resources");
        fs::create_dir_all(resources.join("docs")).unwrap();
        fs::write(resources.join("docs/invoice.pdf"), b"%PDF").unwrap();
        let dest = temp_dir.path().join("full.archive");

        BackupJob::new(&dest, &store, ArchiveKind::Full)
            .with_resources(Some(resources))
            .run(&CancellationToken::new(), &NullSink)
            .unwrap();

        let report = verify_archive(&dest);
        assert!(report.valid);
        assert!(report.has_resources());
        assert!(report.files.contains(&"resources/docs/invoice.pdf".to_string()));
        assert_eq!(report.metadata.unwrap().kind, ArchiveKind::Full);
    }

    #[test]
    fn test_missing_source_leaves_nothing_behind() {
        let temp_dir = tempdir().unwrap();
        let dest = temp_dir.path().join("out.archive");

        let err = BackupJob::new(&dest, temp_dir.path().join("missing.db"), ArchiveKind::DbOnly)
            .run(&CancellationToken::new(), &NullSink)
            .unwrap_err();

        assert!(matches!(err, Error::SourceMissing { .. }));
        assert!(!dest.exists());
        assert!(staging_dirs(temp_dir.path()).is_empty());
    }

    #[test]
    fn test_cancel_between_checkpoints() {
        for percent in [20u8, 40, 60, 80] {
            let temp_dir = tempdir().unwrap();
            let store = temp_dir.path().join("db.bin");
            fs::write(&store, vec![1u8; 4096]).unwrap();
            let resources = temp_dir.path().join("res");
            fs::create_dir_all(&resources).unwrap();
            fs::write(resources.join("a.txt"), b"a").unwrap();
            let dest = temp_dir.path().join("out.archive");

            let token = CancellationToken::new();
            let sink = CancelAt {
                percent,
                token: token.clone(),
            };
            let err = BackupJob::new(&dest, &store, ArchiveKind::Full)
                .with_resources(Some(resources))
                .run(&token, &sink)
                .unwrap_err();

            assert!(err.is_cancelled(), "cancel at {}: {}", percent, err);
            assert!(!dest.exists(), "cancel at {} left an archive", percent);
            assert!(staging_dirs(temp_dir.path()).is_empty());
        }
    }

    #[test]
    fn test_spawned_backup() {
        let temp_dir = tempdir().unwrap();
        let store = temp_dir.path().join("db.bin");
        fs::write(&store, b"rows").unwrap();
        let dest = temp_dir.path().join("spawned.archive");

        let handle = BackupJob::new(&dest, &store, ArchiveKind::DbOnly)
            .spawn(Arc::new(NullSink))
            .unwrap();
        let outcome = handle.wait();

        assert!(outcome.success(), "{}", outcome.message);
        assert!(outcome.message.contains("spawned.archive"));
        assert!(dest.exists());
    }
}
