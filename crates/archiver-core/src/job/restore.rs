//! Restore job: archive -> live data store (and resources)

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::archive::{
    extract_archive, verify_archive, ArchiveMetadata, VerifyReport, DATA_STORE_ENTRY,
};
use crate::error::{Error, Result};

use super::{
    copy_error, copy_file_tolerant, copy_tree, discard_file, discard_temp_dir, CancellationToken,
    Checkpoints, JobHandle, JobKind, ProgressSink,
};

/// Path of the safety copy taken before `target` is overwritten
pub fn safety_copy_path(target: &Path) -> PathBuf {
    with_suffix(target, ".backup")
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Result of a successful restore
#[derive(Debug, Clone)]
pub struct RestoreReport {
    /// Data store that was replaced
    pub data_store: PathBuf,
    /// Copy of the previous data store, when there was one
    pub safety_copy: Option<PathBuf>,
    /// Whether the resource tree was replaced as well
    pub resources_restored: bool,
    pub metadata: Option<ArchiveMetadata>,
}

/// Replaces the live data store with the contents of an archive.
///
/// The archive is validated in full before anything is touched. Once the
/// data store has been swapped the job no longer honours cancellation, so a
/// cancelled restore never leaves a half-restored installation behind.
#[derive(Debug, Clone)]
pub struct RestoreJob {
    archive: PathBuf,
    data_store: PathBuf,
    resources: Option<PathBuf>,
}

impl RestoreJob {
    pub fn new(archive: impl Into<PathBuf>, data_store: impl Into<PathBuf>) -> Self {
        Self {
            archive: archive.into(),
            data_store: data_store.into(),
            resources: None,
        }
    }

    /// Where to restore the resource tree if the archive carries one
    pub fn with_resources(mut self, resources: Option<PathBuf>) -> Self {
        self.resources = resources;
        self
    }

    pub fn archive(&self) -> &Path {
        &self.archive
    }

    /// Run the restore on the current thread
    pub fn run(
        &self,
        cancel: &CancellationToken,
        sink: &dyn ProgressSink,
    ) -> Result<RestoreReport> {
        let mut checkpoints = Checkpoints::new(cancel, sink);
        checkpoints.reach(0, "Validating archive...")?;

        let report = verify_archive(&self.archive);
        if !report.valid {
            let reason = report
                .error
                .unwrap_or_else(|| "archive failed verification".to_string());
            return Err(Error::invalid_archive(&self.archive, reason));
        }
        if let Some(metadata) = &report.metadata {
            tracing::info!(
                "Restoring {} backup from {}",
                metadata.kind,
                metadata.created_at.format("%Y-%m-%d %H:%M:%S")
            );
        }

        let parent = match self.data_store.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).map_err(|e| Error::write_failure(&parent, e))?;

        let staging = tempfile::Builder::new()
            .prefix(".archiver-restore-")
            .tempdir_in(&parent)
            .map_err(|e| Error::write_failure(&parent, e))?;

        let result = self.apply(staging.path(), report, &mut checkpoints);
        discard_temp_dir(staging);
        result
    }

    fn apply(
        &self,
        staging: &Path,
        report: VerifyReport,
        checkpoints: &mut Checkpoints<'_>,
    ) -> Result<RestoreReport> {
        checkpoints.reach(20, "Extracting archive...")?;
        extract_archive(&self.archive, staging)?;

        checkpoints.reach(60, "Restoring data store...")?;
        let safety_copy = if self.data_store.exists() {
            let copy = safety_copy_path(&self.data_store);
            copy_file_tolerant(&self.data_store, &copy)
                .map_err(|e| copy_error(&self.data_store, &copy, e))?;
            tracing::info!("Saved current data store to {}", copy.display());
            Some(copy)
        } else {
            None
        };

        match self.replace(staging, &report, checkpoints) {
            Ok(resources_restored) => {
                checkpoints.report(100, "Restore completed");
                Ok(RestoreReport {
                    data_store: self.data_store.clone(),
                    safety_copy,
                    resources_restored,
                    metadata: report.metadata,
                })
            }
            Err(e) => match safety_copy {
                Some(safety_copy) => Err(Error::RestoreInterrupted {
                    safety_copy,
                    reason: e.to_string(),
                }),
                None => Err(e),
            },
        }
    }

    /// Swap in the extracted data store, then the resources.
    /// Returns whether resources were restored.
    fn replace(
        &self,
        staging: &Path,
        report: &VerifyReport,
        checkpoints: &mut Checkpoints<'_>,
    ) -> Result<bool> {
        let extracted_store = staging.join(DATA_STORE_ENTRY);
        let incoming = with_suffix(&self.data_store, ".restoring");

        if let Err(e) = copy_file_tolerant(&extracted_store, &incoming) {
            discard_file(&incoming);
            return Err(copy_error(&extracted_store, &incoming, e));
        }
        if let Err(e) = fs::rename(&incoming, &self.data_store) {
            discard_file(&incoming);
            return Err(Error::write_failure(&self.data_store, e));
        }

        if !report.has_resources() {
            return Ok(false);
        }
        let Some(dest) = &self.resources else {
            tracing::debug!("Archive has resources but no resource directory was given");
            return Ok(false);
        };

        checkpoints.report(80, "Restoring resources...");
        if dest.exists() {
            fs::remove_dir_all(dest).map_err(|e| Error::write_failure(dest, e))?;
        }
        let files = copy_tree(&staging.join("resources"), dest)?;
        tracing::info!("Restored {} resource files to {}", files, dest.display());
        Ok(true)
    }

    /// Run the restore on a worker thread
    pub fn spawn(self, sink: Arc<dyn ProgressSink>) -> Result<JobHandle> {
        JobHandle::spawn(JobKind::Restore, sink, move |cancel, sink| {
            self.run(cancel, sink)?;
            Ok(format!("Data restored from {}", self.archive.display()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveKind;
    use crate::job::{BackupJob, NullSink};
    use tempfile::{tempdir, TempDir};

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

    /// Flips bytes in the middle of an archive once `percent` is reported
    struct CorruptAt {
        percent: u8,
        archive: PathBuf,
    }

    impl ProgressSink for CorruptAt {
        fn on_progress(&self, percent: u8, _message: &str) {
            if percent == self.percent {
                let mut bytes = fs::read(&self.archive).unwrap();
                let mid = bytes.len() / 2;
                for b in &mut bytes[mid..mid + 32] {
                    *b ^= 0xff;
                }
                fs::write(&self.archive, &bytes).unwrap();
            }
        }
        fn on_complete(&self, _success: bool, _message: &str) {}
    }

    fn noise(len: usize) -> Vec<u8> {
        let mut state = 0x1234_5678_u32;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                state as u8
            })
            .collect()
    }

    /// A full archive of `contents` plus one resource file
    fn full_archive(temp_dir: &TempDir, contents: &[u8]) -> PathBuf {
        let source = temp_dir.path().join("source");
        fs::create_dir_all(source.join("res/sub")).unwrap();
        fs::write(source.join("db.bin"), contents).unwrap();
        fs::write(source.join("res/sub/note.txt"), b"archived note").unwrap();

        let archive = temp_dir.path().join("full.archive");
        BackupJob::new(&archive, source.join("db.bin"), ArchiveKind::Full)
            .with_resources(Some(source.join("res")))
            .run(&CancellationToken::new(), &NullSink)
            .unwrap();
        archive
    }

    #[test]
    fn test_safety_copy_path_appends_suffix() {
        assert_eq!(
            safety_copy_path(Path::new("/data/store.db")),
            PathBuf::from("/data/store.db.backup")
        );
    }

    #[test]
    fn test_restore_replaces_store_and_keeps_safety_copy() {
        let temp_dir = tempdir().unwrap();
        let archive = full_archive(&temp_dir, b"archived rows");

        let live = temp_dir.path().join("live");
        fs::create_dir_all(live.join("res")).unwrap();
        fs::write(live.join("db.bin"), b"current rows").unwrap();
        fs::write(live.join("res/stale.txt"), b"stale").unwrap();
        let archive_bytes = fs::read(&archive).unwrap();

        let report = RestoreJob::new(&archive, live.join("db.bin"))
            .with_resources(Some(live.join("res")))
            .run(&CancellationToken::new(), &NullSink)
            .unwrap();

        assert_eq!(fs::read(live.join("db.bin")).unwrap(), b"archived rows");
        assert_eq!(fs::read(live.join("db.bin.backup")).unwrap(), b"current rows");
        assert_eq!(report.safety_copy, Some(live.join("db.bin.backup")));
        assert!(report.resources_restored);
        assert_eq!(fs::read(live.join("res/sub/note.txt")).unwrap(), b"archived note");
        assert!(!live.join("res/stale.txt").exists());
        assert!(!live.join("db.bin.restoring").exists());

        // The archive itself is never modified
        assert_eq!(fs::read(&archive).unwrap(), archive_bytes);
    }

    #[test]
    fn test_restore_without_existing_store_takes_no_safety_copy() {
        let temp_dir = tempdir().unwrap();
        let archive = full_archive(&temp_dir, b"archived rows");
        let target = temp_dir.path().join("fresh/db.bin");

        let report = RestoreJob::new(&archive, &target)
            .run(&CancellationToken::new(), &NullSink)
            .unwrap();

        assert_eq!(fs::read(&target).unwrap(), b"archived rows");
        assert!(report.safety_copy.is_none());
        assert!(!report.resources_restored);
        assert!(!safety_copy_path(&target).exists());
    }

    #[test]
    fn test_invalid_archive_leaves_store_untouched() {
        let temp_dir = tempdir().unwrap();
        let archive = full_archive(&temp_dir, b"archived rows");
        let bytes = fs::read(&archive).unwrap();
        let truncated = temp_dir.path().join("truncated.archive");
        fs::write(&truncated, &bytes[..bytes.len() / 2]).unwrap();

        let target = temp_dir.path().join("db.bin");
        fs::write(&target, b"current rows").unwrap();

        let err = RestoreJob::new(&truncated, &target)
            .run(&CancellationToken::new(), &NullSink)
            .unwrap_err();

        assert!(matches!(err, Error::InvalidArchive { .. }));
        assert_eq!(fs::read(&target).unwrap(), b"current rows");
        assert!(!safety_copy_path(&target).exists());
    }

    #[test]
    fn test_archive_damaged_after_validation_names_archive() {
        let temp_dir = tempdir().unwrap();
        let archive = full_archive(&temp_dir, &noise(128 * 1024));
        let target = temp_dir.path().join("db.bin");
        fs::write(&target, b"current rows").unwrap();

        let sink = CorruptAt {
            percent: 20,
            archive: archive.clone(),
        };
        let err = RestoreJob::new(&archive, &target)
            .run(&CancellationToken::new(), &sink)
            .unwrap_err();

        match &err {
            Error::InvalidArchive { path, .. } => assert_eq!(path, &archive),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(err.to_string().contains("full.archive"), "{}", err);
        assert_eq!(fs::read(&target).unwrap(), b"current rows");
        assert!(!safety_copy_path(&target).exists());
    }

    #[test]
    fn test_failure_after_safety_copy_points_at_it() {
        let temp_dir = tempdir().unwrap();
        let archive = full_archive(&temp_dir, b"archived rows");
        let live = temp_dir.path().join("live");
        fs::create_dir_all(&live).unwrap();
        let target = live.join("db.bin");
        fs::write(&target, b"current rows").unwrap();
        // A plain file where the resource tree should go
        let resources = live.join("res");
        fs::write(&resources, b"not a directory").unwrap();

        let err = RestoreJob::new(&archive, &target)
            .with_resources(Some(resources))
            .run(&CancellationToken::new(), &NullSink)
            .unwrap_err();

        let backup = live.join("db.bin.backup");
        match &err {
            Error::RestoreInterrupted { safety_copy, .. } => assert_eq!(safety_copy, &backup),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(err.to_string().contains("db.bin.backup"), "{}", err);
        assert_eq!(fs::read(&backup).unwrap(), b"current rows");
    }

    #[test]
    fn test_failed_swap_keeps_current_store() {
        let temp_dir = tempdir().unwrap();
        let archive = full_archive(&temp_dir, b"archived rows");
        let target = temp_dir.path().join("db.bin");
        fs::write(&target, b"current rows").unwrap();
        // Blocks the incoming copy of the store
        fs::create_dir_all(temp_dir.path().join("db.bin.restoring")).unwrap();

        let err = RestoreJob::new(&archive, &target)
            .run(&CancellationToken::new(), &NullSink)
            .unwrap_err();

        assert!(matches!(err, Error::RestoreInterrupted { .. }), "{}", err);
        assert!(err.to_string().contains("db.bin.restoring"), "{}", err);
        assert_eq!(fs::read(&target).unwrap(), b"current rows");
        assert_eq!(fs::read(safety_copy_path(&target)).unwrap(), b"current rows");
    }

    #[test]
    fn test_archive_without_metadata_restores() {
        let temp_dir = tempdir().unwrap();
        // Hand-built container holding only the store entry
        let archive = temp_dir.path().join("legacy.archive");
        {
            let file = fs::File::create(&archive).unwrap();
            let mut zip = zip::ZipWriter::new(file);
            zip.start_file(DATA_STORE_ENTRY, zip::write::SimpleFileOptions::default())
                .unwrap();
            std::io::Write::write_all(&mut zip, b"legacy rows").unwrap();
            zip.finish().unwrap();
        }

        let target = temp_dir.path().join("out/db.bin");
        let report = RestoreJob::new(&archive, &target)
            .run(&CancellationToken::new(), &NullSink)
            .unwrap();
        assert!(report.metadata.is_none());
        assert_eq!(fs::read(&target).unwrap(), b"legacy rows");
    }

    #[test]
    fn test_cancel_before_swap_has_no_side_effects() {
        for percent in [0u8, 20] {
            let temp_dir = tempdir().unwrap();
            let archive = full_archive(&temp_dir, b"archived rows");
            let target = temp_dir.path().join("db.bin");
            fs::write(&target, b"current rows").unwrap();

            let token = CancellationToken::new();
            let sink = CancelAt {
                percent,
                token: token.clone(),
            };
            let err = RestoreJob::new(&archive, &target)
                .run(&token, &sink)
                .unwrap_err();

            assert!(err.is_cancelled());
            assert_eq!(fs::read(&target).unwrap(), b"current rows");
            assert!(!safety_copy_path(&target).exists());
        }
    }

    #[test]
    fn test_cancel_after_swap_is_ignored() {
        let temp_dir = tempdir().unwrap();
        let archive = full_archive(&temp_dir, b"archived rows");
        let target = temp_dir.path().join("db.bin");
        fs::write(&target, b"current rows").unwrap();

        let token = CancellationToken::new();
        let sink = CancelAt {
            percent: 60,
            token: token.clone(),
        };
        RestoreJob::new(&archive, &target)
            .with_resources(Some(temp_dir.path().join("res")))
            .run(&token, &sink)
            .unwrap();

        assert_eq!(fs::read(&target).unwrap(), b"archived rows");
        assert!(temp_dir.path().join("res/sub/note.txt").exists());
    }

    #[test]
    fn test_spawned_restore() {
        let temp_dir = tempdir().unwrap();
        let archive = full_archive(&temp_dir, b"archived rows");
        let target = temp_dir.path().join("db.bin");

        let outcome = RestoreJob::new(&archive, &target)
            .spawn(Arc::new(NullSink))
            .unwrap()
            .wait();

        assert!(outcome.success(), "{}", outcome.message);
        assert!(outcome.message.starts_with("Data restored from"));
        assert_eq!(fs::read(&target).unwrap(), b"archived rows");
    }
}
