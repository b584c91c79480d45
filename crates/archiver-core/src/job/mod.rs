//! Background jobs: backup and restore
//!
//! Each job runs on its own worker thread and reports through a
//! [`ProgressSink`]. Jobs are cancelled cooperatively: the flag is checked
//! between checkpoints, never inside a single copy.

mod backup;
mod restore;

pub use backup::{BackupJob, BackupReport};
pub use restore::{safety_copy_path, RestoreJob, RestoreReport};

use std::fmt;
use std::fs;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};
use walkdir::WalkDir;

use crate::error::{Error, Result};

/// Consumer of job progress and completion events
pub trait ProgressSink: Send + Sync {
    /// Progress within a job; `percent` never decreases within one job
    fn on_progress(&self, percent: u8, message: &str);

    /// Emitted exactly once when a job finishes
    fn on_complete(&self, success: bool, message: &str);
}

/// Sink that discards all events (unattended runs)
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn on_progress(&self, _percent: u8, _message: &str) {}
    fn on_complete(&self, _success: bool, _message: &str) {}
}

/// Event forwarded by [`ChannelSink`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    Progress { percent: u8, message: String },
    Completed { success: bool, message: String },
}

/// Sink that forwards events over a channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: Sender<JobEvent>,
}

impl ChannelSink {
    pub fn new(tx: Sender<JobEvent>) -> Self {
        Self { tx }
    }
}

impl ProgressSink for ChannelSink {
    fn on_progress(&self, percent: u8, message: &str) {
        let _ = self.tx.send(JobEvent::Progress {
            percent,
            message: message.to_string(),
        });
    }

    fn on_complete(&self, success: bool, message: &str) {
        let _ = self.tx.send(JobEvent::Completed {
            success,
            message: message.to_string(),
        });
    }
}

/// Cooperative cancellation flag shared between a job and its caller
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Which job is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Backup,
    Restore,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Backup => write!(f, "Backup"),
            JobKind::Restore => write!(f, "Restore"),
        }
    }
}

/// Lifecycle of a job: `Pending -> Running -> {Completed | Failed | Cancelled}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JobState {
    Pending = 0,
    Running = 1,
    Completed = 2,
    Failed = 3,
    Cancelled = 4,
}

impl JobState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => JobState::Pending,
            1 => JobState::Running,
            2 => JobState::Completed,
            3 => JobState::Failed,
            _ => JobState::Cancelled,
        }
    }

    /// Whether the job has stopped
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Pending => write!(f, "Pending"),
            JobState::Running => write!(f, "Running"),
            JobState::Completed => write!(f, "Completed"),
            JobState::Failed => write!(f, "Failed"),
            JobState::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Final result of a job, as reported to the completion event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub state: JobState,
    pub message: String,
}

impl JobOutcome {
    pub fn success(&self) -> bool {
        self.state == JobState::Completed
    }
}

/// Handle to a job running on a worker thread
pub struct JobHandle {
    kind: JobKind,
    state: Arc<AtomicU8>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<JobOutcome>>,
}

impl JobHandle {
    /// Run `work` on a new worker thread.
    ///
    /// `work` returns the completion message on success. Whatever it
    /// captures is dropped before the completion event is emitted.
    pub(crate) fn spawn<F>(kind: JobKind, sink: Arc<dyn ProgressSink>, work: F) -> Result<Self>
    where
        F: FnOnce(&CancellationToken, &dyn ProgressSink) -> Result<String> + Send + 'static,
    {
        let state = Arc::new(AtomicU8::new(JobState::Pending as u8));
        let cancel = CancellationToken::new();

        let thread_state = Arc::clone(&state);
        let thread_cancel = cancel.clone();
        let handle = thread::Builder::new()
            .name(format!("archiver-{}", kind).to_lowercase())
            .spawn(move || {
                thread_state.store(JobState::Running as u8, Ordering::SeqCst);

                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    work(&thread_cancel, sink.as_ref())
                }));
                let outcome = match result {
                    Ok(Ok(message)) => JobOutcome {
                        state: JobState::Completed,
                        message,
                    },
                    Ok(Err(Error::Cancelled)) => JobOutcome {
                        state: JobState::Cancelled,
                        message: format!("{} cancelled", kind),
                    },
                    Ok(Err(e)) => JobOutcome {
                        state: JobState::Failed,
                        message: format!("{} failed: {}", kind, e),
                    },
                    Err(_) => JobOutcome {
                        state: JobState::Failed,
                        message: format!("{} failed: worker panicked", kind),
                    },
                };

                match outcome.state {
                    JobState::Completed => tracing::info!("{}", outcome.message),
                    JobState::Cancelled => tracing::info!("{}", outcome.message),
                    _ => tracing::error!("{}", outcome.message),
                }

                thread_state.store(outcome.state as u8, Ordering::SeqCst);
                sink.on_complete(outcome.success(), &outcome.message);
                outcome
            })?;

        Ok(Self {
            kind,
            state,
            cancel,
            handle: Some(handle),
        })
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    /// Current state of the job
    pub fn state(&self) -> JobState {
        JobState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    /// Request cancellation; takes effect at the job's next checkpoint
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this job, for callers that give the handle away
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the worker to finish
    pub fn wait(mut self) -> JobOutcome {
        match self.handle.take().map(JoinHandle::join) {
            Some(Ok(outcome)) => outcome,
            _ => JobOutcome {
                state: JobState::Failed,
                message: format!("{} failed: worker thread lost", self.kind),
            },
        }
    }
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish()
    }
}

/// Progress reporting and cancellation checks for one job
pub(crate) struct Checkpoints<'a> {
    cancel: &'a CancellationToken,
    sink: &'a dyn ProgressSink,
    last: u8,
}

impl<'a> Checkpoints<'a> {
    pub(crate) fn new(cancel: &'a CancellationToken, sink: &'a dyn ProgressSink) -> Self {
        Self {
            cancel,
            sink,
            last: 0,
        }
    }

    /// Check for cancellation, then report progress
    pub(crate) fn reach(&mut self, percent: u8, message: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.report(percent, message);
        Ok(())
    }

    /// Report progress without a cancellation check
    pub(crate) fn report(&mut self, percent: u8, message: &str) {
        let percent = percent.min(100).max(self.last);
        self.last = percent;
        self.sink.on_progress(percent, message);
    }
}

const COPY_ATTEMPTS: u32 = 5;
const COPY_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Copy a file that another process may have open.
///
/// Retries on transient lock/busy errors; the destination is only open for
/// the duration of a single attempt.
pub(crate) fn copy_file_tolerant(src: &Path, dst: &Path) -> io::Result<u64> {
    let mut attempt = 1;
    loop {
        match fs::copy(src, dst) {
            Ok(bytes) => return Ok(bytes),
            Err(e) if attempt < COPY_ATTEMPTS && is_transient(&e) => {
                tracing::debug!(
                    "Copy of {} busy (attempt {}/{}): {}",
                    src.display(),
                    attempt,
                    COPY_ATTEMPTS,
                    e
                );
                attempt += 1;
                thread::sleep(COPY_RETRY_DELAY);
            }
            Err(e) => return Err(e),
        }
    }
}

fn is_transient(err: &io::Error) -> bool {
    if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) {
        return true;
    }
    // ERROR_SHARING_VIOLATION / ERROR_LOCK_VIOLATION
    cfg!(windows) && matches!(err.raw_os_error(), Some(32) | Some(33))
}

/// Attribute a failed copy to whichever side is at fault
pub(crate) fn copy_error(src: &Path, dst: &Path, err: io::Error) -> Error {
    match fs::File::open(src) {
        Err(read) => Error::read_failure(src, read),
        Ok(_) => Error::write_failure(dst, err),
    }
}

fn walk_error(root: &Path, err: walkdir::Error) -> Error {
    let path = err.path().unwrap_or(root).to_path_buf();
    Error::read_failure(path, io::Error::from(err))
}

/// Recursively copy a directory tree, returning the number of files copied
pub(crate) fn copy_tree(src: &Path, dst: &Path) -> Result<usize> {
    fs::create_dir_all(dst).map_err(|e| Error::write_failure(dst, e))?;

    let mut files = 0usize;
    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(|e| walk_error(src, e))?;
        let relative = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dst.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(|e| Error::write_failure(&target, e))?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| Error::write_failure(parent, e))?;
            }
            copy_file_tolerant(entry.path(), &target)
                .map_err(|e| copy_error(entry.path(), &target, e))?;
            files += 1;
        }
    }

    Ok(files)
}

/// Remove a job's temporary directory; failures are logged, not returned
pub(crate) fn discard_temp_dir(dir: tempfile::TempDir) {
    let path = dir.path().to_path_buf();
    if let Err(source) = dir.close() {
        let err = Error::CleanupFailure { path, source };
        tracing::warn!("{}", err);
    }
}

/// Remove a leftover file if present; failures are logged, not returned
pub(crate) fn discard_file(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(source) => {
            let err = Error::CleanupFailure {
                path: path.to_path_buf(),
                source,
            };
            tracing::warn!("{}", err);
        }
    }
}

/// Name prefix of every job staging directory
pub(crate) const STAGING_PREFIX: &str = ".archiver-";

/// Remove staging directories in `dir` left behind by an interrupted
/// process. Only directories untouched for at least `max_age` are removed.
/// Returns how many were removed.
pub(crate) fn sweep_stale_staging(dir: &Path, max_age: Duration) -> usize {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return 0,
    };

    let now = SystemTime::now();
    let mut removed = 0;
    for entry in entries.filter_map(|e| e.ok()) {
        if !entry.file_name().to_string_lossy().starts_with(STAGING_PREFIX) {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if !metadata.is_dir() {
            continue;
        }
        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age < max_age {
            continue;
        }

        let path = entry.path();
        match fs::remove_dir_all(&path) {
            Ok(()) => {
                tracing::info!("Removed stale staging directory {}", path.display());
                removed += 1;
            }
            Err(source) => {
                let err = Error::CleanupFailure { path, source };
                tracing::warn!("{}", err);
            }
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use tempfile::tempdir;

    #[test]
    fn test_checkpoints_are_monotonic() {
        let (tx, rx) = mpsc::channel();
        let sink = ChannelSink::new(tx);
        let cancel = CancellationToken::new();
        let mut checkpoints = Checkpoints::new(&cancel, &sink);

        checkpoints.reach(20, "a").unwrap();
        checkpoints.reach(10, "b").unwrap();
        checkpoints.report(150, "c");

        let percents: Vec<u8> = rx
            .try_iter()
            .map(|event| match event {
                JobEvent::Progress { percent, .. } => percent,
                JobEvent::Completed { .. } => panic!("unexpected completion"),
            })
            .collect();
        assert_eq!(percents, vec![20, 20, 100]);
    }

    #[test]
    fn test_checkpoint_observes_cancellation() {
        let cancel = CancellationToken::new();
        let mut checkpoints = Checkpoints::new(&cancel, &NullSink);
        checkpoints.reach(0, "start").unwrap();

        cancel.cancel();
        assert!(matches!(checkpoints.reach(20, "next"), Err(Error::Cancelled)));
    }

    #[test]
    fn test_spawned_job_reports_completion_once() {
        let (tx, rx) = mpsc::channel();
        let sink = Arc::new(ChannelSink::new(tx));
        let handle = JobHandle::spawn(JobKind::Backup, sink, |_, sink| {
            sink.on_progress(50, "halfway");
            Ok("done".to_string())
        })
        .unwrap();

        let outcome = handle.wait();
        assert_eq!(outcome.state, JobState::Completed);
        assert_eq!(outcome.message, "done");

        let events: Vec<JobEvent> = rx.try_iter().collect();
        assert_eq!(
            events,
            vec![
                JobEvent::Progress {
                    percent: 50,
                    message: "halfway".to_string()
                },
                JobEvent::Completed {
                    success: true,
                    message: "done".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_spawned_job_failure_and_cancellation() {
        let failed = JobHandle::spawn(JobKind::Restore, Arc::new(NullSink), |_, _| {
            Err(Error::Busy)
        })
        .unwrap()
        .wait();
        assert_eq!(failed.state, JobState::Failed);
        assert!(failed.message.starts_with("Restore failed"));

        let cancelled = JobHandle::spawn(JobKind::Backup, Arc::new(NullSink), |_, _| {
            Err(Error::Cancelled)
        })
        .unwrap()
        .wait();
        assert_eq!(cancelled.state, JobState::Cancelled);
    }

    #[test]
    fn test_panicking_job_is_reported_as_failed() {
        let work = |_: &CancellationToken, _: &dyn ProgressSink| -> Result<String> {
            panic!("boom")
        };
        let outcome = JobHandle::spawn(JobKind::Backup, Arc::new(NullSink), work)
            .unwrap()
            .wait();
        assert_eq!(outcome.state, JobState::Failed);
    }

    #[test]
    fn test_cancellation_token_reaches_running_job() {
        let (started_tx, started_rx) = mpsc::channel();
        let handle = JobHandle::spawn(JobKind::Backup, Arc::new(NullSink), move |cancel, _| {
            let _ = started_tx.send(());
            while !cancel.is_cancelled() {
                thread::sleep(Duration::from_millis(5));
            }
            Err(Error::Cancelled)
        })
        .unwrap();

        started_rx.recv().unwrap();
        assert!(!handle.is_finished());
        let token = handle.cancellation_token();
        thread::spawn(move || token.cancel()).join().unwrap();

        while !handle.is_finished() {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(handle.state(), JobState::Cancelled);
        assert_eq!(handle.wait().state, JobState::Cancelled);
    }

    #[test]
    fn test_copy_error_blames_missing_source() {
        let temp_dir = tempdir().unwrap();
        let src = temp_dir.path().join("gone.txt");
        let dst = temp_dir.path().join("staging/gone.txt");
        let err = copy_file_tolerant(&src, &dst).unwrap_err();

        let err = copy_error(&src, &dst, err);
        assert!(matches!(err, Error::ReadFailure { ref path, .. } if path == &src));
    }

    #[test]
    fn test_copy_error_blames_destination() {
        let temp_dir = tempdir().unwrap();
        let src = temp_dir.path().join("present.txt");
        fs::write(&src, b"data").unwrap();
        let dst = temp_dir.path().join("no/such/dir/present.txt");
        let err = copy_file_tolerant(&src, &dst).unwrap_err();

        let err = copy_error(&src, &dst, err);
        assert!(matches!(err, Error::WriteFailure { ref path, .. } if path == &dst));
    }

    #[test]
    fn test_copy_tree_names_missing_source_root() {
        let temp_dir = tempdir().unwrap();
        let src = temp_dir.path().join("absent");

        let err = copy_tree(&src, &temp_dir.path().join("dst")).unwrap_err();
        assert!(matches!(err, Error::ReadFailure { ref path, .. } if path == &src));
    }

    #[test]
    fn test_discard_file() {
        let temp_dir = tempdir().unwrap();
        let leftover = temp_dir.path().join("db.bin.restoring");
        fs::write(&leftover, b"partial").unwrap();

        discard_file(&leftover);
        assert!(!leftover.exists());
        // Already gone is not a failure
        discard_file(&leftover);
    }

    #[test]
    fn test_sweep_removes_only_stale_staging() {
        let temp_dir = tempdir().unwrap();
        let dir = temp_dir.path();
        fs::create_dir_all(dir.join(".archiver-backup-abc123/resources")).unwrap();
        fs::write(dir.join(".archiver-backup-abc123/database.db"), b"x").unwrap();
        fs::create_dir_all(dir.join(".archiver-restore-def456")).unwrap();
        fs::create_dir_all(dir.join("unrelated")).unwrap();
        fs::write(dir.join(".archiver-note"), b"not a directory").unwrap();

        // Freshly created directories are left alone
        assert_eq!(sweep_stale_staging(dir, Duration::from_secs(3600)), 0);
        assert!(dir.join(".archiver-backup-abc123").exists());

        assert_eq!(sweep_stale_staging(dir, Duration::ZERO), 2);
        assert!(!dir.join(".archiver-backup-abc123").exists());
        assert!(!dir.join(".archiver-restore-def456").exists());
        assert!(dir.join("unrelated").is_dir());
        assert!(dir.join(".archiver-note").is_file());
    }

    #[test]
    fn test_sweep_of_missing_directory() {
        let temp_dir = tempdir().unwrap();
        assert_eq!(sweep_stale_staging(&temp_dir.path().join("nope"), Duration::ZERO), 0);
    }

    #[test]
    fn test_copy_tree() {
        let temp_dir = tempdir().unwrap();
        let src = temp_dir.path().join("src");
        fs::create_dir_all(src.join("a/b")).unwrap();
        fs::create_dir_all(src.join("empty")).unwrap();
        fs::write(src.join("a/b/file.txt"), b"deep").unwrap();
        fs::write(src.join("top.txt"), b"top").unwrap();

        let dst = temp_dir.path().join("dst");
        assert_eq!(copy_tree(&src, &dst).unwrap(), 2);
        assert_eq!(fs::read(dst.join("a/b/file.txt")).unwrap(), b"deep");
        assert_eq!(fs::read(dst.join("top.txt")).unwrap(), b"top");
        assert!(dst.join("empty").is_dir());
    }
}
