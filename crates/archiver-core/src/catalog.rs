//! Archive catalog: file naming and directory listing
//!
//! Archive files are named `<origin>_<kind>_<YYYYMMDD>_<HHMMSS>.archive`,
//! with an optional `_<n>` suffix before the extension when two backups land
//! in the same second. Records are always recomputed from the files on disk.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::archive::{format_size, read_metadata, ArchiveKind};
use crate::error::Result;
use crate::retention::sort_newest_first;

/// Extension of archive files in the catalog
pub const ARCHIVE_EXTENSION: &str = "archive";

const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Who asked for a backup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveOrigin {
    /// Requested by a user
    Manual,
    /// Triggered by the scheduler
    Auto,
}

impl ArchiveOrigin {
    /// Get the filename prefix for this origin
    pub fn file_prefix(&self) -> &'static str {
        match self {
            ArchiveOrigin::Manual => "manual",
            ArchiveOrigin::Auto => "auto",
        }
    }

    /// Parse from filename prefix
    pub fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "manual" => Some(ArchiveOrigin::Manual),
            "auto" => Some(ArchiveOrigin::Auto),
            _ => None,
        }
    }
}

impl fmt::Display for ArchiveOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.file_prefix())
    }
}

/// Fields encoded in an archive file name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveName {
    pub origin: ArchiveOrigin,
    pub kind: ArchiveKind,
    pub timestamp: NaiveDateTime,
}

impl ArchiveName {
    pub fn new(origin: ArchiveOrigin, kind: ArchiveKind, timestamp: NaiveDateTime) -> Self {
        Self {
            origin,
            kind,
            timestamp,
        }
    }

    /// Render the canonical file name
    pub fn file_name(&self) -> String {
        format!(
            "{}_{}_{}.{}",
            self.origin.file_prefix(),
            self.kind.file_token(),
            self.timestamp.format(TIMESTAMP_FORMAT),
            ARCHIVE_EXTENSION
        )
    }

    /// Parse a file name produced by [`ArchiveName::file_name`] or
    /// [`ArchiveName::unique_path_in`]
    pub fn parse(file_name: &str) -> Option<Self> {
        let stem = file_name.strip_suffix(&format!(".{}", ARCHIVE_EXTENSION))?;
        let parts: Vec<&str> = stem.split('_').collect();
        if parts.len() != 4 && parts.len() != 5 {
            return None;
        }
        if parts.len() == 5 && parts[4].parse::<u32>().is_err() {
            return None;
        }

        let origin = ArchiveOrigin::from_prefix(parts[0])?;
        let kind = ArchiveKind::from_file_token(parts[1])?;
        let timestamp =
            NaiveDateTime::parse_from_str(&format!("{}_{}", parts[2], parts[3]), TIMESTAMP_FORMAT)
                .ok()?;

        Some(Self::new(origin, kind, timestamp))
    }

    /// A path in `dir` that does not exist yet, appending `_1`, `_2`, ...
    /// to the canonical name on collision
    pub fn unique_path_in(&self, dir: &Path) -> PathBuf {
        let canonical = dir.join(self.file_name());
        if !canonical.exists() {
            return canonical;
        }

        let stem = format!(
            "{}_{}_{}",
            self.origin.file_prefix(),
            self.kind.file_token(),
            self.timestamp.format(TIMESTAMP_FORMAT)
        );
        let mut counter = 1u32;
        loop {
            let candidate = dir.join(format!("{}_{}.{}", stem, counter, ARCHIVE_EXTENSION));
            if !candidate.exists() {
                return candidate;
            }
            counter += 1;
        }
    }
}

/// A catalog entry derived from an archive file and its metadata
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveRecord {
    /// Absolute path to the archive
    pub path: PathBuf,
    /// File name for display
    pub name: String,
    /// Archive file size in bytes
    pub size_bytes: u64,
    /// Archive file size in MB, rounded to two decimals
    pub size_mb: f64,
    /// Creation time from metadata, falling back to the file's mtime
    pub created_at: DateTime<Utc>,
    /// Archive kind from metadata, falling back to the file name
    pub kind: Option<ArchiveKind>,
    /// Producing application version, if recorded
    pub app_version: Option<String>,
    /// Manual or scheduled, if the file name says
    pub origin: Option<ArchiveOrigin>,
}

impl ArchiveRecord {
    /// Build a record for `path`, or `None` if it does not look like an archive
    pub fn from_path(path: &Path) -> Option<Self> {
        let metadata = match read_metadata(path) {
            Ok(metadata) => metadata,
            Err(e) => {
                tracing::debug!("Skipping {}: {}", path.display(), e);
                return None;
            }
        };

        let file_metadata = fs::metadata(path).ok()?;
        let name = path.file_name()?.to_string_lossy().to_string();
        let parsed = ArchiveName::parse(&name);

        let created_at = match &metadata {
            Some(m) => m.created_at,
            None => DateTime::<Utc>::from(file_metadata.modified().ok()?),
        };
        let size_bytes = file_metadata.len();

        Some(Self {
            path: fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf()),
            name,
            size_bytes,
            size_mb: bytes_to_mb(size_bytes),
            created_at,
            kind: metadata.as_ref().map(|m| m.kind).or(parsed.map(|p| p.kind)),
            app_version: metadata.map(|m| m.app_version),
            origin: parsed.map(|p| p.origin),
        })
    }

    /// Get human-readable size
    pub fn size_display(&self) -> String {
        format_size(self.size_bytes)
    }

    /// Get human-readable age relative to `now`
    pub fn age_display(&self, now: DateTime<Utc>) -> String {
        let secs = (now - self.created_at).num_seconds().max(0);

        if secs < 60 {
            "just now".to_string()
        } else if secs < 3600 {
            format!("{} min ago", secs / 60)
        } else if secs < 86400 {
            format!("{} hours ago", secs / 3600)
        } else if secs < 604800 {
            format!("{} days ago", secs / 86400)
        } else {
            format!("{} weeks ago", secs / 604800)
        }
    }

    /// Kind for display
    pub fn kind_display(&self) -> &'static str {
        self.kind.map(|k| k.as_str()).unwrap_or("unknown")
    }
}

fn bytes_to_mb(bytes: u64) -> f64 {
    (bytes as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0
}

/// List the archives in `dir`, newest first.
///
/// Only top-level files with the archive extension are considered; files
/// that do not open as a container are skipped.
pub fn list_archives(dir: &Path) -> Result<Vec<ArchiveRecord>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut records = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();

        if !path.is_file() || path.extension().map(|e| e != ARCHIVE_EXTENSION).unwrap_or(true) {
            continue;
        }
        if let Some(record) = ArchiveRecord::from_path(&path) {
            records.push(record);
        }
    }

    sort_newest_first(&mut records);
    Ok(records)
}
