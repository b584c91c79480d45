//! On-disk archive container
//!
//! An archive is a ZIP container with a fixed internal layout:
//! - `database.db` - byte copy of the data store (required)
//! - `resources/` - recursive copy of the resource tree (optional)
//! - `metadata.json` - [`ArchiveMetadata`] descriptor (optional when reading)
//!
//! [`write_archive`], [`verify_archive`] and [`extract_archive`] are the only
//! places that know this layout; jobs and the catalog go through them.

mod format;

pub use format::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Internal name of the data-store entry
pub const DATA_STORE_ENTRY: &str = "database.db";

/// Internal prefix of the resource tree
pub const RESOURCES_PREFIX: &str = "resources/";

/// Internal name of the metadata entry
pub const METADATA_ENTRY: &str = "metadata.json";

/// Container layout version written by this crate
pub const FORMAT_VERSION: u32 = 1;

/// What an archive contains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveKind {
    /// Data store plus resource tree
    Full,
    /// Data store alone
    #[serde(alias = "database_only")]
    DbOnly,
}

impl ArchiveKind {
    /// Select the kind for a backup request
    pub fn from_include_resources(include_resources: bool) -> Self {
        if include_resources {
            ArchiveKind::Full
        } else {
            ArchiveKind::DbOnly
        }
    }

    /// Token used inside archive file names
    pub fn file_token(&self) -> &'static str {
        match self {
            ArchiveKind::Full => "full",
            ArchiveKind::DbOnly => "db",
        }
    }

    /// Parse a file-name token
    pub fn from_file_token(token: &str) -> Option<Self> {
        match token {
            "full" => Some(ArchiveKind::Full),
            "db" => Some(ArchiveKind::DbOnly),
            _ => None,
        }
    }

    /// Value stored in metadata and shown in listings
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveKind::Full => "full",
            ArchiveKind::DbOnly => "db_only",
        }
    }

    pub fn includes_resources(&self) -> bool {
        matches!(self, ArchiveKind::Full)
    }
}

impl fmt::Display for ArchiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Descriptor embedded in every archive (`metadata.json`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveMetadata {
    /// Container layout version; archives written before versioning count as 1
    #[serde(default = "legacy_format_version")]
    pub format_version: u32,
    /// When the backup was taken
    #[serde(with = "iso8601")]
    pub created_at: DateTime<Utc>,
    /// Size of the copied data-store file in bytes
    #[serde(alias = "database_size")]
    pub source_size_bytes: u64,
    /// Version of the application that produced the archive
    pub app_version: String,
    /// What the archive contains
    #[serde(alias = "backup_type")]
    pub kind: ArchiveKind,
    /// Hex SHA-256 of the copied data store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_sha256: Option<String>,
}

fn legacy_format_version() -> u32 {
    1
}

impl ArchiveMetadata {
    /// Create metadata for a backup taken now
    pub fn new(kind: ArchiveKind, source_size_bytes: u64, source_sha256: Option<String>) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            created_at: Utc::now(),
            source_size_bytes,
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            kind,
            source_sha256,
        }
    }

    /// Serialize to JSON bytes for inclusion in the container
    pub fn to_json_bytes(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }
}

/// Outcome of [`verify_archive`]; never an error, always a verdict
#[derive(Debug, Clone, Default, Serialize)]
pub struct VerifyReport {
    /// Whether the archive can be restored
    pub valid: bool,
    /// Decoded metadata, if the archive has any
    pub metadata: Option<ArchiveMetadata>,
    /// Internal entry names
    pub files: Vec<String>,
    /// Why the archive is invalid
    pub error: Option<String>,
}

impl VerifyReport {
    /// Whether the archive carries a resource tree
    pub fn has_resources(&self) -> bool {
        self.files.iter().any(|f| f.starts_with(RESOURCES_PREFIX))
    }
}

/// Timestamps are written as RFC 3339; older archives used naive local
/// ISO-8601 without an offset, which is read as UTC.
mod iso8601 {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &DateTime<Utc>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if let Ok(parsed) = DateTime::parse_from_rfc3339(&raw) {
            return Ok(parsed.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
            .map_err(serde::de::Error::custom)
    }
}

/// Format bytes to human-readable size
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
