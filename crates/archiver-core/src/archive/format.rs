//! Archive creation, verification and extraction

use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;
use walkdir::WalkDir;
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use super::{
    ArchiveMetadata, VerifyReport, DATA_STORE_ENTRY, FORMAT_VERSION, METADATA_ENTRY,
    RESOURCES_PREFIX,
};

/// Write a complete archive container at `container`.
///
/// The data store is stored as [`DATA_STORE_ENTRY`], the resource tree (if
/// given) under [`RESOURCES_PREFIX`], and `metadata` as [`METADATA_ENTRY`].
/// The container is only complete once this returns `Ok`; callers place it
/// into the catalog afterwards.
pub fn write_archive(
    container: &Path,
    data_store: &Path,
    resources: Option<&Path>,
    metadata: &ArchiveMetadata,
) -> Result<()> {
    if !data_store.is_file() {
        return Err(Error::SourceMissing {
            path: data_store.to_path_buf(),
        });
    }

    let file = File::create(container).map_err(|e| Error::write_failure(container, e))?;
    let mut zip = ZipWriter::new(file);

    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(Some(6));

    let store_size = fs::metadata(data_store)
        .map_err(|e| Error::read_failure(data_store, e))?
        .len();
    add_file_to_zip(
        &mut zip,
        data_store,
        DATA_STORE_ENTRY,
        options.large_file(store_size >= u32::MAX as u64),
    )
    .map_err(|e| zip_write_error(container, e))?;

    if let Some(root) = resources {
        add_tree_to_zip(&mut zip, root, options)
            .map_err(|e| zip_write_error(container, e))?;
    }

    let metadata_json = metadata.to_json_bytes()?;
    zip.start_file(METADATA_ENTRY, options)
        .map_err(|e| zip_write_error(container, e))?;
    zip.write_all(&metadata_json)
        .map_err(|e| Error::write_failure(container, e))?;

    let file = zip.finish().map_err(|e| zip_write_error(container, e))?;
    file.sync_all().map_err(|e| Error::write_failure(container, e))?;

    Ok(())
}

/// Add a file to a zip archive, returning its size
fn add_file_to_zip<W: Write + io::Seek>(
    zip: &mut ZipWriter<W>,
    file_path: &Path,
    archive_path: &str,
    options: SimpleFileOptions,
) -> std::result::Result<u64, ZipError> {
    let mut file = File::open(file_path)?;
    zip.start_file(archive_path, options)?;
    let written = io::copy(&mut file, zip)?;
    Ok(written)
}

/// Add a directory tree under [`RESOURCES_PREFIX`]
fn add_tree_to_zip<W: Write + io::Seek>(
    zip: &mut ZipWriter<W>,
    root: &Path,
    options: SimpleFileOptions,
) -> std::result::Result<(), ZipError> {
    zip.add_directory(RESOURCES_PREFIX, options)?;

    for entry in WalkDir::new(root).min_depth(1) {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        let archive_path = format!("{}{}", RESOURCES_PREFIX, relative);

        if entry.file_type().is_dir() {
            zip.add_directory(format!("{}/", archive_path), options)?;
        } else if entry.file_type().is_file() {
            let size = entry.metadata().map_err(io::Error::from)?.len();
            add_file_to_zip(
                zip,
                entry.path(),
                &archive_path,
                options.large_file(size >= u32::MAX as u64),
            )?;
        }
    }

    Ok(())
}

fn zip_write_error(container: &Path, err: ZipError) -> Error {
    match err {
        ZipError::Io(e) => Error::write_failure(container, e),
        other => Error::Zip(other),
    }
}

/// Check the integrity of an archive.
///
/// Every entry is read to the end so truncation and CRC mismatches surface,
/// the data-store entry must be present, and when metadata is present its
/// recorded size and checksum must match the data-store entry. A missing
/// metadata entry is tolerated. This function never fails; problems are
/// reported through [`VerifyReport::error`].
pub fn verify_archive(container: &Path) -> VerifyReport {
    let mut report = VerifyReport::default();
    match inspect(container, &mut report) {
        Ok(()) => report.valid = true,
        Err(reason) => {
            tracing::debug!(
                "Archive {} failed verification: {}",
                container.display(),
                reason
            );
            report.error = Some(reason);
        }
    }
    report
}

fn inspect(container: &Path, report: &mut VerifyReport) -> std::result::Result<(), String> {
    let file = File::open(container).map_err(|e| format!("Cannot open archive file: {}", e))?;
    let mut archive =
        ZipArchive::new(file).map_err(|e| format!("Not a valid archive container: {}", e))?;

    report.files = archive.file_names().map(str::to_string).collect();

    let mut store: Option<(u64, String)> = None;
    let mut metadata_bytes: Option<Vec<u8>> = None;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| format!("Archive is corrupt: cannot open entry {}: {}", i, e))?;
        let name = entry.name().to_string();

        if entry.enclosed_name().is_none() {
            return Err(format!("Entry escapes the archive root: {}", name));
        }
        if entry.is_dir() {
            continue;
        }

        let corrupt = |e: io::Error| format!("Archive is corrupt: cannot read {}: {}", name, e);
        if name == DATA_STORE_ENTRY {
            let mut hasher = Sha256::new();
            let size = io::copy(&mut entry, &mut hasher).map_err(corrupt)?;
            store = Some((size, hex::encode(hasher.finalize())));
        } else if name == METADATA_ENTRY {
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes).map_err(corrupt)?;
            metadata_bytes = Some(bytes);
        } else {
            io::copy(&mut entry, &mut io::sink()).map_err(corrupt)?;
        }
    }

    let (store_size, store_digest) =
        store.ok_or_else(|| format!("Data store entry {} not found in archive", DATA_STORE_ENTRY))?;

    let Some(bytes) = metadata_bytes else {
        return Ok(());
    };
    let metadata: ArchiveMetadata =
        serde_json::from_slice(&bytes).map_err(|e| format!("Metadata is malformed: {}", e))?;
    report.metadata = Some(metadata.clone());

    if metadata.format_version > FORMAT_VERSION {
        return Err(format!(
            "Archive format version {} is newer than supported version {}",
            metadata.format_version, FORMAT_VERSION
        ));
    }
    if metadata.source_size_bytes != store_size {
        return Err(format!(
            "Data store size mismatch: metadata records {} bytes, archive holds {}",
            metadata.source_size_bytes, store_size
        ));
    }
    if let Some(expected) = &metadata.source_sha256 {
        if !expected.eq_ignore_ascii_case(&store_digest) {
            return Err("Data store checksum mismatch".to_string());
        }
    }

    Ok(())
}

/// Read the metadata entry without a full integrity pass.
///
/// Returns `Err` when the file is not an archive container at all, and
/// `Ok(None)` for a container without (readable) metadata.
pub fn read_metadata(container: &Path) -> Result<Option<ArchiveMetadata>> {
    let file = File::open(container)?;
    let mut archive = ZipArchive::new(file)?;

    let mut entry = match archive.by_name(METADATA_ENTRY) {
        Ok(entry) => entry,
        Err(ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut content = String::new();
    if entry.read_to_string(&mut content).is_err() {
        return Ok(None);
    }

    Ok(serde_json::from_str(&content).ok())
}

/// Unpack an archive into `dest`.
///
/// Callers are expected to run [`verify_archive`] first; this only checks
/// that the container opens and holds the data-store entry. Entries that
/// would land outside `dest` are skipped.
pub fn extract_archive(container: &Path, dest: &Path) -> Result<()> {
    let file =
        File::open(container).map_err(|e| Error::invalid_archive(container, e.to_string()))?;
    let mut archive =
        ZipArchive::new(file).map_err(|e| Error::invalid_archive(container, e.to_string()))?;

    if archive.by_name(DATA_STORE_ENTRY).is_err() {
        return Err(Error::invalid_archive(
            container,
            format!("Data store entry {} not found in archive", DATA_STORE_ENTRY),
        ));
    }

    fs::create_dir_all(dest).map_err(|e| Error::write_failure(dest, e))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| Error::invalid_archive(container, e.to_string()))?;
        let outpath = match entry.enclosed_name() {
            Some(path) => dest.join(path),
            None => {
                tracing::warn!(
                    "Skipping archive entry outside extraction root: {}",
                    entry.name()
                );
                continue;
            }
        };

        if entry.is_dir() {
            fs::create_dir_all(&outpath).map_err(|e| Error::write_failure(&outpath, e))?;
            continue;
        }

        if let Some(parent) = outpath.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::write_failure(parent, e))?;
        }

        let mut outfile =
            File::create(&outpath).map_err(|e| Error::write_failure(&outpath, e))?;
        unpack_entry(&mut entry, &mut outfile, container, &outpath)?;
    }

    Ok(())
}

/// Stream one entry out; read errors (corrupt data, CRC) blame the container
fn unpack_entry(
    entry: &mut impl Read,
    outfile: &mut File,
    container: &Path,
    outpath: &Path,
) -> Result<()> {
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = match entry.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(Error::invalid_archive(
                    container,
                    format!("cannot read entry for {}: {}", outpath.display(), e),
                ))
            }
        };
        outfile
            .write_all(&buf[..n])
            .map_err(|e| Error::write_failure(outpath, e))?;
    }
}

/// Hex SHA-256 of a file's contents
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| Error::read_failure(path, e))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)
        .map_err(|e| Error::read_failure(path, e))?;
    Ok(hex::encode(hasher.finalize()))
}
