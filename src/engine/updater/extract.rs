//! Package Extraction
//!
//! Unpacks a zip package from a forward-only byte stream while recording each
//! file's size and digest. `unpack_package` reads the downloaded package once
//! and fans the bytes out to the package hasher and the extractor. Entries
//! whose sizes only follow their data (zip data descriptors) cannot be read
//! forward-only; those packages are extracted again from the central
//! directory of the file on disk.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read};
use std::path::{Component, Path, PathBuf};
use tokio::task;
use tracing::{debug, warn};
use zip::read::read_zipfile_from_stream;
use zip::result::ZipError;
use zip::ZipArchive;

use super::error::{ExtractError, UpdateError};
use super::hasher::{
    fan_out, read_chunks, ChunkReceiver, ContentHasher, HashAlgorithm, HashingWriter,
};

const CHUNK_SIZE: usize = 64 * 1024;
const CHANNEL_DEPTH: usize = 8;

/// A file written during extraction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedEntry {
    /// Relative path with `/` separators
    pub path: String,
    pub size: u64,
    pub sha256: String,
}

/// Result of unpacking a package
#[derive(Debug, Clone)]
pub struct UnpackedPackage {
    /// Digest of the whole package as it was read
    pub package_hash: String,
    pub package_size: u64,
    pub entries: Vec<ExtractedEntry>,
}

/// Extract every file entry of a zip stream into `dest`.
///
/// The reader is consumed to its end even after the last entry, so a
/// producer feeding it never blocks on an abandoned consumer.
pub fn extract_zip_stream<R: Read>(
    mut reader: R,
    dest: &Path,
) -> Result<Vec<ExtractedEntry>, ExtractError> {
    fs::create_dir_all(dest)?;
    let mut entries = Vec::new();

    while let Some(mut entry) = read_zipfile_from_stream(&mut reader)? {
        let relative = entry.enclosed_name();
        let name = entry.name().to_string();
        let is_dir = entry.is_dir();
        if let Some(extracted) = write_entry(&mut entry, relative, &name, is_dir, dest)? {
            entries.push(extracted);
        }
    }

    io::copy(&mut reader, &mut io::sink())?;
    debug!("Extracted {} file(s) into {}", entries.len(), dest.display());
    Ok(entries)
}

/// Extract a zip package through its central directory.
pub fn extract_zip_file(package: &Path, dest: &Path) -> Result<Vec<ExtractedEntry>, ExtractError> {
    fs::create_dir_all(dest)?;
    let mut archive = ZipArchive::new(File::open(package)?)?;
    let mut entries = Vec::new();

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let relative = entry.enclosed_name();
        let name = entry.name().to_string();
        let is_dir = entry.is_dir();
        if let Some(extracted) = write_entry(&mut entry, relative, &name, is_dir, dest)? {
            entries.push(extracted);
        }
    }

    debug!("Extracted {} file(s) into {}", entries.len(), dest.display());
    Ok(entries)
}

fn write_entry<R: Read>(
    entry: &mut R,
    relative: Option<PathBuf>,
    name: &str,
    is_dir: bool,
    dest: &Path,
) -> Result<Option<ExtractedEntry>, ExtractError> {
    let relative = relative.ok_or_else(|| ExtractError::UnsafeEntry(name.to_string()))?;
    let target = dest.join(&relative);

    if is_dir {
        fs::create_dir_all(&target)?;
        return Ok(None);
    }
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }

    let file = BufWriter::new(File::create(&target)?);
    let mut writer = HashingWriter::new(file, HashAlgorithm::Sha256);
    io::copy(entry, &mut writer)?;
    let (_, size, sha256) = writer.finish()?;

    Ok(Some(ExtractedEntry {
        path: slash_path(&relative),
        size,
        sha256,
    }))
}

/// Read `package` once, hashing it while extracting it into `dest`.
///
/// The package hash is returned, not checked; the caller decides what a
/// mismatch means. Extraction errors are reported only after the hasher has
/// seen the whole package.
pub async fn unpack_package(
    package: &Path,
    dest: PathBuf,
) -> Result<UnpackedPackage, UpdateError> {
    let file = tokio::fs::File::open(package)
        .await
        .map_err(|e| UpdateError::io(format!("Failed to open {}", package.display()), e))?;

    let (pump, receivers) = fan_out(read_chunks(file, CHUNK_SIZE), 2, CHANNEL_DEPTH);
    let [hash_rx, extract_rx]: [ChunkReceiver; 2] = receivers
        .try_into()
        .map_err(|_| UpdateError::Task("fan-out produced the wrong number of branches".into()))?;

    let stream_dest = dest.clone();
    let extractor = task::spawn_blocking(move || {
        extract_zip_stream(extract_rx.into_blocking_reader(), &stream_dest)
    });

    let (pumped, hashed) = tokio::join!(
        pump,
        ContentHasher::hash_chunks(hash_rx, HashAlgorithm::Sha256)
    );
    let mut extracted = extractor.await?;

    pumped.map_err(|e| UpdateError::io("Failed to read package", e))?;
    let (package_hash, package_size) =
        hashed.map_err(|e| UpdateError::io("Failed to hash package", e))?;

    if let Err(ExtractError::Zip(ZipError::UnsupportedArchive(reason))) = &extracted {
        debug!(
            "Streaming extraction of {} not possible ({}), reading the central directory",
            package.display(),
            reason
        );
        let package = package.to_path_buf();
        extracted = task::spawn_blocking(move || -> Result<_, ExtractError> {
            match fs::remove_dir_all(&dest) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
            extract_zip_file(&package, &dest)
        })
        .await?;
    }

    let entries = extracted.map_err(|e| {
        warn!("Extraction of {} failed: {}", package.display(), e);
        UpdateError::Extract(e)
    })?;

    Ok(UnpackedPackage {
        package_hash,
        package_size,
        entries,
    })
}

fn slash_path(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
