// pg-s3-backup/src/backup/archive.rs
use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::Path;

/// Returns true iff `archive_path` is a gzip stream that decompresses to at
/// least one byte.
///
/// Only the first decompressed byte is read, so the check is cheap even for
/// very large dumps. The file is opened read-only and closed again before
/// returning, leaving it untouched for the upload that follows.
pub fn is_valid_archive(archive_path: &Path) -> bool {
    match has_decompressed_content(archive_path) {
        Ok(true) => true,
        Ok(false) => {
            tracing::warn!(path = %archive_path.display(), "archive decompresses to zero bytes");
            false
        }
        Err(e) => {
            tracing::warn!(path = %archive_path.display(), error = %format!("{:#}", e), "archive is not readable as gzip");
            false
        }
    }
}

fn has_decompressed_content(archive_path: &Path) -> Result<bool> {
    let archive_file = File::open(archive_path)
        .with_context(|| format!("Failed to open archive file: {}", archive_path.display()))?;
    let mut gz_decoder = GzDecoder::new(BufReader::new(archive_file));

    let mut first_byte = [0u8; 1];
    loop {
        match gz_decoder.read(&mut first_byte) {
            Ok(0) => return Ok(false),
            Ok(_) => return Ok(true),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to decompress archive: {}", archive_path.display())
                });
            }
        }
    }
}

/// Size of the archive on disk, in bytes.
pub fn archive_size(archive_path: &Path) -> Result<u64> {
    let metadata = std::fs::metadata(archive_path)
        .with_context(|| format!("Failed to stat archive file: {}", archive_path.display()))?;
    Ok(metadata.len())
}
