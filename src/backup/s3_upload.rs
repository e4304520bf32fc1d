// pg-s3-backup/src/backup/s3_upload.rs
use anyhow::{Context, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use md5::{Digest, Md5};
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncReadExt;

use super::logic::JobPhase;
use super::retention;
use super::storage::ObjectStore;
use crate::config::UploadChecksum;
use crate::errors::BackupError;

const HASH_CHUNK_SIZE: usize = 1024 * 1024;

/// Uploads a finished archive and retires the previous ones under the same
/// prefix. Never touches the local file beyond reading it.
pub struct UploadPipeline {
    store: Arc<dyn ObjectStore>,
    checksum: UploadChecksum,
}

impl UploadPipeline {
    pub fn new(store: Arc<dyn ObjectStore>, checksum: UploadChecksum) -> Self {
        Self { store, checksum }
    }

    pub async fn upload(&self, local_path: &Path, remote_key: &str, prefix: &str) -> Result<(), BackupError> {
        debug_assert!(remote_key.starts_with(prefix));
        tracing::info!(
            phase = %JobPhase::Uploading,
            key = %remote_key,
            prefix = %prefix,
            "Uploading backup to S3..."
        );

        let content_md5 = match self.checksum {
            UploadChecksum::None => None,
            UploadChecksum::ContentMd5 => {
                tracing::info!(path = %local_path.display(), "MD5 hashing file...");
                let digest = file_md5(local_path)
                    .await
                    .map_err(|e| BackupError::upload(remote_key, e))?;
                tracing::info!(md5 = %hex::encode(digest), "Done hashing file");
                Some(BASE64.encode(digest))
            }
        };

        self.store
            .put_object(remote_key, local_path, content_md5.as_deref())
            .await
            .map_err(|e| BackupError::upload(remote_key, e))?;
        tracing::info!(key = %remote_key, "✅ Backup uploaded to S3");

        // Old backups go only once the new one is confirmed stored.
        match retention::prune(self.store.as_ref(), prefix, remote_key).await {
            Ok(report) => {
                tracing::info!(
                    prefix = %prefix,
                    deleted = report.deleted.len(),
                    failed = report.failed.len(),
                    "Retention cleanup finished"
                );
            }
            Err(e) => {
                tracing::warn!(
                    prefix = %prefix,
                    error = %format!("{:#}", e),
                    "Could not list old backups; they will be retried on the next run"
                );
            }
        }

        Ok(())
    }
}

/// MD5 of a file, read in fixed-size chunks so memory stays bounded.
async fn file_md5(path: &Path) -> Result<[u8; 16]> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("Failed to open {} for hashing", path.display()))?;
    let mut hasher = Md5::new();
    let mut buffer = vec![0u8; HASH_CHUNK_SIZE];

    loop {
        let n = file
            .read(&mut buffer)
            .await
            .with_context(|| format!("Failed to read {} for hashing", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    let mut digest = [0u8; 16];
    digest.copy_from_slice(&hasher.finalize());
    Ok(digest)
}
