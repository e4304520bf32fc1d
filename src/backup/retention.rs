use anyhow::Result;

use super::logic::JobPhase;
use super::storage::ObjectStore;
use crate::errors::BackupError;

/// Outcome of one pruning pass.
#[derive(Debug, Default)]
pub struct PruneReport {
    pub deleted: Vec<String>,
    pub failed: Vec<BackupError>,
}

/// Deletes every object under `prefix` except `survivor_key`.
///
/// `prefix` names a folder; listing is done with a trailing `/` so that
/// `daily-backup` never matches keys under `daily-backup-old/`. Deletions are
/// independent: a failure on one key is logged and recorded in the report,
/// the rest are still attempted. Only a listing failure is returned as `Err`.
pub async fn prune(store: &dyn ObjectStore, prefix: &str, survivor_key: &str) -> Result<PruneReport> {
    let folder = if prefix.ends_with('/') {
        prefix.to_string()
    } else {
        format!("{}/", prefix)
    };

    tracing::info!(phase = %JobPhase::Pruning, prefix = %folder, survivor = %survivor_key, "Deleting old backups");
    let keys = store.list_objects(&folder).await?;

    let mut report = PruneReport::default();
    for key in keys.into_iter().filter(|k| k != survivor_key) {
        match store.delete_object(&key).await {
            Ok(()) => {
                tracing::info!(key = %key, "Deleted old backup");
                report.deleted.push(key);
            }
            Err(e) => {
                let err = BackupError::Prune {
                    key,
                    cause: format!("{:#}", e),
                };
                tracing::warn!(error = %err, "Could not delete old backup, continuing");
                report.failed.push(err);
            }
        }
    }

    Ok(report)
}
