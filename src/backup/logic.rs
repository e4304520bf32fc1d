use chrono::{DateTime, Utc};
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::Instrument;

use super::db_dump::DumpProducer;
use super::s3_upload::UploadPipeline;
use super::{BackupJob, RetentionClass};
use crate::errors::{BackupError, Result};

/// Phases a job moves through; `Failed` can follow any of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Dumping,
    Validating,
    Uploading,
    Pruning,
    LocalCleanup,
    Done,
    Failed,
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobPhase::Dumping => "dumping",
            JobPhase::Validating => "validating",
            JobPhase::Uploading => "uploading",
            JobPhase::Pruning => "pruning",
            JobPhase::LocalCleanup => "local_cleanup",
            JobPhase::Done => "done",
            JobPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct JobSettings {
    pub file_prefix: String,
    pub temp_dir: PathBuf,
    pub folder_prefix: Option<String>,
}

/// Owns the local archive for the lifetime of a job and removes it when
/// dropped, whatever path the job took out (error, panic or cancellation).
struct LocalArchive {
    path: PathBuf,
    armed: bool,
}

impl LocalArchive {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    /// Removes the file now. A missing file counts as removed.
    fn remove(mut self) -> Result<()> {
        self.armed = false;
        remove_if_exists(&self.path)
    }
}

impl Drop for LocalArchive {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::info!(phase = %JobPhase::LocalCleanup, path = %self.path.display(), "Deleting local file...");
        if let Err(e) = remove_if_exists(&self.path) {
            tracing::warn!(error = %e, "Local cleanup failed");
        }
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(BackupError::Cleanup {
            path: path.to_path_buf(),
            cause: e.to_string(),
        }),
    }
}

/// Sequences dump → upload (which prunes) → local cleanup for one class.
pub struct BackupOrchestrator {
    producer: DumpProducer,
    uploader: UploadPipeline,
    settings: JobSettings,
}

impl BackupOrchestrator {
    pub fn new(producer: DumpProducer, uploader: UploadPipeline, settings: JobSettings) -> Self {
        Self {
            producer,
            uploader,
            settings,
        }
    }

    pub fn plan(&self, class: RetentionClass, created_at: DateTime<Utc>) -> BackupJob {
        BackupJob::new(
            class,
            created_at,
            &self.settings.file_prefix,
            &self.settings.temp_dir,
            self.settings.folder_prefix.as_deref(),
        )
    }

    pub async fn run(&self, class: RetentionClass) -> Result<()> {
        let job = self.plan(class, Utc::now());
        self.execute(&job).await
    }

    /// Runs a planned job. The local archive never outlives this call; a
    /// dump or upload failure is returned as-is even if cleanup also fails.
    pub async fn execute(&self, job: &BackupJob) -> Result<()> {
        let span = tracing::info_span!("backup_job", class = %job.class, key = %job.remote_key);
        async {
            tracing::info!(
                created_at = %job.created_at,
                file = %job.file_name,
                prefix = %job.remote_prefix,
                "Initiating DB backup..."
            );

            if let Err(e) = tokio::fs::create_dir_all(&self.settings.temp_dir).await {
                let err = BackupError::dump(
                    format!(
                        "Failed to create temp directory {}: {}",
                        self.settings.temp_dir.display(),
                        e
                    ),
                    None,
                );
                tracing::error!(phase = %JobPhase::Failed, error = %err, "DB backup failed");
                return Err(err);
            }

            let local_archive = LocalArchive::new(job.local_path.clone());

            match self.dump_and_upload(job).await {
                Ok(size) => {
                    tracing::info!(phase = %JobPhase::LocalCleanup, path = %job.local_path.display(), "Deleting local file...");
                    if let Err(e) = local_archive.remove() {
                        tracing::warn!(error = %e, "Local cleanup failed");
                    }
                    tracing::info!(phase = %JobPhase::Done, size, key = %job.remote_key, "DB backup complete");
                    Ok(())
                }
                Err(e) => {
                    tracing::error!(
                        phase = %JobPhase::Failed,
                        error = %e,
                        key = %job.remote_key,
                        prefix = %job.remote_prefix,
                        "DB backup failed"
                    );
                    drop(local_archive);
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn dump_and_upload(&self, job: &BackupJob) -> Result<u64> {
        let outcome = self.producer.produce(&job.local_path).await?;
        tracing::info!(
            size = outcome.size,
            with_warnings = !outcome.diagnostics.is_empty(),
            "DB dumped to file"
        );

        self.uploader
            .upload(&job.local_path, &job.remote_key, &job.remote_prefix)
            .await?;
        Ok(outcome.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::db_dump::DumpCommand;
    use crate::backup::storage::memory::InMemoryObjectStore;
    use crate::config::UploadChecksum;
    use std::sync::Arc;

    fn orchestrator(script: &str, store: Arc<InMemoryObjectStore>, temp_dir: &Path) -> BackupOrchestrator {
        BackupOrchestrator::new(
            DumpProducer::new(DumpCommand::new(
                "sh",
                vec!["-c".into(), script.into()],
                "test-db",
            )),
            UploadPipeline::new(store, UploadChecksum::ContentMd5),
            JobSettings {
                file_prefix: "backup".to_string(),
                temp_dir: temp_dir.to_path_buf(),
                folder_prefix: None,
            },
        )
    }

    fn dir_is_empty(dir: &Path) -> bool {
        std::fs::read_dir(dir).unwrap().next().is_none()
    }

    #[tokio::test]
    async fn test_successful_run_keeps_only_the_new_backup() {
        let temp = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryObjectStore::with_keys(&[
            "daily-backup/a.tar.gz",
            "daily-backup/b.tar.gz",
            "weekly-backup/w.tar.gz",
        ]));
        let orchestrator = orchestrator("printf 'PGDMP tar body'", store.clone(), temp.path());
        let job = orchestrator.plan(RetentionClass::Daily, Utc::now());

        orchestrator.execute(&job).await.unwrap();

        assert_eq!(store.keys_under("daily-backup/"), vec![job.remote_key.clone()]);
        assert_eq!(store.keys_under("weekly-backup/"), vec!["weekly-backup/w.tar.gz".to_string()]);
        assert!(store.object(&job.remote_key).unwrap().content_md5.is_some());
        assert!(!job.local_path.exists());
        assert!(dir_is_empty(temp.path()));
    }

    #[tokio::test]
    async fn test_run_creates_missing_temp_dir() {
        let temp = tempfile::tempdir().unwrap();
        let nested = temp.path().join("spool").join("pg");
        let store = Arc::new(InMemoryObjectStore::default());
        let orchestrator = orchestrator("printf data", store.clone(), &nested);

        orchestrator.run(RetentionClass::Weekly).await.unwrap();

        assert_eq!(store.keys_under("weekly-backup/").len(), 1);
        assert!(dir_is_empty(&nested));
    }

    #[tokio::test]
    async fn test_upload_failure_keeps_old_backups_and_removes_local_file() {
        let temp = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryObjectStore::with_keys(&[
            "daily-backup/a.tar.gz",
            "daily-backup/b.tar.gz",
        ]));
        store.fail_puts();
        let orchestrator = orchestrator("printf data", store.clone(), temp.path());
        let job = orchestrator.plan(RetentionClass::Daily, Utc::now());

        let err = orchestrator.execute(&job).await.unwrap_err();

        assert!(matches!(err, BackupError::Upload { .. }));
        assert!(store.deletes().is_empty());
        assert_eq!(store.keys_under("daily-backup/").len(), 2);
        assert!(dir_is_empty(temp.path()));
    }

    #[tokio::test]
    async fn test_dump_failure_never_uploads() {
        let temp = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryObjectStore::with_keys(&["daily-backup/a.tar.gz"]));
        let orchestrator = orchestrator("printf partial; exit 1", store.clone(), temp.path());

        let err = orchestrator.run(RetentionClass::Daily).await.unwrap_err();

        assert!(matches!(err, BackupError::Dump { .. }));
        assert!(store.calls().is_empty());
        assert!(dir_is_empty(temp.path()));
    }

    #[tokio::test]
    async fn test_empty_dump_never_uploads() {
        let temp = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryObjectStore::default());
        let orchestrator = orchestrator("true", store.clone(), temp.path());

        let err = orchestrator.run(RetentionClass::Weekly).await.unwrap_err();

        assert!(matches!(err, BackupError::Dump { .. }));
        assert!(store.calls().is_empty());
        assert!(dir_is_empty(temp.path()));
    }

    #[tokio::test]
    async fn test_daily_and_weekly_can_run_concurrently() {
        let temp = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryObjectStore::with_keys(&[
            "daily-backup/old.tar.gz",
            "weekly-backup/old.tar.gz",
        ]));
        let orchestrator = orchestrator("printf data", store.clone(), temp.path());
        let at = Utc::now();
        let daily = orchestrator.plan(RetentionClass::Daily, at);
        let weekly = orchestrator.plan(RetentionClass::Weekly, at);

        let (d, w) = tokio::join!(orchestrator.execute(&daily), orchestrator.execute(&weekly));
        d.unwrap();
        w.unwrap();

        assert_eq!(store.keys_under("daily-backup/"), vec![daily.remote_key.clone()]);
        assert_eq!(store.keys_under("weekly-backup/"), vec![weekly.remote_key.clone()]);
        assert!(dir_is_empty(temp.path()));
    }

    #[test]
    fn test_local_archive_guard_removes_on_drop() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("daily-x.tar.gz");
        std::fs::write(&path, b"x").unwrap();

        drop(LocalArchive::new(path.clone()));

        assert!(!path.exists());
    }

    #[test]
    fn test_local_archive_remove_tolerates_missing_file() {
        let temp = tempfile::tempdir().unwrap();
        let guard = LocalArchive::new(temp.path().join("never-created.tar.gz"));

        assert!(guard.remove().is_ok());
    }

    #[test]
    fn test_remove_if_exists_reports_cleanup_error() {
        let temp = tempfile::tempdir().unwrap();
        // A directory cannot be removed with remove_file.
        let err = remove_if_exists(temp.path()).unwrap_err();
        assert!(matches!(err, BackupError::Cleanup { .. }));
    }
}
