pub(crate) mod archive; // Archive validation (gzip sniffing)
pub(crate) mod db_dump; // pg_dump | gzip into a local file
pub(crate) mod logic; // Job orchestration and local cleanup
pub(crate) mod retention; // Remote pruning per retention prefix
pub(crate) mod s3_upload; // Upload pipeline with optional Content-MD5
pub(crate) mod storage; // ObjectStore trait and the S3 implementation

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use crate::config::AppConfig;
use db_dump::{DumpCommand, DumpProducer};
use logic::{BackupOrchestrator, JobSettings};
use s3_upload::UploadPipeline;
use storage::S3ObjectStore;

/// Retention bucket a backup belongs to. Each class keeps exactly one
/// archive under its own remote prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum RetentionClass {
    Daily,
    Weekly,
}

impl RetentionClass {
    pub const ALL: [RetentionClass; 2] = [RetentionClass::Daily, RetentionClass::Weekly];

    /// Remote folder holding this class's archive.
    pub fn prefix(self) -> &'static str {
        match self {
            RetentionClass::Daily => "daily-backup",
            RetentionClass::Weekly => "weekly-backup",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RetentionClass::Daily => "daily",
            RetentionClass::Weekly => "weekly",
        }
    }
}

impl fmt::Display for RetentionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RetentionClass {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" => Ok(RetentionClass::Daily),
            "weekly" => Ok(RetentionClass::Weekly),
            other => Err(format!(
                "unknown retention class '{}', expected 'daily' or 'weekly'",
                other
            )),
        }
    }
}

/// One planned backup run. Paths and keys are pure functions of the
/// creation time and the retention class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupJob {
    pub class: RetentionClass,
    pub created_at: DateTime<Utc>,
    pub file_name: String,
    pub local_path: PathBuf,
    pub remote_prefix: String,
    pub remote_key: String,
}

impl BackupJob {
    pub fn new(
        class: RetentionClass,
        created_at: DateTime<Utc>,
        file_prefix: &str,
        temp_dir: &Path,
        folder_prefix: Option<&str>,
    ) -> Self {
        // ISO-8601 with ':' and '.' swapped for '-', e.g. 2026-10-19T03-00-00-000Z
        let timestamp = created_at.format("%Y-%m-%dT%H-%M-%S-%3fZ");
        let file_name = format!("{}-{}.tar.gz", file_prefix, timestamp);

        // The class is part of the local name so concurrent daily and weekly
        // runs started in the same millisecond never share a file.
        let local_path = temp_dir.join(format!("{}-{}", class.as_str(), file_name));

        let remote_prefix = match folder_prefix.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
            Some(root) => format!("{}/{}", root, class.prefix()),
            None => class.prefix().to_string(),
        };
        let remote_key = format!("{}/{}", remote_prefix, file_name);

        BackupJob {
            class,
            created_at,
            file_name,
            local_path,
            remote_prefix,
            remote_key,
        }
    }
}

/// Wires the production collaborators (pg_dump, S3) into an orchestrator.
pub async fn build_orchestrator(app_config: &AppConfig) -> Result<BackupOrchestrator> {
    let command = DumpCommand::pg_dump(&app_config.dump)
        .context("Failed to prepare the pg_dump command")?;
    let store = S3ObjectStore::from_config(&app_config.storage).await;

    Ok(BackupOrchestrator::new(
        DumpProducer::new(command),
        UploadPipeline::new(Arc::new(store), app_config.upload_checksum),
        JobSettings {
            file_prefix: app_config.job.file_prefix.clone(),
            temp_dir: app_config.job.temp_dir.clone(),
            folder_prefix: app_config.storage.folder_prefix.clone(),
        },
    ))
}
