use std::path::PathBuf;
use thiserror::Error;

/// Failures at the boundary of a single backup job.
///
/// `Dump` and `Upload` abort the job and are returned to the caller.
/// `Prune` and `Cleanup` are only ever logged; the job outcome does not
/// depend on them. `Interrupted` means shutdown cancelled a job mid-flight.
#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Dump failed: {cause}")]
    Dump {
        cause: String,
        diagnostics: Option<String>,
    },

    #[error("Upload of {key} failed: {cause}")]
    Upload { key: String, cause: String },

    #[error("Failed to delete remote object {key}: {cause}")]
    Prune { key: String, cause: String },

    #[error("Failed to remove local archive {}: {cause}", path.display())]
    Cleanup { path: PathBuf, cause: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Backup interrupted by shutdown")]
    Interrupted,
}

impl BackupError {
    pub fn dump(cause: impl Into<String>, diagnostics: Option<String>) -> Self {
        BackupError::Dump {
            cause: cause.into(),
            diagnostics: diagnostics.filter(|d| !d.trim().is_empty()),
        }
    }

    /// Wraps an anyhow chain for an upload failure, keeping every context layer.
    pub fn upload(key: &str, err: anyhow::Error) -> Self {
        BackupError::Upload {
            key: key.to_string(),
            cause: format!("{:#}", err),
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
