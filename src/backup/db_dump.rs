// pg-s3-backup/src/backup/db_dump.rs
use anyhow::{Context, Result};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::ffi::OsString;
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio};

use super::archive::{archive_size, is_valid_archive};
use super::logic::JobPhase;
use crate::config::DumpConfig;
use crate::errors::BackupError;
use crate::utils::{find_executable, redact_database_url};

/// The external dump tool invocation. Its stdout must be the dump itself.
#[derive(Debug, Clone)]
pub struct DumpCommand {
    program: PathBuf,
    args: Vec<OsString>,
    /// What is being dumped, safe to log.
    target: String,
}

impl DumpCommand {
    pub fn new(program: impl Into<PathBuf>, args: Vec<OsString>, target: impl Into<String>) -> Self {
        DumpCommand {
            program: program.into(),
            args,
            target: target.into(),
        }
    }

    /// `pg_dump --dbname=<url> --format=tar [options...]`
    pub fn pg_dump(dump_config: &DumpConfig) -> Result<Self> {
        let program = match &dump_config.pg_dump_path {
            Some(path) => path.clone(),
            None => find_executable("pg_dump")?,
        };

        let mut args: Vec<OsString> = vec![
            format!("--dbname={}", dump_config.database_url.expose()).into(),
            "--format=tar".into(),
        ];
        args.extend(dump_config.options.iter().map(OsString::from));

        Ok(DumpCommand::new(
            program,
            args,
            redact_database_url(dump_config.database_url.expose()),
        ))
    }
}

/// A dump that passed validation.
#[derive(Debug)]
pub struct DumpOutcome {
    pub size: u64,
    /// Whatever the dump tool wrote to stderr. Non-empty means warnings.
    pub diagnostics: String,
}

/// The running dump tool. Killed and reaped if dropped before `wait`, so a
/// cancelled job never leaves pg_dump writing in the background.
struct DumpChild(Option<Child>);

impl DumpChild {
    fn wait(mut self) -> io::Result<ExitStatus> {
        match self.0.take() {
            Some(mut child) => child.wait(),
            None => Err(io::Error::other("dump tool already reaped")),
        }
    }
}

impl Drop for DumpChild {
    fn drop(&mut self) {
        if let Some(mut child) = self.0.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

const STDERR_TAIL_LIMIT: usize = 64 * 1024;

pub struct DumpProducer {
    command: DumpCommand,
}

impl DumpProducer {
    pub fn new(command: DumpCommand) -> Self {
        DumpProducer { command }
    }

    /// Runs the dump tool, gzips its stdout into `destination` and validates
    /// the result. The file may exist (partially written) when this fails;
    /// removing it is the caller's job.
    pub async fn produce(&self, destination: &Path) -> Result<DumpOutcome, BackupError> {
        tracing::info!(
            phase = %JobPhase::Dumping,
            target = %self.command.target,
            program = %self.command.program.display(),
            path = %destination.display(),
            "Dumping DB to file..."
        );

        let (child, stdout, stderr) =
            spawn_dump(&self.command).map_err(|e| BackupError::dump(format!("{:#}", e), None))?;
        let archive_file = File::create(destination).map_err(|e| {
            BackupError::dump(
                format!("Failed to create archive file {}: {}", destination.display(), e),
                None,
            )
        })?;

        let (bytes_read, diagnostics) =
            tokio::task::spawn_blocking(move || stream_dump(stdout, stderr, archive_file))
                .await
                .map_err(|e| BackupError::dump(format!("dump task panicked: {}", e), None))?
                .map_err(|e| {
                    BackupError::dump(
                        format!("Failed to stream dump output into {}: {}", destination.display(), e),
                        None,
                    )
                })?;

        let status = tokio::task::spawn_blocking(move || child.wait())
            .await
            .map_err(|e| BackupError::dump(format!("dump task panicked: {}", e), None))?
            .map_err(|e| BackupError::dump(format!("Failed to wait for dump tool: {}", e), None))?;

        let diagnostics = diagnostics.trim_end().to_string();

        if !status.success() {
            tracing::error!(
                status = %status,
                stderr = %diagnostics,
                "pg_dump failed"
            );
            return Err(BackupError::dump(
                format!("pg_dump exited with {}", status),
                Some(diagnostics),
            ));
        }

        tracing::info!(
            phase = %JobPhase::Validating,
            bytes_read,
            path = %destination.display(),
            "Validating backup archive"
        );
        let archive_path = destination.to_path_buf();
        let valid = tokio::task::spawn_blocking(move || is_valid_archive(&archive_path))
            .await
            .unwrap_or(false);
        if !valid {
            return Err(BackupError::dump(
                "Backup archive file is invalid or empty; check for errors above",
                Some(diagnostics),
            ));
        }

        let size = archive_size(destination).map_err(|e| BackupError::dump(format!("{:#}", e), None))?;
        tracing::info!(size, path = %destination.display(), "✓ Backup archive file is valid");

        if !diagnostics.is_empty() {
            tracing::warn!(stderr = %diagnostics, "pg_dump wrote to stderr");
            tracing::warn!(
                file = %destination.file_name().map(|n| n.to_string_lossy()).unwrap_or_default(),
                "Potential warnings detected; please ensure the backup file contains all needed data"
            );
        }

        Ok(DumpOutcome { size, diagnostics })
    }
}

fn spawn_dump(command: &DumpCommand) -> Result<(DumpChild, ChildStdout, ChildStderr)> {
    let mut child = Command::new(&command.program)
        .args(&command.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("Failed to execute dump tool: {}", command.program.display()))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let child = DumpChild(Some(child));
    let stdout = stdout.context("Dump tool stdout was not captured")?;
    let stderr = stderr.context("Dump tool stderr was not captured")?;
    Ok((child, stdout, stderr))
}

/// Streams stdout through gzip into `archive_file` and returns the number of
/// raw bytes read along with everything written to stderr. stderr is drained
/// on a separate thread so a chatty tool cannot block on a full pipe.
fn stream_dump(
    mut stdout: ChildStdout,
    mut stderr: ChildStderr,
    archive_file: File,
) -> io::Result<(u64, String)> {
    let stderr_reader = std::thread::spawn(move || read_tail(&mut stderr, STDERR_TAIL_LIMIT));

    let mut encoder = GzEncoder::new(BufWriter::new(archive_file), Compression::default());
    let bytes_read = io::copy(&mut stdout, &mut encoder)?;
    let mut writer = encoder.finish()?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    drop(stdout);

    let diagnostics = stderr_reader.join().unwrap_or_default();
    Ok((bytes_read, diagnostics))
}

/// Reads `reader` to the end, keeping only the last `limit` bytes.
fn read_tail(reader: &mut impl Read, limit: usize) -> String {
    let mut kept: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 8192];
    let mut truncated = false;

    loop {
        match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                kept.extend_from_slice(&chunk[..n]);
                if kept.len() > limit * 2 {
                    kept.drain(..kept.len() - limit);
                    truncated = true;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    if kept.len() > limit {
        kept.drain(..kept.len() - limit);
        truncated = true;
    }

    let text = String::from_utf8_lossy(&kept);
    if truncated {
        format!("[earlier output truncated]\n{}", text)
    } else {
        text.into_owned()
    }
}
