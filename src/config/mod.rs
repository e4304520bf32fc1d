// pg-s3-backup/src/config/mod.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use url::Url;

use crate::backup::RetentionClass;
use crate::errors::BackupError;
use crate::scheduler::{normalize_cron, parse_schedule};

pub const DEFAULT_CONFIG_PATH: &str = "config.json";
const DEFAULT_FILE_PREFIX: &str = "backup";
const DEFAULT_DAILY_CRON: &str = "0 0 3 * * *";
const DEFAULT_WEEKLY_CRON: &str = "0 0 4 * * Sun";

// Structs for deserializing config.json
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JsonS3StorageConfig {
    pub bucket_name: Option<String>,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub endpoint_url: Option<String>,
    pub force_path_style: Option<bool>,
    pub folder_prefix: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JsonScheduleConfig {
    pub daily_cron: Option<String>,
    pub weekly_cron: Option<String>,
    pub run_on_startup: Option<bool>,
    pub single_shot_mode: Option<bool>,
    pub startup_class: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawJsonConfig {
    pub backup_database_url: Option<String>,
    pub backup_options: Option<String>,
    pub backup_file_prefix: Option<String>,
    pub temp_dir: Option<PathBuf>,
    pub pg_dump_path: Option<PathBuf>,
    pub support_object_lock: Option<bool>,
    pub s3_storage: Option<JsonS3StorageConfig>,
    pub schedule: Option<JsonScheduleConfig>,
}

/// A value that must never end up in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Secret(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

// Application's internal configuration structs
#[derive(Debug, Clone)]
pub struct DumpConfig {
    pub database_url: Secret,
    pub options: Vec<String>,
    pub pg_dump_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct StaticCredentials {
    pub access_key_id: String,
    pub secret_access_key: Secret,
}

#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket_name: String,
    pub region: String,
    pub endpoint_url: Option<String>,
    pub force_path_style: bool,
    /// `None` falls back to the default AWS credential chain.
    pub credentials: Option<StaticCredentials>,
    pub folder_prefix: Option<String>,
}

/// Integrity mode for uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadChecksum {
    None,
    /// Send a Content-MD5 header; required by buckets with Object Lock.
    ContentMd5,
}

#[derive(Debug, Clone)]
pub struct JobConfig {
    pub file_prefix: String,
    pub temp_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    /// Normalized cron expressions, already known to parse.
    pub daily_cron: String,
    pub weekly_cron: String,
    pub run_on_startup: bool,
    pub single_shot: bool,
    pub startup_class: RetentionClass,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub dump: DumpConfig,
    pub storage: S3Config,
    pub upload_checksum: UploadChecksum,
    pub job: JobConfig,
    pub schedule: ScheduleConfig,
}

impl AppConfig {
    /// Reads `config_path` (or `config.json` when present) and resolves it
    /// against the process environment.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let raw_json_config = match config_path {
            Some(path) => read_raw_config(path)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                read_raw_config(Path::new(DEFAULT_CONFIG_PATH))?
            }
            None => {
                tracing::info!("No {} found, reading configuration from the environment", DEFAULT_CONFIG_PATH);
                RawJsonConfig::default()
            }
        };

        Ok(Self::resolve(raw_json_config, |name| env::var(name).ok())?)
    }

    /// Merges the JSON values with `lookup` (JSON wins) and validates the
    /// result.
    pub fn resolve<F>(raw: RawJsonConfig, lookup: F) -> std::result::Result<Self, BackupError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let s3_raw = raw.s3_storage.unwrap_or_default();
        let schedule_raw = raw.schedule.unwrap_or_default();

        let text = |json: Option<String>, var: &str| -> Option<String> {
            json.or_else(|| lookup(var))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let flag = |json: Option<bool>, var: &str, default: bool| -> std::result::Result<bool, BackupError> {
            match json {
                Some(value) => Ok(value),
                None => match lookup(var) {
                    Some(value) => parse_bool(var, &value),
                    None => Ok(default),
                },
            }
        };
        let required = |value: Option<String>, what: &str| -> std::result::Result<String, BackupError> {
            value.ok_or_else(|| BackupError::Config(format!("{} must be set", what)))
        };

        let dump = DumpConfig {
            database_url: Secret::new(required(
                text(raw.backup_database_url, "BACKUP_DATABASE_URL"),
                "backup_database_url (or BACKUP_DATABASE_URL)",
            )?),
            options: text(raw.backup_options, "BACKUP_OPTIONS")
                .map(|opts| opts.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            pg_dump_path: raw
                .pg_dump_path
                .or_else(|| lookup("PG_DUMP_PATH").map(PathBuf::from)),
        };

        let endpoint_url = text(s3_raw.endpoint_url, "AWS_S3_ENDPOINT");
        if let Some(endpoint) = &endpoint_url {
            Url::parse(endpoint).map_err(|e| {
                BackupError::Config(format!("Invalid S3 endpoint URL '{}': {}", endpoint, e))
            })?;
        }

        let credentials = match (
            text(s3_raw.access_key_id, "AWS_ACCESS_KEY_ID"),
            text(s3_raw.secret_access_key, "AWS_SECRET_ACCESS_KEY"),
        ) {
            (Some(access_key_id), Some(secret)) => Some(StaticCredentials {
                access_key_id,
                secret_access_key: Secret::new(secret),
            }),
            (None, None) => None,
            _ => {
                return Err(BackupError::Config(
                    "access_key_id and secret_access_key must be provided together".to_string(),
                ));
            }
        };

        let storage = S3Config {
            bucket_name: required(
                text(s3_raw.bucket_name, "AWS_S3_BUCKET"),
                "s3_storage.bucket_name (or AWS_S3_BUCKET)",
            )?,
            region: required(
                text(s3_raw.region, "AWS_S3_REGION"),
                "s3_storage.region (or AWS_S3_REGION)",
            )?,
            endpoint_url,
            force_path_style: flag(s3_raw.force_path_style, "AWS_S3_FORCE_PATH_STYLE", false)?,
            credentials,
            folder_prefix: text(s3_raw.folder_prefix, "AWS_S3_FOLDER_PREFIX")
                .map(|p| p.trim_matches('/').to_string())
                .filter(|p| !p.is_empty()),
        };

        let upload_checksum = if flag(raw.support_object_lock, "SUPPORT_OBJECT_LOCK", false)? {
            UploadChecksum::ContentMd5
        } else {
            UploadChecksum::None
        };

        let job = JobConfig {
            file_prefix: text(raw.backup_file_prefix, "BACKUP_FILE_PREFIX")
                .unwrap_or_else(|| DEFAULT_FILE_PREFIX.to_string()),
            temp_dir: raw
                .temp_dir
                .or_else(|| lookup("BACKUP_TEMP_DIR").map(PathBuf::from))
                .unwrap_or_else(env::temp_dir),
        };
        if job.file_prefix.contains('/') {
            return Err(BackupError::Config(format!(
                "backup_file_prefix '{}' must not contain '/'",
                job.file_prefix
            )));
        }

        let cron = |json: Option<String>, var: &str, default: &str| -> std::result::Result<String, BackupError> {
            let expr = normalize_cron(&text(json, var).unwrap_or_else(|| default.to_string()));
            parse_schedule(&expr)
                .map_err(|e| BackupError::Config(format!("{} is not a valid cron expression: {:#}", var, e)))?;
            Ok(expr)
        };
        let startup_class = match text(schedule_raw.startup_class, "STARTUP_BACKUP_CLASS") {
            Some(value) => value.parse::<RetentionClass>().map_err(BackupError::Config)?,
            None => RetentionClass::Daily,
        };
        let schedule = ScheduleConfig {
            daily_cron: cron(schedule_raw.daily_cron, "DAILY_BACKUP_CRON", DEFAULT_DAILY_CRON)?,
            weekly_cron: cron(schedule_raw.weekly_cron, "WEEKLY_BACKUP_CRON", DEFAULT_WEEKLY_CRON)?,
            run_on_startup: flag(schedule_raw.run_on_startup, "RUN_ON_STARTUP", false)?,
            single_shot: flag(schedule_raw.single_shot_mode, "SINGLE_SHOT_MODE", false)?,
            startup_class,
        };

        Ok(AppConfig {
            dump,
            storage,
            upload_checksum,
            job,
            schedule,
        })
    }
}

fn read_raw_config(config_path: &Path) -> Result<RawJsonConfig> {
    let config_content = fs::read_to_string(config_path)
        .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
    serde_json::from_str(&config_content).with_context(|| {
        format!(
            "Failed to parse JSON from config file at {}",
            config_path.display()
        )
    })
}

fn parse_bool(name: &str, value: &str) -> std::result::Result<bool, BackupError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" | "" => Ok(false),
        other => Err(BackupError::Config(format!(
            "{} must be a boolean, got '{}'",
            name, other
        ))),
    }
}
