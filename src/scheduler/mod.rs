use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use crate::backup::RetentionClass;
use crate::backup::logic::BackupOrchestrator;
use crate::config::ScheduleConfig;
use crate::errors::BackupError;

/// Anything that can run one backup of a given class.
#[async_trait]
pub trait BackupRunner: Send + Sync {
    async fn run_backup(&self, class: RetentionClass) -> Result<(), BackupError>;
}

#[async_trait]
impl BackupRunner for BackupOrchestrator {
    async fn run_backup(&self, class: RetentionClass) -> Result<(), BackupError> {
        self.run(class).await
    }
}

const DAY_NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// Classic 5-field expressions get a leading seconds field. Numeric
/// day-of-week values follow crontab (0 or 7 is Sunday) and are rewritten as
/// day names, since the `cron` crate numbers Sunday as 1.
pub fn normalize_cron(expr: &str) -> String {
    let mut fields: Vec<String> = expr.split_whitespace().map(str::to_string).collect();
    if fields.len() == 5 {
        fields.insert(0, "0".to_string());
    }
    if let Some(day_of_week) = fields.get_mut(5) {
        if let Some(named) = day_of_week_names(day_of_week) {
            *day_of_week = named;
        }
    }
    fields.join(" ")
}

/// Rewrites a crontab day-of-week field as a list of day names. Returns `None`
/// when there is nothing numeric to rewrite or the field is malformed, in
/// which case the field is left for the cron parser to judge.
fn day_of_week_names(field: &str) -> Option<String> {
    if !field.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }

    let mut days = [false; 7];
    for item in field.split(',') {
        let (base, step) = match item.split_once('/') {
            Some((base, step)) => (base, step.parse::<usize>().ok().filter(|s| *s > 0)?),
            None => (item, 1),
        };
        let (start, end) = match base.split_once('-') {
            Some((start, end)) => (day_ordinal(start)?, day_ordinal(end)?),
            None if base == "*" => (0, 6),
            None if item.contains('/') => (day_ordinal(base)?, 6),
            None => {
                let day = day_ordinal(base)?;
                (day, day)
            }
        };
        if start > end {
            return None;
        }
        for day in (start..=end).step_by(step) {
            days[day % 7] = true;
        }
    }

    let names: Vec<&str> = DAY_NAMES
        .iter()
        .zip(days)
        .filter_map(|(name, set)| set.then_some(*name))
        .collect();
    Some(names.join(","))
}

/// 0..=7 with 0 and 7 both Sunday, or a three-letter/full day name.
fn day_ordinal(token: &str) -> Option<usize> {
    if let Ok(n) = token.parse::<usize>() {
        return (n <= 7).then_some(n);
    }
    let lower = token.to_ascii_lowercase();
    DAY_NAMES.iter().position(|name| {
        let name = name.to_ascii_lowercase();
        lower == name || (lower.len() > 3 && lower.starts_with(&name) && lower.ends_with("day"))
    })
}

pub fn parse_schedule(expr: &str) -> Result<Schedule> {
    Schedule::from_str(&normalize_cron(expr))
        .with_context(|| format!("Invalid cron expression '{}'", expr))
}

pub fn next_fire(schedule: &Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}

/// Drives the backups until `shutdown` resolves.
///
/// With `single_shot` the startup class runs once and its result is returned
/// without scheduling anything. With `run_on_startup` the startup class runs
/// once before the schedules start; its failure is logged, not returned.
/// A shutdown during that run drops the job, so its guards clean up.
pub async fn run<S>(
    runner: Arc<dyn BackupRunner>,
    schedule_config: &ScheduleConfig,
    shutdown: S,
) -> Result<(), BackupError>
where
    S: Future<Output = ()>,
{
    tokio::pin!(shutdown);

    if schedule_config.run_on_startup || schedule_config.single_shot {
        tracing::info!(class = %schedule_config.startup_class, "Running on start backup...");
        let result = tokio::select! {
            result = runner.run_backup(schedule_config.startup_class) => result,
            _ = &mut shutdown => {
                tracing::warn!(class = %schedule_config.startup_class, "Shutdown requested, startup backup cancelled");
                return if schedule_config.single_shot {
                    Err(BackupError::Interrupted)
                } else {
                    Ok(())
                };
            }
        };

        if schedule_config.single_shot {
            if result.is_ok() {
                tracing::info!("Database backup complete, exiting...");
            }
            return result;
        }
        if let Err(e) = result {
            tracing::error!(error = %e, "Error while running startup backup; schedules continue");
        }
    }

    let mut tasks = Vec::with_capacity(RetentionClass::ALL.len());
    for class in RetentionClass::ALL {
        let expr = match class {
            RetentionClass::Daily => &schedule_config.daily_cron,
            RetentionClass::Weekly => &schedule_config.weekly_cron,
        };
        let schedule = parse_schedule(expr).map_err(|e| BackupError::Config(format!("{:#}", e)))?;
        tracing::info!(class = %class, cron = %expr, "Scheduling backups");
        tasks.push(tokio::spawn(class_loop(runner.clone(), class, schedule)));
    }
    tracing::info!("Backups cron scheduled...");

    shutdown.await;
    tracing::info!("Shutdown requested, stopping backup schedules");
    for task in tasks {
        task.abort();
    }
    Ok(())
}

async fn class_loop(runner: Arc<dyn BackupRunner>, class: RetentionClass, schedule: Schedule) {
    let mut after = Utc::now();
    loop {
        let Some(fire_at) = next_fire(&schedule, after) else {
            tracing::warn!(class = %class, "Schedule has no upcoming fire times, stopping");
            return;
        };
        tracing::info!(class = %class, next_run = %fire_at, "Next backup scheduled");

        let delay = (fire_at - Utc::now()).to_std().unwrap_or_default();
        tokio::time::sleep(delay).await;

        if let Err(e) = runner.run_backup(class).await {
            tracing::error!(class = %class, error = %e, "Error while running backup");
        }

        // Slots missed while the job ran are skipped, never replayed.
        after = fire_at.max(Utc::now());
    }
}
