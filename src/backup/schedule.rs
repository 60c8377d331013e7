use crate::backup::backup_config::RunConfig;
use crate::backup::engine::{CancellationToken, CopyProgress};
use crate::backup::orchestrator::Orchestrator;
use crate::backup::report::Report;
use crate::backup::result_error::error::{Error, ErrorCategory};
use crate::backup::result_error::result::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

const SLEEP_SLICE: Duration = Duration::from_millis(500);

pub fn next_tick(cron: &str, after: &DateTime<Utc>) -> Result<DateTime<Utc>> {
    cron_parser::parse(cron, after)
        .map_err(|e| Error::Configuration(format!("Invalid cron string {cron:?}: {e:?}")))
}

/// Sleeps until `until`, waking up regularly to check `cancel`.
/// Returns false if cancelled first.
fn sleep_until(until: DateTime<Utc>, cancel: &CancellationToken) -> bool {
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let remaining = match (until - Utc::now()).to_std() {
            Ok(remaining) if !remaining.is_zero() => remaining,
            _ => return true,
        };
        std::thread::sleep(remaining.min(SLEEP_SLICE));
    }
}

/// Runs a backup on every tick of the configured cron expression until
/// `cancel` is set. Returns the report of the last run, if any ran.
pub fn run_scheduled(
    config: &RunConfig,
    dry_run: bool,
    cancel: &CancellationToken,
    progress: Option<Arc<dyn CopyProgress>>,
) -> Result<Option<Report>> {
    let cron = config
        .cron()
        .as_deref()
        .ok_or_else(|| Error::Configuration("daemon mode requires `cron`".to_string()))?;

    let mut last = None;
    loop {
        let start = next_tick(cron, &Utc::now())?;
        tracing::info!("Sleeping until {start}");
        if !sleep_until(start, cancel) {
            tracing::info!("Scheduler stopped");
            return Ok(last);
        }

        let report = Orchestrator::new(config, cancel.clone())
            .with_progress(progress.clone())
            .run(dry_run);
        report.log_summary();
        match report.error_category() {
            Some(ErrorCategory::LockContention) => {
                tracing::warn!("Previous backup still running, skipping this tick")
            }
            Some(ErrorCategory::Cancelled) => return Ok(Some(report)),
            _ => {}
        }
        last = Some(report);
    }
}
