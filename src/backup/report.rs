use crate::backup::archive::Archive;
use crate::backup::engine::{CopyResult, CopyStatus};
use crate::backup::orchestrator::RunState;
use crate::backup::result_error::error::{Error, ErrorCategory};
use crate::backup::retention::{PruneOutcome, PrunedArchive};
use derive_more::Display;
use std::time::Duration;

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    PartialFailure,
    Failed,
}

impl RunStatus {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Success => 0,
            RunStatus::PartialFailure => 1,
            RunStatus::Failed => 2,
        }
    }
}

/// Summary of one run, returned to the caller once the lock is released.
#[derive(Debug)]
pub struct Report {
    pub status: RunStatus,
    /// One entry per unit, in unit order
    pub results: Vec<CopyResult>,
    /// The archive written by this run. Always `None` for dry runs and
    /// failed runs.
    pub archive: Option<Archive>,
    pub pruned: Vec<PrunedArchive>,
    /// Set when the destination could not be listed for pruning
    pub prune_error: Option<Error>,
    pub duration: Duration,
    pub dry_run: bool,
    /// The error that ended the run early
    pub fatal: Option<Error>,
    /// States the run went through, ending with `Done`
    pub states: Vec<RunState>,
}

impl Report {
    pub fn succeeded(&self) -> usize {
        self.count(|s| matches!(s, CopyStatus::Succeeded))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, CopyStatus::Failed(_)))
    }

    pub fn skipped(&self) -> usize {
        self.count(|s| matches!(s, CopyStatus::Skipped(_)))
    }

    fn count<F: Fn(&CopyStatus) -> bool>(&self, f: F) -> usize {
        self.results.iter().filter(|r| f(&r.status)).count()
    }

    pub fn prune_failures(&self) -> usize {
        self.pruned
            .iter()
            .filter(|p| matches!(p.outcome, PruneOutcome::Failed(_)))
            .count()
    }

    pub fn error_category(&self) -> Option<ErrorCategory> {
        self.fatal.as_ref().map(Error::category)
    }

    pub fn exit_code(&self) -> i32 {
        self.status.exit_code()
    }

    pub fn log_summary(&self) {
        let prefix = if self.dry_run { "[dry run] " } else { "" };
        for r in self.results.iter().filter(|r| r.is_failed()) {
            tracing::warn!("{prefix}{:?}: {}", r.unit.src, r.status);
        }
        for p in &self.pruned {
            match p.outcome {
                PruneOutcome::Failed(_) => tracing::warn!("{prefix}{p}"),
                _ => tracing::info!("{prefix}{p}"),
            }
        }
        if let Some(e) = &self.prune_error {
            tracing::warn!("{prefix}Pruning skipped: {e}");
        }
        if let Some(archive) = &self.archive {
            tracing::info!(
                "{prefix}Archive {:?}: {} entries, {} bytes",
                archive.path,
                archive.manifest.len(),
                archive.size
            );
        }
        tracing::info!(
            "{prefix}{} units: {} succeeded, {} failed, {} skipped; {} archives pruned ({} failed); took {:?}",
            self.results.len(),
            self.succeeded(),
            self.failed(),
            self.skipped(),
            self.pruned.len() - self.prune_failures(),
            self.prune_failures(),
            self.duration
        );
        match (&self.status, &self.fatal) {
            (RunStatus::Failed, Some(e)) => {
                tracing::error!("{prefix}Backup {} ({:?}): {e}", self.status, e.category())
            }
            (RunStatus::Success, _) => tracing::info!("{prefix}Backup {}", self.status),
            _ => tracing::warn!("{prefix}Backup {}", self.status),
        }
    }
}
