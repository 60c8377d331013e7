//! One backup run as a state machine:
//! resolve paths, take the destination lock, copy, finalize, prune, release.
//!
//! The lock is released on every path that acquired it, whatever failed in
//! between.

use crate::backup::archive::naming::ArchiveNaming;
use crate::backup::archive::{Archive, ArchiveWriter, SharedArchive};
use crate::backup::backup_config::RunConfig;
use crate::backup::engine::{
    CancellationToken, CopyProgress, CopyResult, DryRunSink, ParallelCopyEngine,
};
use crate::backup::lock::LockGuard;
use crate::backup::report::{Report, RunStatus};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use crate::backup::retention::{PruneOutcome, PrunedArchive, RetentionManager};
use crate::backup::source::{BackupUnit, PathResolver};
use chrono::{DateTime, Utc};
use derive_more::Display;
use std::sync::Arc;
use std::time::Instant;
use validator::Validate;

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum RunState {
    Idle,
    ResolvingPaths,
    AcquiringLock,
    Copying,
    Finalizing,
    Pruning,
    ReleasingLock,
    #[display("Done({_0})")]
    Done(RunStatus),
}

/// Runs one backup of a [`RunConfig`].
pub struct Orchestrator<'a> {
    config: &'a RunConfig,
    cancel: CancellationToken,
    progress: Option<Arc<dyn CopyProgress>>,
    /// Source of the archive timestamp and of "now" for retention
    clock: fn() -> DateTime<Utc>,
    states: Vec<RunState>,
}

/// What happened while the lock was held.
#[derive(Default)]
struct LockedOutcome {
    results: Vec<CopyResult>,
    archive: Option<Archive>,
    pruned: Vec<PrunedArchive>,
    prune_error: Option<Error>,
    fatal: Option<Error>,
}

/// Runs `config` once without external cancellation.
pub fn run(config: &RunConfig, dry_run: bool) -> Report {
    Orchestrator::new(config, CancellationToken::new()).run(dry_run)
}

impl<'a> Orchestrator<'a> {
    pub fn new(config: &'a RunConfig, cancel: CancellationToken) -> Self {
        Self {
            config,
            cancel,
            progress: None,
            clock: Utc::now,
            states: vec![RunState::Idle],
        }
    }

    /// Reports copy progress of the run to `progress`.
    pub fn with_progress(mut self, progress: Option<Arc<dyn CopyProgress>>) -> Self {
        self.progress = progress;
        self
    }

    fn enter(&mut self, state: RunState) {
        tracing::debug!("Backup run entering {state}");
        self.states.push(state);
    }

    /// Runs the backup. `dry_run` is combined with the configured flag.
    pub fn run(mut self, dry_run: bool) -> Report {
        let started = Instant::now();
        let dry_run = dry_run || self.config.dry_run();
        let prefix = if dry_run { "[dry run] " } else { "" };
        tracing::info!(
            "{prefix}Starting backup {:?} into {:?}",
            self.config.archive_name(),
            self.config.destination()
        );

        self.enter(RunState::ResolvingPaths);
        let units = match self.resolve() {
            Ok(units) => units,
            Err(e) => return self.finish(started, dry_run, LockedOutcome::failed(e)),
        };

        self.enter(RunState::AcquiringLock);
        let lock = match LockGuard::acquire(self.config.destination()) {
            Ok(lock) => lock,
            Err(e) => return self.finish(started, dry_run, LockedOutcome::failed(e)),
        };

        let outcome = self.run_locked(&units, dry_run);

        self.enter(RunState::ReleasingLock);
        if let Err(e) = lock.release() {
            tracing::warn!("{e}");
        }

        self.finish(started, dry_run, outcome)
    }

    fn resolve(&self) -> Result<Vec<BackupUnit>> {
        self.config
            .validate()
            .map_err(Error::from)
            .with_msg("Config validation failed")?;
        PathResolver::new(self.config.sources()).resolve()
    }

    fn run_locked(&mut self, units: &[BackupUnit], dry_run: bool) -> LockedOutcome {
        let created_at = (self.clock)();
        let naming = self.config.naming();
        let engine =
            ParallelCopyEngine::new(self.config.parallelism()).with_progress(self.progress.clone());

        self.enter(RunState::Copying);
        let (results, archive) = if dry_run {
            self.simulate(&engine, units)
        } else {
            self.write_archive(&engine, units, &naming, created_at)
        };
        let mut outcome = LockedOutcome {
            results,
            ..Default::default()
        };
        match archive {
            Ok(archive) => outcome.archive = archive,
            Err(e) => {
                outcome.fatal = Some(e);
                return outcome;
            }
        }

        if let Some(policy) = self.config.retention() {
            self.enter(RunState::Pruning);
            let current = match &outcome.archive {
                Some(archive) => archive.path.clone(),
                None => self.config.destination().join(naming.file_name(created_at)),
            };
            match RetentionManager::new(policy, &naming).prune(
                self.config.destination(),
                Some((current.as_path(), created_at)),
                (self.clock)(),
                dry_run,
            ) {
                Ok(pruned) => outcome.pruned = pruned,
                Err(e) => {
                    tracing::error!("{e}");
                    outcome.prune_error = Some(e);
                }
            }
        }
        outcome
    }

    fn simulate(
        &mut self,
        engine: &ParallelCopyEngine,
        units: &[BackupUnit],
    ) -> (Vec<CopyResult>, Result<Option<Archive>>) {
        let results = match engine.process(units, &DryRunSink, &self.cancel) {
            Ok(results) => results,
            Err(e) => return (Vec::new(), Err(e)),
        };
        if self.cancel.is_cancelled() {
            return (results, Err(Error::Cancelled));
        }
        self.enter(RunState::Finalizing);
        (results, Ok(None))
    }

    fn write_archive(
        &mut self,
        engine: &ParallelCopyEngine,
        units: &[BackupUnit],
        naming: &ArchiveNaming,
        created_at: DateTime<Utc>,
    ) -> (Vec<CopyResult>, Result<Option<Archive>>) {
        let writer = match ArchiveWriter::create(
            self.config.destination(),
            naming,
            created_at,
            &self.config.compressor(),
        ) {
            Ok(writer) => writer,
            Err(e) => return (Vec::new(), Err(e)),
        };

        let shared = SharedArchive::new(writer);
        let processed = engine.process(units, &shared, &self.cancel);
        let writer = match shared.into_inner() {
            Ok(writer) => writer,
            Err(e) => return (processed.unwrap_or_default(), Err(e)),
        };

        let abandon = |writer: ArchiveWriter, e: Error| match writer.abandon() {
            Ok(()) => e,
            Err(abandon_error) => e.chain(abandon_error),
        };
        match processed {
            Err(e) => (Vec::new(), Err(abandon(writer, e))),
            Ok(results) if self.cancel.is_cancelled() => {
                tracing::warn!("Backup cancelled, discarding partial archive");
                (results, Err(abandon(writer, Error::Cancelled)))
            }
            Ok(results) => {
                self.enter(RunState::Finalizing);
                (results, writer.finish().map(Some))
            }
        }
    }

    fn finish(mut self, started: Instant, dry_run: bool, outcome: LockedOutcome) -> Report {
        let recovered_failures = outcome.results.iter().any(CopyResult::is_failed)
            || outcome
                .pruned
                .iter()
                .any(|p| matches!(p.outcome, PruneOutcome::Failed(_)))
            || outcome.prune_error.is_some();
        let status = match (&outcome.fatal, recovered_failures) {
            (Some(_), _) => RunStatus::Failed,
            (None, true) => RunStatus::PartialFailure,
            (None, false) => RunStatus::Success,
        };
        self.enter(RunState::Done(status));

        let report = Report {
            status,
            results: outcome.results,
            archive: outcome.archive,
            pruned: outcome.pruned,
            prune_error: outcome.prune_error,
            duration: started.elapsed(),
            dry_run,
            fatal: outcome.fatal,
            states: self.states,
        };
        tracing::info!(
            "{}Backup finished with {} in {:?}",
            if dry_run { "[dry run] " } else { "" },
            report.status,
            report.duration
        );
        report
    }
}

impl LockedOutcome {
    fn failed(e: Error) -> Self {
        Self {
            fatal: Some(e),
            ..Default::default()
        }
    }
}
