use crate::backup::archive::naming::ArchiveNaming;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use bon::Builder;
use chrono::{DateTime, Duration, Utc};
use getset::{CopyGetters, Getters};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::cmp::Reverse;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use validator::Validate;

/// How the count rule and the age rule combine when both are set.
#[derive(Clone, Copy, Default, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuleComposition {
    /// Delete only when every active rule votes delete.
    #[default]
    KeepIfAny,
    /// Delete as soon as one active rule votes delete.
    DeleteIfAny,
}

#[skip_serializing_none]
#[derive(Clone, Default, Validate, Serialize, Deserialize, Debug, Builder, CopyGetters)]
#[serde(deny_unknown_fields)]
#[getset(get_copy = "pub")]
pub struct RetentionConfig {
    /// Number of newest archives that are kept
    #[validate(range(min = 1))]
    keep_last: Option<usize>,
    /// Archives younger than this are kept
    #[serde(default, with = "humantime_serde")]
    keep_newer_than: Option<std::time::Duration>,
    #[serde(default)]
    #[builder(default)]
    composition: RuleComposition,
}

#[derive(Clone, Debug, Hash, Eq, PartialEq, Getters)]
#[getset(get = "pub")]
pub struct ItemWithDateTime<R> {
    item: R,
    date_time: DateTime<Utc>,
}

impl<R> From<(R, DateTime<Utc>)> for ItemWithDateTime<R> {
    fn from(value: (R, DateTime<Utc>)) -> Self {
        Self {
            item: value.0,
            date_time: value.1,
        }
    }
}

impl RetentionConfig {
    pub fn is_active(&self) -> bool {
        self.keep_last.is_some() || self.keep_newer_than.is_some()
    }

    /// Items to delete, oldest first.
    ///
    /// Items are ranked newest first by their date time. Items for which
    /// `protected` returns true are ranked but never returned.
    pub fn get_delete<R, I, F>(&self, items: I, now: DateTime<Utc>, protected: F) -> Vec<ItemWithDateTime<R>>
    where
        I: IntoIterator<Item = ItemWithDateTime<R>>,
        F: Fn(&R) -> bool,
    {
        if !self.is_active() {
            return Vec::new();
        }
        let max_age = self
            .keep_newer_than
            .map(|d| Duration::from_std(d).unwrap_or(Duration::MAX));

        let mut to_delete = items
            .into_iter()
            .sorted_by_key(|i| Reverse(i.date_time))
            .enumerate()
            .filter(|(rank, i)| {
                let votes = [
                    self.keep_last.map(|n| *rank >= n),
                    max_age.map(|max_age| now.signed_duration_since(i.date_time) >= max_age),
                ];
                let mut active = votes.iter().flatten();
                let delete = match self.composition {
                    RuleComposition::KeepIfAny => active.all(|delete| *delete),
                    RuleComposition::DeleteIfAny => active.any(|delete| *delete),
                };
                delete && !protected(&i.item)
            })
            .map(|(_, i)| i)
            .collect_vec();
        to_delete.reverse();
        to_delete
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PruneOutcome {
    Deleted,
    /// Dry run, the archive would have been deleted
    Simulated,
    Failed(String),
}

#[derive(Clone, Debug)]
pub struct PrunedArchive {
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub outcome: PruneOutcome,
}

impl Display for PrunedArchive {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.outcome {
            PruneOutcome::Deleted => write!(f, "deleted {:?}", self.path),
            PruneOutcome::Simulated => write!(f, "would delete {:?}", self.path),
            PruneOutcome::Failed(e) => write!(f, "failed to delete {:?}: {e}", self.path),
        }
    }
}

/// Applies the retention policy to the archives in a destination directory.
pub struct RetentionManager<'a> {
    config: &'a RetentionConfig,
    naming: &'a ArchiveNaming,
}

impl<'a> RetentionManager<'a> {
    pub fn new(config: &'a RetentionConfig, naming: &'a ArchiveNaming) -> Self {
        Self { config, naming }
    }

    /// Archives in `dir` that follow the naming, with their embedded time.
    pub fn list(&self, dir: &Path) -> Result<Vec<ItemWithDateTime<PathBuf>>> {
        Ok(std::fs::read_dir(dir)
            .map_err(Error::from)
            .with_msg(format!("Listing archives in {:?} failed", dir))?
            .filter_map(|r| r.ok())
            .filter_map(|e| {
                self.naming
                    .parse(e.path())
                    .map(|dt| ItemWithDateTime::from((e.path(), dt)))
            })
            .collect())
    }

    /// Deletes the archives the policy rejects.
    ///
    /// `current` is the archive of the running backup, it takes part in the
    /// ranking even when it is not on disk (dry run) and is never deleted.
    /// A failed deletion is recorded and pruning continues.
    pub fn prune(
        &self,
        dir: &Path,
        current: Option<(&Path, DateTime<Utc>)>,
        now: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<Vec<PrunedArchive>> {
        let mut candidates = self.list(dir)?;
        if let Some((path, dt)) = current {
            if !candidates.iter().any(|c| c.item == path) {
                candidates.push(ItemWithDateTime::from((path.to_path_buf(), dt)));
            }
        }
        tracing::info!(
            "Checking {} archives against retention {:?}",
            candidates.len(),
            self.config
        );

        let is_current = |p: &PathBuf| current.is_some_and(|(c, _)| p == c);
        let pruned = self
            .config
            .get_delete(candidates, now, is_current)
            .into_iter()
            .map(|i| {
                let outcome = if dry_run {
                    tracing::info!("[dry run] Would remove out of retention archive {:?}", i.item);
                    PruneOutcome::Simulated
                } else {
                    match std::fs::remove_file(&i.item) {
                        Ok(()) => {
                            tracing::info!("Removed out of retention archive {:?}", i.item);
                            PruneOutcome::Deleted
                        }
                        Err(e) => {
                            tracing::warn!("Removing archive {:?} failed: {e}", i.item);
                            PruneOutcome::Failed(e.to_string())
                        }
                    }
                };
                PrunedArchive {
                    path: i.item,
                    created_at: i.date_time,
                    outcome,
                }
            })
            .collect();
        Ok(pruned)
    }
}
