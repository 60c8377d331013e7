//! Parallel copy engine.
//!
//! A fixed rayon pool processes backup units. Each worker stages its unit's
//! bytes on its own (open, read into a spooled buffer) and then hands them to
//! the [`EntrySink`], which serializes the actual writes. A failing unit only
//! produces a failed [`CopyResult`], the rest of the run carries on.

use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use crate::backup::source::{BackupUnit, UnitIssue, UnitKind};
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use std::fmt::{Display, Formatter};
use std::fs::{File, Metadata};
use std::io::Seek;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::SpooledTempFile;

/// Staged bytes above this size spill from memory to a temp file.
static SPOOL_THRESHOLD: usize = 8 * 1024 * 1024;

/// Shared flag to stop a run between unit boundaries.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SkipReason {
    CyclicLink,
    /// Another unit already claimed the same path inside the archive
    DuplicateEntry,
    Cancelled,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CopyStatus {
    Succeeded,
    Skipped(SkipReason),
    Failed(String),
}

impl Display for CopyStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CopyStatus::Succeeded => f.write_str("succeeded"),
            CopyStatus::Skipped(SkipReason::CyclicLink) => f.write_str("skipped (cyclic link)"),
            CopyStatus::Skipped(SkipReason::DuplicateEntry) => {
                f.write_str("skipped (duplicate entry path)")
            }
            CopyStatus::Skipped(SkipReason::Cancelled) => f.write_str("skipped (cancelled)"),
            CopyStatus::Failed(cause) => write!(f, "failed: {cause}"),
        }
    }
}

/// Outcome of one unit.
#[derive(Clone, Debug)]
pub struct CopyResult {
    pub unit: BackupUnit,
    pub status: CopyStatus,
    pub bytes: u64,
    /// Set when the run was a dry run and nothing was written
    pub simulated: bool,
}

impl CopyResult {
    pub fn is_failed(&self) -> bool {
        matches!(self.status, CopyStatus::Failed(_))
    }
}

/// A unit's data, read and ready to be appended.
pub struct StagedEntry {
    pub metadata: Metadata,
    pub size: u64,
    /// `None` for directories and in simulated runs
    pub content: Option<SpooledTempFile>,
}

/// Where workers deliver staged entries.
///
/// Implementations must serialize concurrent `commit` calls themselves.
pub trait EntrySink: Sync {
    /// A simulated sink writes nothing, workers skip reading file bytes.
    fn is_simulated(&self) -> bool;

    fn commit(&self, unit: &BackupUnit, staged: StagedEntry) -> Result<u64>;
}

/// Sink of a dry run, accepts every entry and only accounts its size.
pub struct DryRunSink;

impl EntrySink for DryRunSink {
    fn is_simulated(&self) -> bool {
        true
    }

    fn commit(&self, unit: &BackupUnit, staged: StagedEntry) -> Result<u64> {
        tracing::debug!("[dry run] Would archive {:?} as {:?}", unit.src, unit.dst);
        Ok(staged.size)
    }
}

/// Observer of a copy, called from the worker threads.
pub trait CopyProgress: Send + Sync {
    /// Called once before any unit, with the totals of the run.
    fn start(&self, units: usize, bytes: u64);

    /// Called once per unit as soon as its result is known.
    fn unit_done(&self, result: &CopyResult);

    fn finish(&self) {}
}

pub struct ParallelCopyEngine {
    worker_count: usize,
    progress: Option<Arc<dyn CopyProgress>>,
}

impl ParallelCopyEngine {
    pub fn new(worker_count: usize) -> Self {
        Self {
            worker_count: worker_count.max(1),
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: Option<Arc<dyn CopyProgress>>) -> Self {
        self.progress = progress;
        self
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Processes every unit and returns one result per unit, in unit order.
    pub fn process(
        &self,
        units: &[BackupUnit],
        sink: &dyn EntrySink,
        cancel: &CancellationToken,
    ) -> Result<Vec<CopyResult>> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(self.worker_count)
            .thread_name(|i| format!("backup-worker-{i}"))
            .build()?;

        let total_bytes = units.iter().map(|u| u.size).sum::<u64>();
        tracing::info!(
            "{}Copying {} units ({} bytes) with {} workers",
            if sink.is_simulated() { "[dry run] " } else { "" },
            units.len(),
            total_bytes,
            self.worker_count
        );
        let progress = self.progress.as_deref();
        if let Some(progress) = progress {
            progress.start(units.len(), total_bytes);
        }

        let mut results: Vec<CopyResult> = pool.install(|| {
            units
                .par_iter()
                .with_max_len(1)
                .map(|unit| {
                    let result = process_unit(unit, sink, cancel);
                    if let Some(progress) = progress {
                        progress.unit_done(&result);
                    }
                    result
                })
                .collect()
        });
        if let Some(progress) = progress {
            progress.finish();
        }
        results.sort_by_key(|r| r.unit.index);
        Ok(results)
    }
}

fn process_unit(unit: &BackupUnit, sink: &dyn EntrySink, cancel: &CancellationToken) -> CopyResult {
    let (status, bytes) = if cancel.is_cancelled() {
        (CopyStatus::Skipped(SkipReason::Cancelled), 0)
    } else {
        match &unit.issue {
            Some(UnitIssue::CyclicLink) => (CopyStatus::Skipped(SkipReason::CyclicLink), 0),
            Some(UnitIssue::DuplicateEntry) => {
                (CopyStatus::Skipped(SkipReason::DuplicateEntry), 0)
            }
            Some(UnitIssue::Unreadable(cause)) => (CopyStatus::Failed(cause.clone()), 0),
            None => match copy_unit(unit, sink, cancel) {
                Ok(Some(bytes)) => (CopyStatus::Succeeded, bytes),
                Ok(None) => (CopyStatus::Skipped(SkipReason::Cancelled), 0),
                Err(e) => {
                    tracing::error!("{e}");
                    (CopyStatus::Failed(e.to_string()), 0)
                }
            },
        }
    };

    CopyResult {
        unit: unit.clone(),
        status,
        bytes,
        simulated: sink.is_simulated(),
    }
}

/// `Ok(None)` when the run got cancelled while the unit was being staged,
/// in which case nothing was committed.
fn copy_unit(
    unit: &BackupUnit,
    sink: &dyn EntrySink,
    cancel: &CancellationToken,
) -> Result<Option<u64>> {
    let staged = stage(unit, sink.is_simulated())
        .with_msg(format!("Backing up {:?} failed", unit.src))?;
    if cancel.is_cancelled() {
        tracing::debug!("Abandoning staged {:?}, run cancelled", unit.src);
        return Ok(None);
    }
    sink.commit(unit, staged)
        .with_msg(format!("Archiving {:?} failed", unit.src))
        .map(Some)
}

fn stage(unit: &BackupUnit, simulated: bool) -> Result<StagedEntry> {
    match unit.kind {
        UnitKind::Directory => {
            let metadata = std::fs::metadata(&unit.src)?;
            // Listing proves the directory is still readable.
            std::fs::read_dir(&unit.src)?;
            Ok(StagedEntry {
                metadata,
                size: 0,
                content: None,
            })
        }
        UnitKind::File => {
            let mut file = File::open(&unit.src)?;
            let metadata = file.metadata()?;
            if !metadata.is_file() {
                return Err(Error::from(std::io::Error::other("no longer a regular file")));
            }
            if simulated {
                return Ok(StagedEntry {
                    size: metadata.len(),
                    metadata,
                    content: None,
                });
            }

            let mut spool = tempfile::spooled_tempfile(SPOOL_THRESHOLD);
            let size = std::io::copy(&mut file, &mut spool)?;
            spool.rewind()?;
            Ok(StagedEntry {
                metadata,
                size,
                content: Some(spool),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::archive::naming::ArchiveNaming;
    use crate::backup::archive::tests::read_archive;
    use crate::backup::archive::{ArchiveWriter, SharedArchive};
    use crate::backup::compress::CompressorConfig;
    use crate::backup::source::walkdir_globset::SourceConfig;
    use crate::backup::source::PathResolver;
    use chrono::Utc;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, AtomicUsize};
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingProgress {
        planned: Mutex<Option<(usize, u64)>>,
        done: AtomicUsize,
        bytes: AtomicU64,
        finished: AtomicBool,
    }

    impl CopyProgress for RecordingProgress {
        fn start(&self, units: usize, bytes: u64) {
            *self.planned.lock().unwrap() = Some((units, bytes));
        }

        fn unit_done(&self, result: &CopyResult) {
            self.done.fetch_add(1, Ordering::SeqCst);
            self.bytes.fetch_add(result.bytes, Ordering::SeqCst);
        }

        fn finish(&self) {
            self.finished.store(true, Ordering::SeqCst);
        }
    }

    fn fixture(files: &[(&str, &str)]) -> (TempDir, Vec<BackupUnit>) {
        let temp_dir = TempDir::new().unwrap();
        let src = temp_dir.path().join("src");
        for (name, content) in files {
            let path = src.join(name);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, content).unwrap();
        }
        std::fs::create_dir_all(temp_dir.path().join("dst")).unwrap();
        let sources = vec![SourceConfig::builder().path(&src).build()];
        let units = PathResolver::new(&sources).resolve().unwrap();
        (temp_dir, units)
    }

    fn writer(temp_dir: &TempDir) -> ArchiveWriter {
        ArchiveWriter::create(
            temp_dir.path().join("dst"),
            &ArchiveNaming::new("test", "tar"),
            Utc::now(),
            &CompressorConfig::None,
        )
        .unwrap()
    }

    #[test]
    fn test_all_units_succeed() {
        let (temp_dir, units) = fixture(&[("a.txt", "aa"), ("b/c.txt", "ccc"), ("d.txt", "d")]);
        let shared = SharedArchive::new(writer(&temp_dir));

        let results = ParallelCopyEngine::new(4)
            .process(&units, &shared, &CancellationToken::new())
            .unwrap();

        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.status == CopyStatus::Succeeded));
        assert!(results.iter().all(|r| !r.simulated));
        assert_eq!(results.iter().map(|r| r.bytes).collect::<Vec<_>>(), vec![2, 3, 1]);
        assert_eq!(
            results.iter().map(|r| r.unit.index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );

        let archive = shared.into_inner().unwrap().finish().unwrap();
        let mut entries = read_archive(&archive.path);
        entries.sort();
        assert_eq!(
            entries,
            vec![
                (PathBuf::from("a.txt"), "aa".to_string()),
                (PathBuf::from("b/c.txt"), "ccc".to_string()),
                (PathBuf::from("d.txt"), "d".to_string()),
            ]
        );
    }

    #[test]
    fn test_unit_vanished_before_copy_is_partial_failure() {
        let (temp_dir, units) = fixture(&[("a.txt", "a"), ("b.txt", "b"), ("c.txt", "c")]);
        std::fs::remove_file(&*units[1].src).unwrap();
        let shared = SharedArchive::new(writer(&temp_dir));

        let results = ParallelCopyEngine::new(3)
            .process(&units, &shared, &CancellationToken::new())
            .unwrap();

        assert_eq!(results[0].status, CopyStatus::Succeeded);
        assert!(results[1].is_failed());
        assert_eq!(results[2].status, CopyStatus::Succeeded);

        let archive = shared.into_inner().unwrap().finish().unwrap();
        let mut names: Vec<_> = read_archive(&archive.path).into_iter().map(|e| e.0).collect();
        names.sort();
        assert_eq!(names, vec![PathBuf::from("a.txt"), PathBuf::from("c.txt")]);
    }

    #[test]
    fn test_dry_run_writes_nothing_but_reports_failures() {
        let (_temp_dir, units) = fixture(&[("a.txt", "aaaa"), ("b.txt", "b")]);
        std::fs::remove_file(&*units[1].src).unwrap();

        let results = ParallelCopyEngine::new(2)
            .process(&units, &DryRunSink, &CancellationToken::new())
            .unwrap();

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.simulated));
        assert_eq!(results[0].status, CopyStatus::Succeeded);
        assert_eq!(results[0].bytes, 4);
        assert!(results[1].is_failed());
    }

    #[test]
    fn test_issues_decide_status_without_io() {
        let (_temp_dir, mut units) = fixture(&[("a.txt", "a"), ("b.txt", "b")]);
        units[0].issue = Some(UnitIssue::CyclicLink);
        units[1].issue = Some(UnitIssue::Unreadable("permission denied".into()));

        let results = ParallelCopyEngine::new(1)
            .process(&units, &DryRunSink, &CancellationToken::new())
            .unwrap();

        assert_eq!(results[0].status, CopyStatus::Skipped(SkipReason::CyclicLink));
        assert_eq!(results[1].status, CopyStatus::Failed("permission denied".into()));
    }

    #[test]
    fn test_cancelled_before_start_skips_everything() {
        let (_temp_dir, units) = fixture(&[("a.txt", "a"), ("b.txt", "b")]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let results = ParallelCopyEngine::new(2)
            .process(&units, &DryRunSink, &cancel)
            .unwrap();

        assert!(results
            .iter()
            .all(|r| r.status == CopyStatus::Skipped(SkipReason::Cancelled)));
    }

    #[test]
    fn test_many_workers_keep_entries_intact() {
        let files: Vec<(String, String)> = (0..40)
            .map(|i| (format!("f{i:02}.txt"), format!("{i}-").repeat(1000 * i)))
            .collect();
        let refs: Vec<(&str, &str)> = files.iter().map(|(a, b)| (a.as_str(), b.as_str())).collect();
        let (temp_dir, units) = fixture(&refs);
        let shared = SharedArchive::new(writer(&temp_dir));

        let results = ParallelCopyEngine::new(8)
            .process(&units, &shared, &CancellationToken::new())
            .unwrap();
        assert!(results.iter().all(|r| r.status == CopyStatus::Succeeded));
        assert!(results.windows(2).all(|w| w[0].unit.index < w[1].unit.index));

        let archive = shared.into_inner().unwrap().finish().unwrap();
        let mut entries = read_archive(&archive.path);
        entries.sort();
        let expected: Vec<_> = files
            .into_iter()
            .map(|(name, content)| (PathBuf::from(name), content))
            .collect();
        assert_eq!(entries, expected);
    }

    #[test]
    fn test_progress_sees_every_unit_and_committed_bytes() {
        let (temp_dir, units) = fixture(&[("a.txt", "aa"), ("b.txt", "bbbb"), ("c.txt", "c")]);
        std::fs::remove_file(&*units[2].src).unwrap();
        let shared = SharedArchive::new(writer(&temp_dir));
        let progress = Arc::new(RecordingProgress::default());

        let results = ParallelCopyEngine::new(3)
            .with_progress(Some(progress.clone()))
            .process(&units, &shared, &CancellationToken::new())
            .unwrap();

        assert!(results[2].is_failed());
        assert_eq!(*progress.planned.lock().unwrap(), Some((3, 7)));
        assert_eq!(progress.done.load(Ordering::SeqCst), 3);
        assert_eq!(progress.bytes.load(Ordering::SeqCst), 6);
        assert!(progress.finished.load(Ordering::SeqCst));
    }

    #[test]
    fn test_duplicate_entry_is_skipped() {
        let (_temp_dir, mut units) = fixture(&[("a.txt", "a")]);
        units[0].issue = Some(UnitIssue::DuplicateEntry);

        let results = ParallelCopyEngine::new(1)
            .process(&units, &DryRunSink, &CancellationToken::new())
            .unwrap();

        assert_eq!(results[0].status, CopyStatus::Skipped(SkipReason::DuplicateEntry));
        assert_eq!(results[0].status.to_string(), "skipped (duplicate entry path)");
    }

    #[test]
    fn test_worker_count_is_clamped() {
        assert_eq!(ParallelCopyEngine::new(0).worker_count(), 1);
        assert_eq!(ParallelCopyEngine::new(3).worker_count(), 3);
    }
}
