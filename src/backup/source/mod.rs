pub mod walkdir_globset;

use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::source::walkdir_globset::SourceConfig;
use std::collections::HashSet;
use std::fmt::{Display, Formatter};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UnitKind {
    File,
    Directory,
}

/// A problem found during resolution that decides the unit's outcome
/// before any worker touches it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UnitIssue {
    /// A followed link leads back into one of its own ancestors.
    CyclicLink,
    /// The walker could not read this path.
    Unreadable(String),
    /// An earlier unit from another source already uses this archive path.
    DuplicateEntry,
}

impl Display for UnitIssue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            UnitIssue::CyclicLink => f.write_str("cyclic link"),
            UnitIssue::Unreadable(e) => write!(f, "unreadable: {e}"),
            UnitIssue::DuplicateEntry => f.write_str("duplicate entry path"),
        }
    }
}

/// One file or directory slated for archiving in a run.
///
/// Immutable once resolved. `index` is the position in resolution order and
/// is what the final report is sorted by.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackupUnit {
    pub index: usize,
    /// Source path on the filesystem
    pub src: Arc<Path>,
    /// Path of the entry inside the archive
    pub dst: Arc<Path>,
    pub kind: UnitKind,
    /// Size seen at resolution time, the copied size may differ
    pub size: u64,
    pub issue: Option<UnitIssue>,
}

/// Expands configured sources into a deduplicated, order-stable unit list.
pub struct PathResolver<'a> {
    sources: &'a [SourceConfig],
}

impl<'a> PathResolver<'a> {
    pub fn new(sources: &'a [SourceConfig]) -> Self {
        Self { sources }
    }

    /// Common ancestor of all sources, entries are stored relative to it.
    ///
    /// A file source contributes its parent directory.
    pub fn common_root(&self) -> Result<PathBuf> {
        let dirs = self
            .sources
            .iter()
            .map(|s| {
                let path = std::fs::canonicalize(s.path()).map_err(|e| {
                    Error::Configuration(format!("source {:?} is not accessible: {e}", s.path()))
                })?;
                Ok(if path.is_file() {
                    path.parent().map(Path::to_path_buf).unwrap_or(path)
                } else {
                    path
                })
            })
            .collect::<Result<Vec<PathBuf>>>()?;

        let mut iter = dirs.into_iter();
        let first = match iter.next() {
            Some(first) => first,
            None => return Err(Error::Configuration("no sources configured".into())),
        };
        Ok(iter.fold(first, |acc, p| {
            acc.components()
                .zip(p.components())
                .take_while(|(a, b)| a == b)
                .map(|(a, _)| a)
                .collect()
        }))
    }

    /// Resolves every source into backup units.
    ///
    /// A missing source is a configuration error. Paths reached more than
    /// once (overlapping sources, links to already visited files) are kept
    /// only at their first occurrence. A different path landing on an archive
    /// path already taken is kept as a unit with [`UnitIssue::DuplicateEntry`].
    pub fn resolve(&self) -> Result<Vec<BackupUnit>> {
        let root = self.common_root()?;
        tracing::debug!("Resolving {} sources relative to {:?}", self.sources.len(), root);

        let mut visited = HashSet::new();
        let mut entry_paths = HashSet::new();
        let mut units = Vec::new();
        for source in self.sources {
            for entry in source.canonicalized()?.walk(&root)? {
                let key = std::fs::canonicalize(&entry.src).unwrap_or_else(|_| entry.src.clone());
                if entry.issue.is_none() && !visited.insert(key) {
                    tracing::debug!("Skipping already visited path {:?}", entry.src);
                    continue;
                }
                let dst = sanitize_dst(&entry.dst);
                let issue = match entry.issue {
                    None if !entry_paths.insert(dst.clone()) => {
                        tracing::warn!(
                            "Skipping {:?}, archive path {:?} is already taken",
                            entry.src,
                            dst
                        );
                        Some(UnitIssue::DuplicateEntry)
                    }
                    issue => issue,
                };
                units.push(BackupUnit {
                    index: units.len(),
                    src: entry.src.into(),
                    dst: dst.into(),
                    kind: entry.kind,
                    size: entry.size,
                    issue,
                });
            }
        }

        tracing::info!(
            "Resolved {} units ({} bytes)",
            units.len(),
            units.iter().map(|u| u.size).sum::<u64>()
        );
        Ok(units)
    }
}

/// Archive entry paths are always relative and never climb out of the archive.
fn sanitize_dst(dst: &Path) -> PathBuf {
    dst.components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use itertools::Itertools;
    use tempfile::TempDir;

    fn write(path: &Path, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_common_root_of_sibling_dirs() {
        let temp_dir = TempDir::new().unwrap();
        write(&temp_dir.path().join("docs/a.txt"), "a");
        write(&temp_dir.path().join("pics/b.png"), "b");

        let sources = vec![
            SourceConfig::builder().path(temp_dir.path().join("docs")).build(),
            SourceConfig::builder().path(temp_dir.path().join("pics")).build(),
        ];
        let resolver = PathResolver::new(&sources);
        assert_eq!(
            resolver.common_root().unwrap(),
            std::fs::canonicalize(temp_dir.path()).unwrap()
        );

        let units = resolver.resolve().unwrap();
        let dsts: Vec<_> = units.iter().map(|u| u.dst.to_path_buf()).collect();
        assert_eq!(dsts, vec![PathBuf::from("docs/a.txt"), PathBuf::from("pics/b.png")]);
        assert_eq!(units.iter().map(|u| u.index).collect_vec(), vec![0, 1]);
    }

    #[test]
    fn test_single_dir_source_is_its_own_root() {
        let temp_dir = TempDir::new().unwrap();
        write(&temp_dir.path().join("docs/sub/a.txt"), "a");

        let sources = vec![SourceConfig::builder().path(temp_dir.path().join("docs")).build()];
        let units = PathResolver::new(&sources).resolve().unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].dst.as_ref(), Path::new("sub/a.txt"));
        assert_eq!(units[0].size, 1);
    }

    #[test]
    fn test_overlapping_sources_are_deduplicated() {
        let temp_dir = TempDir::new().unwrap();
        write(&temp_dir.path().join("docs/a.txt"), "a");
        write(&temp_dir.path().join("docs/b.txt"), "b");

        let sources = vec![
            SourceConfig::builder().path(temp_dir.path().join("docs")).build(),
            SourceConfig::builder().path(temp_dir.path().join("docs/b.txt")).build(),
        ];
        let units = PathResolver::new(&sources).resolve().unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[1].dst.as_ref(), Path::new("b.txt"));
    }

    #[cfg(unix)]
    #[test]
    fn test_link_to_visited_file_is_deduplicated() {
        let temp_dir = TempDir::new().unwrap();
        write(&temp_dir.path().join("docs/a.txt"), "a");
        std::os::unix::fs::symlink(
            temp_dir.path().join("docs/a.txt"),
            temp_dir.path().join("docs/z_link.txt"),
        )
        .unwrap();

        let sources = vec![SourceConfig::builder().path(temp_dir.path().join("docs")).build()];
        let units = PathResolver::new(&sources).resolve().unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].dst.as_ref(), Path::new("a.txt"));
    }

    #[cfg(unix)]
    #[test]
    fn test_cycle_becomes_unit_with_issue() {
        let temp_dir = TempDir::new().unwrap();
        write(&temp_dir.path().join("docs/a.txt"), "a");
        std::os::unix::fs::symlink(
            temp_dir.path().join("docs"),
            temp_dir.path().join("docs/again"),
        )
        .unwrap();

        let sources = vec![SourceConfig::builder().path(temp_dir.path().join("docs")).build()];
        let units = PathResolver::new(&sources).resolve().unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[1].issue, Some(UnitIssue::CyclicLink));
        assert_eq!(units[1].dst.as_ref(), Path::new("again"));
    }

    #[test]
    fn test_colliding_entry_paths_keep_first() {
        let temp_dir = TempDir::new().unwrap();
        write(&temp_dir.path().join("one/a.txt"), "one");
        write(&temp_dir.path().join("two/a.txt"), "two");

        let sources = vec![
            SourceConfig::builder()
                .path(temp_dir.path().join("one"))
                .dst_dir("same")
                .build(),
            SourceConfig::builder()
                .path(temp_dir.path().join("two"))
                .dst_dir("same")
                .build(),
        ];
        let units = PathResolver::new(&sources).resolve().unwrap();
        let files = units
            .iter()
            .filter(|u| u.kind == UnitKind::File)
            .collect_vec();

        assert_eq!(files.len(), 2);
        assert_eq!(files[0].dst.as_ref(), Path::new("same/a.txt"));
        assert!(files[0].src.ends_with("one/a.txt"));
        assert_eq!(files[0].issue, None);
        assert_eq!(files[1].dst.as_ref(), Path::new("same/a.txt"));
        assert_eq!(files[1].issue, Some(UnitIssue::DuplicateEntry));
    }

    #[test]
    fn test_missing_source_fails() {
        let temp_dir = TempDir::new().unwrap();
        let sources = vec![SourceConfig::builder().path(temp_dir.path().join("gone")).build()];
        let err = PathResolver::new(&sources).resolve().unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_sanitize_dst() {
        assert_eq!(sanitize_dst(Path::new("/a/../b/./c")), PathBuf::from("a/b/c"));
    }
}
