use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use crate::backup::source::{UnitIssue, UnitKind};
use crate::backup::validate::validate_path_exist;

use bon::Builder;
use derive_more::{Display, From};
use getset::Getters;
use globset::{Glob, GlobBuilder, GlobSet, GlobSetBuilder};
use serde::de::value::MapAccessDeserializer;
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use serde_with::skip_serializing_none;
use validator::Validate;
use walkdir::WalkDir;

use std::fmt::{Debug, Formatter};
use std::path::{Path, PathBuf};
use std::result;

/// One configured backup source.
///
/// Either a single file or a directory walked recursively. Files under a
/// directory are kept when their path relative to `path` matches one of the
/// `include` globs and none of the `exclude` globs. Excluded directories are
/// not descended into.
///
/// Deserializes from a bare path string or from a table.
#[skip_serializing_none]
#[derive(Clone, Debug, Serialize, Validate, Builder, PartialEq, Eq, Getters)]
#[getset(get = "pub")]
pub struct SourceConfig {
    #[validate(custom(function = validate_path_exist))]
    #[builder(into)]
    path: PathBuf,
    #[builder(into)]
    dst_dir: Option<PathBuf>,
    #[builder(default = default_include(), into)]
    include: Vec<CustomDeserializedGlob>,
    #[builder(default, into)]
    exclude: Vec<CustomDeserializedGlob>,
}

fn default_include() -> Vec<CustomDeserializedGlob> {
    vec![CustomDeserializedGlob::default()]
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SourceTable {
    path: PathBuf,
    #[serde(default)]
    dst_dir: Option<PathBuf>,
    #[serde(default = "default_include")]
    include: Vec<CustomDeserializedGlob>,
    #[serde(default)]
    exclude: Vec<CustomDeserializedGlob>,
}

impl From<SourceTable> for SourceConfig {
    fn from(t: SourceTable) -> Self {
        Self {
            path: t.path,
            dst_dir: t.dst_dir,
            include: t.include,
            exclude: t.exclude,
        }
    }
}

struct SourceConfigVisitor;

impl<'de> Visitor<'de> for SourceConfigVisitor {
    type Value = SourceConfig;

    fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
        formatter.write_str("a source path or a source table")
    }

    fn visit_str<E>(self, v: &str) -> result::Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Ok(SourceConfig::builder().path(v).build())
    }

    fn visit_map<A>(self, map: A) -> result::Result<Self::Value, A::Error>
    where
        A: MapAccess<'de>,
    {
        SourceTable::deserialize(MapAccessDeserializer::new(map)).map(SourceConfig::from)
    }
}

impl<'de> Deserialize<'de> for SourceConfig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> result::Result<Self, D::Error> {
        deserializer.deserialize_any(SourceConfigVisitor)
    }
}

/// A glob pattern wrapper that handles custom deserialization
///
/// Wraps the `globset::Glob` type with custom serde support for
/// deserializing glob patterns from strings. Always enables literal
/// separator mode so `*` never crosses a directory boundary.
#[derive(Clone, Debug, From, Display, Serialize, PartialEq, Eq, Getters)]
#[serde(transparent)]
#[getset(get = "pub")]
pub struct CustomDeserializedGlob {
    glob: Glob,
}

impl Default for CustomDeserializedGlob {
    fn default() -> Self {
        Self::new("**/*").unwrap()
    }
}

impl CustomDeserializedGlob {
    pub fn new(pattern: &str) -> result::Result<Self, globset::Error> {
        GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map(CustomDeserializedGlob::from)
    }
}

struct CustomGlobVisitor;

impl Visitor<'_> for CustomGlobVisitor {
    type Value = CustomDeserializedGlob;

    fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
        formatter.write_str("a glob pattern")
    }

    fn visit_str<E>(self, v: &str) -> result::Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        CustomDeserializedGlob::new(v).map_err(serde::de::Error::custom)
    }
}

impl<'de> Deserialize<'de> for CustomDeserializedGlob {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> result::Result<Self, D::Error> {
        deserializer.deserialize_str(CustomGlobVisitor)
    }
}

/// A path found while walking a source, before deduplication.
#[derive(Debug)]
pub(crate) struct WalkedEntry {
    pub src: PathBuf,
    pub dst: PathBuf,
    pub kind: UnitKind,
    pub size: u64,
    pub issue: Option<UnitIssue>,
}

fn build_globset(globs: &[CustomDeserializedGlob]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    globs.iter().for_each(|g| {
        builder.add(g.glob.clone());
    });
    builder
        .build()
        .map_err(|e| Error::Configuration(e.to_string()))
}

impl SourceConfig {
    /// Same source with its path resolved through links, so that entry
    /// paths can be made relative to a canonical root.
    pub(crate) fn canonicalized(&self) -> Result<SourceConfig> {
        let path = std::fs::canonicalize(&self.path).map_err(|e| {
            Error::Configuration(format!("source {:?} is not accessible: {e}", self.path))
        })?;
        Ok(SourceConfig {
            path,
            ..self.clone()
        })
    }

    /// Walks this source and returns every candidate entry in file name order.
    ///
    /// `root` is the directory entry paths are made relative to when no
    /// `dst_dir` is configured.
    pub(crate) fn walk(&self, root: &Path) -> Result<Vec<WalkedEntry>> {
        let metadata = std::fs::metadata(&self.path).map_err(|e| {
            Error::Configuration(format!("source {:?} is not accessible: {e}", self.path))
        })?;

        if metadata.is_file() {
            let dst = match &self.dst_dir {
                Some(dst_dir) => dst_dir.join(self.path.file_name().unwrap_or_default()),
                None => relative_to(&self.path, root),
            };
            return Ok(vec![WalkedEntry {
                src: self.path.clone(),
                dst,
                kind: UnitKind::File,
                size: metadata.len(),
                issue: None,
            }]);
        }

        let include = if self.include.is_empty() {
            build_globset(&default_include())?
        } else {
            build_globset(&self.include)?
        };
        let exclude = build_globset(&self.exclude)?;

        tracing::info!(
            "Starting directory scan: {:?} with {} include and {} exclude patterns",
            self.path,
            self.include.len(),
            self.exclude.len()
        );

        let base_dst = match &self.dst_dir {
            Some(dst_dir) => dst_dir.clone(),
            None => relative_to(&self.path, root),
        };
        let src_dir = self.path.as_path();

        let entries: Vec<WalkedEntry> = WalkDir::new(src_dir)
            .follow_links(true)
            .sort_by_file_name()
            .min_depth(1)
            .into_iter()
            .filter_entry(|de| match de.path().strip_prefix(src_dir) {
                Ok(rel) => !exclude.is_match(rel),
                Err(_) => true,
            })
            .filter_map(|res| match res {
                Ok(de) => {
                    let rel = de.path().strip_prefix(src_dir).ok()?.to_path_buf();
                    if !include.is_match(&rel) {
                        tracing::trace!("Skipping {:?}, glob not match", de.path());
                        return None;
                    }
                    let dst = base_dst.join(&rel);
                    if de.file_type().is_file() {
                        let size = de.metadata().map(|m| m.len()).unwrap_or_default();
                        Some(WalkedEntry {
                            src: de.into_path(),
                            dst,
                            kind: UnitKind::File,
                            size,
                            issue: None,
                        })
                    } else if de.file_type().is_dir() && is_empty_dir(de.path()) {
                        Some(WalkedEntry {
                            src: de.into_path(),
                            dst,
                            kind: UnitKind::Directory,
                            size: 0,
                            issue: None,
                        })
                    } else {
                        tracing::trace!("Skipping {:?}, not a file or empty directory", de.path());
                        None
                    }
                }
                Err(e) => Some(walk_error_entry(e, src_dir, &base_dst)),
            })
            .collect();

        Ok(entries)
    }
}

fn is_empty_dir(path: &Path) -> bool {
    std::fs::read_dir(path)
        .map(|mut rd| rd.next().is_none())
        .unwrap_or(false)
}

fn walk_error_entry(e: walkdir::Error, src_dir: &Path, base_dst: &Path) -> WalkedEntry {
    let src = e.path().map(Path::to_path_buf).unwrap_or_else(|| src_dir.to_path_buf());
    let dst = base_dst.join(src.strip_prefix(src_dir).unwrap_or(&src));
    let issue = match e.loop_ancestor() {
        Some(ancestor) => {
            tracing::warn!("Skipping cyclic link {:?} pointing back to {:?}", src, ancestor);
            UnitIssue::CyclicLink
        }
        None => {
            let e = Error::from(e).with_msg(format!("Walking {:?} failed", src));
            tracing::error!("{e}");
            UnitIssue::Unreadable(e.to_string())
        }
    };
    WalkedEntry {
        src,
        dst,
        kind: UnitKind::File,
        size: 0,
        issue: Some(issue),
    }
}

fn relative_to(path: &Path, root: &Path) -> PathBuf {
    path.strip_prefix(root)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| {
            path.components()
                .filter(|c| matches!(c, std::path::Component::Normal(_)))
                .collect()
        })
}
