pub mod naming;

use crate::backup::archive::naming::ArchiveNaming;
use crate::backup::compress::{Compressor, CompressorBuilder, CompressorConfig};
use crate::backup::engine::{EntrySink, StagedEntry};
use crate::backup::finish::Finish;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use crate::backup::source::{BackupUnit, UnitKind};
use chrono::{DateTime, Utc};
use std::fs::{File, Metadata};
use std::io::{BufWriter, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

type ArchiveStream = tar::Builder<BufWriter<Compressor<BufWriter<File>>>>;

/// A completed archive on disk.
#[derive(Clone, Debug)]
pub struct Archive {
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub size: u64,
    /// Entry paths in the order they were written
    pub manifest: Vec<Arc<Path>>,
}

/// Streams entries into `<name>.tmp` and renames it to `<name>` once the
/// whole stream is closed.
///
/// Not synchronized itself, concurrent callers go through [`SharedArchive`].
///
/// A failed append may leave a partial entry in the stream. From then on the
/// writer refuses further entries and [`finish`](Self::finish) fails.
pub struct ArchiveWriter {
    builder: ArchiveStream,
    path: PathBuf,
    tmp_path: PathBuf,
    created_at: DateTime<Utc>,
    manifest: Vec<Arc<Path>>,
    broken: Option<String>,
}

impl ArchiveWriter {
    pub fn create<P: AsRef<Path>>(
        destination: P,
        naming: &ArchiveNaming,
        created_at: DateTime<Utc>,
        compressor: &CompressorConfig,
    ) -> Result<ArchiveWriter> {
        let path = destination.as_ref().join(naming.file_name(created_at));
        let mut tmp_name = path.clone().into_os_string();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        let writer = File::create_new(&tmp_path)
            .map(BufWriter::new)
            .map_err(Error::from)
            .and_then(|f| compressor.build_compressor(f))
            .map(BufWriter::new)
            .with_msg(format!("Creating archive {:?} failed", tmp_path))?;

        tracing::info!("Writing archive {:?}", tmp_path);
        Ok(ArchiveWriter {
            builder: tar::Builder::new(writer),
            path,
            tmp_path,
            created_at,
            manifest: Vec::new(),
            broken: None,
        })
    }

    /// Final path of the archive, which does not exist until [`finish`](Self::finish).
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn add_file<R: Read>(
        &mut self,
        unit: &BackupUnit,
        metadata: &Metadata,
        size: u64,
        data: R,
    ) -> Result<u64> {
        let mut header = tar::Header::new_gnu();
        header.set_metadata(metadata);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(size);
        self.append(&mut header, &unit.dst, data)?;
        self.manifest.push(unit.dst.clone());
        Ok(size)
    }

    pub fn add_dir(&mut self, unit: &BackupUnit, metadata: &Metadata) -> Result<u64> {
        let mut header = tar::Header::new_gnu();
        header.set_metadata(metadata);
        header.set_entry_type(tar::EntryType::Directory);
        header.set_size(0);
        self.append(&mut header, &unit.dst, std::io::empty())?;
        self.manifest.push(unit.dst.clone());
        Ok(0)
    }

    fn append<R: Read>(&mut self, header: &mut tar::Header, dst: &Path, data: R) -> Result<()> {
        if let Some(cause) = &self.broken {
            return Err(Error::from(std::io::Error::other(format!(
                "archive stream broken by an earlier entry: {cause}"
            ))));
        }
        if let Err(e) = self.builder.append_data(header, dst, data) {
            tracing::error!("Archive stream {:?} broken while adding {:?}: {e}", self.tmp_path, dst);
            self.broken = Some(format!("{dst:?}: {e}"));
            return Err(e.into());
        }
        Ok(())
    }

    /// Closes every stage of the stream and moves the archive into place.
    ///
    /// On failure, including an earlier failed append, the `.tmp` file stays
    /// on disk for inspection.
    pub fn finish(self) -> Result<Archive> {
        let ArchiveWriter {
            builder,
            path,
            tmp_path,
            created_at,
            manifest,
            broken,
        } = self;

        let closed = match broken {
            Some(cause) => {
                drop(builder);
                Err(std::io::Error::other(format!("archive stream broken by {cause}")))
            }
            None => close_stream(builder, &tmp_path, &path),
        };

        match closed {
            Ok(metadata) => {
                tracing::info!(
                    "Created archive {:?} ({} entries, {} bytes)",
                    path,
                    manifest.len(),
                    metadata.len()
                );
                Ok(Archive {
                    path,
                    created_at,
                    size: metadata.len(),
                    manifest,
                })
            }
            Err(e) => {
                tracing::error!("Finalizing archive {:?} failed, leaving it on disk: {e}", tmp_path);
                Err(Error::ArchiveFinalization {
                    path: tmp_path,
                    error: Box::new(e.into()),
                })
            }
        }
    }

    /// Drops the partial stream and deletes the `.tmp` file.
    pub fn abandon(self) -> Result<()> {
        let tmp_path = self.tmp_path.clone();
        drop(self.builder);
        std::fs::remove_file(&tmp_path)
            .map_err(Error::from)
            .with_msg(format!("Removing abandoned archive {:?} failed", tmp_path))?;
        tracing::info!("Abandoned archive {:?}", tmp_path);
        Ok(())
    }
}

fn close_stream(builder: ArchiveStream, tmp_path: &Path, path: &Path) -> std::io::Result<Metadata> {
    let file = builder.into_inner()?.finish()?.finish()?.finish()?;
    file.sync_all()?;
    std::fs::rename(tmp_path, path)?;
    std::fs::metadata(path)
}

/// The single-writer side of the copy engine: workers stage bytes on their
/// own and only the append to the archive stream runs under the mutex.
pub struct SharedArchive {
    writer: Mutex<ArchiveWriter>,
}

impl SharedArchive {
    pub fn new(writer: ArchiveWriter) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> Result<ArchiveWriter> {
        self.writer.into_inner().map_err(|_| Error::PoisonedArchive)
    }
}

impl EntrySink for SharedArchive {
    fn is_simulated(&self) -> bool {
        false
    }

    fn commit(&self, unit: &BackupUnit, staged: StagedEntry) -> Result<u64> {
        let mut writer = self.writer.lock().map_err(|_| Error::PoisonedArchive)?;
        match (unit.kind, staged.content) {
            (UnitKind::Directory, _) => writer.add_dir(unit, &staged.metadata),
            (UnitKind::File, Some(content)) => {
                writer.add_file(unit, &staged.metadata, staged.size, content)
            }
            (UnitKind::File, None) => Err(Error::from(std::io::Error::other(format!(
                "{:?} was not staged",
                unit.src
            )))),
        }
    }
}
