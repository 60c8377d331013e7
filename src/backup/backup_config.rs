use crate::backup::archive::naming::ArchiveNaming;
use crate::backup::compress::CompressorConfig;
use crate::backup::file_ext::FileExtProvider;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use crate::backup::retention::RetentionConfig;
use crate::backup::source::walkdir_globset::SourceConfig;
use crate::backup::validate::{
    validate_cron_str, validate_valid_archive_base_name, validate_writable_dir,
};
use bon::Builder;
use getset::{CopyGetters, Getters};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use validator::Validate;

/// Everything one run needs, loaded from YAML (or JSON).
#[skip_serializing_none]
#[derive(Clone, Serialize, Deserialize, Debug, Validate, Builder, Getters, CopyGetters)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    #[validate(length(min = 1), nested)]
    #[builder(into)]
    #[getset(get = "pub")]
    sources: Vec<SourceConfig>,
    #[validate(custom(function = validate_writable_dir))]
    #[builder(into)]
    #[getset(get = "pub")]
    destination: PathBuf,
    /// Maximum number of concurrent copy workers
    #[validate(range(min = 1, max = 256))]
    #[serde(default = "default_parallelism")]
    #[builder(default = default_parallelism())]
    #[getset(get_copy = "pub")]
    parallelism: usize,
    #[validate(nested)]
    #[getset(get = "pub")]
    retention: Option<RetentionConfig>,
    /// Archive file name prefix
    #[validate(custom(function = validate_valid_archive_base_name))]
    #[builder(into)]
    #[getset(get = "pub")]
    archive_name: Arc<str>,
    #[validate(nested)]
    #[serde(default)]
    #[builder(default)]
    #[getset(get_copy = "pub")]
    compressor: CompressorConfig,
    #[serde(default)]
    #[builder(default)]
    #[getset(get_copy = "pub")]
    dry_run: bool,
    /// Schedule for daemon mode
    #[validate(custom(function = validate_cron_str))]
    #[builder(into)]
    #[getset(get = "pub")]
    cron: Option<Arc<str>>,
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(256)
}

static TAR_FILE_EXT: OnceLock<Arc<str>> = OnceLock::new();

impl FileExtProvider for RunConfig {
    fn file_ext(&self) -> Option<Arc<str>> {
        Some(
            std::iter::once(TAR_FILE_EXT.get_or_init(|| "tar".into()))
                .chain(self.compressor.file_ext().iter())
                .join(".")
                .into(),
        )
    }
}

impl RunConfig {
    /// Opens, parses and validates a config file. Every failure here is a
    /// configuration error.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<RunConfig> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| Error::Configuration(format!("cannot open {:?}: {e}", path)))?;
        let config: RunConfig = serde_yml::from_reader(file)
            .map_err(Error::from)
            .with_msg(format!("Parse YAML config failed: {:?}", path))?;
        config
            .validate()
            .map_err(Error::from)
            .with_msg(format!("Config validation failed: {:?}", path))?;
        Ok(config)
    }

    pub fn naming(&self) -> ArchiveNaming {
        ArchiveNaming::new(
            self.archive_name.clone(),
            self.file_ext().unwrap_or_else(|| "tar".into()),
        )
    }
}
