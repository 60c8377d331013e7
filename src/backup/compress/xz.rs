use crate::backup::compress::{Compressor, CompressorBuilder};
use crate::backup::result_error::result::Result;
use bon::Builder;
use getset::CopyGetters;
use liblzma::stream::{Check, MtStreamBuilder};
use liblzma::write::XzEncoder;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::io::Write;
use std::num::NonZero;
use validator::Validate;

static DEFAULT_COMPRESSION_LEVEL: u32 = 3;
static DEFAULT_MAX_PARALLELIZATION: usize = 32;

/// XZ (LZMA) stage of the archive stream.
///
/// With more than one thread the encoder splits the stream into blocks and
/// compresses them in parallel, so compression keeps up with the copy
/// workers feeding the archive.
#[skip_serializing_none]
#[derive(Clone, Copy, Default, Validate, Serialize, Deserialize, Debug, Builder, CopyGetters)]
#[serde(deny_unknown_fields)]
#[getset(get_copy = "pub")]
pub struct XzConfig {
    /// 0 (fastest) to 9 (smallest), defaults to 3
    #[validate(range(min = 0, max = 9))]
    level: Option<u32>,
    /// Encoder threads, defaults to half the cores
    #[validate(range(min = 1))]
    thread: Option<u32>,
}

impl XzConfig {
    fn effective_threads(&self) -> u32 {
        self.thread.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(NonZero::get)
                .map(|core| (core / 2).clamp(1, DEFAULT_MAX_PARALLELIZATION) as u32)
                .unwrap_or(1)
        })
    }
}

impl<W: Write> CompressorBuilder<W> for XzConfig {
    fn build_compressor(&self, writer: W) -> Result<Compressor<W>> {
        let level = self.level.unwrap_or(DEFAULT_COMPRESSION_LEVEL);
        let thread = self.effective_threads();

        tracing::debug!("Creating XZ compressor with level={}, threads={}", level, thread);

        if thread == 1 {
            Ok(XzEncoder::new(writer, level).into())
        } else {
            let stream = MtStreamBuilder::new()
                .preset(level)
                .check(Check::Crc64)
                .threads(thread)
                .encoder()?;
            Ok(XzEncoder::new_stream(writer, stream).into())
        }
    }
}
