pub mod xz;

use crate::backup::file_ext::FileExtProvider;
use crate::backup::finish::Finish;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithDebugObjectAndFnName;
use derive_more::From;
use io_enum::Write;
use liblzma::write::XzEncoder;
use serde::{Deserialize, Serialize};
use std::io;
use std::io::Write;
use std::result;
use std::sync::{Arc, OnceLock};
use validator::{Validate, ValidationErrors};

#[derive(Write, From)]
pub enum Compressor<W: Write> {
    None(W),
    XzEncoder(XzEncoder<W>),
}

/// Compression applied to the whole archive stream.
#[derive(Clone, Copy, From, Serialize, Deserialize, Debug)]
#[serde(tag = "compressor_type")]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum CompressorConfig {
    None,
    Xz(xz::XzConfig),
}

impl Default for CompressorConfig {
    fn default() -> Self {
        CompressorConfig::Xz(xz::XzConfig::default())
    }
}

impl Validate for CompressorConfig {
    fn validate(&self) -> result::Result<(), ValidationErrors> {
        match self {
            CompressorConfig::None => Ok(()),
            CompressorConfig::Xz(xz) => xz.validate(),
        }
    }
}

pub trait CompressorBuilder<W: Write> {
    fn build_compressor(&self, writer: W) -> Result<Compressor<W>>;
}

impl<W: Write> Finish<W> for Compressor<W> {
    fn finish(self) -> io::Result<W> {
        match self {
            Compressor::None(w) => Ok(w),
            Compressor::XzEncoder(w) => w.finish(),
        }
    }
}

impl<W: Write> CompressorBuilder<W> for CompressorConfig {
    fn build_compressor(&self, writer: W) -> Result<Compressor<W>> {
        match self {
            CompressorConfig::None => Ok(Compressor::None(writer)),
            CompressorConfig::Xz(xz) => xz.build_compressor(writer),
        }
        .with_debug_object_and_fn_name(*self, "build_compressor")
    }
}

static XZ_FILE_EXT: OnceLock<Arc<str>> = OnceLock::new();
impl FileExtProvider for CompressorConfig {
    fn file_ext(&self) -> Option<Arc<str>> {
        match self {
            CompressorConfig::None => None,
            CompressorConfig::Xz(_) => Some(XZ_FILE_EXT.get_or_init(|| "xz".into()).clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_default_is_xz() {
        assert!(matches!(CompressorConfig::default(), CompressorConfig::Xz(_)));
        assert_eq!(CompressorConfig::default().file_ext().as_deref(), Some("xz"));
        assert!(CompressorConfig::None.file_ext().is_none());
    }

    #[test]
    fn test_config_tagged_deserialization() {
        let none: CompressorConfig =
            serde_json::from_str("{\"compressor_type\":\"none\"}").unwrap();
        assert!(matches!(none, CompressorConfig::None));

        let xz: CompressorConfig =
            serde_yml::from_str("compressor_type: xz\nlevel: 6\nthread: 2\n").unwrap();
        match xz {
            CompressorConfig::Xz(c) => {
                assert_eq!(c.level(), Some(6));
                assert_eq!(c.thread(), Some(2));
            }
            _ => panic!("Expected xz"),
        }
    }

    #[test]
    fn test_none_compressor_passes_bytes_through() {
        let mut compressor = CompressorConfig::None
            .build_compressor(Cursor::new(Vec::new()))
            .unwrap();
        compressor.write_all(b"plain").unwrap();
        assert_eq!(compressor.finish().unwrap().into_inner(), b"plain");
    }
}
