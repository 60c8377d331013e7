use chrono::{DateTime, NaiveDateTime, Utc};
use std::path::Path;
use std::sync::Arc;

/// ISO 8601 basic format, UTC, millisecond precision.
static TIME_FORMAT: &str = "%Y%m%dT%H%M%S%.3fZ";
static TIME_PARSE_FORMAT: &str = "%Y%m%dT%H%M%S%.fZ";

/// `<prefix>-<timestamp>.<ext>`, the one name shape retention relies on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveNaming {
    prefix: Arc<str>,
    ext: Arc<str>,
}

impl ArchiveNaming {
    pub fn new<A: Into<Arc<str>>, B: Into<Arc<str>>>(prefix: A, ext: B) -> Self {
        Self {
            prefix: prefix.into(),
            ext: ext.into(),
        }
    }

    pub fn ext(&self) -> &str {
        &self.ext
    }

    pub fn file_name(&self, dt: DateTime<Utc>) -> String {
        format!("{}-{}.{}", self.prefix, dt.format(TIME_FORMAT), self.ext)
    }

    /// Timestamp embedded in `file_path`, or `None` if the name does not
    /// follow this naming.
    pub fn parse<P: AsRef<Path>>(&self, file_path: P) -> Option<DateTime<Utc>> {
        let file_name = file_path.as_ref().file_name()?.to_str()?;
        let time_string = file_name
            .strip_prefix(self.prefix.as_ref())?
            .strip_prefix('-')?
            .strip_suffix(self.ext.as_ref())?
            .strip_suffix('.')?;

        NaiveDateTime::parse_from_str(time_string, TIME_PARSE_FORMAT)
            .ok()
            .map(|dt| dt.and_utc())
    }
}
