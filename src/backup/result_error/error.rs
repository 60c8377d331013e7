use crate::backup::lock::LockContent;
use crate::backup::result_error::{WithDebugObjectAndFnName, WithMsg};
use itertools::Itertools;
use std::fmt::Debug;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    LiblzmaStream(#[from] liblzma::stream::Error),
    #[error(transparent)]
    ValidationError(#[from] validator::ValidationErrors),
    #[error(transparent)]
    ThreadPoolBuildError(#[from] rayon::ThreadPoolBuildError),
    #[error(transparent)]
    SerdeYml(#[from] serde_yml::Error),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error(transparent)]
    WalkDir(#[from] walkdir::Error),
    #[error("Invalid configuration: {0}")]
    Configuration(String),
    #[error("Backup already running: {lock_path:?} held by {}", describe_holder(.holder))]
    AlreadyRunning {
        holder: Option<LockContent>,
        lock_path: PathBuf,
    },
    #[error("Finalizing archive {:?} failed:\n{}", path, indent::indent_all_with("  ", error.to_string()))]
    ArchiveFinalization { path: PathBuf, error: Box<Error> },
    #[error("Run cancelled")]
    Cancelled,
    #[error("Archive writer lock poisoned by a panicking worker")]
    PoisonedArchive,
    #[error("{}:\n{}", msg, indent::indent_all_with("  ", error.to_string()))]
    WithMsg { msg: String, error: Box<Error> },
    #[error("{:?} {} failed:\n{}", obj_debug, fn_name, indent::indent_all_with("  ", error.to_string()))]
    WithDebugObjAndFnName {
        error: Box<Error>,
        obj_debug: Box<dyn Debug + Send + Sync>,
        fn_name: String,
    },
    #[error("{}", itertools::join(.0, "\n\n"))]
    LotsOfError(Vec<Error>),
}

fn describe_holder(holder: &Option<LockContent>) -> String {
    match holder {
        Some(holder) => format!("pid {} since {}", holder.pid, holder.acquired_at),
        None => "another process".to_string(),
    }
}

/// Failure classes a run reports to its caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    LockContention,
    ArchiveFinalization,
    Cancelled,
    Io,
}

impl<S: Into<String>, O: Debug + Send + Sync + 'static> WithDebugObjectAndFnName<S, O> for Error {
    fn with_debug_object_and_fn_name(self, obj: O, fn_name: S) -> Self {
        Error::WithDebugObjAndFnName {
            error: Box::new(self),
            obj_debug: Box::new(obj),
            fn_name: fn_name.into(),
        }
    }
}

impl<S: Into<String>> WithMsg<S> for Error {
    fn with_msg(self, msg: S) -> Self {
        Self::WithMsg {
            msg: msg.into(),
            error: Box::new(self),
        }
    }
}

impl From<Vec<Error>> for Error {
    fn from(errors: Vec<Error>) -> Self {
        Self::LotsOfError(errors.into_iter().flat_map(|e| e.into_iter()).collect_vec())
    }
}

impl Error {
    pub fn into_iter(self) -> Box<dyn Iterator<Item = Error>> {
        match self {
            Error::LotsOfError(v) => Box::new(v.into_iter().flat_map(|e| e.into_iter())),
            e => Box::new(std::iter::once(e)),
        }
    }

    pub fn chain(self, other: Error) -> Error {
        Error::LotsOfError(self.into_iter().chain(other.into_iter()).collect_vec())
    }

    /// Strips message and context wrappers down to the error that caused them.
    pub fn root(&self) -> &Error {
        match self {
            Error::WithMsg { error, .. } | Error::WithDebugObjAndFnName { error, .. } => {
                error.root()
            }
            Error::LotsOfError(v) if v.len() == 1 => v[0].root(),
            e => e,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self.root() {
            Error::Configuration(_)
            | Error::ValidationError(_)
            | Error::SerdeYml(_)
            | Error::SerdeJson(_) => ErrorCategory::Configuration,
            Error::AlreadyRunning { .. } => ErrorCategory::LockContention,
            Error::ArchiveFinalization { .. } => ErrorCategory::ArchiveFinalization,
            Error::Cancelled => ErrorCategory::Cancelled,
            Error::LotsOfError(v) => v
                .iter()
                .map(Error::category)
                .find(|c| *c != ErrorCategory::Io)
                .unwrap_or(ErrorCategory::Io),
            _ => ErrorCategory::Io,
        }
    }
}
