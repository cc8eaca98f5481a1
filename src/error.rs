use std::fmt::{Display, Formatter};

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::resource::ResourceKey;
use crate::task::TaskId;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The chain of tasks that led to an error, outermost first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskPath(pub Vec<TaskId>);

impl TaskPath {
    pub fn tasks(&self) -> &[TaskId] {
        &self.0
    }

    pub fn last(&self) -> Option<&TaskId> {
        self.0.last()
    }
}

impl Display for TaskPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (i, task) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" -> ")?;
            }
            write!(f, "{task}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown task kind '{kind}'")]
    UnknownTask { kind: Box<str> },

    #[error("Unknown engine handle {0}")]
    UnknownEngine(usize),

    #[error("Task kinds registered more than once: {}", .kinds.join(", "))]
    DuplicateTaskKind { kinds: Vec<String> },

    #[error("No resolver claims resource '{0}'")]
    UnresolvedResource(ResourceKey),

    #[error("Cyclic dependency: {path}")]
    CyclicDependency { path: TaskPath },

    #[error("Task {path} failed:\n{source}")]
    TaskExecution {
        path: TaskPath,
        #[source]
        source: anyhow::Error,
    },

    #[error("Evaluation was cancelled")]
    Cancelled,

    #[error("Resource '{key}':\n{source}")]
    Resource {
        key: ResourceKey,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Payload(#[from] PayloadError),

    #[error("Error while writing the trace store:\n{0}")]
    Trace(#[from] TraceError),
}

impl Error {
    /// Process exit code a command line front end should use for this error.
    ///
    /// A task that failed because of an engine error, say an unresolved
    /// resource it read, reports the code of that error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::TaskExecution { source, .. } => source
                .downcast_ref::<Error>()
                .map(Error::exit_code)
                .unwrap_or(1),
            Error::UnknownTask { .. } | Error::UnknownEngine(_) => 2,
            Error::DuplicateTaskKind { .. } => 3,
            Error::UnresolvedResource(_) => 4,
            Error::CyclicDependency { .. } => 5,
            Error::Resource { .. } => 6,
            Error::Payload(_) => 7,
            Error::Trace(_) => 8,
            Error::Cancelled => 130,
        }
    }

    /// The task path attached to this error, if any.
    pub fn path(&self) -> Option<&TaskPath> {
        match self {
            Error::CyclicDependency { path } | Error::TaskExecution { path, .. } => Some(path),
            _ => None,
        }
    }

    pub(crate) fn duplicate(mut kinds: Vec<String>) -> Self {
        kinds.sort();
        kinds.dedup();
        Error::DuplicateTaskKind { kinds }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("Couldn't encode payload: {0}")]
    Encode(String),

    #[error("Couldn't decode payload as {target}: {reason}")]
    Decode {
        target: &'static str,
        reason: String,
    },
}

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("Couldn't access trace file {path}:\n{source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Trace file {path} is corrupt: {reason}")]
    Corruption { path: Utf8PathBuf, reason: String },

    #[error("Couldn't encode trace record: {0}")]
    Encode(String),
}

#[cfg(feature = "live")]
#[derive(Debug, Error)]
pub enum WatchError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Notify(#[from] notify::Error),

    #[error(transparent)]
    GlobPattern(#[from] glob::PatternError),

    #[error("Couldn't convert path to UTF-8.\n{0}")]
    PathFormat(#[from] camino::FromPathBufError),

    #[error(transparent)]
    Recv(#[from] std::sync::mpsc::RecvError),
}
