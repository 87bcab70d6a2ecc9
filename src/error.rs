//! Error taxonomy shared by the process runner and both pipelines.
//!
//! Only [`Error::Execution`] and [`Error::Build`] carry captured process
//! output. Everything else is reported verbatim.

use std::io;
use std::path::Path;

use crate::diagnose::BuildFailure;
use crate::process::VerboseError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Rejected request or unusable configuration. Raised before any
    /// filesystem or process work.
    #[error("{0}")]
    Config(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// A requested restriction could not be prepared.
    #[error("sandbox: {0}")]
    Sandbox(String),

    /// The program could not be started at all.
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The program ran but exited non-zero or was killed on timeout.
    #[error(transparent)]
    Execution(#[from] VerboseError),

    #[error(transparent)]
    Build(#[from] BuildFailure),

    #[error("image build failed: {0}")]
    ImageBuild(VerboseError),
}

impl Error {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn io_at(action: &str, path: &Path, source: io::Error) -> Self {
        Error::io(format!("{} '{}'", action, path.display()), source)
    }

    /// Captured output of a failed process, if this error carries any.
    pub fn output(&self) -> Option<&[u8]> {
        match self {
            Error::Execution(err) | Error::ImageBuild(err) => Some(err.output()),
            Error::Build(failure) => Some(failure.full_output()),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
