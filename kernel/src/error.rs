// Pipeline Errors
//
// Component errors composed into one type for the run, plus the coarse
// classification the binary turns into an exit code.

use std::time::Duration;

use crate::config::ConfigError;
use crate::message::DecodeError;
use crate::provision::ProvisionError;
use crate::schema::registry::SchemaError;
use crate::state::StateError;
use crate::writer::WriteError;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("line {line}: {source}")]
    Decode {
        line: u64,
        #[source]
        source: DecodeError,
    },

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stream `{0}` worker stopped unexpectedly")]
    WorkerGone(String),

    #[error("shutdown grace period of {0:?} elapsed before buffers drained")]
    Interrupted(Duration),
}

/// Coarse error classes, one per exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Parse,
    Schema,
    SchemaConflict,
    Write,
    Interrupted,
    Io,
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Config(_) => ErrorKind::Config,
            PipelineError::Decode { .. } => ErrorKind::Parse,
            PipelineError::Schema(_) => ErrorKind::Schema,
            PipelineError::Provision(ProvisionError::SchemaConflict { .. }) => {
                ErrorKind::SchemaConflict
            }
            PipelineError::Provision(ProvisionError::Warehouse { .. }) => ErrorKind::Write,
            PipelineError::Write(_) => ErrorKind::Write,
            PipelineError::Interrupted(_) => ErrorKind::Interrupted,
            PipelineError::State(_) | PipelineError::Io(_) | PipelineError::WorkerGone(_) => {
                ErrorKind::Io
            }
        }
    }

    /// Failures confined to one stream that leave checkpoints correct.
    pub fn is_stream_local(&self) -> bool {
        self.kind() == ErrorKind::SchemaConflict
    }
}
