//! Error taxonomy shared by the distributor, the dispatchers and the broker seam.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// Startup problems: topology/binding mismatch, invalid settings, broker
    /// unreachable when the process starts.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The broker connection or channel was lost mid-operation.
    #[error("transport error: {0}")]
    Transport(String),

    /// A queue handler failed on a message and the dispatcher stopped.
    #[error("handler fault on queue '{queue}': {reason}")]
    HandlerFault { queue: String, reason: String },

    /// An input row could not be read or did not match the record schema.
    #[error("source error: {0}")]
    Source(String),

    /// The operation was stopped by the shutdown signal.
    #[error("interrupted by shutdown signal")]
    Interrupted,
}

impl PipelineError {
    /// True for errors that stop the process with exit code 1.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Interrupted)
    }

    /// Process exit status for this error.
    pub fn exit_code(&self) -> u8 {
        if self.is_fatal() {
            1
        } else {
            0
        }
    }
}

/// Process exit status for an error that reached the entry point.
///
/// Errors that do not wrap a [`PipelineError`] are always fatal.
pub fn exit_code_for(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<PipelineError>()
        .map_or(1, PipelineError::exit_code)
}

impl From<lapin::Error> for PipelineError {
    fn from(err: lapin::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<csv::Error> for PipelineError {
    fn from(err: csv::Error) -> Self {
        Self::Source(err.to_string())
    }
}
