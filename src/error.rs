use thiserror::Error;

/// Errors surfaced across the packet buffer, thread runner, scale stage and
/// frame capture stage.
///
/// All variants are recoverable by the caller except when they arrive via a
/// stage's `finish` callback, at which point the worker that produced them
/// has already exited.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("operation would race a running capture or stage")]
    AlreadyRunning,

    #[error("resource is not ready yet")]
    NotReady,

    #[error("requested configuration is not supported: {0}")]
    NotSupported(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("operation would block")]
    Busy,

    #[error("insufficient space for a reservation of this size")]
    NoSpace,

    #[error("buffer was cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
