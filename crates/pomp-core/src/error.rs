use thiserror::Error;

/// Error type shared by every layer of the protocol stack.
///
/// Mirrors the `-errno` convention of the reference implementation with a
/// closed taxonomy plus an `Io` escape hatch for OS-level failures that carry
/// their own `io::ErrorKind`.
#[derive(Error, Debug)]
pub enum PompError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("permission denied: {0}")]
    PermissionDenied(&'static str),

    #[error("not connected")]
    NotConnected,

    #[error("busy: {0}")]
    Busy(&'static str),

    #[error("not found: {0}")]
    NotFound(&'static str),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    #[error("timed out")]
    TimedOut,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PompError>;
