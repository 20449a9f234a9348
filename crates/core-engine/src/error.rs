//! The public error taxonomy for the scheduler/monitor API surface.
//!
//! Internal plumbing (DB queries, lock-free helpers) stays on
//! `anyhow::Result`; this type is reserved for callers that need to match
//! on *kind* (the admin API maps each variant to an HTTP status).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[source] anyhow::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("handler error: {0}")]
    HandlerError(String),

    #[error("handler timeout after {0:?}")]
    HandlerTimeout(std::time::Duration),

    #[error("shutting down")]
    ShuttingDown,

    #[error("programmer error: {0}")]
    ProgrammerError(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
