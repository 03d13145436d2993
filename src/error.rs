//! Error types for the transaction manager

use thiserror::Error;

/// Failures on a framed message channel.
#[derive(Error, Debug)]
pub enum WireError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("channel already closed by an earlier failure")]
    Poisoned,

    #[error("unreasonable frame length: {0} bytes")]
    FrameLength(u64),

    #[error("unknown opcode {0}")]
    UnknownOpCode(i8),

    #[error("unknown response code {0}")]
    UnknownResponseCode(i8),

    #[error("malformed payload: {0}")]
    Codec(#[from] bincode::Error),

    #[error("malformed transaction id: {0}")]
    TransactionId(#[from] uuid::Error),
}

/// Failures against the protocol log. Write failures are fatal for the
/// transaction worker: no state transition may become observable without its
/// log record.
#[derive(Error, Debug)]
pub enum LogError {
    #[error("protocol log error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("protocol log holds a malformed transaction id: {0}")]
    TransactionId(#[from] uuid::Error),
}

/// Failures reported by the resource manager.
#[derive(Error, Debug)]
pub enum RmError {
    /// Constraint violations (SQLSTATE class 23). These abort the offending
    /// transaction but are an expected part of the workload.
    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("resource manager error: {0}")]
    Backend(String),
}

impl From<tokio_postgres::Error> for RmError {
    fn from(e: tokio_postgres::Error) -> Self {
        match e.code() {
            Some(state) if state.code().starts_with("23") => RmError::Integrity(e.to_string()),
            _ => RmError::Backend(e.to_string()),
        }
    }
}

/// Top-level error for daemon and state-machine workers.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Rm(#[from] RmError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Shutdown(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
