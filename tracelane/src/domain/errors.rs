//! Structured error types for tracelane
//!
//! Using thiserror for automatic Display implementation and error chaining.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("record of {record} bytes cannot fit in a ring of {capacity} bytes")]
    RecordTooLarge { record: usize, capacity: usize },

    #[error("ring buffer is full")]
    RingFull,

    #[error("ring pool exhausted")]
    PoolExhausted,

    #[error("thread registry is at capacity ({0} slots)")]
    RegistryFull(u32),
}

#[derive(Error, Debug)]
pub enum WriterError {
    #[error("failed to create {path}: {source}")]
    Create { path: String, source: std::io::Error },

    #[error("short write to {path}")]
    ShortWrite { path: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("capacity error: {0}")]
    Capacity(String),

    #[error("drain worker already terminated")]
    AlreadyTerminated,

    #[error("I/O error during finalize: {0}")]
    Finalize(#[source] std::io::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Process exit code the session-controller CLI maps this error to.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            SessionError::InvalidConfig(_) => 1,
            SessionError::Capacity(_) => 2,
            SessionError::AlreadyTerminated
            | SessionError::Finalize(_)
            | SessionError::Io(_) => 3,
        }
    }
}
