//! Crate-level error types.
//!
//! Domain-tool failures are data, not errors: they flow through
//! [`crate::adapter::ToolOutcome`] and drive the learning loop. Only
//! transport-level and setup failures surface through `AgentError`.

use thiserror::Error;

/// Errors that can surface to the caller of a session run.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Model transport failed after bounded retries.
    #[error("model transport error: {0}")]
    Transport(String),

    /// Session setup failed (unknown domain, unreadable task, bad config).
    #[error("session setup error: {0}")]
    Setup(String),

    /// Session artifact I/O (event log, metrics file) failed.
    #[error("session io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Learning(#[from] crate::learning::LearningError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;
