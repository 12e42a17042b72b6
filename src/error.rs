//! Conclave error types

use thiserror::Error;

use crate::ids::{EventId, SessionId};

/// Errors that can occur while composing agents or touching session state
#[derive(Debug, Error)]
pub enum ConclaveError {
    /// Invalid composer configuration, raised at construction time
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Session not found
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    /// State key has no usable name part
    #[error("Invalid state key: {0:?}")]
    InvalidStateKey(String),

    /// Event was already appended to the session
    #[error("Duplicate event: {0}")]
    DuplicateEvent(EventId),

    /// A sub-agent failed while executing
    #[error("Agent '{agent}' failed: {message}")]
    Agent { agent: String, message: String },

    /// Execution was cancelled
    #[error("Execution cancelled")]
    Cancelled,

    /// The invocation deadline passed
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// Channel error
    #[error("Channel error: {0}")]
    ChannelError(String),

    /// A spawned sub-agent task panicked or was torn down unexpectedly
    #[error("Task error: {0}")]
    TaskError(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ConclaveError {
    /// Build an execution error attributed to `agent`
    pub fn agent(agent: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Agent {
            agent: agent.into(),
            message: message.into(),
        }
    }

    /// Cancellation and deadline expiry are expected terminations, not failures
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::SessionNotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, ConclaveError>;
