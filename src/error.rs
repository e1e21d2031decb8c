//! Error taxonomy for the conversation pipeline.
//!
//! Three kinds only, matching how failures are actually handled: a capability
//! that never became ready is fatal, a capability call that exhausts its
//! retry budget is recoverable at the turn level, and a malformed or
//! out-of-sequence wire message is a protocol violation scoped to one
//! connection.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConversationError {
    #[error("initialization failed: {0}")]
    Init(String),

    #[error("processing failed: {0}")]
    Processing(String),

    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl ConversationError {
    pub fn init(msg: impl Into<String>) -> Self {
        Self::Init(msg.into())
    }

    pub fn processing(msg: impl Into<String>) -> Self {
        Self::Processing(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, ConversationError>;
