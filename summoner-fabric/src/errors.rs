//! Error types for the orchestration fabric
//!
//! This module defines all error types that can occur when talking to the
//! store or driving the orchestration layers on top of it. The errors are
//! designed to be informative and actionable.

use thiserror::Error;

/// Main error type for the fabric
#[derive(Error, Debug)]
pub enum FabricError {
    /// Store unreachable, name resolution failure, or TCP timeout
    #[error("Store connection error: {0}")]
    Connection(String),

    /// The server replied with an error (`-` reply)
    #[error("Store error: {0}")]
    Protocol(String),

    /// A reply frame did not have the expected shape
    #[error("Unexpected reply: expected {expected}, got {actual}")]
    UnexpectedReply {
        /// Expected reply shape
        expected: String,
        /// Actual reply received
        actual: String,
    },

    /// Failed to parse a message
    #[error("Failed to parse message: {error}\nRaw message: {raw}")]
    MessageParseError {
        /// Parse error description
        error: String,
        /// Raw message that failed to parse
        raw: String,
    },

    /// Message carried a `type` tag no variant matches
    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Session descriptor missing from the store
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Every sequence slot in the probe range is occupied
    #[error("No available sequence number for prefix '{prefix}' (tried 1-{max_attempts})")]
    NoAvailableSequence {
        /// Prefix that was probed
        prefix: String,
        /// Highest sequence number probed
        max_attempts: u32,
    },

    /// child_id outside 1..=max_children
    #[error("child_id must be 1-{max_children}, got {child_id}")]
    ChildIdOutOfRange {
        /// The offending id
        child_id: u32,
        /// Upper bound from the session descriptor
        max_children: u32,
    },

    /// Operation attempted in the wrong state (e.g. before connect)
    #[error("Invalid state: {message}")]
    InvalidState {
        /// Description of the invalid state
        message: String,
    },

    /// Subscriber channel closed unexpectedly
    #[error("Subscriber connection closed")]
    SubscriberClosed,
}

/// Result type alias for fabric operations
pub type Result<T> = std::result::Result<T, FabricError>;

impl FabricError {
    /// Create a new Connection error from any displayable cause
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    /// Create a new MessageParseError
    pub fn parse_error(error: impl Into<String>, raw: impl Into<String>) -> Self {
        Self::MessageParseError {
            error: error.into(),
            raw: raw.into(),
        }
    }

    /// Create a new UnexpectedReply error
    pub fn unexpected_reply(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::UnexpectedReply {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create a new InvalidState error
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Check if the error indicates a lost or unreachable connection.
    /// Blocking loops sleep briefly and retry on these; protocol errors
    /// are never retried.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::SubscriberClosed)
    }
}

impl From<std::io::Error> for FabricError {
    fn from(err: std::io::Error) -> Self {
        Self::Connection(err.to_string())
    }
}
