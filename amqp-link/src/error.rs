//! Error types for AMQP link management

use thiserror::Error;

/// Result type alias for link operations
pub type Result<T> = std::result::Result<T, LinkError>;

/// AMQP error condition used when a link tears down without a cause from the peer.
pub const AMQP_INTERNAL_ERROR: &str = "amqp:internal-error";

/// Errors surfaced by the link state machines
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// A required argument was missing or empty
    #[error("Missing required argument: {0}")]
    MissingArgument(String),

    /// The AMQP client had no usable connection when an attach was attempted
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// The link detached while an operation was pending
    #[error("Link detached ({condition}): {description}")]
    LinkDetached {
        /// AMQP error condition reported by the peer, or a synthetic one
        condition: String,
        /// Human-readable description of the failure
        description: String,
    },

    /// Any other error reported by the AMQP client
    #[error("Transport error: {0}")]
    Transport(String),
}

impl LinkError {
    /// Create a missing-argument error
    pub fn missing_argument(name: impl Into<String>) -> Self {
        Self::MissingArgument(name.into())
    }

    /// Create a not-connected error
    pub fn not_connected(msg: impl Into<String>) -> Self {
        Self::NotConnected(msg.into())
    }

    /// Create a link-detached error with an explicit AMQP condition
    pub fn detached(condition: impl Into<String>, description: impl Into<String>) -> Self {
        Self::LinkDetached {
            condition: condition.into(),
            description: description.into(),
        }
    }

    /// Create a link-detached error carrying the synthetic `amqp:internal-error` condition
    pub fn detached_internal(description: impl Into<String>) -> Self {
        Self::detached(AMQP_INTERNAL_ERROR, description)
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }
}
