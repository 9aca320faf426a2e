//! Error types for the IoT Hub protocol agents

use amqp_link::LinkError;
use thiserror::Error;

/// Errors surfaced by the CBS token-refresh agent
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CbsError {
    /// The service refused the token
    #[error("Put-token request was not authorized: {0}")]
    Unauthorized(String),

    /// No response arrived before the per-request deadline
    #[error("Put-token request timed out")]
    Timeout,

    /// The request never left the sender link
    #[error("Failed to send put-token request: {0}")]
    SendFailed(#[source] LinkError),

    /// A link-level failure
    #[error(transparent)]
    Link(#[from] LinkError),
}

/// Errors surfaced by the device-twin client
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TwinError {
    /// Caller passed a value of the wrong shape
    #[error("Invalid argument: {0}")]
    Argument(String),

    /// A required argument was missing or empty
    #[error("Missing required argument: {0}")]
    MissingArgument(String),

    /// The request could not be handed to the sender link
    #[error("Unable to send twin message: {0}")]
    Send(#[source] LinkError),

    /// A link-level failure
    #[error(transparent)]
    Link(#[from] LinkError),
}
