//! # AMQP Link Management
//!
//! Multiplexes a single long-lived AMQP 1.0 connection into named,
//! independently-lifecycled links. The AMQP framing itself lives behind the
//! [`AmqpClient`] trait family; this crate owns the lifecycle around it.
//!
//! ## Features
//!
//! - **Sender links**: sends issued before the link is up are queued and
//!   drained in FIFO order on attach; attach failures are reported as the
//!   cause to every queued completion
//! - **Receiver links**: lazy lifecycle driven by message subscribers, with
//!   accept/reject/abandon dispositions
//! - **Exactly-once completions**: every accepted operation resolves exactly
//!   once, regardless of attach/detach interleaving
//! - **Async/await**: each link runs as a tokio task; completions never fire
//!   inside a state-machine transition
//!
//! ## Basic Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use amqp_link::{AmqpClient, AmqpMessage, LinkAddress, Result, SenderLink};
//!
//! async fn report_temperature(client: Arc<dyn AmqpClient>) -> Result<()> {
//!     let link = SenderLink::new(
//!         client,
//!         LinkAddress::new("/devices/device-1/messages/events"),
//!         None,
//!     );
//!     // Queued until the link attaches, then delivered in order.
//!     link.send(AmqpMessage::new().with_text_body("{\"temperature\":21.3}"))
//!         .await?;
//!     link.detach().await
//! }
//! ```

pub mod client;
pub mod correlation;
pub mod error;
pub mod message;
pub mod receiver;
pub mod sender;

#[cfg(feature = "test-util")]
pub mod testing;

// Re-export main types for convenience
pub use client::{AmqpClient, AmqpReceiver, AmqpSender, LinkEvent};
pub use error::{AMQP_INTERNAL_ERROR, LinkError, Result};
pub use message::{
    AmqpDelivery, AmqpMessage, AmqpValue, LinkAddress, LinkOptions, MessageBody, MessageOutcome,
    MessageProperties, ReceiverSettleMode, SenderSettleMode,
};
pub use receiver::{MessageSubscription, ReceiverLink};
pub use sender::SenderLink;

/// Lifecycle state of a link state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum LinkState {
    /// No link object exists
    Detached,
    /// An attach is in flight
    Attaching,
    /// The link is up and usable
    Attached,
    /// A teardown is in flight
    Detaching,
}

/// Point-in-time statistics for a link state machine
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct LinkStats {
    /// Messages handed to the underlying link with a fulfilled disposition
    pub messages_sent: u64,
    /// Sends that terminated with an error
    pub sends_failed: u64,
    /// Deepest the pre-attach queue ever got
    pub queue_high_water: usize,
    /// Messages received from the underlying link
    pub messages_received: u64,
}
