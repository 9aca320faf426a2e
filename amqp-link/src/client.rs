//! Interfaces consumed from the AMQP 1.0 client library
//!
//! The link state machines never frame bytes themselves; they drive an
//! injected client through these traits. Event streams are single-consumer:
//! each wrapping state machine owns its link object exclusively and takes
//! the stream exactly once.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{LinkError, Result};
use crate::message::{AmqpDelivery, AmqpMessage, LinkAddress, LinkOptions};

/// Asynchronous event reported by a link endpoint's event stream
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// The peer detached the link; carries the cause when one was supplied
    Detached(Option<LinkError>),
    /// A link-level error that did not detach the link
    Error(LinkError),
}

/// An AMQP 1.0 connection capable of opening links
#[async_trait]
pub trait AmqpClient: Send + Sync + 'static {
    /// Open an outbound link to `address`
    async fn create_sender(
        &self,
        address: &LinkAddress,
        options: Option<&LinkOptions>,
    ) -> Result<Arc<dyn AmqpSender>>;

    /// Open an inbound link from `address`
    async fn create_receiver(
        &self,
        address: &LinkAddress,
        options: Option<&LinkOptions>,
    ) -> Result<Arc<dyn AmqpReceiver>>;

    /// Subscribe to connection-level errors
    fn connection_errors(&self) -> mpsc::UnboundedReceiver<LinkError>;
}

/// An attached outbound link
#[async_trait]
pub trait AmqpSender: Send + Sync + 'static {
    /// Hand a message to the link; resolves with the peer's disposition
    async fn send(&self, message: AmqpMessage) -> Result<()>;

    /// Tear the link down without waiting for the peer
    async fn force_detach(&self);

    /// Detach and error events for this link endpoint
    fn link_events(&self) -> mpsc::UnboundedReceiver<LinkEvent>;
}

/// An attached inbound link
#[async_trait]
pub trait AmqpReceiver: Send + Sync + 'static {
    /// Inbound deliveries, in arrival order
    fn deliveries(&self) -> mpsc::UnboundedReceiver<AmqpDelivery>;

    /// Detach and error events for this link endpoint
    fn link_events(&self) -> mpsc::UnboundedReceiver<LinkEvent>;

    /// Settle a delivery as accepted
    async fn accept(&self, delivery: &AmqpDelivery) -> Result<()>;

    /// Settle a delivery as rejected
    async fn reject(&self, delivery: &AmqpDelivery) -> Result<()>;

    /// Release a delivery back to the peer
    async fn abandon(&self, delivery: &AmqpDelivery) -> Result<()>;

    /// Tear the link down without waiting for the peer
    async fn force_detach(&self);
}
