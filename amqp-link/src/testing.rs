//! In-memory AMQP client for driving the link state machines in tests
//!
//! Available with the `test-util` feature. Attach latency and failures are
//! scriptable per direction, and every created link endpoint records what
//! flowed through it so tests can assert on wire-level shapes.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};

use crate::client::{AmqpClient, AmqpReceiver, AmqpSender, LinkEvent};
use crate::error::{LinkError, Result};
use crate::message::{AmqpDelivery, AmqpMessage, LinkAddress, LinkOptions};

/// Scriptable in-memory [`AmqpClient`]
#[derive(Default)]
pub struct MockAmqpClient {
    attach_delay: Mutex<Option<Duration>>,
    sender_attach_error: Mutex<Option<LinkError>>,
    receiver_attach_error: Mutex<Option<LinkError>>,
    senders: Mutex<Vec<Arc<MockSender>>>,
    receivers: Mutex<Vec<Arc<MockReceiver>>>,
    attach_log: Mutex<Vec<String>>,
    sender_attach_count: AtomicUsize,
    receiver_attach_count: AtomicUsize,
    connection_error_listeners: std::sync::Mutex<Vec<mpsc::UnboundedSender<LinkError>>>,
}

impl MockAmqpClient {
    /// Create a mock client with instant, always-successful attaches
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every subsequent attach by `delay`
    pub async fn set_attach_delay(&self, delay: Duration) {
        *self.attach_delay.lock().await = Some(delay);
    }

    /// Fail the next `create_sender` call with `error`
    pub async fn fail_next_sender_attach(&self, error: LinkError) {
        *self.sender_attach_error.lock().await = Some(error);
    }

    /// Fail the next `create_receiver` call with `error`
    pub async fn fail_next_receiver_attach(&self, error: LinkError) {
        *self.receiver_attach_error.lock().await = Some(error);
    }

    /// How many times `create_sender` was called
    pub fn sender_attach_count(&self) -> usize {
        self.sender_attach_count.load(Ordering::SeqCst)
    }

    /// How many times `create_receiver` was called
    pub fn receiver_attach_count(&self) -> usize {
        self.receiver_attach_count.load(Ordering::SeqCst)
    }

    /// Attach calls in order, as `"sender:<address>"` / `"receiver:<address>"`
    pub async fn attach_log(&self) -> Vec<String> {
        self.attach_log.lock().await.clone()
    }

    /// The `index`th sender endpoint created, if any
    pub async fn sender(&self, index: usize) -> Option<Arc<MockSender>> {
        self.senders.lock().await.get(index).cloned()
    }

    /// The most recently created sender endpoint, if any
    pub async fn last_sender(&self) -> Option<Arc<MockSender>> {
        self.senders.lock().await.last().cloned()
    }

    /// The `index`th receiver endpoint created, if any
    pub async fn receiver(&self, index: usize) -> Option<Arc<MockReceiver>> {
        self.receivers.lock().await.get(index).cloned()
    }

    /// The most recently created receiver endpoint, if any
    pub async fn last_receiver(&self) -> Option<Arc<MockReceiver>> {
        self.receivers.lock().await.last().cloned()
    }

    /// Emit a connection-level error to every registered listener
    pub fn push_connection_error(&self, error: LinkError) {
        if let Ok(listeners) = self.connection_error_listeners.lock() {
            for listener in listeners.iter() {
                let _ = listener.send(error.clone());
            }
        }
    }
}

#[async_trait]
impl AmqpClient for MockAmqpClient {
    async fn create_sender(
        &self,
        address: &LinkAddress,
        options: Option<&LinkOptions>,
    ) -> Result<Arc<dyn AmqpSender>> {
        self.sender_attach_count.fetch_add(1, Ordering::SeqCst);
        self.attach_log.lock().await.push(format!("sender:{address}"));
        if let Some(delay) = *self.attach_delay.lock().await {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.sender_attach_error.lock().await.take() {
            return Err(error);
        }
        let sender = Arc::new(MockSender::new(address.clone(), options.cloned()));
        self.senders.lock().await.push(Arc::clone(&sender));
        Ok(sender)
    }

    async fn create_receiver(
        &self,
        address: &LinkAddress,
        options: Option<&LinkOptions>,
    ) -> Result<Arc<dyn AmqpReceiver>> {
        self.receiver_attach_count.fetch_add(1, Ordering::SeqCst);
        self.attach_log
            .lock()
            .await
            .push(format!("receiver:{address}"));
        if let Some(delay) = *self.attach_delay.lock().await {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.receiver_attach_error.lock().await.take() {
            return Err(error);
        }
        let receiver = Arc::new(MockReceiver::new(address.clone(), options.cloned()));
        self.receivers.lock().await.push(Arc::clone(&receiver));
        Ok(receiver)
    }

    fn connection_errors(&self) -> mpsc::UnboundedReceiver<LinkError> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut listeners) = self.connection_error_listeners.lock() {
            listeners.push(tx);
        }
        rx
    }
}

/// Sender endpoint created by [`MockAmqpClient`]
pub struct MockSender {
    address: LinkAddress,
    options: Option<LinkOptions>,
    sent: Mutex<Vec<AmqpMessage>>,
    send_errors: Mutex<VecDeque<LinkError>>,
    events: mpsc::UnboundedSender<LinkEvent>,
    events_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<LinkEvent>>>,
    force_detached: AtomicBool,
}

impl MockSender {
    fn new(address: LinkAddress, options: Option<LinkOptions>) -> Self {
        let (events, events_rx) = mpsc::unbounded_channel();
        Self {
            address,
            options,
            sent: Mutex::new(Vec::new()),
            send_errors: Mutex::new(VecDeque::new()),
            events,
            events_rx: std::sync::Mutex::new(Some(events_rx)),
            force_detached: AtomicBool::new(false),
        }
    }

    /// The address this endpoint was attached to
    pub fn address(&self) -> &LinkAddress {
        &self.address
    }

    /// The attach options the endpoint was created with
    pub fn options(&self) -> Option<&LinkOptions> {
        self.options.as_ref()
    }

    /// Everything successfully sent through this endpoint, in order
    pub async fn sent(&self) -> Vec<AmqpMessage> {
        self.sent.lock().await.clone()
    }

    /// Fail the next send with `error`
    pub async fn fail_next_send(&self, error: LinkError) {
        self.send_errors.lock().await.push_back(error);
    }

    /// Emit a peer-detach event
    pub fn emit_detached(&self, cause: Option<LinkError>) {
        let _ = self.events.send(LinkEvent::Detached(cause));
    }

    /// Emit a link error event
    pub fn emit_error(&self, error: LinkError) {
        let _ = self.events.send(LinkEvent::Error(error));
    }

    /// Whether the wrapping state machine force-detached this endpoint
    pub fn is_force_detached(&self) -> bool {
        self.force_detached.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AmqpSender for MockSender {
    async fn send(&self, message: AmqpMessage) -> Result<()> {
        if self.force_detached.load(Ordering::SeqCst) {
            return Err(LinkError::detached_internal("link force detached"));
        }
        if let Some(error) = self.send_errors.lock().await.pop_front() {
            return Err(error);
        }
        self.sent.lock().await.push(message);
        Ok(())
    }

    async fn force_detach(&self) {
        self.force_detached.store(true, Ordering::SeqCst);
    }

    fn link_events(&self) -> mpsc::UnboundedReceiver<LinkEvent> {
        take_stream(&self.events_rx)
    }
}

/// Receiver endpoint created by [`MockAmqpClient`]
pub struct MockReceiver {
    address: LinkAddress,
    options: Option<LinkOptions>,
    deliveries: mpsc::UnboundedSender<AmqpDelivery>,
    deliveries_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<AmqpDelivery>>>,
    events: mpsc::UnboundedSender<LinkEvent>,
    events_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<LinkEvent>>>,
    accepted: Mutex<Vec<u64>>,
    rejected: Mutex<Vec<u64>>,
    abandoned: Mutex<Vec<u64>>,
    next_delivery_tag: AtomicU64,
    force_detached: AtomicBool,
}

impl MockReceiver {
    fn new(address: LinkAddress, options: Option<LinkOptions>) -> Self {
        let (deliveries, deliveries_rx) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        Self {
            address,
            options,
            deliveries,
            deliveries_rx: std::sync::Mutex::new(Some(deliveries_rx)),
            events,
            events_rx: std::sync::Mutex::new(Some(events_rx)),
            accepted: Mutex::new(Vec::new()),
            rejected: Mutex::new(Vec::new()),
            abandoned: Mutex::new(Vec::new()),
            next_delivery_tag: AtomicU64::new(1),
            force_detached: AtomicBool::new(false),
        }
    }

    /// The address this endpoint was attached to
    pub fn address(&self) -> &LinkAddress {
        &self.address
    }

    /// The attach options the endpoint was created with
    pub fn options(&self) -> Option<&LinkOptions> {
        self.options.as_ref()
    }

    /// Push an inbound message; returns its delivery tag
    pub fn deliver(&self, message: AmqpMessage) -> u64 {
        let delivery_tag = self.next_delivery_tag.fetch_add(1, Ordering::SeqCst);
        let _ = self.deliveries.send(AmqpDelivery {
            delivery_tag,
            message,
        });
        delivery_tag
    }

    /// Delivery tags settled as accepted, in order
    pub async fn accepted(&self) -> Vec<u64> {
        self.accepted.lock().await.clone()
    }

    /// Delivery tags settled as rejected, in order
    pub async fn rejected(&self) -> Vec<u64> {
        self.rejected.lock().await.clone()
    }

    /// Delivery tags released back, in order
    pub async fn abandoned(&self) -> Vec<u64> {
        self.abandoned.lock().await.clone()
    }

    /// Emit a peer-detach event
    pub fn emit_detached(&self, cause: Option<LinkError>) {
        let _ = self.events.send(LinkEvent::Detached(cause));
    }

    /// Emit a link error event
    pub fn emit_error(&self, error: LinkError) {
        let _ = self.events.send(LinkEvent::Error(error));
    }

    /// Whether the wrapping state machine force-detached this endpoint
    pub fn is_force_detached(&self) -> bool {
        self.force_detached.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AmqpReceiver for MockReceiver {
    fn deliveries(&self) -> mpsc::UnboundedReceiver<AmqpDelivery> {
        take_stream(&self.deliveries_rx)
    }

    fn link_events(&self) -> mpsc::UnboundedReceiver<LinkEvent> {
        take_stream(&self.events_rx)
    }

    async fn accept(&self, delivery: &AmqpDelivery) -> Result<()> {
        self.accepted.lock().await.push(delivery.delivery_tag);
        Ok(())
    }

    async fn reject(&self, delivery: &AmqpDelivery) -> Result<()> {
        self.rejected.lock().await.push(delivery.delivery_tag);
        Ok(())
    }

    async fn abandon(&self, delivery: &AmqpDelivery) -> Result<()> {
        self.abandoned.lock().await.push(delivery.delivery_tag);
        Ok(())
    }

    async fn force_detach(&self) {
        self.force_detached.store(true, Ordering::SeqCst);
    }
}

/// Streams are single-consumer: a second take yields a closed channel.
fn take_stream<T>(
    slot: &std::sync::Mutex<Option<mpsc::UnboundedReceiver<T>>>,
) -> mpsc::UnboundedReceiver<T> {
    slot.lock()
        .ok()
        .and_then(|mut guard| guard.take())
        .unwrap_or_else(|| {
            let (_closed, rx) = mpsc::unbounded_channel();
            rx
        })
}
