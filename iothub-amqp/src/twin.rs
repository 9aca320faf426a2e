//! Device-twin synchronization over a correlated AMQP link pair
//!
//! `TwinClient` runs the twin request/response protocol plus unsolicited
//! desired-property notifications over one sender and one receiver link that
//! share a channel-correlation id. The link pair is lifetime-coupled: it
//! comes up when the first subscriber appears and goes down when the last
//! one leaves. Inbound traffic is demultiplexed three ways: responses to the
//! internal subscribe/unsubscribe handshakes, responses to caller requests,
//! and correlation-free desired-property deltas.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use amqp_link::correlation::correlation_id;
use amqp_link::receiver::MessageSubscription;
use amqp_link::{
    AmqpClient, AmqpDelivery, AmqpMessage, AmqpValue, LinkAddress, LinkError, LinkEvent,
    LinkOptions, MessageBody, MessageOutcome, ReceiverLink, ReceiverSettleMode, SenderLink,
    SenderSettleMode,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::TwinError;

/// Default service api-version negotiated at attach time
pub const TWIN_API_VERSION: &str = "2018-06-30";

/// Topic carried on every synthetic twin response envelope
pub const TWIN_RESPONSE_TOPIC: &str = "$iothub/twin/res";

const CHANNEL_CORRELATION_ID_PROPERTY: &str = "com.microsoft:channel-correlation-id";
const API_VERSION_PROPERTY: &str = "com.microsoft:api-version";
const OPERATION_ANNOTATION: &str = "operation";
const RESOURCE_ANNOTATION: &str = "resource";
const VERSION_ANNOTATION: &str = "version";
const RID_PROPERTY: &str = "$rid";
const DESIRED_NOTIFICATIONS_RESOURCE: &str = "/notifications/twin/properties/desired";
const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Twin client configuration
#[derive(Debug, Clone)]
pub struct TwinConfig {
    /// Device whose twin is synchronized
    pub device_id: String,
    /// Service api-version sent as a link property
    pub api_version: String,
}

impl TwinConfig {
    /// Configuration for `device_id` with the default api-version
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            api_version: TWIN_API_VERSION.to_string(),
        }
    }
}

/// Lifecycle state of the twin link pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TwinState {
    /// No links exist
    Disconnected,
    /// The link pair is attaching
    Connecting,
    /// Both links are up
    Connected,
    /// The link pair is tearing down
    Disconnecting,
}

/// Synthetic envelope emitted for every response to a caller request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TwinResponse {
    /// Always [`TWIN_RESPONSE_TOPIC`]
    pub topic: String,
    /// Response status
    pub status: u32,
    /// The caller-assigned request id this response answers
    #[serde(rename = "$rid")]
    pub request_id: String,
    /// Response payload
    pub body: MessageBody,
}

impl TwinResponse {
    /// Parse the response body as JSON
    pub fn body_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        match &self.body {
            MessageBody::Text(text) => serde_json::from_str(text),
            MessageBody::Data(data) => serde_json::from_slice(data),
            MessageBody::Empty => serde_json::from_str(""),
        }
    }
}

/// Stream of responses to caller twin requests
///
/// Dropping the stream unsubscribes it; when no subscribers of either kind
/// remain the link pair detaches.
#[derive(Debug)]
pub struct TwinResponseStream {
    id: u64,
    responses: mpsc::UnboundedReceiver<TwinResponse>,
    commands: mpsc::UnboundedSender<TwinCommand>,
}

impl TwinResponseStream {
    /// Receive the next response envelope
    pub async fn recv(&mut self) -> Option<TwinResponse> {
        self.responses.recv().await
    }

    /// Receive a response envelope without waiting
    pub fn try_recv(&mut self) -> Option<TwinResponse> {
        self.responses.try_recv().ok()
    }
}

impl Drop for TwinResponseStream {
    fn drop(&mut self) {
        let _ = self
            .commands
            .send(TwinCommand::UnsubscribeResponses { id: self.id });
    }
}

/// Stream of desired-property delta payloads
pub struct DesiredPropertyStream {
    id: u64,
    payloads: mpsc::UnboundedReceiver<MessageBody>,
    commands: mpsc::UnboundedSender<TwinCommand>,
}

impl DesiredPropertyStream {
    /// Receive the next desired-property delta
    pub async fn recv(&mut self) -> Option<MessageBody> {
        self.payloads.recv().await
    }

    /// Receive a desired-property delta without waiting
    pub fn try_recv(&mut self) -> Option<MessageBody> {
        self.payloads.try_recv().ok()
    }
}

impl Drop for DesiredPropertyStream {
    fn drop(&mut self) {
        let _ = self
            .commands
            .send(TwinCommand::UnsubscribeDesired { id: self.id });
    }
}

enum TwinCommand {
    SendRequest {
        message: AmqpMessage,
        done: oneshot::Sender<Result<MessageOutcome, TwinError>>,
    },
    SubscribeResponses {
        done: oneshot::Sender<Result<TwinResponseStream, TwinError>>,
    },
    UnsubscribeResponses {
        id: u64,
    },
    SubscribeDesired {
        done: oneshot::Sender<Result<DesiredPropertyStream, TwinError>>,
    },
    UnsubscribeDesired {
        id: u64,
    },
    State {
        done: oneshot::Sender<TwinState>,
    },
    DeliveryReceived(AmqpDelivery),
    LinkDown(Option<LinkError>),
    LinkFailed(LinkError),
}

/// Handle to the device-twin state machine
///
/// Cheap to clone; all clones drive the same state machine.
#[derive(Clone)]
pub struct TwinClient {
    commands: mpsc::UnboundedSender<TwinCommand>,
    events: broadcast::Sender<TwinError>,
}

impl TwinClient {
    /// Create a disconnected twin client over `client`
    pub fn new(client: Arc<dyn AmqpClient>, config: TwinConfig) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let actor = TwinActor {
            client,
            config,
            commands: commands.downgrade(),
            events: events.clone(),
            state: TwinState::Disconnected,
            links: None,
            next_subscriber_id: 0,
            response_subscribers: HashMap::new(),
            desired_subscribers: HashMap::new(),
            desired_waiters: Vec::new(),
            internal_ops: HashMap::new(),
        };
        tokio::spawn(actor.run(command_rx));
        Self { commands, events }
    }

    /// Encode and send a twin request over the sender link
    ///
    /// Validation happens before the request reaches the state machine:
    /// empty method/resource/body are missing-argument errors, non-scalar
    /// property values are argument errors. The `$rid` property becomes the
    /// message correlation id; the link pair is attached first if needed.
    pub async fn send_twin_request(
        &self,
        method: &str,
        resource: &str,
        properties: &BTreeMap<String, AmqpValue>,
        body: &str,
    ) -> Result<MessageOutcome, TwinError> {
        let message = encode_twin_request(method, resource, properties, body)?;
        let (done, result) = oneshot::channel();
        self.command(TwinCommand::SendRequest { message, done })?;
        result.await.map_err(|_| machine_stopped())?
    }

    /// Subscribe to responses for caller twin requests
    ///
    /// Attaches the link pair when it is not already up; resolves as soon as
    /// both links are attached.
    pub async fn subscribe_responses(&self) -> Result<TwinResponseStream, TwinError> {
        let (done, result) = oneshot::channel();
        self.command(TwinCommand::SubscribeResponses { done })?;
        result.await.map_err(|_| machine_stopped())?
    }

    /// Subscribe to desired-property deltas
    ///
    /// The first subscriber triggers the service-side handshake (a `PUT` on
    /// the notification resource); the call resolves once the service has
    /// acknowledged it. Dropping the last subscriber sends the matching
    /// `DELETE`.
    pub async fn subscribe_desired_properties(&self) -> Result<DesiredPropertyStream, TwinError> {
        let (done, result) = oneshot::channel();
        self.command(TwinCommand::SubscribeDesired { done })?;
        result.await.map_err(|_| machine_stopped())?
    }

    /// Subscribe to asynchronous twin errors
    pub fn events(&self) -> broadcast::Receiver<TwinError> {
        self.events.subscribe()
    }

    /// Current lifecycle state of the link pair
    pub async fn state(&self) -> TwinState {
        let (done, result) = oneshot::channel();
        if self.command(TwinCommand::State { done }).is_err() {
            return TwinState::Disconnected;
        }
        result.await.unwrap_or(TwinState::Disconnected)
    }

    fn command(&self, command: TwinCommand) -> Result<(), TwinError> {
        self.commands.send(command).map_err(|_| machine_stopped())
    }
}

fn machine_stopped() -> TwinError {
    TwinError::Link(LinkError::detached_internal("twin state machine stopped"))
}

/// Encode a twin request message
///
/// The method becomes the `operation` annotation; the resource loses one
/// trailing slash and is omitted entirely when nothing remains; `PATCH`
/// requests carry an explicit null `version` annotation. Caller properties
/// land in the message properties section, with `$rid` renamed to the
/// correlation id.
fn encode_twin_request(
    method: &str,
    resource: &str,
    properties: &BTreeMap<String, AmqpValue>,
    body: &str,
) -> Result<AmqpMessage, TwinError> {
    if method.is_empty() {
        return Err(TwinError::MissingArgument("method".to_string()));
    }
    if resource.is_empty() {
        return Err(TwinError::MissingArgument("resource".to_string()));
    }
    if body.is_empty() {
        return Err(TwinError::MissingArgument("body".to_string()));
    }
    for (key, value) in properties {
        if value.is_null() {
            return Err(TwinError::Argument(format!(
                "property '{key}' must be a string, number, or boolean"
            )));
        }
    }

    let mut message = AmqpMessage::new();
    message
        .message_annotations
        .insert(OPERATION_ANNOTATION.to_string(), AmqpValue::from(method));
    let trimmed = resource.strip_suffix('/').unwrap_or(resource);
    if !trimmed.is_empty() {
        message
            .message_annotations
            .insert(RESOURCE_ANNOTATION.to_string(), AmqpValue::from(trimmed));
    }
    if method == "PATCH" {
        message
            .message_annotations
            .insert(VERSION_ANNOTATION.to_string(), AmqpValue::Null);
    }
    for (key, value) in properties {
        if key == RID_PROPERTY {
            message.properties.correlation_id = Some(value.to_string());
        } else {
            message.properties.custom.insert(key.clone(), value.clone());
        }
    }
    message.body = MessageBody::Text(body.to_string());
    Ok(message)
}

struct TwinLinks {
    sender: SenderLink,
    receiver: ReceiverLink,
    demux_task: JoinHandle<()>,
    sender_events_task: JoinHandle<()>,
    receiver_events_task: JoinHandle<()>,
}

enum InternalOp {
    SubscribeDesired,
    UnsubscribeDesired,
}

struct TwinActor {
    client: Arc<dyn AmqpClient>,
    config: TwinConfig,
    commands: mpsc::WeakUnboundedSender<TwinCommand>,
    events: broadcast::Sender<TwinError>,
    state: TwinState,
    links: Option<TwinLinks>,
    next_subscriber_id: u64,
    response_subscribers: HashMap<u64, mpsc::UnboundedSender<TwinResponse>>,
    desired_subscribers: HashMap<u64, mpsc::UnboundedSender<MessageBody>>,
    desired_waiters: Vec<oneshot::Sender<Result<DesiredPropertyStream, TwinError>>>,
    internal_ops: HashMap<String, InternalOp>,
}

impl TwinActor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<TwinCommand>) {
        while let Some(command) = commands.recv().await {
            self.handle(command).await;
        }
        if self.links.is_some() {
            self.disconnect().await;
        }
    }

    async fn handle(&mut self, command: TwinCommand) {
        match command {
            TwinCommand::SendRequest { message, done } => self.on_send_request(message, done).await,
            TwinCommand::SubscribeResponses { done } => self.on_subscribe_responses(done).await,
            TwinCommand::UnsubscribeResponses { id } => {
                if self.response_subscribers.remove(&id).is_some() {
                    self.maybe_disconnect().await;
                }
            }
            TwinCommand::SubscribeDesired { done } => self.on_subscribe_desired(done).await,
            TwinCommand::UnsubscribeDesired { id } => self.on_unsubscribe_desired(id).await,
            TwinCommand::State { done } => {
                let _ = done.send(self.state);
            }
            TwinCommand::DeliveryReceived(delivery) => self.on_delivery(delivery),
            TwinCommand::LinkDown(cause) => self.on_link_down(cause).await,
            TwinCommand::LinkFailed(error) => {
                debug!("Twin link error: {}", error);
                let _ = self.events.send(TwinError::Link(error));
            }
        }
    }

    async fn on_send_request(
        &mut self,
        message: AmqpMessage,
        done: oneshot::Sender<Result<MessageOutcome, TwinError>>,
    ) {
        if let Err(error) = self.ensure_connected().await {
            let _ = done.send(Err(error));
            return;
        }
        let Some(links) = &self.links else {
            let _ = done.send(Err(machine_stopped()));
            return;
        };
        let result = links
            .sender
            .send(message)
            .await
            .map_err(TwinError::Send);
        let _ = done.send(result);
    }

    async fn on_subscribe_responses(
        &mut self,
        done: oneshot::Sender<Result<TwinResponseStream, TwinError>>,
    ) {
        if let Err(error) = self.ensure_connected().await {
            let _ = done.send(Err(error));
            return;
        }
        let result = self.register_response_subscriber();
        let _ = done.send(result);
    }

    async fn on_subscribe_desired(
        &mut self,
        done: oneshot::Sender<Result<DesiredPropertyStream, TwinError>>,
    ) {
        if let Err(error) = self.ensure_connected().await {
            let _ = done.send(Err(error));
            return;
        }
        // An active subscription covers new subscribers immediately; the
        // handshake only runs for the first one.
        if !self.desired_subscribers.is_empty() {
            let result = self.register_desired_subscriber();
            let _ = done.send(result);
            return;
        }
        let handshake_in_flight = self
            .internal_ops
            .values()
            .any(|op| matches!(op, InternalOp::SubscribeDesired));
        self.desired_waiters.push(done);
        if handshake_in_flight {
            return;
        }

        let correlation = correlation_id();
        self.internal_ops
            .insert(correlation.clone(), InternalOp::SubscribeDesired);
        debug!("Enabling desired-property notifications: {}", correlation);
        if let Err(error) = self
            .send_internal(DESIRED_NOTIFICATIONS_RESOURCE, "PUT", &correlation)
            .await
        {
            self.internal_ops.remove(&correlation);
            let error = TwinError::Send(error);
            for waiter in self.desired_waiters.drain(..) {
                let _ = waiter.send(Err(error.clone()));
            }
        }
    }

    async fn on_unsubscribe_desired(&mut self, id: u64) {
        if self.desired_subscribers.remove(&id).is_none() {
            return;
        }
        if self.desired_subscribers.is_empty() && self.links.is_some() {
            let correlation = correlation_id();
            self.internal_ops
                .insert(correlation.clone(), InternalOp::UnsubscribeDesired);
            debug!("Disabling desired-property notifications: {}", correlation);
            if let Err(error) = self
                .send_internal(DESIRED_NOTIFICATIONS_RESOURCE, "DELETE", &correlation)
                .await
            {
                self.internal_ops.remove(&correlation);
                warn!("Failed to send notification unsubscribe: {}", error);
            }
        }
        self.maybe_disconnect().await;
    }

    /// Send a subscription-churn request with `correlation` as its id
    async fn send_internal(
        &self,
        resource: &str,
        method: &str,
        correlation: &str,
    ) -> Result<(), LinkError> {
        let Some(links) = &self.links else {
            return Err(LinkError::detached_internal("twin links detached"));
        };
        let mut message = AmqpMessage::new()
            .with_annotation(OPERATION_ANNOTATION, method)
            .with_annotation(RESOURCE_ANNOTATION, resource)
            .with_text_body(" ");
        message.properties.correlation_id = Some(correlation.to_string());
        links.sender.send(message).await.map(|_| ())
    }

    fn on_delivery(&mut self, delivery: AmqpDelivery) {
        let message = delivery.message;
        if let Some(correlation) = message.properties.correlation_id.clone() {
            match self.internal_ops.remove(&correlation) {
                Some(InternalOp::SubscribeDesired) => {
                    debug!("Desired-property notifications enabled");
                    let waiters: Vec<_> = self.desired_waiters.drain(..).collect();
                    for waiter in waiters {
                        let result = self.register_desired_subscriber();
                        let _ = waiter.send(result);
                    }
                }
                Some(InternalOp::UnsubscribeDesired) => {
                    debug!("Desired-property notifications disabled");
                }
                None => {
                    let response = TwinResponse {
                        topic: TWIN_RESPONSE_TOPIC.to_string(),
                        status: 200,
                        request_id: correlation,
                        body: message.body,
                    };
                    self.response_subscribers
                        .retain(|_, subscriber| subscriber.send(response.clone()).is_ok());
                }
            }
        } else if !message.body.is_empty() {
            // Correlation-free body: a desired-properties delta.
            self.desired_subscribers
                .retain(|_, subscriber| subscriber.send(message.body.clone()).is_ok());
        } else {
            debug!("Dropping twin message with no correlation id and no body");
        }
    }

    async fn on_link_down(&mut self, cause: Option<LinkError>) {
        if self.links.is_none() {
            debug!("Ignoring stale link-down notification");
            return;
        }
        let error = TwinError::Link(
            cause.unwrap_or_else(|| LinkError::detached_internal("twin link detached by peer")),
        );
        warn!("Twin link detached: {}", error);
        let _ = self.events.send(error);
        self.disconnect().await;
    }

    async fn ensure_connected(&mut self) -> Result<(), TwinError> {
        if self.state == TwinState::Connected && self.links.is_some() {
            return Ok(());
        }
        self.connect().await
    }

    /// Attach the link pair: a fresh channel-correlation id, receiver first,
    /// then the sender at the same node
    async fn connect(&mut self) -> Result<(), TwinError> {
        debug!("Connecting twin links for device: {}", self.config.device_id);
        self.state = TwinState::Connecting;
        let channel = correlation_id();
        let options = LinkOptions::new()
            .with_property(CHANNEL_CORRELATION_ID_PROPERTY, format!("twin:{channel}"))
            .with_property(API_VERSION_PROPERTY, self.config.api_version.clone())
            .with_sender_settle_mode(SenderSettleMode::Settled)
            .with_receiver_settle_mode(ReceiverSettleMode::AutoSettle);
        let address = LinkAddress::new(format!("/devices/{}/twin/", self.config.device_id));

        let receiver = ReceiverLink::new(
            Arc::clone(&self.client),
            address.clone(),
            Some(options.clone()),
        );
        let subscription = match receiver.subscribe().await {
            Ok(subscription) => subscription,
            Err(error) => {
                self.state = TwinState::Disconnected;
                let error = TwinError::Link(error);
                let _ = self.events.send(error.clone());
                return Err(error);
            }
        };
        if let Err(error) = receiver.attach().await {
            self.state = TwinState::Disconnected;
            let error = TwinError::Link(error);
            let _ = self.events.send(error.clone());
            return Err(error);
        }

        let sender = SenderLink::new(Arc::clone(&self.client), address, Some(options));
        if let Err(error) = sender.attach().await {
            // The receiver is already up: take it back down on the way out.
            self.state = TwinState::Disconnecting;
            if let Err(detach_error) = receiver.detach().await {
                let _ = self.events.send(TwinError::Link(detach_error));
            }
            self.state = TwinState::Disconnected;
            let error = TwinError::Link(error);
            let _ = self.events.send(error.clone());
            return Err(error);
        }

        let demux_task = spawn_demux(subscription, self.commands.clone());
        let sender_events_task = spawn_link_event_pump(sender.events(), self.commands.clone());
        let receiver_events_task = spawn_link_event_pump(receiver.events(), self.commands.clone());
        self.links = Some(TwinLinks {
            sender,
            receiver,
            demux_task,
            sender_events_task,
            receiver_events_task,
        });
        self.state = TwinState::Connected;
        info!("Twin links attached for device: {}", self.config.device_id);
        Ok(())
    }

    /// Detach the link pair once no subscribers of either kind remain
    async fn maybe_disconnect(&mut self) {
        if self.response_subscribers.is_empty()
            && self.desired_subscribers.is_empty()
            && self.links.is_some()
        {
            debug!("Last twin subscriber removed, detaching links");
            self.disconnect().await;
        }
    }

    /// Tear both links down; teardown errors are reported as events but do
    /// not block the state change
    async fn disconnect(&mut self) {
        self.state = TwinState::Disconnecting;
        if let Some(links) = self.links.take() {
            links.demux_task.abort();
            links.sender_events_task.abort();
            links.receiver_events_task.abort();
            let (sender_result, receiver_result) =
                tokio::join!(links.sender.detach(), links.receiver.detach());
            for result in [sender_result, receiver_result] {
                if let Err(error) = result {
                    warn!("Error detaching twin link: {}", error);
                    let _ = self.events.send(TwinError::Link(error));
                }
            }
        }
        // Handshakes that will never be answered now.
        self.internal_ops.clear();
        let stale = LinkError::detached_internal("twin links detached");
        for waiter in self.desired_waiters.drain(..) {
            let _ = waiter.send(Err(TwinError::Link(stale.clone())));
        }
        self.state = TwinState::Disconnected;
        info!("Twin links detached for device: {}", self.config.device_id);
    }

    fn register_response_subscriber(&mut self) -> Result<TwinResponseStream, TwinError> {
        let commands = self.commands.upgrade().ok_or_else(machine_stopped)?;
        let id = self.next_subscriber_id;
        self.next_subscriber_id += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        self.response_subscribers.insert(id, tx);
        Ok(TwinResponseStream {
            id,
            responses: rx,
            commands,
        })
    }

    fn register_desired_subscriber(&mut self) -> Result<DesiredPropertyStream, TwinError> {
        let commands = self.commands.upgrade().ok_or_else(machine_stopped)?;
        let id = self.next_subscriber_id;
        self.next_subscriber_id += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        self.desired_subscribers.insert(id, tx);
        Ok(DesiredPropertyStream {
            id,
            payloads: rx,
            commands,
        })
    }
}

fn spawn_demux(
    mut subscription: MessageSubscription,
    commands: mpsc::WeakUnboundedSender<TwinCommand>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(delivery) = subscription.recv().await {
            let Some(commands) = commands.upgrade() else {
                break;
            };
            if commands
                .send(TwinCommand::DeliveryReceived(delivery))
                .is_err()
            {
                break;
            }
        }
    })
}

fn spawn_link_event_pump(
    mut events: broadcast::Receiver<LinkEvent>,
    commands: mpsc::WeakUnboundedSender<TwinCommand>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Twin link event stream lagged by {} events", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let Some(commands) = commands.upgrade() else {
                break;
            };
            let command = match event {
                LinkEvent::Detached(cause) => TwinCommand::LinkDown(cause),
                LinkEvent::Error(error) => TwinCommand::LinkFailed(error),
            };
            if commands.send(command).is_err() {
                break;
            }
        }
    })
}
