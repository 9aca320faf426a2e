//! Inbound link state machine
//!
//! `ReceiverLink` wraps one inbound AMQP link. The lifecycle is lazy: the
//! first message subscriber attaches the link, dropping the last one
//! detaches it again, so no credit sits on the wire while nobody listens.
//! Deliveries fan out to every live subscriber; dispositions are only valid
//! while the link is attached.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::client::{AmqpClient, AmqpReceiver, LinkEvent};
use crate::error::{LinkError, Result};
use crate::message::{AmqpDelivery, LinkAddress, LinkOptions, MessageOutcome};
use crate::{LinkState, LinkStats};

const EVENT_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy)]
enum Disposition {
    Accept,
    Reject,
    Abandon,
}

enum ReceiverCommand {
    Attach {
        done: oneshot::Sender<Result<()>>,
    },
    Detach {
        done: oneshot::Sender<Result<()>>,
    },
    Subscribe {
        done: oneshot::Sender<(u64, mpsc::UnboundedReceiver<AmqpDelivery>)>,
    },
    Unsubscribe {
        id: u64,
    },
    Settle {
        disposition: Disposition,
        delivery: AmqpDelivery,
        done: oneshot::Sender<Result<MessageOutcome>>,
    },
    State {
        done: oneshot::Sender<LinkState>,
    },
    Stats {
        done: oneshot::Sender<LinkStats>,
    },
    AttachResolved(Result<Arc<dyn AmqpReceiver>>),
    DeliveryReceived(AmqpDelivery),
    PeerDetached(Option<LinkError>),
    LinkErrorReceived(LinkError),
}

/// Handle to an inbound link state machine
///
/// Cheap to clone; all clones drive the same state machine.
#[derive(Clone)]
pub struct ReceiverLink {
    commands: mpsc::UnboundedSender<ReceiverCommand>,
    events: broadcast::Sender<LinkEvent>,
}

/// A live message subscription
///
/// Dropping the subscription unsubscribes it; when the last subscription
/// goes away the link detaches itself.
pub struct MessageSubscription {
    id: u64,
    deliveries: mpsc::UnboundedReceiver<AmqpDelivery>,
    commands: mpsc::UnboundedSender<ReceiverCommand>,
}

impl MessageSubscription {
    /// Receive the next inbound delivery
    ///
    /// Returns `None` when the state machine has stopped.
    pub async fn recv(&mut self) -> Option<AmqpDelivery> {
        self.deliveries.recv().await
    }
}

impl Drop for MessageSubscription {
    fn drop(&mut self) {
        let _ = self
            .commands
            .send(ReceiverCommand::Unsubscribe { id: self.id });
    }
}

impl ReceiverLink {
    /// Create a detached receiver link for `address`
    pub fn new(
        client: Arc<dyn AmqpClient>,
        address: LinkAddress,
        options: Option<LinkOptions>,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let actor = ReceiverActor {
            client,
            address,
            options,
            commands: commands.downgrade(),
            events: events.clone(),
            state: State::Detached,
            subscribers: HashMap::new(),
            next_subscriber_id: 0,
            stats: Arc::new(Mutex::new(LinkStats::default())),
        };
        tokio::spawn(actor.run(command_rx));
        Self { commands, events }
    }

    /// Attach the link, or wait for an attach already in flight
    pub async fn attach(&self) -> Result<()> {
        let (done, result) = oneshot::channel();
        self.command(ReceiverCommand::Attach { done })?;
        result.await.map_err(|_| machine_stopped())?
    }

    /// Detach the link; a no-op when already detached
    pub async fn detach(&self) -> Result<()> {
        let (done, result) = oneshot::channel();
        self.command(ReceiverCommand::Detach { done })?;
        result.await.map_err(|_| machine_stopped())?
    }

    /// Subscribe to inbound messages
    ///
    /// The first subscriber attaches the link; messages start flowing once
    /// the attach completes.
    pub async fn subscribe(&self) -> Result<MessageSubscription> {
        let (done, result) = oneshot::channel();
        self.command(ReceiverCommand::Subscribe { done })?;
        let (id, deliveries) = result.await.map_err(|_| machine_stopped())?;
        Ok(MessageSubscription {
            id,
            deliveries,
            commands: self.commands.clone(),
        })
    }

    /// Settle `delivery` as accepted
    pub async fn accept(&self, delivery: AmqpDelivery) -> Result<MessageOutcome> {
        self.settle(Disposition::Accept, delivery).await
    }

    /// Settle `delivery` as rejected
    pub async fn reject(&self, delivery: AmqpDelivery) -> Result<MessageOutcome> {
        self.settle(Disposition::Reject, delivery).await
    }

    /// Release `delivery` back to the peer
    pub async fn abandon(&self, delivery: AmqpDelivery) -> Result<MessageOutcome> {
        self.settle(Disposition::Abandon, delivery).await
    }

    /// Subscribe to asynchronous link events (peer detach, link errors)
    pub fn events(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    /// Current lifecycle state
    pub async fn state(&self) -> LinkState {
        let (done, result) = oneshot::channel();
        if self.command(ReceiverCommand::State { done }).is_err() {
            return LinkState::Detached;
        }
        result.await.unwrap_or(LinkState::Detached)
    }

    /// Snapshot of the link statistics
    pub async fn stats(&self) -> LinkStats {
        let (done, result) = oneshot::channel();
        if self.command(ReceiverCommand::Stats { done }).is_err() {
            return LinkStats::default();
        }
        result.await.unwrap_or_default()
    }

    async fn settle(
        &self,
        disposition: Disposition,
        delivery: AmqpDelivery,
    ) -> Result<MessageOutcome> {
        let (done, result) = oneshot::channel();
        self.command(ReceiverCommand::Settle {
            disposition,
            delivery,
            done,
        })?;
        result.await.map_err(|_| machine_stopped())?
    }

    fn command(&self, command: ReceiverCommand) -> Result<()> {
        self.commands.send(command).map_err(|_| machine_stopped())
    }
}

fn machine_stopped() -> LinkError {
    LinkError::detached_internal("link state machine stopped")
}

enum State {
    Detached,
    Attaching {
        attach_waiters: Vec<oneshot::Sender<Result<()>>>,
        detach_waiters: Vec<oneshot::Sender<Result<()>>>,
        detach_requested: bool,
    },
    Attached {
        receiver: Arc<dyn AmqpReceiver>,
        delivery_task: JoinHandle<()>,
        events_task: JoinHandle<()>,
    },
    Detaching,
}

impl State {
    fn name(&self) -> LinkState {
        match self {
            Self::Detached => LinkState::Detached,
            Self::Attaching { .. } => LinkState::Attaching,
            Self::Attached { .. } => LinkState::Attached,
            Self::Detaching => LinkState::Detaching,
        }
    }
}

struct ReceiverActor {
    client: Arc<dyn AmqpClient>,
    address: LinkAddress,
    options: Option<LinkOptions>,
    commands: mpsc::WeakUnboundedSender<ReceiverCommand>,
    events: broadcast::Sender<LinkEvent>,
    state: State,
    subscribers: HashMap<u64, mpsc::UnboundedSender<AmqpDelivery>>,
    next_subscriber_id: u64,
    stats: Arc<Mutex<LinkStats>>,
}

impl ReceiverActor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<ReceiverCommand>) {
        while let Some(command) = commands.recv().await {
            self.handle(command).await;
        }
        if matches!(self.state, State::Attached { .. }) {
            self.teardown().await;
        }
    }

    async fn handle(&mut self, command: ReceiverCommand) {
        match command {
            ReceiverCommand::Attach { done } => self.on_attach(done),
            ReceiverCommand::Detach { done } => self.on_detach(done).await,
            ReceiverCommand::Subscribe { done } => self.on_subscribe(done),
            ReceiverCommand::Unsubscribe { id } => self.on_unsubscribe(id).await,
            ReceiverCommand::Settle {
                disposition,
                delivery,
                done,
            } => self.on_settle(disposition, delivery, done).await,
            ReceiverCommand::State { done } => {
                let _ = done.send(self.state.name());
            }
            ReceiverCommand::Stats { done } => {
                let _ = done.send(self.stats.lock().await.clone());
            }
            ReceiverCommand::AttachResolved(result) => self.on_attach_resolved(result).await,
            ReceiverCommand::DeliveryReceived(delivery) => self.on_delivery(delivery).await,
            ReceiverCommand::PeerDetached(cause) => self.on_peer_detached(cause).await,
            ReceiverCommand::LinkErrorReceived(error) => {
                debug!("Receiver link error: {}: {}", self.address, error);
                let _ = self.events.send(LinkEvent::Error(error));
            }
        }
    }

    fn on_attach(&mut self, done: oneshot::Sender<Result<()>>) {
        match &mut self.state {
            State::Detached | State::Detaching => self.begin_attach(vec![done]),
            State::Attaching { attach_waiters, .. } => attach_waiters.push(done),
            State::Attached { .. } => {
                let _ = done.send(Ok(()));
            }
        }
    }

    fn on_subscribe(&mut self, done: oneshot::Sender<(u64, mpsc::UnboundedReceiver<AmqpDelivery>)>) {
        let id = self.next_subscriber_id;
        self.next_subscriber_id += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.insert(id, tx);
        let _ = done.send((id, rx));
        match &mut self.state {
            State::Detached if self.subscribers.len() == 1 => {
                debug!("First subscriber registered, attaching: {}", self.address);
                self.begin_attach(Vec::new());
            }
            // A subscriber arriving mid-attach supersedes a lazy detach.
            State::Attaching {
                detach_requested, ..
            } => *detach_requested = false,
            _ => {}
        }
    }

    async fn on_unsubscribe(&mut self, id: u64) {
        if self.subscribers.remove(&id).is_none() {
            return;
        }
        if !self.subscribers.is_empty() {
            return;
        }
        // Last subscriber gone: take the link down again.
        match &mut self.state {
            State::Attached { .. } => {
                debug!("Last subscriber removed, detaching: {}", self.address);
                self.teardown().await;
            }
            State::Attaching {
                detach_requested, ..
            } => *detach_requested = true,
            State::Detached | State::Detaching => {}
        }
    }

    async fn on_settle(
        &mut self,
        disposition: Disposition,
        delivery: AmqpDelivery,
        done: oneshot::Sender<Result<MessageOutcome>>,
    ) {
        let State::Attached { receiver, .. } = &self.state else {
            let _ = done.send(Err(LinkError::detached_internal("link is not attached")));
            return;
        };
        let result = match disposition {
            Disposition::Accept => receiver
                .accept(&delivery)
                .await
                .map(|()| MessageOutcome::Completed),
            Disposition::Reject => receiver
                .reject(&delivery)
                .await
                .map(|()| MessageOutcome::Rejected),
            Disposition::Abandon => receiver
                .abandon(&delivery)
                .await
                .map(|()| MessageOutcome::Abandoned),
        };
        let _ = done.send(result);
    }

    fn begin_attach(&mut self, attach_waiters: Vec<oneshot::Sender<Result<()>>>) {
        debug!("Attaching receiver link: {}", self.address);
        self.state = State::Attaching {
            attach_waiters,
            detach_waiters: Vec::new(),
            detach_requested: false,
        };
        let client = Arc::clone(&self.client);
        let address = self.address.clone();
        let options = self.options.clone();
        let commands = self.commands.clone();
        tokio::spawn(async move {
            let mut connection_errors = client.connection_errors();
            let result = match client.create_receiver(&address, options.as_ref()).await {
                Ok(receiver) => Ok(receiver),
                Err(error) => match connection_errors.try_recv() {
                    Ok(cause) => Err(LinkError::not_connected(cause.to_string())),
                    Err(_) => Err(error),
                },
            };
            match commands.upgrade() {
                Some(commands) => {
                    let _ = commands.send(ReceiverCommand::AttachResolved(result));
                }
                None => {
                    if let Ok(receiver) = result {
                        receiver.force_detach().await;
                    }
                }
            }
        });
    }

    async fn on_attach_resolved(&mut self, result: Result<Arc<dyn AmqpReceiver>>) {
        let state = std::mem::replace(&mut self.state, State::Detaching);
        let (attach_waiters, detach_waiters, detach_requested) = match state {
            State::Attaching {
                attach_waiters,
                detach_waiters,
                detach_requested,
            } => (attach_waiters, detach_waiters, detach_requested),
            other => {
                self.state = other;
                debug!("Ignoring stale attach resolution: {}", self.address);
                if let Ok(receiver) = result {
                    receiver.force_detach().await;
                }
                return;
            }
        };

        match result {
            Ok(receiver) if detach_waiters.is_empty() && !detach_requested => {
                let delivery_task = self.spawn_delivery_pump(&receiver);
                let events_task = self.spawn_event_pump(&receiver);
                for waiter in attach_waiters {
                    let _ = waiter.send(Ok(()));
                }
                self.state = State::Attached {
                    receiver,
                    delivery_task,
                    events_task,
                };
                debug!("Receiver link attached: {}", self.address);
            }
            Ok(receiver) => {
                // A detach arrived while the attach was in flight.
                receiver.force_detach().await;
                let error = LinkError::detached_internal("link detached before attach completed");
                for waiter in attach_waiters {
                    let _ = waiter.send(Err(error.clone()));
                }
                for waiter in detach_waiters {
                    let _ = waiter.send(Ok(()));
                }
                self.state = State::Detached;
            }
            Err(error) => {
                warn!("Receiver link attach failed: {}: {}", self.address, error);
                for waiter in attach_waiters {
                    let _ = waiter.send(Err(error.clone()));
                }
                for waiter in detach_waiters {
                    let _ = waiter.send(Ok(()));
                }
                self.state = State::Detached;
            }
        }
    }

    async fn on_delivery(&mut self, delivery: AmqpDelivery) {
        self.stats.lock().await.messages_received += 1;
        self.subscribers
            .retain(|_, subscriber| subscriber.send(delivery.clone()).is_ok());
    }

    async fn on_detach(&mut self, done: oneshot::Sender<Result<()>>) {
        match &mut self.state {
            State::Detached | State::Detaching => {
                let _ = done.send(Ok(()));
            }
            State::Attaching { detach_waiters, .. } => detach_waiters.push(done),
            State::Attached { .. } => {
                self.teardown().await;
                let _ = done.send(Ok(()));
            }
        }
    }

    async fn on_peer_detached(&mut self, cause: Option<LinkError>) {
        if !matches!(self.state, State::Attached { .. }) {
            debug!("Ignoring stale peer detach: {}", self.address);
            return;
        }
        debug!("Receiver link detached by peer: {}", self.address);
        self.teardown().await;
        let _ = self.events.send(LinkEvent::Detached(cause));
    }

    async fn teardown(&mut self) {
        let state = std::mem::replace(&mut self.state, State::Detaching);
        let State::Attached {
            receiver,
            delivery_task,
            events_task,
        } = state
        else {
            self.state = state;
            return;
        };
        delivery_task.abort();
        events_task.abort();
        receiver.force_detach().await;
        debug!("Receiver link detached: {}", self.address);
        self.state = State::Detached;
    }

    fn spawn_delivery_pump(&self, receiver: &Arc<dyn AmqpReceiver>) -> JoinHandle<()> {
        let mut deliveries = receiver.deliveries();
        let commands = self.commands.clone();
        tokio::spawn(async move {
            while let Some(delivery) = deliveries.recv().await {
                let Some(commands) = commands.upgrade() else {
                    break;
                };
                if commands
                    .send(ReceiverCommand::DeliveryReceived(delivery))
                    .is_err()
                {
                    break;
                }
            }
        })
    }

    fn spawn_event_pump(&self, receiver: &Arc<dyn AmqpReceiver>) -> JoinHandle<()> {
        let mut events = receiver.link_events();
        let commands = self.commands.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(commands) = commands.upgrade() else {
                    break;
                };
                let command = match event {
                    LinkEvent::Detached(cause) => ReceiverCommand::PeerDetached(cause),
                    LinkEvent::Error(error) => ReceiverCommand::LinkErrorReceived(error),
                };
                if commands.send(command).is_err() {
                    break;
                }
            }
        })
    }
}
