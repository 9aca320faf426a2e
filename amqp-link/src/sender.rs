//! Outbound link state machine
//!
//! `SenderLink` wraps one outbound AMQP link. Sends issued before the link is
//! attached are queued and drained in FIFO order once the attach completes;
//! a send issued while detached triggers the attach itself. Every accepted
//! send resolves exactly once, with either the peer's disposition or the
//! error that terminated it (the attach failure when one is recorded).

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Mutex, broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::client::{AmqpClient, AmqpSender, LinkEvent};
use crate::error::{LinkError, Result};
use crate::message::{AmqpMessage, LinkAddress, LinkOptions, MessageOutcome};
use crate::{LinkState, LinkStats};

const EVENT_CHANNEL_CAPACITY: usize = 32;

/// A send waiting for the link to come up or for its disposition
struct QueuedSend {
    message: AmqpMessage,
    done: oneshot::Sender<Result<MessageOutcome>>,
}

enum SenderCommand {
    Attach {
        done: oneshot::Sender<Result<()>>,
    },
    Detach {
        done: oneshot::Sender<Result<()>>,
    },
    Send(QueuedSend),
    State {
        done: oneshot::Sender<LinkState>,
    },
    Stats {
        done: oneshot::Sender<LinkStats>,
    },
    AttachResolved(Result<Arc<dyn AmqpSender>>),
    PeerDetached(Option<LinkError>),
    LinkErrorReceived(LinkError),
}

/// Handle to an outbound link state machine
///
/// Cheap to clone; all clones drive the same state machine. The machine
/// tears the link down when the last handle is dropped.
#[derive(Clone)]
pub struct SenderLink {
    commands: mpsc::UnboundedSender<SenderCommand>,
    events: broadcast::Sender<LinkEvent>,
}

impl SenderLink {
    /// Create a detached sender link for `address`
    pub fn new(
        client: Arc<dyn AmqpClient>,
        address: LinkAddress,
        options: Option<LinkOptions>,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let actor = SenderActor {
            client,
            address,
            options,
            commands: commands.downgrade(),
            events: events.clone(),
            state: State::Detached,
            stats: Arc::new(Mutex::new(LinkStats::default())),
        };
        tokio::spawn(actor.run(command_rx));
        Self { commands, events }
    }

    /// Attach the link, or wait for an attach already in flight
    pub async fn attach(&self) -> Result<()> {
        let (done, result) = oneshot::channel();
        self.command(SenderCommand::Attach { done })?;
        result.await.map_err(|_| machine_stopped())?
    }

    /// Detach the link; a no-op when already detached
    pub async fn detach(&self) -> Result<()> {
        let (done, result) = oneshot::channel();
        self.command(SenderCommand::Detach { done })?;
        result.await.map_err(|_| machine_stopped())?
    }

    /// Queue `message` for delivery and resolve with its disposition
    ///
    /// The message is handed to the state machine before this returns, so
    /// two sequential calls are delivered in call order even when the
    /// returned futures are awaited later or concurrently. A send issued
    /// while detached attaches the link first.
    pub fn send(
        &self,
        message: AmqpMessage,
    ) -> impl Future<Output = Result<MessageOutcome>> + Send + use<> {
        let (done, result) = oneshot::channel();
        let submitted = self.command(SenderCommand::Send(QueuedSend { message, done }));
        async move {
            submitted?;
            result.await.map_err(|_| machine_stopped())?
        }
    }

    /// Subscribe to asynchronous link events (peer detach, link errors)
    pub fn events(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    /// Current lifecycle state
    pub async fn state(&self) -> LinkState {
        let (done, result) = oneshot::channel();
        if self.command(SenderCommand::State { done }).is_err() {
            return LinkState::Detached;
        }
        result.await.unwrap_or(LinkState::Detached)
    }

    /// Snapshot of the link statistics
    pub async fn stats(&self) -> LinkStats {
        let (done, result) = oneshot::channel();
        if self.command(SenderCommand::Stats { done }).is_err() {
            return LinkStats::default();
        }
        result.await.unwrap_or_default()
    }

    fn command(&self, command: SenderCommand) -> Result<()> {
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
        queue: VecDeque<QueuedSend>,
    },
    Attached {
        sender: Arc<dyn AmqpSender>,
        pump: mpsc::UnboundedSender<QueuedSend>,
        pump_stop: oneshot::Sender<()>,
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

struct SenderActor {
    client: Arc<dyn AmqpClient>,
    address: LinkAddress,
    options: Option<LinkOptions>,
    commands: mpsc::WeakUnboundedSender<SenderCommand>,
    events: broadcast::Sender<LinkEvent>,
    state: State,
    stats: Arc<Mutex<LinkStats>>,
}

impl SenderActor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SenderCommand>) {
        while let Some(command) = commands.recv().await {
            self.handle(command).await;
        }
        // The last handle was dropped: tear the link down if it is still up.
        if matches!(self.state, State::Attached { .. }) {
            self.teardown().await;
        }
    }

    async fn handle(&mut self, command: SenderCommand) {
        match command {
            SenderCommand::Attach { done } => self.on_attach(done),
            SenderCommand::Detach { done } => self.on_detach(done).await,
            SenderCommand::Send(send) => self.on_send(send).await,
            SenderCommand::State { done } => {
                let _ = done.send(self.state.name());
            }
            SenderCommand::Stats { done } => {
                let _ = done.send(self.stats.lock().await.clone());
            }
            SenderCommand::AttachResolved(result) => self.on_attach_resolved(result).await,
            SenderCommand::PeerDetached(cause) => self.on_peer_detached(cause).await,
            SenderCommand::LinkErrorReceived(error) => {
                debug!("Sender link error: {}: {}", self.address, error);
                let _ = self.events.send(LinkEvent::Error(error));
            }
        }
    }

    fn on_attach(&mut self, done: oneshot::Sender<Result<()>>) {
        match &mut self.state {
            State::Detached | State::Detaching => {
                self.begin_attach(vec![done], VecDeque::new());
            }
            State::Attaching { attach_waiters, .. } => attach_waiters.push(done),
            State::Attached { .. } => {
                let _ = done.send(Ok(()));
            }
        }
    }

    async fn on_send(&mut self, send: QueuedSend) {
        match &mut self.state {
            State::Detached | State::Detaching => {
                let mut queue = VecDeque::new();
                queue.push_back(send);
                self.begin_attach(Vec::new(), queue);
            }
            State::Attaching { queue, .. } => {
                queue.push_back(send);
                let depth = queue.len();
                let mut stats = self.stats.lock().await;
                if depth > stats.queue_high_water {
                    stats.queue_high_water = depth;
                }
            }
            State::Attached { pump, .. } => {
                if let Err(mpsc::error::SendError(send)) = pump.send(send) {
                    self.stats.lock().await.sends_failed += 1;
                    let _ = send
                        .done
                        .send(Err(LinkError::detached_internal("link detached")));
                }
            }
        }
    }

    fn begin_attach(
        &mut self,
        attach_waiters: Vec<oneshot::Sender<Result<()>>>,
        queue: VecDeque<QueuedSend>,
    ) {
        debug!("Attaching sender link: {}", self.address);
        self.state = State::Attaching {
            attach_waiters,
            detach_waiters: Vec::new(),
            queue,
        };
        let client = Arc::clone(&self.client);
        let address = self.address.clone();
        let options = self.options.clone();
        let commands = self.commands.clone();
        tokio::spawn(async move {
            // One-shot listener on the connection error stream: a connection
            // error captured while the attach is in flight is the real cause.
            let mut connection_errors = client.connection_errors();
            let result = match client.create_sender(&address, options.as_ref()).await {
                Ok(sender) => Ok(sender),
                Err(error) => match connection_errors.try_recv() {
                    Ok(cause) => Err(LinkError::not_connected(cause.to_string())),
                    Err(_) => Err(error),
                },
            };
            match commands.upgrade() {
                Some(commands) => {
                    let _ = commands.send(SenderCommand::AttachResolved(result));
                }
                None => {
                    // Nobody is left to own the link; close it again.
                    if let Ok(sender) = result {
                        sender.force_detach().await;
                    }
                }
            }
        });
    }

    async fn on_attach_resolved(&mut self, result: Result<Arc<dyn AmqpSender>>) {
        let state = std::mem::replace(&mut self.state, State::Detaching);
        let (attach_waiters, detach_waiters, queue) = match state {
            State::Attaching {
                attach_waiters,
                detach_waiters,
                queue,
            } => (attach_waiters, detach_waiters, queue),
            other => {
                self.state = other;
                debug!("Ignoring stale attach resolution: {}", self.address);
                if let Ok(sender) = result {
                    sender.force_detach().await;
                }
                return;
            }
        };

        match result {
            Ok(sender) if detach_waiters.is_empty() => {
                let events_task = self.spawn_event_pump(&sender);
                let (pump, pump_stop) =
                    spawn_send_pump(Arc::clone(&sender), Arc::clone(&self.stats));
                // Drain the queue in submission order before any new input.
                for queued in queue {
                    if let Err(mpsc::error::SendError(queued)) = pump.send(queued) {
                        let _ = queued
                            .done
                            .send(Err(LinkError::detached_internal("link detached")));
                    }
                }
                for waiter in attach_waiters {
                    let _ = waiter.send(Ok(()));
                }
                self.state = State::Attached {
                    sender,
                    pump,
                    pump_stop,
                    events_task,
                };
                debug!("Sender link attached: {}", self.address);
            }
            Ok(sender) => {
                // A detach arrived while the attach was in flight.
                sender.force_detach().await;
                let error = LinkError::detached_internal("link detached before attach completed");
                for waiter in attach_waiters {
                    let _ = waiter.send(Err(error.clone()));
                }
                for waiter in detach_waiters {
                    let _ = waiter.send(Ok(()));
                }
                self.enter_detached(None, queue).await;
            }
            Err(error) => {
                warn!("Sender link attach failed: {}: {}", self.address, error);
                for waiter in attach_waiters {
                    let _ = waiter.send(Err(error.clone()));
                }
                for waiter in detach_waiters {
                    let _ = waiter.send(Ok(()));
                }
                self.enter_detached(Some(error), queue).await;
            }
        }
    }

    /// Enter `Detached`, failing every queued request with the attach error
    /// when one is recorded, in FIFO order.
    async fn enter_detached(&mut self, attach_error: Option<LinkError>, queue: VecDeque<QueuedSend>) {
        let cause =
            attach_error.unwrap_or_else(|| LinkError::detached_internal("link detached"));
        let failed = queue.len() as u64;
        for queued in queue {
            let _ = queued.done.send(Err(cause.clone()));
        }
        if failed > 0 {
            self.stats.lock().await.sends_failed += failed;
        }
        self.state = State::Detached;
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
        debug!("Sender link detached by peer: {}", self.address);
        self.teardown().await;
        let _ = self.events.send(LinkEvent::Detached(cause));
    }

    async fn teardown(&mut self) {
        let state = std::mem::replace(&mut self.state, State::Detaching);
        let State::Attached {
            sender,
            pump,
            pump_stop,
            events_task,
        } = state
        else {
            self.state = state;
            return;
        };
        events_task.abort();
        let _ = pump_stop.send(());
        drop(pump);
        sender.force_detach().await;
        debug!("Sender link detached: {}", self.address);
        self.state = State::Detached;
    }

    fn spawn_event_pump(&self, sender: &Arc<dyn AmqpSender>) -> JoinHandle<()> {
        let mut events = sender.link_events();
        let commands = self.commands.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(commands) = commands.upgrade() else {
                    break;
                };
                let command = match event {
                    LinkEvent::Detached(cause) => SenderCommand::PeerDetached(cause),
                    LinkEvent::Error(error) => SenderCommand::LinkErrorReceived(error),
                };
                if commands.send(command).is_err() {
                    break;
                }
            }
        })
    }
}

/// Delivery pump for an attached link: hands sends to the AMQP sender one at
/// a time so submission order is preserved, and fails whatever is still
/// queued when the link detaches.
fn spawn_send_pump(
    sender: Arc<dyn AmqpSender>,
    stats: Arc<Mutex<LinkStats>>,
) -> (mpsc::UnboundedSender<QueuedSend>, oneshot::Sender<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<QueuedSend>();
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = &mut stop_rx => break,
                next = rx.recv() => {
                    let Some(QueuedSend { message, done }) = next else {
                        return;
                    };
                    let result = sender.send(message).await;
                    {
                        let mut stats = stats.lock().await;
                        match &result {
                            Ok(()) => stats.messages_sent += 1,
                            Err(_) => stats.sends_failed += 1,
                        }
                    }
                    let _ = done.send(result.map(|()| MessageOutcome::Enqueued));
                }
            }
        }
        // Detach requested: fail whatever is still queued.
        rx.close();
        while let Ok(QueuedSend { done, .. }) = rx.try_recv() {
            stats.lock().await.sends_failed += 1;
            let _ = done.send(Err(LinkError::detached_internal("link detached")));
        }
    });
    (tx, stop_tx)
}
