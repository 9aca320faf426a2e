//! Claims-based-security token refresh over the `$cbs` node
//!
//! `CbsAgent` composes one sender link and one receiver link on `$cbs` and
//! runs the put-token request/response protocol on top of them: requests are
//! correlated by message id, responses may arrive in any order, and a single
//! sweep timer expires requests whose response never came. A late response
//! for an already-expired request is still settled, just no longer reported.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use amqp_link::correlation::correlation_id;
use amqp_link::receiver::MessageSubscription;
use amqp_link::{
    AmqpClient, AmqpMessage, AmqpValue, LinkAddress, LinkError, LinkState, ReceiverLink, SenderLink,
};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::CbsError;

/// Node both CBS links attach to
pub const CBS_ENDPOINT: &str = "$cbs";

const PUT_TOKEN_OPERATION: &str = "put-token";
const PUT_TOKEN_TYPE: &str = "servicebus.windows.net:sastoken";
const CBS_REPLY_TO: &str = "cbs";
const STATUS_CODE_PROPERTY: &str = "status-code";
const STATUS_DESCRIPTION_PROPERTY: &str = "status-description";

/// Timing configuration for the token-refresh protocol
#[derive(Debug, Clone)]
pub struct CbsConfig {
    /// How long a put-token request may wait for its response
    pub put_token_timeout: Duration,
    /// How often expired requests are swept
    pub sweep_interval: Duration,
}

impl Default for CbsConfig {
    fn default() -> Self {
        Self {
            put_token_timeout: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(10),
        }
    }
}

/// Counters for token-refresh outcomes
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct CbsStats {
    /// Tokens the service accepted
    pub tokens_renewed: u64,
    /// Requests refused by the service or never sent
    pub renewals_failed: u64,
    /// Requests that expired without a response
    pub renewals_timed_out: u64,
}

/// A put-token request waiting for its response
///
/// The pending list is ordered by insertion; deadlines are monotone because
/// every request shares the same timeout.
struct PendingPutToken {
    correlation_id: String,
    deadline: Instant,
    done: oneshot::Sender<Result<(), CbsError>>,
}

/// Token-refresh agent over a `$cbs` link pair
pub struct CbsAgent {
    sender: SenderLink,
    receiver: ReceiverLink,
    config: CbsConfig,
    state: Mutex<LinkState>,
    pending: Arc<Mutex<VecDeque<PendingPutToken>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    demux: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<Mutex<CbsStats>>,
}

impl CbsAgent {
    /// Create a detached agent over `client`
    pub fn new(client: Arc<dyn AmqpClient>, config: CbsConfig) -> Self {
        let sender = SenderLink::new(Arc::clone(&client), LinkAddress::new(CBS_ENDPOINT), None);
        let receiver = ReceiverLink::new(client, LinkAddress::new(CBS_ENDPOINT), None);
        Self {
            sender,
            receiver,
            config,
            state: Mutex::new(LinkState::Detached),
            pending: Arc::new(Mutex::new(VecDeque::new())),
            sweeper: Mutex::new(None),
            demux: Mutex::new(None),
            stats: Arc::new(Mutex::new(CbsStats::default())),
        }
    }

    /// Attach both CBS links
    ///
    /// The response demultiplexer is wired up before the agent is declared
    /// attached; on the first link failure the partner link is detached
    /// best-effort and the error is surfaced.
    pub async fn attach(&self) -> Result<(), CbsError> {
        let mut state = self.state.lock().await;
        if *state == LinkState::Attached {
            return Ok(());
        }
        *state = LinkState::Attaching;

        let subscription = match self.receiver.subscribe().await {
            Ok(subscription) => subscription,
            Err(error) => {
                *state = LinkState::Detached;
                return Err(error.into());
            }
        };
        let demux_task = tokio::spawn(Self::demux(
            subscription,
            self.receiver.clone(),
            Arc::clone(&self.pending),
            Arc::clone(&self.stats),
        ));
        if let Some(previous) = self.demux.lock().await.replace(demux_task) {
            previous.abort();
        }

        let (sender_result, receiver_result) =
            tokio::join!(self.sender.attach(), self.receiver.attach());
        let failure = match (sender_result, receiver_result) {
            (Ok(()), Ok(())) => None,
            (Err(error), Ok(())) => {
                if let Err(detach_error) = self.receiver.detach().await {
                    warn!("Error detaching CBS receiver link: {}", detach_error);
                }
                Some(error)
            }
            (Ok(()), Err(error)) => {
                if let Err(detach_error) = self.sender.detach().await {
                    warn!("Error detaching CBS sender link: {}", detach_error);
                }
                Some(error)
            }
            (Err(error), Err(receiver_error)) => {
                debug!("CBS receiver link also failed to attach: {}", receiver_error);
                Some(error)
            }
        };

        if let Some(error) = failure {
            if let Some(task) = self.demux.lock().await.take() {
                task.abort();
            }
            *state = LinkState::Detached;
            return Err(error.into());
        }
        *state = LinkState::Attached;
        info!("CBS links attached");
        Ok(())
    }

    /// Detach both CBS links, failing whatever is still pending
    ///
    /// Detach is best-effort: link errors are logged but the agent still
    /// reaches the detached state.
    pub async fn detach(&self) -> Result<(), CbsError> {
        let mut state = self.state.lock().await;
        if *state == LinkState::Detached {
            return Ok(());
        }
        *state = LinkState::Detaching;

        if let Some(task) = self.demux.lock().await.take() {
            task.abort();
        }
        if let Some(task) = self.sweeper.lock().await.take() {
            task.abort();
        }

        let (sender_result, receiver_result) =
            tokio::join!(self.sender.detach(), self.receiver.detach());
        for result in [sender_result, receiver_result] {
            if let Err(error) = result {
                warn!("Error detaching CBS link: {}", error);
            }
        }

        let drained: Vec<PendingPutToken> = self.pending.lock().await.drain(..).collect();
        for entry in drained {
            let _ = entry.done.send(Err(CbsError::Link(LinkError::detached_internal(
                "cbs links detached",
            ))));
        }

        *state = LinkState::Detached;
        info!("CBS links detached");
        Ok(())
    }

    /// Install `token` for `audience` and wait for the service verdict
    pub async fn put_token(&self, audience: &str, token: &str) -> Result<(), CbsError> {
        if audience.is_empty() {
            return Err(LinkError::missing_argument("audience").into());
        }
        if token.is_empty() {
            return Err(LinkError::missing_argument("token").into());
        }

        let correlation = correlation_id();
        let message = AmqpMessage::new()
            .with_application_property("operation", PUT_TOKEN_OPERATION)
            .with_application_property("type", PUT_TOKEN_TYPE)
            .with_application_property("name", audience)
            .with_message_id(correlation.clone())
            .with_to(CBS_ENDPOINT)
            .with_reply_to(CBS_REPLY_TO)
            .with_text_body(token);

        let (done, result) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.push_back(PendingPutToken {
                correlation_id: correlation.clone(),
                deadline: Instant::now() + self.config.put_token_timeout,
                done,
            });
        }
        self.ensure_sweeper().await;

        debug!("Sending put-token request for audience: {}", audience);
        if let Err(error) = self.sender.send(message).await {
            // The failed request is most likely the newest entry: scan from
            // the tail.
            let mut pending = self.pending.lock().await;
            if let Some(index) = pending
                .iter()
                .rposition(|entry| entry.correlation_id == correlation)
                && let Some(entry) = pending.remove(index)
            {
                self.stats.lock().await.renewals_failed += 1;
                let _ = entry.done.send(Err(CbsError::SendFailed(error)));
            }
        }

        result
            .await
            .map_err(|_| CbsError::Link(LinkError::detached_internal("cbs agent stopped")))?
    }

    /// Number of put-token requests still waiting for a response
    pub async fn pending_renewals(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Snapshot of the token-refresh counters
    pub async fn stats(&self) -> CbsStats {
        self.stats.lock().await.clone()
    }

    /// Start the sweep task unless one is already running
    async fn ensure_sweeper(&self) {
        let mut sweeper = self.sweeper.lock().await;
        if sweeper.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        *sweeper = Some(tokio::spawn(Self::sweep(
            Arc::clone(&self.pending),
            Arc::clone(&self.stats),
            self.config.sweep_interval,
        )));
    }

    /// Periodic expiry sweep; exits once the pending list drains so the
    /// timer is not rearmed while nothing is waiting
    async fn sweep(
        pending: Arc<Mutex<VecDeque<PendingPutToken>>>,
        stats: Arc<Mutex<CbsStats>>,
        period: Duration,
    ) {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            interval.tick().await;
            let mut guard = pending.lock().await;
            let now = Instant::now();
            // Deadlines are monotone: stop at the first unexpired entry.
            while guard
                .front()
                .is_some_and(|entry| entry.deadline <= now)
            {
                if let Some(entry) = guard.pop_front() {
                    warn!(
                        "Put-token request timed out: {}",
                        entry.correlation_id
                    );
                    stats.lock().await.renewals_timed_out += 1;
                    let _ = entry.done.send(Err(CbsError::Timeout));
                }
            }
            if guard.is_empty() {
                break;
            }
        }
    }

    /// Response demultiplexer: matches responses to pending requests by
    /// correlation id and settles every delivery, matched or not
    async fn demux(
        mut subscription: MessageSubscription,
        receiver: ReceiverLink,
        pending: Arc<Mutex<VecDeque<PendingPutToken>>>,
        stats: Arc<Mutex<CbsStats>>,
    ) {
        while let Some(delivery) = subscription.recv().await {
            match delivery.message.properties.correlation_id.clone() {
                Some(correlation) => {
                    let entry = {
                        let mut pending = pending.lock().await;
                        pending
                            .iter()
                            .position(|entry| entry.correlation_id == correlation)
                            .and_then(|index| pending.remove(index))
                    };
                    match entry {
                        Some(entry) => {
                            let verdict = classify_response(&delivery.message);
                            {
                                let mut stats = stats.lock().await;
                                match &verdict {
                                    Ok(()) => stats.tokens_renewed += 1,
                                    Err(_) => stats.renewals_failed += 1,
                                }
                            }
                            let _ = entry.done.send(verdict);
                        }
                        // The response may arrive after the timeout sweep
                        // already gave up on it.
                        None => debug!("No pending put-token for correlation id: {}", correlation),
                    }
                }
                None => debug!("CBS message without a correlation id"),
            }
            if let Err(error) = receiver.accept(delivery).await {
                debug!("Failed to settle CBS response: {}", error);
            }
        }
    }
}

fn classify_response(message: &AmqpMessage) -> Result<(), CbsError> {
    let status = message
        .application_properties
        .get(STATUS_CODE_PROPERTY)
        .and_then(|value| match value {
            AmqpValue::Long(code) => Some(*code),
            _ => None,
        });
    if status == Some(200) {
        Ok(())
    } else {
        let description = message
            .application_properties
            .get(STATUS_DESCRIPTION_PROPERTY)
            .map(|value| value.to_string())
            .unwrap_or_else(|| "put-token request refused".to_string());
        Err(CbsError::Unauthorized(description))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amqp_link::testing::MockAmqpClient;

    #[test]
    fn classify_accepts_only_status_200() {
        let ok = AmqpMessage::new().with_application_property(STATUS_CODE_PROPERTY, 200i64);
        assert!(classify_response(&ok).is_ok());

        let refused = AmqpMessage::new()
            .with_application_property(STATUS_CODE_PROPERTY, 401i64)
            .with_application_property(STATUS_DESCRIPTION_PROPERTY, "bad signature");
        assert_eq!(
            classify_response(&refused),
            Err(CbsError::Unauthorized("bad signature".to_string()))
        );

        let missing = AmqpMessage::new();
        assert!(matches!(
            classify_response(&missing),
            Err(CbsError::Unauthorized(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_exits_once_the_pending_list_drains() {
        let client = Arc::new(MockAmqpClient::new());
        let agent = Arc::new(CbsAgent::new(
            client.clone() as Arc<dyn AmqpClient>,
            CbsConfig::default(),
        ));
        agent.attach().await.unwrap();

        let task = tokio::spawn({
            let agent = Arc::clone(&agent);
            async move { agent.put_token("sr/audience", "token").await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let sent = client.last_sender().await.unwrap().sent().await;
        let correlation = sent[0].properties.message_id.clone().unwrap();
        let response = AmqpMessage::new()
            .with_correlation_id(correlation)
            .with_application_property(STATUS_CODE_PROPERTY, 200i64);
        client.last_receiver().await.unwrap().deliver(response);

        task.await.unwrap().unwrap();
        assert_eq!(agent.pending_renewals().await, 0);

        // Let the sweeper observe the empty list and wind down.
        tokio::time::sleep(agent.config.sweep_interval * 2).await;
        let sweeper = agent.sweeper.lock().await;
        assert!(sweeper.as_ref().is_some_and(|task| task.is_finished()));
    }
}
