//! Integration tests for the sender link state machine

use std::sync::Arc;
use std::time::Duration;

use amqp_link::testing::MockAmqpClient;
use amqp_link::{
    AmqpMessage, LinkAddress, LinkError, LinkEvent, LinkState, MessageOutcome, SenderLink,
};

fn test_client() -> Arc<MockAmqpClient> {
    Arc::new(MockAmqpClient::new())
}

fn test_link(client: &Arc<MockAmqpClient>) -> SenderLink {
    SenderLink::new(
        Arc::clone(client) as Arc<dyn amqp_link::AmqpClient>,
        LinkAddress::new("/devices/device-1/messages/events"),
        None,
    )
}

fn text_message(body: &str) -> AmqpMessage {
    AmqpMessage::new().with_text_body(body)
}

#[tokio::test(start_paused = true)]
async fn send_before_attach_drains_in_order() {
    let client = test_client();
    client.set_attach_delay(Duration::from_millis(50)).await;
    let link = test_link(&client);

    let first = link.send(text_message("m1"));
    let second = link.send(text_message("m2"));

    let order = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    let first_task = tokio::spawn({
        let order = Arc::clone(&order);
        async move {
            let outcome = first.await.expect("first send should succeed");
            order.lock().await.push(1);
            outcome
        }
    });
    let second_task = tokio::spawn({
        let order = Arc::clone(&order);
        async move {
            let outcome = second.await.expect("second send should succeed");
            order.lock().await.push(2);
            outcome
        }
    });

    assert_eq!(first_task.await.unwrap(), MessageOutcome::Enqueued);
    assert_eq!(second_task.await.unwrap(), MessageOutcome::Enqueued);
    assert_eq!(*order.lock().await, vec![1, 2]);

    // One attach serves both queued sends.
    assert_eq!(client.sender_attach_count(), 1);
    let sender = client.last_sender().await.unwrap();
    let sent = sender.sent().await;
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].body.as_text(), Some("m1"));
    assert_eq!(sent[1].body.as_text(), Some("m2"));
    assert_eq!(link.state().await, LinkState::Attached);
}

#[tokio::test(start_paused = true)]
async fn attach_failure_fails_every_queued_send() {
    let client = test_client();
    client.set_attach_delay(Duration::from_millis(20)).await;
    let fake = LinkError::transport("fake attach failure");
    client.fail_next_sender_attach(fake.clone()).await;
    let link = test_link(&client);

    let first = link.send(text_message("m1"));
    let second = link.send(text_message("m2"));

    assert_eq!(first.await.unwrap_err(), fake);
    assert_eq!(second.await.unwrap_err(), fake);
    assert_eq!(link.state().await, LinkState::Detached);
    assert_eq!(client.sender_attach_count(), 1);
    assert_eq!(link.stats().await.sends_failed, 2);
}

#[tokio::test]
async fn explicit_attach_then_send() {
    let client = test_client();
    let link = test_link(&client);

    link.attach().await.unwrap();
    assert_eq!(link.state().await, LinkState::Attached);

    let outcome = link.send(text_message("hello")).await.unwrap();
    assert_eq!(outcome, MessageOutcome::Enqueued);
    assert_eq!(link.stats().await.messages_sent, 1);
}

#[tokio::test]
async fn detach_without_attach_is_a_noop() {
    let client = test_client();
    let link = test_link(&client);

    link.detach().await.unwrap();
    assert_eq!(client.sender_attach_count(), 0);
    assert_eq!(link.state().await, LinkState::Detached);
}

#[tokio::test]
async fn attach_is_idempotent_once_attached() {
    let client = test_client();
    let link = test_link(&client);

    link.attach().await.unwrap();
    link.attach().await.unwrap();
    assert_eq!(client.sender_attach_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn peer_detach_tears_down_and_emits_event() {
    let client = test_client();
    let link = test_link(&client);
    link.attach().await.unwrap();
    let mut events = link.events();

    let sender = client.last_sender().await.unwrap();
    sender.emit_detached(None);
    tokio::time::sleep(Duration::from_millis(5)).await;

    assert_eq!(link.state().await, LinkState::Detached);
    assert!(sender.is_force_detached());
    assert!(matches!(
        events.try_recv().unwrap(),
        LinkEvent::Detached(None)
    ));
}

#[tokio::test(start_paused = true)]
async fn link_error_is_reemitted() {
    let client = test_client();
    let link = test_link(&client);
    link.attach().await.unwrap();
    let mut events = link.events();

    let sender = client.last_sender().await.unwrap();
    sender.emit_error(LinkError::transport("credit exhausted"));
    tokio::time::sleep(Duration::from_millis(5)).await;

    let event = events.try_recv().unwrap();
    assert!(
        matches!(event, LinkEvent::Error(LinkError::Transport(ref msg)) if msg == "credit exhausted")
    );
    // A bare error does not take the link down.
    assert_eq!(link.state().await, LinkState::Attached);
}

#[tokio::test(start_paused = true)]
async fn send_after_peer_detach_reattaches() {
    let client = test_client();
    let link = test_link(&client);
    link.attach().await.unwrap();

    client.last_sender().await.unwrap().emit_detached(None);
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(link.state().await, LinkState::Detached);

    let outcome = link.send(text_message("again")).await.unwrap();
    assert_eq!(outcome, MessageOutcome::Enqueued);
    assert_eq!(client.sender_attach_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn detach_during_attach_fails_queued_sends() {
    let client = test_client();
    client.set_attach_delay(Duration::from_millis(50)).await;
    let link = test_link(&client);

    let pending = link.send(text_message("m1"));
    let detach_link = link.clone();
    let detach_task = tokio::spawn(async move { detach_link.detach().await });

    let send_error = pending.await.unwrap_err();
    assert!(matches!(send_error, LinkError::LinkDetached { .. }));
    detach_task.await.unwrap().unwrap();
    assert_eq!(link.state().await, LinkState::Detached);
    assert!(client.last_sender().await.unwrap().is_force_detached());
}

#[tokio::test]
async fn rejected_send_reports_the_error() {
    let client = test_client();
    let link = test_link(&client);
    link.attach().await.unwrap();

    let rejection = LinkError::transport("delivery rejected");
    client
        .last_sender()
        .await
        .unwrap()
        .fail_next_send(rejection.clone())
        .await;

    assert_eq!(link.send(text_message("nope")).await.unwrap_err(), rejection);
    let stats = link.stats().await;
    assert_eq!(stats.sends_failed, 1);
    assert_eq!(stats.messages_sent, 0);
}

#[tokio::test(start_paused = true)]
async fn connection_error_during_attach_becomes_the_cause() {
    let client = test_client();
    client.set_attach_delay(Duration::from_millis(20)).await;
    client
        .fail_next_sender_attach(LinkError::transport("attach refused"))
        .await;
    let link = test_link(&client);

    let pending = link.send(text_message("m1"));
    tokio::time::sleep(Duration::from_millis(5)).await;
    client.push_connection_error(LinkError::transport("socket closed"));

    let error = pending.await.unwrap_err();
    assert!(matches!(error, LinkError::NotConnected(ref msg) if msg.contains("socket closed")));
}
