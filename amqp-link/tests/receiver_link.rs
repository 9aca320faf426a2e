//! Integration tests for the receiver link state machine

use std::sync::Arc;
use std::time::Duration;

use amqp_link::testing::MockAmqpClient;
use amqp_link::{AmqpMessage, LinkAddress, LinkError, LinkEvent, LinkState, MessageOutcome, ReceiverLink};

fn test_client() -> Arc<MockAmqpClient> {
    Arc::new(MockAmqpClient::new())
}

fn test_link(client: &Arc<MockAmqpClient>) -> ReceiverLink {
    ReceiverLink::new(
        Arc::clone(client) as Arc<dyn amqp_link::AmqpClient>,
        LinkAddress::new("/devices/device-1/messages/devicebound"),
        None,
    )
}

#[tokio::test(start_paused = true)]
async fn first_subscriber_attaches_the_link() {
    let client = test_client();
    let link = test_link(&client);
    assert_eq!(client.receiver_attach_count(), 0);

    let _subscription = link.subscribe().await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    assert_eq!(client.receiver_attach_count(), 1);
    assert_eq!(link.state().await, LinkState::Attached);
}

#[tokio::test(start_paused = true)]
async fn messages_fan_out_to_every_subscriber() {
    let client = test_client();
    let link = test_link(&client);

    let mut first = link.subscribe().await.unwrap();
    let mut second = link.subscribe().await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let receiver = client.last_receiver().await.unwrap();
    receiver.deliver(AmqpMessage::new().with_text_body("payload"));

    let delivery = first.recv().await.unwrap();
    assert_eq!(delivery.message.body.as_text(), Some("payload"));
    let delivery = second.recv().await.unwrap();
    assert_eq!(delivery.message.body.as_text(), Some("payload"));
    assert_eq!(link.stats().await.messages_received, 1);
}

#[tokio::test(start_paused = true)]
async fn dropping_the_last_subscriber_detaches() {
    let client = test_client();
    let link = test_link(&client);

    let first = link.subscribe().await.unwrap();
    let second = link.subscribe().await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(link.state().await, LinkState::Attached);

    drop(first);
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(link.state().await, LinkState::Attached);

    drop(second);
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(link.state().await, LinkState::Detached);
    assert!(client.last_receiver().await.unwrap().is_force_detached());
}

#[tokio::test(start_paused = true)]
async fn dispositions_reach_the_underlying_link() {
    let client = test_client();
    let link = test_link(&client);
    let mut subscription = link.subscribe().await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let receiver = client.last_receiver().await.unwrap();
    receiver.deliver(AmqpMessage::new().with_text_body("a"));
    receiver.deliver(AmqpMessage::new().with_text_body("b"));
    receiver.deliver(AmqpMessage::new().with_text_body("c"));

    let first = subscription.recv().await.unwrap();
    let second = subscription.recv().await.unwrap();
    let third = subscription.recv().await.unwrap();

    assert_eq!(
        link.accept(first.clone()).await.unwrap(),
        MessageOutcome::Completed
    );
    assert_eq!(
        link.reject(second.clone()).await.unwrap(),
        MessageOutcome::Rejected
    );
    assert_eq!(
        link.abandon(third.clone()).await.unwrap(),
        MessageOutcome::Abandoned
    );

    assert_eq!(receiver.accepted().await, vec![first.delivery_tag]);
    assert_eq!(receiver.rejected().await, vec![second.delivery_tag]);
    assert_eq!(receiver.abandoned().await, vec![third.delivery_tag]);
}

#[tokio::test]
async fn dispositions_require_an_attached_link() {
    let client = test_client();
    let link = test_link(&client);

    let delivery = amqp_link::AmqpDelivery {
        delivery_tag: 1,
        message: AmqpMessage::new(),
    };
    let error = link.accept(delivery).await.unwrap_err();
    assert!(matches!(error, LinkError::LinkDetached { .. }));
}

#[tokio::test]
async fn explicit_attach_failure_surfaces_the_error() {
    let client = test_client();
    let fake = LinkError::transport("no such node");
    client.fail_next_receiver_attach(fake.clone()).await;
    let link = test_link(&client);

    assert_eq!(link.attach().await.unwrap_err(), fake);
    assert_eq!(link.state().await, LinkState::Detached);
}

#[tokio::test(start_paused = true)]
async fn peer_detach_tears_down_and_emits_event() {
    let client = test_client();
    let link = test_link(&client);
    let _subscription = link.subscribe().await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let mut events = link.events();

    let cause = LinkError::detached("amqp:link:detach-forced", "server going away");
    client
        .last_receiver()
        .await
        .unwrap()
        .emit_detached(Some(cause.clone()));
    tokio::time::sleep(Duration::from_millis(5)).await;

    assert_eq!(link.state().await, LinkState::Detached);
    assert!(
        matches!(events.try_recv().unwrap(), LinkEvent::Detached(Some(received)) if received == cause)
    );
}

#[tokio::test(start_paused = true)]
async fn unsubscribe_during_attach_takes_the_link_back_down() {
    let client = test_client();
    client.set_attach_delay(Duration::from_millis(50)).await;
    let link = test_link(&client);

    let subscription = link.subscribe().await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(link.state().await, LinkState::Attaching);

    drop(subscription);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(link.state().await, LinkState::Detached);
    assert!(client.last_receiver().await.unwrap().is_force_detached());
}
