//! Integration tests for the CBS token-refresh agent

use std::sync::Arc;
use std::time::Duration;

use amqp_link::testing::MockAmqpClient;
use amqp_link::{AmqpClient, AmqpMessage, AmqpValue, LinkError};
use iothub_amqp::{CbsAgent, CbsConfig, CbsError};

fn test_agent() -> (Arc<MockAmqpClient>, Arc<CbsAgent>) {
    let client = Arc::new(MockAmqpClient::new());
    let agent = Arc::new(CbsAgent::new(
        Arc::clone(&client) as Arc<dyn AmqpClient>,
        CbsConfig::default(),
    ));
    (client, agent)
}

fn response(correlation: &str, status: i64) -> AmqpMessage {
    AmqpMessage::new()
        .with_correlation_id(correlation)
        .with_application_property("status-code", status)
}

#[tokio::test]
async fn attach_opens_both_links_on_the_cbs_node() {
    let (client, agent) = test_agent();
    agent.attach().await.unwrap();

    assert_eq!(client.sender_attach_count(), 1);
    assert_eq!(client.receiver_attach_count(), 1);
    assert_eq!(
        client.last_sender().await.unwrap().address().as_str(),
        "$cbs"
    );
    assert_eq!(
        client.last_receiver().await.unwrap().address().as_str(),
        "$cbs"
    );
    // CBS links carry no custom attach options.
    assert!(client.last_sender().await.unwrap().options().is_none());
    assert!(client.last_receiver().await.unwrap().options().is_none());
}

#[tokio::test(start_paused = true)]
async fn put_token_happy_path() {
    let (client, agent) = test_agent();
    agent.attach().await.unwrap();

    let task = tokio::spawn({
        let agent = Arc::clone(&agent);
        async move { agent.put_token("myhub/devices/device-1", "sas-token").await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let sent = client.last_sender().await.unwrap().sent().await;
    assert_eq!(sent.len(), 1);
    let request = &sent[0];
    assert_eq!(
        request.application_properties.get("operation"),
        Some(&AmqpValue::String("put-token".to_string()))
    );
    assert_eq!(
        request.application_properties.get("type"),
        Some(&AmqpValue::String(
            "servicebus.windows.net:sastoken".to_string()
        ))
    );
    assert_eq!(
        request.application_properties.get("name"),
        Some(&AmqpValue::String("myhub/devices/device-1".to_string()))
    );
    assert_eq!(request.properties.to.as_deref(), Some("$cbs"));
    assert_eq!(request.properties.reply_to.as_deref(), Some("cbs"));
    assert_eq!(request.body.as_text(), Some("sas-token"));
    let correlation = request.properties.message_id.clone().unwrap();

    let receiver = client.last_receiver().await.unwrap();
    receiver.deliver(response(&correlation, 200));

    task.await.unwrap().unwrap();
    assert_eq!(agent.pending_renewals().await, 0);
    assert_eq!(receiver.accepted().await.len(), 1);
    assert_eq!(agent.stats().await.tokens_renewed, 1);

    // With the list drained no further sweep fires.
    tokio::time::advance(Duration::from_secs(130)).await;
    assert_eq!(agent.stats().await.renewals_timed_out, 0);
}

#[tokio::test(start_paused = true)]
async fn put_token_times_out_and_still_settles_a_late_response() {
    let (client, agent) = test_agent();
    agent.attach().await.unwrap();

    let task = tokio::spawn({
        let agent = Arc::clone(&agent);
        async move { agent.put_token("myhub/devices/device-1", "sas-token").await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    tokio::time::advance(Duration::from_secs(121)).await;
    assert_eq!(task.await.unwrap(), Err(CbsError::Timeout));
    assert_eq!(agent.pending_renewals().await, 0);
    assert_eq!(agent.stats().await.renewals_timed_out, 1);

    // The response shows up late: no second callback, but the delivery is
    // still settled.
    let correlation = client.last_sender().await.unwrap().sent().await[0]
        .properties
        .message_id
        .clone()
        .unwrap();
    let receiver = client.last_receiver().await.unwrap();
    receiver.deliver(response(&correlation, 200));
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(receiver.accepted().await.len(), 1);
    assert_eq!(agent.stats().await.tokens_renewed, 0);
}

#[tokio::test(start_paused = true)]
async fn put_token_unauthorized_carries_the_description() {
    let (client, agent) = test_agent();
    agent.attach().await.unwrap();

    let task = tokio::spawn({
        let agent = Arc::clone(&agent);
        async move { agent.put_token("myhub/devices/device-1", "sas-token").await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let correlation = client.last_sender().await.unwrap().sent().await[0]
        .properties
        .message_id
        .clone()
        .unwrap();
    let rejection = response(&correlation, 401)
        .with_application_property("status-description", "signature expired");
    client.last_receiver().await.unwrap().deliver(rejection);

    assert_eq!(
        task.await.unwrap(),
        Err(CbsError::Unauthorized("signature expired".to_string()))
    );
    assert_eq!(agent.stats().await.renewals_failed, 1);
}

#[tokio::test(start_paused = true)]
async fn put_token_send_failure_fails_fast() {
    let (client, agent) = test_agent();
    agent.attach().await.unwrap();

    client
        .last_sender()
        .await
        .unwrap()
        .fail_next_send(LinkError::transport("link gone"))
        .await;

    let error = agent
        .put_token("myhub/devices/device-1", "sas-token")
        .await
        .unwrap_err();
    assert!(matches!(error, CbsError::SendFailed(_)));
    assert_eq!(agent.pending_renewals().await, 0);
}

#[tokio::test]
async fn attach_failure_detaches_the_partner_link() {
    let (client, agent) = test_agent();
    let fake = LinkError::transport("sender refused");
    client.fail_next_sender_attach(fake.clone()).await;

    let error = agent.attach().await.unwrap_err();
    assert_eq!(error, CbsError::Link(fake));

    // The receiver came up and was taken back down best-effort.
    assert!(client.last_receiver().await.unwrap().is_force_detached());
}

#[tokio::test]
async fn put_token_rejects_empty_arguments() {
    let (_client, agent) = test_agent();
    assert!(matches!(
        agent.put_token("", "token").await.unwrap_err(),
        CbsError::Link(LinkError::MissingArgument(_))
    ));
    assert!(matches!(
        agent.put_token("audience", "").await.unwrap_err(),
        CbsError::Link(LinkError::MissingArgument(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn detach_fails_outstanding_renewals() {
    let (client, agent) = test_agent();
    agent.attach().await.unwrap();

    let task = tokio::spawn({
        let agent = Arc::clone(&agent);
        async move { agent.put_token("myhub/devices/device-1", "sas-token").await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(agent.pending_renewals().await, 1);

    agent.detach().await.unwrap();
    assert!(matches!(
        task.await.unwrap(),
        Err(CbsError::Link(LinkError::LinkDetached { .. }))
    ));
    assert_eq!(agent.pending_renewals().await, 0);
    assert!(client.last_sender().await.unwrap().is_force_detached());
    assert!(client.last_receiver().await.unwrap().is_force_detached());
}
