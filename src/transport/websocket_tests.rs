use super::{connect, serve};
use crate::broker::{AckKind, Broker, MessageHeader, OutgoingMessage, TargetKind, TopicConfig};
use crate::utils::BrokerError;
use serde_json::{Value, json};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

async fn start_server() -> (String, Arc<Broker>) {
    let broker = Arc::new(Broker::temporary().unwrap());
    broker.create_topic(TopicConfig::new("chat")).await.unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve(listener, broker.clone(), 16));
    (format!("ws://{addr}/ca/connect"), broker)
}

async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(10), future)
        .await
        .expect("timed out")
}

#[tokio::test]
async fn test_remote_send_and_processed_ack() {
    let (url, _broker) = start_server().await;
    let receiver = within(connect(&url)).await.unwrap();
    let sender = within(connect(&url)).await.unwrap();
    assert_ne!(receiver.id(), sender.id());

    let mut endpoint = within(receiver.create_endpoint("chat", ["room"]))
        .await
        .unwrap();
    let consumer = tokio::spawn(async move {
        let received = endpoint.next().await.unwrap();
        let body: Value = received.json().unwrap();
        received.processed().unwrap();
        body
    });

    let message = OutgoingMessage::json(
        &json!({ "text": "hello" }),
        MessageHeader::new("chat", ["room/42"], TargetKind::Online).ack_kind(AckKind::Processed),
    )
    .unwrap();
    let report = within(sender.send_message(message)).await.unwrap();
    assert_eq!(report.matched.len(), 1);
    assert_eq!(within(consumer).await.unwrap(), json!({ "text": "hello" }));
}

#[tokio::test]
async fn test_remote_errors_cross_the_wire() {
    let (url, _broker) = start_server().await;
    let node = within(connect(&url)).await.unwrap();

    let err = within(node.create_endpoint("missing", ["s"]))
        .await
        .unwrap_err();
    assert_eq!(err, BrokerError::NotFound("topic missing".to_string()));

    let err = within(node.send_message(OutgoingMessage::new(
        "x",
        MessageHeader::new("chat", ["nobody"], TargetKind::Push),
    )))
    .await
    .unwrap_err();
    assert_eq!(err, BrokerError::NoReceiver("chat".to_string()));
}

#[tokio::test]
async fn test_explicit_node_id_and_conflict() {
    let (url, broker) = start_server().await;
    let node = within(connect(&format!("{url}?node_id=alpha")))
        .await
        .unwrap();
    assert_eq!(node.id(), "alpha");
    assert!(broker.is_node_online("alpha"));

    assert!(within(connect(&format!("{url}?node_id=alpha"))).await.is_err());

    let stray = within(connect(&url.replace("/ca/connect", "/elsewhere"))).await;
    assert!(stray.is_err());
}

#[tokio::test]
async fn test_durable_message_reaches_late_remote_endpoint() {
    let (url, _broker) = start_server().await;
    let sender = within(connect(&url)).await.unwrap();
    let report = within(sender.send_message(OutgoingMessage::new(
        "stored",
        MessageHeader::new("chat", ["inbox"], TargetKind::Durable),
    )))
    .await
    .unwrap();
    assert!(report.matched.is_empty());

    let receiver = within(connect(&url)).await.unwrap();
    let mut endpoint = within(receiver.create_endpoint("chat", ["inbox"]))
        .await
        .unwrap();
    let received = within(endpoint.next()).await.unwrap();
    assert_eq!(received.payload(), "stored");
}

#[tokio::test]
async fn test_close_ends_session_and_streams() {
    let (url, broker) = start_server().await;
    let node = within(connect(&url)).await.unwrap();
    let mut endpoint = within(node.create_endpoint("chat", ["s"])).await.unwrap();
    assert_eq!(broker.node_count(), 1);

    within(node.close()).await;
    assert!(within(endpoint.next()).await.is_none());
    assert_eq!(broker.node_count(), 0);
    assert_eq!(broker.endpoint_count("chat").unwrap(), 0);
}

#[tokio::test]
async fn test_remote_stream_ends_when_topic_is_deleted() {
    let (url, broker) = start_server().await;
    broker.create_topic(TopicConfig::new("gone")).await.unwrap();
    let node = within(connect(&url)).await.unwrap();
    let mut endpoint = within(node.create_endpoint("gone", ["s"])).await.unwrap();

    broker.delete_topic("gone").unwrap();
    assert!(within(endpoint.next()).await.is_none());
}
