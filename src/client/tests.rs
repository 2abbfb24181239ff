use super::Node;
use crate::broker::{AckKind, Broker, MessageHeader, OutgoingMessage, TargetKind, TopicConfig};
use crate::utils::BrokerError;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Greeting {
    text: String,
    seq: u32,
}

async fn broker() -> Arc<Broker> {
    let broker = Arc::new(Broker::temporary().unwrap());
    broker.create_topic(TopicConfig::new("greetings")).await.unwrap();
    broker
}

#[tokio::test]
async fn test_connect_assigns_unique_ids() {
    let broker = broker().await;
    let a = Node::connect(broker.clone()).unwrap();
    let b = Node::connect(broker.clone()).unwrap();
    assert_ne!(a.id(), b.id());
    assert_eq!(broker.node_count(), 2);

    let err = Node::connect_with_id(broker.clone(), a.id()).unwrap_err();
    assert!(matches!(err, BrokerError::AlreadyExists(_)));

    drop(a);
    b.close();
    assert_eq!(broker.node_count(), 0);
}

#[tokio::test]
async fn test_send_json_and_ack_through_endpoint() {
    let broker = broker().await;
    let sender = Node::connect(broker.clone()).unwrap();
    let receiver = Node::connect(broker.clone()).unwrap();
    let mut endpoint = receiver.create_endpoint("greetings", ["hello"]).unwrap();

    let message = OutgoingMessage::json(
        &Greeting {
            text: "hi".to_string(),
            seq: 1,
        },
        MessageHeader::new("greetings", ["hello/world"], TargetKind::Online)
            .ack_kind(AckKind::Processed),
    )
    .unwrap();

    let consumer = tokio::spawn(async move {
        let received = endpoint.next().await.unwrap();
        let greeting: Greeting = received.json().unwrap();
        assert_eq!(received.attempt(), 1);
        received.received().unwrap();
        received.processed().unwrap();
        greeting
    });

    let report = sender.send_message(message).await.unwrap();
    assert_eq!(report.matched.len(), 1);
    assert_eq!(
        consumer.await.unwrap(),
        Greeting {
            text: "hi".to_string(),
            seq: 1
        }
    );
}

#[tokio::test]
async fn test_failed_ack_triggers_redelivery() {
    let broker = broker().await;
    let sender = Node::connect(broker.clone()).unwrap();
    let receiver = Node::connect(broker.clone()).unwrap();
    let mut endpoint = receiver.create_endpoint("greetings", ["retry"]).unwrap();

    let pending = broker
        .submit(
            sender.id(),
            OutgoingMessage::new(
                "again",
                MessageHeader::new("greetings", ["retry"], TargetKind::Online)
                    .ack_kind(AckKind::Received),
            ),
        )
        .unwrap();

    let first = endpoint.next().await.unwrap();
    first.failed().unwrap();
    let second = endpoint.next().await.unwrap();
    assert_eq!(second.attempt(), 2);
    assert_eq!(second.payload(), "again");
    second.received().unwrap();

    pending.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_endpoint_stream_ends_on_close() {
    let broker = broker().await;
    let sender = Node::connect(broker.clone()).unwrap();
    let receiver = Node::connect(broker.clone()).unwrap();
    let endpoint = receiver.create_endpoint("greetings", ["s"]).unwrap();
    let endpoint_id = endpoint.id();
    assert_eq!(endpoint.topic(), "greetings");

    for i in 0..3 {
        sender
            .send_message(OutgoingMessage::new(
                i.to_string(),
                MessageHeader::new("greetings", ["s"], TargetKind::Online),
            ))
            .await
            .unwrap();
    }

    let stream = endpoint.messages();
    let payloads: Vec<String> = stream
        .take(3)
        .map(|m| String::from_utf8_lossy(m.payload()).into_owned())
        .collect()
        .await;
    assert_eq!(payloads, vec!["0", "1", "2"]);

    // the stream was dropped after three items, which closed the endpoint
    assert_eq!(broker.endpoint_count("greetings").unwrap(), 0);
    assert!(broker.detach(endpoint_id).is_err());
}

#[tokio::test]
async fn test_dropping_node_detaches_its_endpoints() {
    let broker = broker().await;
    let receiver = Node::connect(broker.clone()).unwrap();
    let mut endpoint = receiver.create_endpoint("greetings", ["s"]).unwrap();
    assert_eq!(broker.endpoint_count("greetings").unwrap(), 1);

    drop(receiver);
    assert!(endpoint.next().await.is_none());
    assert_eq!(broker.endpoint_count("greetings").unwrap(), 0);
    endpoint.close().unwrap_err();
}
