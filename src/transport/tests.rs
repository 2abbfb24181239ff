use super::message::{ClientMessage, ServerMessage};
use super::websocket::{Connection, node_id_from_uri};
use crate::broker::{Broker, DeliveryState, EndpointId, MessageId, TopicConfig};
use crate::utils::BrokerError;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tungstenite::http::Uri;

async fn broker() -> Arc<Broker> {
    let broker = Arc::new(Broker::temporary().unwrap());
    broker.create_topic(TopicConfig::new("chat")).await.unwrap();
    broker
}

fn connection(broker: &Arc<Broker>, node_id: &str) -> (Connection, mpsc::UnboundedReceiver<ServerMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let connection = Connection::open(broker.clone(), node_id.to_string(), tx).unwrap();
    (connection, rx)
}

async fn next(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> ServerMessage {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a server message")
        .expect("outbound channel closed")
}

#[test]
fn test_node_id_from_uri() {
    let uri: Uri = "/ca/connect?node_id=alpha".parse().unwrap();
    assert_eq!(node_id_from_uri(&uri), Some("alpha".to_string()));

    let uri: Uri = "/ca/connect?other=1&node_id=b%20c".parse().unwrap();
    assert_eq!(node_id_from_uri(&uri), Some("b c".to_string()));

    let uri: Uri = "/ca/connect?node_id=".parse().unwrap();
    assert_eq!(node_id_from_uri(&uri), None);

    let uri: Uri = "/ca/connect".parse().unwrap();
    assert_eq!(node_id_from_uri(&uri), None);
}

#[test]
fn test_client_message_wire_shape() {
    let msg: ClientMessage = serde_json::from_value(json!({
        "type": "ack",
        "topic": "chat",
        "message_id": 4,
        "endpoint_id": 2,
        "state": "processed"
    }))
    .unwrap();
    assert_eq!(
        msg,
        ClientMessage::Ack {
            topic: "chat".to_string(),
            message_id: MessageId(4),
            endpoint_id: EndpointId(2),
            state: DeliveryState::Processed,
        }
    );
}

#[test]
fn test_error_frame_wire_shape() {
    let frame = ServerMessage::Error {
        request_id: Some(3),
        error: BrokerError::NoReceiver("chat".to_string()),
    };
    assert_eq!(
        serde_json::to_value(&frame).unwrap(),
        json!({
            "type": "error",
            "request_id": 3,
            "error": { "kind": "no_receiver", "detail": "chat" }
        })
    );
    assert_eq!(frame.request_id(), Some(3));
}

#[tokio::test]
async fn test_handle_create_endpoint_and_send() {
    let broker = broker().await;
    let (mut receiver, mut receiver_rx) = connection(&broker, "receiver");
    let (mut sender, mut sender_rx) = connection(&broker, "sender");

    receiver.handle_text(
        &json!({
            "type": "create_endpoint",
            "request_id": 1,
            "topic": "chat",
            "subjects": ["room"]
        })
        .to_string(),
    );
    let endpoint_id = match next(&mut receiver_rx).await {
        ServerMessage::EndpointCreated {
            request_id: 1,
            endpoint_id,
        } => endpoint_id,
        other => panic!("unexpected reply: {other:?}"),
    };

    sender.handle_text(
        &json!({
            "type": "send",
            "request_id": 2,
            "message": {
                "header": {
                    "topic": "chat",
                    "subjects": ["room/1"],
                    "target_kind": "online",
                    "ack_kind": "received"
                },
                "payload": "hello"
            }
        })
        .to_string(),
    );

    let message_id = match next(&mut receiver_rx).await {
        ServerMessage::Delivery {
            endpoint_id: delivered_to,
            attempt,
            message,
        } => {
            assert_eq!(delivered_to, endpoint_id);
            assert_eq!(attempt, 1);
            assert_eq!(message.payload, "hello");
            message.id
        }
        other => panic!("unexpected frame: {other:?}"),
    };

    receiver.handle(ClientMessage::Ack {
        topic: "chat".to_string(),
        message_id,
        endpoint_id,
        state: DeliveryState::Received,
    });
    match next(&mut sender_rx).await {
        ServerMessage::SendResult { request_id, report } => {
            assert_eq!(request_id, 2);
            assert_eq!(report.matched, vec![endpoint_id]);
            assert_eq!(report.states[&endpoint_id], DeliveryState::Received);
        }
        other => panic!("unexpected reply: {other:?}"),
    }
}

#[tokio::test]
async fn test_handle_reports_errors() {
    let broker = broker().await;
    let (mut conn, mut rx) = connection(&broker, "n1");

    conn.handle_text("{not json");
    assert!(matches!(
        next(&mut rx).await,
        ServerMessage::Error {
            request_id: None,
            error: BrokerError::Codec(_)
        }
    ));

    conn.handle(ClientMessage::CreateEndpoint {
        request_id: 7,
        topic: "missing".to_string(),
        subjects: vec!["s".to_string()],
    });
    assert_eq!(
        next(&mut rx).await,
        ServerMessage::Error {
            request_id: Some(7),
            error: BrokerError::NotFound("topic missing".to_string()),
        }
    );
}

#[tokio::test]
async fn test_ack_for_foreign_endpoint_is_ignored() {
    let broker = broker().await;
    let (mut owner, mut owner_rx) = connection(&broker, "owner");
    let (mut intruder, _intruder_rx) = connection(&broker, "intruder");

    owner.handle(ClientMessage::CreateEndpoint {
        request_id: 1,
        topic: "chat".to_string(),
        subjects: vec!["s".to_string()],
    });
    let ServerMessage::EndpointCreated { endpoint_id, .. } = next(&mut owner_rx).await else {
        panic!("endpoint not created");
    };

    let waiting = broker
        .submit(
            "intruder",
            crate::broker::OutgoingMessage::new(
                "x",
                crate::broker::MessageHeader::new("chat", ["s"], crate::broker::TargetKind::Online)
                    .ack_kind(crate::broker::AckKind::Received),
            ),
        )
        .unwrap();
    let ServerMessage::Delivery { message, .. } = next(&mut owner_rx).await else {
        panic!("no delivery");
    };

    intruder.handle(ClientMessage::Ack {
        topic: "chat".to_string(),
        message_id: message.id,
        endpoint_id,
        state: DeliveryState::Received,
    });
    let records = broker.delivery_records("chat", message.id).unwrap().unwrap();
    assert_eq!(records[&endpoint_id].state, DeliveryState::Sent);

    owner.close();
    assert!(matches!(
        waiting.await.unwrap(),
        Err(BrokerError::DeliveryFailed { undelivered: 1, .. })
    ));
}

#[tokio::test]
async fn test_duplicate_node_id_is_rejected() {
    let broker = broker().await;
    let (_first, _rx) = connection(&broker, "dup");
    let (tx, _rx2) = mpsc::unbounded_channel();
    let err = Connection::open(broker.clone(), "dup".to_string(), tx).err();
    assert_eq!(err, Some(BrokerError::AlreadyExists("node dup".to_string())));
}

#[tokio::test]
async fn test_detached_endpoint_is_announced_and_forgotten() {
    let broker = broker().await;
    broker.create_topic(TopicConfig::new("gone")).await.unwrap();
    let (mut conn, mut rx) = connection(&broker, "n1");

    conn.handle(ClientMessage::CreateEndpoint {
        request_id: 1,
        topic: "gone".to_string(),
        subjects: vec!["s".to_string()],
    });
    let ServerMessage::EndpointCreated { endpoint_id, .. } = next(&mut rx).await else {
        panic!("endpoint not created");
    };
    assert_eq!(conn.open_endpoints(), 1);

    broker.delete_topic("gone").unwrap();
    assert_eq!(
        next(&mut rx).await,
        ServerMessage::EndpointClosed { endpoint_id }
    );
    assert_eq!(conn.open_endpoints(), 0);
}
