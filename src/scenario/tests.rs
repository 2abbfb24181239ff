use super::{
    NonBlockingOptions, ScenarioError, ScenarioResult, TestMessage, TestPayload, durable_quota,
    join_all, non_blocking, ordered_push, overflow,
};
use crate::broker::Broker;
use crate::utils::BrokerError;
use serde_json::json;
use std::sync::Arc;
use tokio::task::JoinSet;

fn broker() -> Arc<Broker> {
    Arc::new(Broker::temporary().unwrap())
}

#[test]
fn test_payload_wire_shape() {
    let data = TestPayload::Data(TestMessage {
        seq: 3,
        body: "b".to_string(),
    });
    assert_eq!(
        serde_json::to_value(&data).unwrap(),
        json!({ "kind": "data", "data": { "seq": 3, "body": "b" } })
    );
    assert_eq!(
        serde_json::to_value(TestPayload::Quit).unwrap(),
        json!({ "kind": "quit" })
    );
}

#[tokio::test]
async fn test_join_all_returns_first_error_after_draining() {
    let mut tasks: JoinSet<ScenarioResult<u32>> = JoinSet::new();
    tasks.spawn(async { Ok(1) });
    tasks.spawn(async { Err(ScenarioError::Broker(BrokerError::Cancelled)) });
    tasks.spawn(async { Ok(2) });

    let err = join_all(tasks).await.unwrap_err();
    assert!(matches!(err, ScenarioError::Broker(BrokerError::Cancelled)));

    let mut tasks: JoinSet<ScenarioResult<u32>> = JoinSet::new();
    tasks.spawn(async { Ok(1) });
    tasks.spawn(async { Ok(2) });
    let mut outputs = join_all(tasks).await.unwrap();
    outputs.sort();
    assert_eq!(outputs, vec![1, 2]);
}

#[tokio::test]
async fn test_non_blocking_every_receiver_sees_every_message() {
    let options = NonBlockingOptions::default();
    let report = non_blocking(broker(), options.clone()).await.unwrap();

    assert_eq!(report.receivers.len(), options.receivers);
    assert!(
        report
            .receivers
            .iter()
            .all(|outcome| outcome.distinct == options.messages as usize)
    );
}

#[tokio::test]
async fn test_non_blocking_can_run_twice_on_one_broker() {
    let broker = broker();
    let options = NonBlockingOptions {
        receivers: 3,
        messages: 5,
        capacity: 10,
    };
    non_blocking(broker.clone(), options.clone()).await.unwrap();
    let report = non_blocking(broker.clone(), options).await.unwrap();
    assert!(report.receivers.iter().all(|outcome| outcome.distinct == 5));
    assert_eq!(broker.node_count(), 0);
}

#[tokio::test]
async fn test_ordered_push_arrives_in_send_order() {
    let arrived = ordered_push(broker(), "test/order", 50).await.unwrap();
    assert_eq!(arrived, (0..50).collect::<Vec<u32>>());
}

#[tokio::test]
async fn test_durable_quota_limits_receivers() {
    let delivered = durable_quota(broker(), "test/durable", 2, 4).await.unwrap();
    assert_eq!(delivered, 2);
}

#[tokio::test]
async fn test_overflow_rejects_one_past_capacity() {
    let (accepted, err) = overflow(broker(), "test/overflow", 5).await.unwrap();
    assert_eq!(accepted, 5);
    assert_eq!(
        err,
        Some(BrokerError::CapacityExceeded {
            topic: "test/overflow".to_string(),
            capacity: 5
        })
    );
}
