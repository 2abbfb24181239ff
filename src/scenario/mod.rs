//! Integration scenarios
//!
//! End-to-end runs over a broker through in-process `Node`s. Each scenario
//! takes its state in an explicit options struct, runs its senders and
//! receivers as tasks in a `JoinSet`, and returns a report. The `bench`
//! command and the test suite both drive these.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::broker::{
    AckKind, Broker, Durability, EndpointId, MessageHeader, OutgoingMessage, OverflowPolicy,
    TargetKind, TopicConfig,
};
use crate::client::{Endpoint, Node};
use crate::utils::BrokerError;

pub const NON_BLOCKING_TOPIC: &str = "test/non-blocking";
const SUBJECT: &str = "event";

/// Payload every scenario sends: data, or the signal to stop receiving.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum TestPayload {
    Data(TestMessage),
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestMessage {
    pub seq: u32,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("{0} ended before the quit signal")]
    StreamEnded(EndpointId),
    #[error("{endpoint} saw seq {got} after {previous}")]
    OutOfOrder {
        endpoint: EndpointId,
        previous: u32,
        got: u32,
    },
    #[error("scenario task failed: {0}")]
    Task(String),
}

pub type ScenarioResult<T> = std::result::Result<T, ScenarioError>;

fn data(seq: u32) -> TestPayload {
    TestPayload::Data(TestMessage {
        seq,
        body: format!("message-{seq}"),
    })
}

/// Drains `tasks` and returns their outputs, or the first error once every
/// task has finished.
pub async fn join_all<T: 'static>(mut tasks: JoinSet<ScenarioResult<T>>) -> ScenarioResult<Vec<T>> {
    let mut outputs = Vec::with_capacity(tasks.len());
    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        let result = joined.map_err(|e| ScenarioError::Task(e.to_string())).and_then(|r| r);
        match result {
            Ok(output) => outputs.push(output),
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(outputs),
    }
}

async fn ensure_topic(broker: &Broker, config: TopicConfig) -> ScenarioResult<()> {
    match broker.create_topic(config).await {
        Ok(()) | Err(BrokerError::AlreadyExists(_)) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug, Clone)]
pub struct NonBlockingOptions {
    pub receivers: usize,
    pub messages: u32,
    pub capacity: usize,
}

impl Default for NonBlockingOptions {
    fn default() -> Self {
        Self {
            receivers: 100,
            messages: 100,
            capacity: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReceiverOutcome {
    pub endpoint: EndpointId,
    /// Distinct payloads seen before `Quit`.
    pub distinct: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct NonBlockingReport {
    pub messages: u32,
    pub receivers: Vec<ReceiverOutcome>,
    pub elapsed: Duration,
}

async fn receive_until_quit(mut endpoint: Endpoint) -> ScenarioResult<ReceiverOutcome> {
    let endpoint_id = endpoint.id();
    let mut seen = HashSet::new();
    let mut previous = None;
    while let Some(received) = endpoint.next().await {
        match received.json::<TestPayload>()? {
            TestPayload::Data(message) => {
                if let Some(previous) = previous.filter(|p| *p >= message.seq) {
                    return Err(ScenarioError::OutOfOrder {
                        endpoint: endpoint_id,
                        previous,
                        got: message.seq,
                    });
                }
                previous = Some(message.seq);
                seen.insert(message.seq);
                received.received()?;
            }
            TestPayload::Quit => {
                return Ok(ReceiverOutcome {
                    endpoint: endpoint_id,
                    distinct: seen.len(),
                });
            }
        }
    }
    Err(ScenarioError::StreamEnded(endpoint_id))
}

/// Fans `messages` `Online` messages out to `receivers` endpoints on
/// `test/non-blocking`, then ends every receiver with an `Available` quit.
pub async fn non_blocking(
    broker: Arc<Broker>,
    options: NonBlockingOptions,
) -> ScenarioResult<NonBlockingReport> {
    let started = Instant::now();
    ensure_topic(
        &broker,
        TopicConfig::new(NON_BLOCKING_TOPIC)
            .overflow(OverflowPolicy::RejectNew, options.capacity)
            .blocking(true),
    )
    .await?;

    let sender = Node::connect(broker.clone())?;
    let mut nodes = Vec::with_capacity(options.receivers);
    let mut receivers = JoinSet::new();
    for _ in 0..options.receivers {
        let node = Node::connect(broker.clone())?;
        let endpoint = node.create_endpoint(NON_BLOCKING_TOPIC, [SUBJECT])?;
        receivers.spawn(receive_until_quit(endpoint));
        nodes.push(node);
    }
    debug!(receivers = options.receivers, "receivers attached");

    for seq in 0..options.messages {
        let message = OutgoingMessage::json(
            &data(seq),
            MessageHeader::new(NON_BLOCKING_TOPIC, [SUBJECT], TargetKind::Online),
        )?;
        sender.send_message(message).await?;
    }
    let quit = OutgoingMessage::json(
        &TestPayload::Quit,
        MessageHeader::new(NON_BLOCKING_TOPIC, [SUBJECT], TargetKind::Available),
    )?;
    sender.send_message(quit).await?;

    let mut outcomes = join_all(receivers).await?;
    outcomes.sort_by_key(|outcome| outcome.endpoint);
    drop(nodes);

    let report = NonBlockingReport {
        messages: options.messages,
        receivers: outcomes,
        elapsed: started.elapsed(),
    };
    info!(
        receivers = report.receivers.len(),
        messages = report.messages,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "non-blocking scenario finished"
    );
    Ok(report)
}

async fn consume_in_order(mut endpoint: Endpoint) -> ScenarioResult<Vec<u32>> {
    let mut arrived = Vec::new();
    while let Some(received) = endpoint.next().await {
        match received.json::<TestPayload>()? {
            TestPayload::Data(message) => {
                arrived.push(message.seq);
                received.processed()?;
            }
            TestPayload::Quit => return Ok(arrived),
        }
    }
    Err(ScenarioError::StreamEnded(endpoint.id()))
}

async fn push_sequence(sender: Node, topic: String, count: u32) -> ScenarioResult<Vec<u32>> {
    for seq in 0..count {
        let message = OutgoingMessage::json(
            &data(seq),
            MessageHeader::new(topic.as_str(), [SUBJECT], TargetKind::Push)
                .ack_kind(AckKind::Processed),
        )?;
        sender.send_message(message).await?;
    }
    let quit = OutgoingMessage::json(
        &TestPayload::Quit,
        MessageHeader::new(topic.as_str(), [SUBJECT], TargetKind::Push),
    )?;
    sender.send_message(quit).await?;
    Ok(Vec::new())
}

/// Sends `0..count` with `Push` to a single consumer that acknowledges each
/// one as processed. Returns the sequence numbers in arrival order.
pub async fn ordered_push(broker: Arc<Broker>, topic: &str, count: u32) -> ScenarioResult<Vec<u32>> {
    ensure_topic(&broker, TopicConfig::new(topic)).await?;
    let consumer = Node::connect(broker.clone())?;
    let sender = Node::connect(broker.clone())?;
    let endpoint = consumer.create_endpoint(topic, [SUBJECT])?;

    let mut tasks = JoinSet::new();
    tasks.spawn(consume_in_order(endpoint));
    tasks.spawn(push_sequence(sender, topic.to_string(), count));

    let outputs = join_all(tasks).await?;
    drop(consumer);
    Ok(outputs.into_iter().flatten().collect())
}

/// Sends one durable message with a receiver quota of `max_receivers` before
/// anyone listens, then attaches `attach` endpoints one by one. Returns how
/// many of them received it.
pub async fn durable_quota(
    broker: Arc<Broker>,
    topic: &str,
    max_receivers: u32,
    attach: usize,
) -> ScenarioResult<usize> {
    ensure_topic(&broker, TopicConfig::new(topic)).await?;
    let sender = Node::connect(broker.clone())?;
    let message = OutgoingMessage::json(
        &data(0),
        MessageHeader::new(topic, [SUBJECT], TargetKind::Durable)
            .durability(Durability::expire_in(60, max_receivers)),
    )?;
    sender.send_message(message).await?;

    let mut delivered = 0;
    let mut nodes = Vec::with_capacity(attach);
    for _ in 0..attach {
        let node = Node::connect(broker.clone())?;
        let mut endpoint = node.create_endpoint(topic, [SUBJECT])?;
        // replay happens during attach, so anything due is already queued
        if let Ok(Some(received)) =
            tokio::time::timeout(Duration::from_millis(50), endpoint.next()).await
        {
            received.json::<TestPayload>()?;
            delivered += 1;
        }
        nodes.push((node, endpoint));
    }
    Ok(delivered)
}

/// Fills a `RejectNew` topic of `capacity` with durable messages nobody
/// receives. Returns how many sends were accepted and the error of the
/// first rejected one.
pub async fn overflow(
    broker: Arc<Broker>,
    topic: &str,
    capacity: usize,
) -> ScenarioResult<(usize, Option<BrokerError>)> {
    ensure_topic(
        &broker,
        TopicConfig::new(topic).overflow(OverflowPolicy::RejectNew, capacity),
    )
    .await?;
    let sender = Node::connect(broker.clone())?;

    for seq in 0..=capacity as u32 {
        let message = OutgoingMessage::json(
            &data(seq),
            MessageHeader::new(topic, [SUBJECT], TargetKind::Durable),
        )?;
        if let Err(e) = sender.send_message(message).await {
            return Ok((seq as usize, Some(e)));
        }
    }
    Ok((capacity + 1, None))
}

#[cfg(test)]
mod tests;
