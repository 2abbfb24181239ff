//! Remote node over WebSocket
//!
//! `connect(url)` opens a session against a running server and hands back a
//! `RemoteNode` with the same surface as the in-process `Node`. Requests are
//! correlated by a per-connection `request_id`; deliveries are routed to the
//! endpoint they name. When the socket closes, waiting requests fail with
//! `Cancelled` and every endpoint stream ends.

use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tracing::{debug, warn};
use tungstenite::protocol::Message as WsMessage;
use url::Url;
use uuid::Uuid;

use crate::broker::{
    Delivery, DeliveryState, EndpointId, MessageId, NodeId, OutgoingMessage, SendReport,
};
use crate::client::{DeliveryControl, Endpoint};
use crate::transport::message::{ClientMessage, ServerMessage};
use crate::utils::{BrokerError, Result};

enum Reply {
    Endpoint(EndpointId, mpsc::UnboundedReceiver<Delivery>),
    Sent(SendReport),
    Failed(BrokerError),
}

struct RemoteInner {
    outbound: mpsc::UnboundedSender<WsMessage>,
    next_request: AtomicU64,
    requests: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
    endpoints: Mutex<HashMap<EndpointId, mpsc::UnboundedSender<Delivery>>>,
}

impl RemoteInner {
    fn requests(&self) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<Reply>>> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn endpoints(&self) -> MutexGuard<'_, HashMap<EndpointId, mpsc::UnboundedSender<Delivery>>> {
        self.endpoints.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send(&self, message: &ClientMessage) -> Result<()> {
        let text = serde_json::to_string(message)?;
        self.outbound
            .send(WsMessage::Text(text.into()))
            .map_err(|_| BrokerError::Transport("connection closed".to_string()))
    }

    async fn request(&self, build: impl FnOnce(u64) -> ClientMessage) -> Result<Reply> {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.requests().insert(request_id, tx);
        if let Err(e) = self.send(&build(request_id)) {
            self.requests().remove(&request_id);
            return Err(e);
        }
        rx.await.map_err(|_| BrokerError::Cancelled)
    }

    fn dispatch(&self, message: ServerMessage) {
        match message {
            ServerMessage::Delivery {
                endpoint_id,
                attempt,
                message,
            } => {
                let delivered = self.endpoints().get(&endpoint_id).is_some_and(|tx| {
                    tx.send(Delivery {
                        endpoint_id,
                        attempt,
                        message: Arc::new(message),
                    })
                    .is_ok()
                });
                if !delivered {
                    debug!(%endpoint_id, "dropping delivery for a closed endpoint");
                }
            }
            ServerMessage::EndpointCreated {
                request_id,
                endpoint_id,
            } => {
                // registered here so deliveries right behind this frame are routed
                let (tx, rx) = mpsc::unbounded_channel();
                self.endpoints().insert(endpoint_id, tx);
                self.resolve(request_id, Reply::Endpoint(endpoint_id, rx));
            }
            ServerMessage::EndpointClosed { endpoint_id } => {
                // dropping the sender ends the endpoint's stream
                self.endpoints().remove(&endpoint_id);
                debug!(%endpoint_id, "endpoint closed by the server");
            }
            ServerMessage::SendResult { request_id, report } => {
                self.resolve(request_id, Reply::Sent(report));
            }
            ServerMessage::Error {
                request_id: Some(request_id),
                error,
            } => self.resolve(request_id, Reply::Failed(error)),
            ServerMessage::Error {
                request_id: None,
                error,
            } => warn!("server reported an error: {error}"),
        }
    }

    fn resolve(&self, request_id: u64, reply: Reply) {
        match self.requests().remove(&request_id) {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => debug!(request_id, "reply for an unknown request"),
        }
    }

    /// Fails every waiting request and ends every endpoint stream.
    fn shut_down(&self) {
        self.requests().clear();
        self.endpoints().clear();
    }
}

impl DeliveryControl for RemoteInner {
    fn ack(
        &self,
        topic: &str,
        message_id: MessageId,
        endpoint_id: EndpointId,
        state: DeliveryState,
    ) -> Result<()> {
        self.send(&ClientMessage::Ack {
            topic: topic.to_string(),
            message_id,
            endpoint_id,
            state,
        })
    }

    fn close_endpoint(&self, endpoint_id: EndpointId) -> Result<()> {
        if self.endpoints().remove(&endpoint_id).is_none() {
            return Err(BrokerError::NotFound(format!("endpoint {endpoint_id}")));
        }
        self.send(&ClientMessage::CloseEndpoint { endpoint_id })
    }
}

pub struct RemoteNode {
    id: NodeId,
    inner: Arc<RemoteInner>,
    reader: Option<JoinHandle<()>>,
}

/// Connects to `url` (for example `ws://127.0.0.1:8080/ca/connect`). A
/// `node_id` query parameter is added when the URL has none.
pub async fn connect(url: &str) -> Result<RemoteNode> {
    let mut url = Url::parse(url).map_err(|e| BrokerError::Transport(format!("{url}: {e}")))?;
    let requested = url
        .query_pairs()
        .find(|(key, _)| key == "node_id")
        .map(|(_, value)| value.into_owned());
    let id = match requested {
        Some(id) => id,
        None => {
            let id = Uuid::new_v4().to_string();
            url.query_pairs_mut().append_pair("node_id", &id);
            id
        }
    };

    let (ws_stream, _) = connect_async(url.as_str()).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (outbound, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    let inner = Arc::new(RemoteInner {
        outbound,
        next_request: AtomicU64::new(1),
        requests: Mutex::new(HashMap::new()),
        endpoints: Mutex::new(HashMap::new()),
    });

    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, WsMessage::Close(_));
            if let Err(e) = ws_sender.send(message).await {
                debug!("send loop closed: {e}");
                break;
            }
            if closing {
                break;
            }
        }
    });

    let reader = {
        let inner = inner.clone();
        let id = id.clone();
        tokio::spawn(async move {
            while let Some(frame) = ws_receiver.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => {
                        match serde_json::from_str::<ServerMessage>(text.as_str()) {
                            Ok(message) => inner.dispatch(message),
                            Err(e) => warn!(node_id = %id, "invalid server message: {e}"),
                        }
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!(node_id = %id, "read loop closed: {e}");
                        break;
                    }
                }
            }
            inner.shut_down();
        })
    };

    Ok(RemoteNode {
        id,
        inner,
        reader: Some(reader),
    })
}

impl RemoteNode {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn create_endpoint<S: Into<String>>(
        &self,
        topic: &str,
        subjects: impl IntoIterator<Item = S>,
    ) -> Result<Endpoint> {
        let subjects: Vec<String> = subjects.into_iter().map(Into::into).collect();
        let reply = self
            .inner
            .request(|request_id| ClientMessage::CreateEndpoint {
                request_id,
                topic: topic.to_string(),
                subjects,
            })
            .await?;
        match reply {
            Reply::Endpoint(endpoint_id, rx) => Ok(Endpoint::new(
                endpoint_id,
                topic.to_string(),
                rx,
                self.inner.clone(),
            )),
            Reply::Failed(error) => Err(error),
            Reply::Sent(_) => Err(BrokerError::Transport(
                "unexpected reply to create_endpoint".to_string(),
            )),
        }
    }

    /// Sends a message and waits until the server reports its ack level
    /// reached.
    pub async fn send_message(&self, message: OutgoingMessage) -> Result<SendReport> {
        let reply = self
            .inner
            .request(|request_id| ClientMessage::Send {
                request_id,
                message,
            })
            .await?;
        match reply {
            Reply::Sent(report) => Ok(report),
            Reply::Failed(error) => Err(error),
            Reply::Endpoint(..) => Err(BrokerError::Transport(
                "unexpected reply to send".to_string(),
            )),
        }
    }

    /// Closes the socket and waits for the server to finish the session.
    pub async fn close(mut self) {
        let _ = self.inner.outbound.send(WsMessage::Close(None));
        if let Some(reader) = self.reader.take() {
            let _ = reader.await;
        }
    }
}

impl Drop for RemoteNode {
    fn drop(&mut self) {
        let _ = self.inner.outbound.send(WsMessage::Close(None));
    }
}

impl std::fmt::Debug for RemoteNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteNode").field("id", &self.id).finish()
    }
}
