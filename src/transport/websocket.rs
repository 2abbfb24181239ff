//! WebSocket transport
//!
//! Exposes node sessions over WebSocket. Responsibilities:
//! - Accept TCP/WebSocket connections on `/ca/connect?node_id=<id>`,
//!   assigning a UUID when `node_id` is missing and refusing ids already
//!   connected
//! - Cap concurrent sessions at `server.max_connections`
//! - Open a `Node` per connection and translate protocol JSON frames into
//!   node and broker operations
//! - Forward each endpoint's deliveries to the socket, followed by an
//!   `endpoint_closed` frame once the broker detaches the endpoint
//!
//! Everything a connection created is torn down when the socket closes:
//! endpoint forwarders are aborted and the node is closed, which cancels
//! its pending sends.

use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{AbortHandle, JoinSet};
use tokio_tungstenite::accept_hdr_async;
use tracing::{debug, info, warn};
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::http::{StatusCode, Uri};
use tungstenite::protocol::Message as WsMessage;
use url::Url;
use uuid::Uuid;

use crate::broker::{Broker, EndpointId, NodeId};
use crate::client::Node;
use crate::config::Settings;
use crate::transport::message::{ClientMessage, ServerMessage};
use crate::utils::{BrokerError, Result};

pub const CONNECT_PATH: &str = "/ca/connect";

/// Binds `server.host:server.port` and serves until the listener fails.
pub async fn start_websocket_server(broker: Arc<Broker>, settings: Settings) -> Result<()> {
    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| BrokerError::Transport(format!("can't bind {addr}: {e}")))?;
    info!("WebSocket server listening on ws://{addr}{CONNECT_PATH}");
    serve(listener, broker, settings.server.max_connections).await
}

/// Accepts connections from an already bound listener.
pub async fn serve(listener: TcpListener, broker: Arc<Broker>, max_connections: usize) -> Result<()> {
    let permits = Arc::new(Semaphore::new(max_connections));
    loop {
        let (stream, peer) = listener
            .accept()
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;
        let Ok(permit) = permits.clone().try_acquire_owned() else {
            warn!(%peer, max_connections, "connection limit reached, dropping connection");
            continue;
        };
        let broker = broker.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, broker).await {
                warn!(%peer, "connection ended with error: {e}");
            }
            drop(permit);
        });
    }
}

/// Extracts `node_id` from the handshake request URI.
pub fn node_id_from_uri(uri: &Uri) -> Option<NodeId> {
    let url = Url::parse(&format!("ws://localhost{uri}")).ok()?;
    url.query_pairs()
        .find(|(key, value)| key == "node_id" && !value.is_empty())
        .map(|(_, value)| value.into_owned())
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

async fn handle_connection(stream: TcpStream, broker: Arc<Broker>) -> Result<()> {
    let mut node_id = None;
    let ws_stream = accept_hdr_async(stream, |request: &Request, response: Response| {
        if request.uri().path() != CONNECT_PATH {
            return Err(reject(StatusCode::NOT_FOUND, "unknown path"));
        }
        let id = node_id_from_uri(request.uri()).unwrap_or_else(|| Uuid::new_v4().to_string());
        if broker.is_node_online(&id) {
            return Err(reject(StatusCode::CONFLICT, "node already connected"));
        }
        node_id = Some(id);
        Ok(response)
    })
    .await?;
    let node_id = node_id.ok_or_else(|| BrokerError::Transport("handshake without node id".into()))?;

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let mut connection = Connection::open(broker, node_id.clone(), tx)?;
    info!(%node_id, "remote node connected");

    let writer = {
        let node_id = node_id.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(%node_id, "failed to encode server message: {e}");
                        continue;
                    }
                };
                if let Err(e) = ws_sender.send(WsMessage::Text(text.into())).await {
                    debug!(%node_id, "send loop closed: {e}");
                    break;
                }
            }
            let _ = ws_sender.close().await;
        })
    };

    while let Some(frame) = ws_receiver.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => connection.handle_text(text.as_str()),
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(%node_id, "read loop closed: {e}");
                break;
            }
        }
    }

    connection.close();
    let _ = writer.await;
    info!(%node_id, "remote node disconnected");
    Ok(())
}

/// One remote session: the node plus the endpoint forwarders it spawned.
pub struct Connection {
    broker: Arc<Broker>,
    node: Node,
    outbound: mpsc::UnboundedSender<ServerMessage>,
    forwarders: JoinSet<EndpointId>,
    endpoints: HashMap<EndpointId, AbortHandle>,
}

impl Connection {
    pub fn open(
        broker: Arc<Broker>,
        node_id: NodeId,
        outbound: mpsc::UnboundedSender<ServerMessage>,
    ) -> Result<Self> {
        let node = Node::connect_with_id(broker.clone(), node_id)?;
        Ok(Self {
            broker,
            node,
            outbound,
            forwarders: JoinSet::new(),
            endpoints: HashMap::new(),
        })
    }

    pub fn node_id(&self) -> &str {
        self.node.id()
    }

    fn reply(&self, message: ServerMessage) {
        let _ = self.outbound.send(message);
    }

    pub fn handle_text(&mut self, text: &str) {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => self.handle(message),
            Err(e) => {
                warn!(
                    node_id = self.node_id(),
                    "invalid client message: {e} | {}",
                    text.chars().take(100).collect::<String>()
                );
                self.reply(ServerMessage::Error {
                    request_id: None,
                    error: e.into(),
                });
            }
        }
    }

    /// Forgets endpoints whose forwarder has already finished.
    fn reap(&mut self) {
        while let Some(joined) = self.forwarders.try_join_next() {
            if let Ok(endpoint_id) = joined {
                self.endpoints.remove(&endpoint_id);
            }
        }
    }

    /// Endpoints this connection still forwards.
    pub fn open_endpoints(&mut self) -> usize {
        self.reap();
        self.endpoints.len()
    }

    pub fn handle(&mut self, message: ClientMessage) {
        self.reap();
        match message {
            ClientMessage::CreateEndpoint {
                request_id,
                topic,
                subjects,
            } => match self.node.create_endpoint(&topic, subjects) {
                Ok(endpoint) => {
                    let endpoint_id = endpoint.id();
                    self.reply(ServerMessage::EndpointCreated {
                        request_id,
                        endpoint_id,
                    });
                    let outbound = self.outbound.clone();
                    let handle = self.forwarders.spawn(async move {
                        let mut endpoint = endpoint;
                        while let Some(received) = endpoint.next().await {
                            let delivery = ServerMessage::Delivery {
                                endpoint_id,
                                attempt: received.attempt(),
                                message: received.message().clone(),
                            };
                            if outbound.send(delivery).is_err() {
                                return endpoint_id;
                            }
                        }
                        let _ = outbound.send(ServerMessage::EndpointClosed { endpoint_id });
                        endpoint_id
                    });
                    self.endpoints.insert(endpoint_id, handle);
                    debug!(node_id = self.node_id(), %topic, %endpoint_id, "remote endpoint created");
                }
                Err(error) => self.reply(ServerMessage::Error {
                    request_id: Some(request_id),
                    error,
                }),
            },
            ClientMessage::CloseEndpoint { endpoint_id } => {
                if let Some(handle) = self.endpoints.remove(&endpoint_id) {
                    handle.abort();
                    debug!(node_id = self.node_id(), %endpoint_id, "remote endpoint closed");
                }
            }
            ClientMessage::Send {
                request_id,
                message,
            } => match self.broker.submit(self.node.id(), message) {
                Ok(waiting) => {
                    let outbound = self.outbound.clone();
                    tokio::spawn(async move {
                        let reply = match waiting.await.unwrap_or(Err(BrokerError::Cancelled)) {
                            Ok(report) => ServerMessage::SendResult { request_id, report },
                            Err(error) => ServerMessage::Error {
                                request_id: Some(request_id),
                                error,
                            },
                        };
                        let _ = outbound.send(reply);
                    });
                }
                Err(error) => self.reply(ServerMessage::Error {
                    request_id: Some(request_id),
                    error,
                }),
            },
            ClientMessage::Ack {
                topic,
                message_id,
                endpoint_id,
                state,
            } => {
                if !self.endpoints.contains_key(&endpoint_id) {
                    debug!(node_id = self.node_id(), %endpoint_id, "ack for an endpoint this node does not own");
                    return;
                }
                if let Err(error) = self.broker.ack(&topic, message_id, endpoint_id, state) {
                    self.reply(ServerMessage::Error {
                        request_id: None,
                        error,
                    });
                }
            }
        }
    }

    /// Aborts the endpoint forwarders and closes the node.
    pub fn close(mut self) {
        self.forwarders.abort_all();
        self.endpoints.clear();
        self.node.close();
    }
}
