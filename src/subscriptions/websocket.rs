//! graphql-transport-ws client
//!
//! One socket carries every subscription. After the `connection_init` /
//! `connection_ack` handshake a writer task drains an outbound queue and a
//! reader task routes `next`, `error` and `complete` frames to the
//! subscription they name. When the socket drops, every open route receives
//! [`Push::ConnectionLost`].

use super::query::SubscriptionQuery;
use super::transport::{
    push_channel, ConnectParams, Push, PushSender, SubscriptionTransport, TransportConnector,
    TransportSubscription, TransportSubscriptionId,
};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{Sink, SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const SUBPROTOCOL: &str = "graphql-transport-ws";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Routes = Arc<Mutex<HashMap<String, PushSender>>>;

/// graphql-transport-ws frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsMessage {
    ConnectionInit {
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    ConnectionAck {
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    Ping {
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    Subscribe {
        id: String,
        payload: Value,
    },
    Next {
        id: String,
        payload: Value,
    },
    Error {
        id: String,
        payload: Value,
    },
    Complete {
        id: String,
    },
}

impl WsMessage {
    fn to_text(&self) -> Result<Message> {
        Ok(Message::Text(serde_json::to_string(self)?))
    }
}

/// Opens [`WebSocketTransport`] connections
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransportConnector for WebSocketConnector {
    async fn connect(&self, params: ConnectParams) -> Result<Arc<dyn SubscriptionTransport>> {
        let transport = WebSocketTransport::connect(params).await?;
        Ok(Arc::new(transport))
    }
}

/// A live graphql-transport-ws connection
#[derive(Debug)]
pub struct WebSocketTransport {
    write_tx: mpsc::UnboundedSender<WsMessage>,
    routes: Routes,
    next_id: AtomicU64,
    connected: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl WebSocketTransport {
    /// Open the socket and complete the protocol handshake within `params.timeout`
    pub async fn connect(params: ConnectParams) -> Result<Self> {
        let timeout_ms = params.timeout.as_millis() as u64;
        let mut request = params.url.as_str().into_client_request()?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(SUBPROTOCOL));

        let connector = if params.skip_tls_verify {
            let tls = native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()
                .map_err(|e| Error::Connection {
                    message: format!("Failed to build TLS connector: {}", e),
                })?;
            Some(Connector::NativeTls(tls))
        } else {
            None
        };

        debug!("Connecting subscription socket to {}", params.url);
        let (stream, _) = tokio::time::timeout(
            params.timeout,
            tokio_tungstenite::connect_async_tls_with_config(request, None, false, connector),
        )
        .await
        .map_err(|_| Error::Timeout { timeout_ms })??;

        let (mut write, mut read) = stream.split();

        let init = WsMessage::ConnectionInit {
            payload: Some(params.connection_params.clone()),
        };
        write.send(init.to_text()?).await?;

        tokio::time::timeout(params.timeout, await_ack(&mut write, &mut read))
            .await
            .map_err(|_| Error::Timeout { timeout_ms })??;

        info!("Subscription socket connected to {}", params.url);

        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let routes: Routes = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));
        let shutdown = CancellationToken::new();

        tokio::spawn(write_task(
            write,
            write_rx,
            connected.clone(),
            shutdown.clone(),
        ));
        tokio::spawn(read_task(
            read,
            routes.clone(),
            write_tx.clone(),
            connected.clone(),
            shutdown.clone(),
        ));

        if let Some(period) = params.keep_alive {
            tokio::spawn(keep_alive_task(period, write_tx.clone(), shutdown.clone()));
        }

        Ok(Self {
            write_tx,
            routes,
            next_id: AtomicU64::new(1),
            connected,
            shutdown,
        })
    }

    fn not_connected() -> Error {
        Error::Connection {
            message: "subscription socket is not connected".to_string(),
        }
    }
}

#[async_trait]
impl SubscriptionTransport for WebSocketTransport {
    async fn subscribe(&self, query: &SubscriptionQuery) -> Result<TransportSubscription> {
        if !self.is_connected() {
            return Err(Self::not_connected());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let (tx, rx) = push_channel();
        self.routes.lock().insert(id.clone(), tx);

        // Both socket tasks clear `connected` before the routes are drained,
        // so a route inserted after the drain is caught here.
        if !self.is_connected() {
            self.routes.lock().remove(&id);
            return Err(Self::not_connected());
        }

        let message = WsMessage::Subscribe {
            id: id.clone(),
            payload: serde_json::to_value(query)?,
        };
        if self.write_tx.send(message).is_err() {
            self.routes.lock().remove(&id);
            return Err(Self::not_connected());
        }

        debug!("Sent subscribe {} for {}", id, query.operation_name);
        Ok(TransportSubscription {
            id: TransportSubscriptionId(id),
            pushes: rx,
        })
    }

    async fn unsubscribe(&self, id: &TransportSubscriptionId) -> Result<()> {
        if self.routes.lock().remove(&id.0).is_none() {
            return Ok(());
        }
        if self.is_connected() {
            self.write_tx
                .send(WsMessage::Complete { id: id.0.clone() })
                .map_err(|_| Self::not_connected())?;
            debug!("Sent complete {}", id);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        if !self.shutdown.is_cancelled() {
            info!("Closing subscription socket");
        }
        self.shutdown.cancel();
        Ok(())
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn await_ack(
    write: &mut SplitSink<WsStream, Message>,
    read: &mut SplitStream<WsStream>,
) -> Result<()> {
    while let Some(message) = read.next().await {
        match message? {
            Message::Text(text) => match serde_json::from_str::<WsMessage>(&text) {
                Ok(WsMessage::ConnectionAck { .. }) => return Ok(()),
                Ok(WsMessage::Ping { .. }) => {
                    write.send(WsMessage::Pong { payload: None }.to_text()?).await?;
                }
                Ok(other) => debug!("Ignoring {:?} before connection_ack", other),
                Err(e) => debug!("Ignoring unparseable frame before connection_ack: {}", e),
            },
            Message::Close(frame) => {
                return Err(Error::Connection {
                    message: format!("server closed the socket during handshake: {:?}", frame),
                });
            }
            _ => {}
        }
    }
    Err(Error::Connection {
        message: "socket ended before connection_ack".to_string(),
    })
}

async fn write_task<S>(
    mut write: S,
    mut write_rx: mpsc::UnboundedReceiver<WsMessage>,
    connected: Arc<AtomicBool>,
    shutdown: CancellationToken,
) where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                break;
            }
            message = write_rx.recv() => {
                let Some(message) = message else { break };
                let frame = match message.to_text() {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("Failed to encode outbound frame: {}", e);
                        continue;
                    }
                };
                if let Err(e) = write.send(frame).await {
                    error!("Subscription socket write failed: {}", e);
                    // The reader sees the cancellation and notifies every route
                    connected.store(false, Ordering::SeqCst);
                    shutdown.cancel();
                    break;
                }
            }
        }
    }
    debug!("Subscription socket writer stopped");
}

async fn read_task(
    mut read: SplitStream<WsStream>,
    routes: Routes,
    write_tx: mpsc::UnboundedSender<WsMessage>,
    connected: Arc<AtomicBool>,
    shutdown: CancellationToken,
) {
    let reason = loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => break "connection shut down".to_string(),
            message = read.next() => message,
        };

        match message {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<WsMessage>(&text) {
                Ok(message) => route_message(message, &routes, &write_tx),
                Err(e) => warn!("Dropping unparseable frame: {}", e),
            },
            Some(Ok(Message::Close(frame))) => {
                break format!("server closed the connection: {:?}", frame);
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!("Subscription socket read failed: {}", e);
                break format!("read failed: {}", e);
            }
            None => break "connection ended".to_string(),
        }
    };

    connected.store(false, Ordering::SeqCst);
    shutdown.cancel();

    let orphaned: Vec<_> = routes.lock().drain().collect();
    if !orphaned.is_empty() {
        warn!(
            "Subscription socket lost ({}), notifying {} subscriptions",
            reason,
            orphaned.len()
        );
    }
    for (_, tx) in orphaned {
        let _ = tx.send(Push::ConnectionLost(reason.clone()));
    }
    debug!("Subscription socket reader stopped: {}", reason);
}

fn route_message(
    message: WsMessage,
    routes: &Routes,
    write_tx: &mpsc::UnboundedSender<WsMessage>,
) {
    match message {
        WsMessage::Next { id, payload } => {
            if let Some(tx) = routes.lock().get(&id) {
                let _ = tx.send(Push::Data(payload));
            }
        }
        WsMessage::Error { id, payload } => {
            if let Some(tx) = routes.lock().remove(&id) {
                let _ = tx.send(Push::Error(error_message(&payload)));
            }
        }
        WsMessage::Complete { id } => {
            if let Some(tx) = routes.lock().remove(&id) {
                let _ = tx.send(Push::Complete);
            }
        }
        WsMessage::Ping { .. } => {
            let _ = write_tx.send(WsMessage::Pong { payload: None });
        }
        WsMessage::Pong { .. } | WsMessage::ConnectionAck { .. } => {}
        other => debug!("Ignoring unexpected frame {:?}", other),
    }
}

/// Flatten an `error` frame payload (a list of GraphQL errors) into one message
fn error_message(payload: &Value) -> String {
    let messages: Vec<String> = match payload {
        Value::Array(errors) => errors
            .iter()
            .map(|e| {
                e.get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| e.to_string())
            })
            .collect(),
        Value::Object(_) => vec![payload
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| payload.to_string())],
        other => vec![other.to_string()],
    };
    if messages.is_empty() {
        "unknown subscription error".to_string()
    } else {
        messages.join(", ")
    }
}

async fn keep_alive_task(
    period: Duration,
    write_tx: mpsc::UnboundedSender<WsMessage>,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                if write_tx.send(WsMessage::Ping { payload: None }).is_err() {
                    break;
                }
            }
        }
    }
}
