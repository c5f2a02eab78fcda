//! Transport seam between the subscription manager and the wire
//!
//! A [`TransportConnector`] opens one long-lived connection; the resulting
//! [`SubscriptionTransport`] multiplexes any number of subscriptions over it
//! and routes each server push to the matching subscription's mailbox.

use super::query::SubscriptionQuery;
use crate::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Server-side subscription id, unique within one connection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransportSubscriptionId(pub String);

impl fmt::Display for TransportSubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Something the connection delivers to a single subscription
#[derive(Debug, Clone, PartialEq)]
pub enum Push {
    /// A result payload, `{"data": ..., "errors": ...}`
    Data(Value),
    /// The server terminated the subscription with an error
    Error(String),
    /// The server finished the subscription
    Complete,
    /// The connection went away
    ConnectionLost(String),
}

/// Accepted subscription; pushes arrive on `pushes` until a terminal push
#[derive(Debug)]
pub struct TransportSubscription {
    pub id: TransportSubscriptionId,
    pub pushes: PushReceiver,
}

/// Create the mailbox that carries one subscription's pushes.
///
/// Every data push is a full snapshot, so an unread snapshot is replaced by
/// the next one instead of queueing behind it. A terminal push is kept and
/// handed out after the pending snapshot. Memory per subscription stays
/// bounded however slowly the caller drains its events.
pub fn push_channel() -> (PushSender, PushReceiver) {
    let shared = Arc::new(PushShared {
        mailbox: Mutex::new(Mailbox::default()),
        notify: Notify::new(),
    });
    (
        PushSender {
            shared: shared.clone(),
        },
        PushReceiver { shared },
    )
}

#[derive(Debug, Default)]
struct Mailbox {
    snapshot: Option<Value>,
    end: Option<Push>,
    ended: bool,
    sender_closed: bool,
    receiver_closed: bool,
}

#[derive(Debug)]
struct PushShared {
    mailbox: Mutex<Mailbox>,
    notify: Notify,
}

/// Transport side of a push mailbox
#[derive(Debug)]
pub struct PushSender {
    shared: Arc<PushShared>,
}

impl PushSender {
    /// Store a push for the subscription; hands it back once the receiver is gone.
    /// Pushes after a terminal push are discarded.
    pub fn send(&self, push: Push) -> std::result::Result<(), Push> {
        {
            let mut mailbox = self.shared.mailbox.lock();
            if mailbox.receiver_closed {
                return Err(push);
            }
            if mailbox.ended {
                return Ok(());
            }
            match push {
                Push::Data(snapshot) => mailbox.snapshot = Some(snapshot),
                end => {
                    mailbox.ended = true;
                    mailbox.end = Some(end);
                }
            }
        }
        self.shared.notify.notify_one();
        Ok(())
    }
}

impl Drop for PushSender {
    fn drop(&mut self) {
        self.shared.mailbox.lock().sender_closed = true;
        self.shared.notify.notify_one();
    }
}

/// Subscription side of a push mailbox
#[derive(Debug)]
pub struct PushReceiver {
    shared: Arc<PushShared>,
}

impl PushReceiver {
    /// Next push, or `None` once the sender is gone and nothing is pending.
    /// Cancel safe.
    pub async fn recv(&mut self) -> Option<Push> {
        loop {
            {
                let mut mailbox = self.shared.mailbox.lock();
                if let Some(snapshot) = mailbox.snapshot.take() {
                    return Some(Push::Data(snapshot));
                }
                if let Some(end) = mailbox.end.take() {
                    return Some(end);
                }
                if mailbox.sender_closed {
                    return None;
                }
            }
            self.shared.notify.notified().await;
        }
    }
}

impl Drop for PushReceiver {
    fn drop(&mut self) {
        self.shared.mailbox.lock().receiver_closed = true;
    }
}

/// Everything needed to open a connection
#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub url: String,
    /// Sent with the protocol handshake, carries the auth headers
    pub connection_params: Value,
    pub timeout: Duration,
    pub skip_tls_verify: bool,
    pub keep_alive: Option<Duration>,
}

#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(&self, params: ConnectParams) -> Result<Arc<dyn SubscriptionTransport>>;
}

#[async_trait]
pub trait SubscriptionTransport: Send + Sync {
    /// Start a subscription; resolves once the request is on the wire
    async fn subscribe(&self, query: &SubscriptionQuery) -> Result<TransportSubscription>;

    /// Stop a subscription; unknown ids are ignored
    async fn unsubscribe(&self, id: &TransportSubscriptionId) -> Result<()>;

    fn is_connected(&self) -> bool;

    async fn close(&self) -> Result<()>;
}
