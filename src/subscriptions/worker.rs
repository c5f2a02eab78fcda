use super::event::{decode_push, EventFilter, SubscriptionEvent};
use super::handler::EventHandler;
use super::registry::SubscriptionRegistry;
use super::subscription::SubscriptionShared;
use super::transport::{Push, PushReceiver, SubscriptionTransport, TransportSubscriptionId};
use crate::Error;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// Upper bound on waiting for the transport to accept an unsubscribe
const UNSUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Why the pump loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    /// The subscription's token fired
    Cancelled,
    /// The caller dropped the events receiver
    Abandoned,
    /// The server or connection ended the subscription
    Finished,
}

/// Owns one subscription's delivery loop from acceptance to completion
pub(crate) struct Worker {
    pub shared: Arc<SubscriptionShared>,
    pub filter: EventFilter,
    pub handler: Option<Arc<dyn EventHandler>>,
    pub transport: Arc<dyn SubscriptionTransport>,
    pub transport_id: TransportSubscriptionId,
    pub pushes: PushReceiver,
    pub events: mpsc::Sender<SubscriptionEvent>,
    pub errors: mpsc::Sender<Error>,
    pub registry: Arc<SubscriptionRegistry>,
}

impl Worker {
    pub async fn run(mut self) {
        let exit = self.pump().await;
        self.teardown(exit).await;
    }

    async fn pump(&mut self) -> Exit {
        loop {
            let push = tokio::select! {
                biased;
                _ = self.shared.cancel.cancelled() => return Exit::Cancelled,
                push = self.pushes.recv() => push,
            };

            match push {
                Some(Push::Data(payload)) => {
                    if let Some(exit) = self.deliver(&payload).await {
                        return exit;
                    }
                }
                Some(Push::Error(message)) => {
                    warn!(
                        subscription_id = %self.shared.id,
                        "server ended subscription: {}", message
                    );
                    self.report(Error::Subscription {
                        subscription_id: self.shared.id,
                        message,
                    });
                    return Exit::Finished;
                }
                Some(Push::Complete) => {
                    debug!(subscription_id = %self.shared.id, "server completed subscription");
                    return Exit::Finished;
                }
                Some(Push::ConnectionLost(reason)) => {
                    self.report(Error::Connection { message: reason });
                    return Exit::Finished;
                }
                None => {
                    self.report(Error::Connection {
                        message: "subscription mailbox closed by transport".to_string(),
                    });
                    return Exit::Finished;
                }
            }
        }
    }

    /// Decode one push and hand its events to the handler and the events queue
    async fn deliver(&self, payload: &Value) -> Option<Exit> {
        let events = match decode_push(self.shared.category, payload) {
            Ok(events) => events,
            Err(message) => {
                warn!(subscription_id = %self.shared.id, "dropping malformed push: {}", message);
                self.report(Error::Decode {
                    subscription_id: self.shared.id,
                    message,
                });
                return None;
            }
        };

        for event in events {
            if !self.filter.matches(&event) {
                continue;
            }

            if let Some(handler) = self.handler.clone() {
                let result = tokio::select! {
                    biased;
                    _ = self.shared.cancel.cancelled() => return Some(Exit::Cancelled),
                    result = handler.handle(&event) => result,
                };
                if let Err(e) = result {
                    self.report(Error::Handler {
                        subscription_id: self.shared.id,
                        message: format!("{:#}", e),
                    });
                }
            }

            tokio::select! {
                biased;
                _ = self.shared.cancel.cancelled() => return Some(Exit::Cancelled),
                sent = self.events.send(event) => {
                    if sent.is_err() {
                        return Some(Exit::Abandoned);
                    }
                }
            }
        }
        None
    }

    /// Queue a non-blocking error; when the queue is full the newest error is dropped
    fn report(&self, error: Error) {
        if let Err(TrySendError::Full(error)) = self.errors.try_send(error) {
            warn!(subscription_id = %self.shared.id, "errors queue full, dropping: {}", error);
        }
    }

    async fn teardown(self, exit: Exit) {
        self.shared.deactivate();

        if exit != Exit::Finished {
            let unsubscribe = self.transport.unsubscribe(&self.transport_id);
            let failure = match tokio::time::timeout(UNSUBSCRIBE_TIMEOUT, unsubscribe).await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some(format!(
                    "unsubscribe timed out after {}ms",
                    UNSUBSCRIBE_TIMEOUT.as_millis()
                )),
            };
            if let Some(message) = failure {
                warn!(subscription_id = %self.shared.id, "unsubscribe failed: {}", message);
                self.report(Error::Teardown {
                    subscription_id: self.shared.id,
                    message,
                });
            }
        }

        self.registry.remove(&self.shared.id);
        self.shared.cancel.cancel();

        let shared = self.shared.clone();
        // Close both queues before signalling completion
        drop(self);
        shared.done.fire();
        debug!(
            subscription_id = %shared.id,
            category = %shared.category,
            ?exit,
            "subscription closed"
        );
    }
}
