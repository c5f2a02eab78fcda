use super::category::SubscriptionCategory;
use super::event::{EventFilter, SubscriptionEvent};
use super::handler::{EventHandler, FnHandler};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Default capacity of a subscription's events queue
pub const DEFAULT_EVENT_CAPACITY: usize = 100;

/// Capacity of a subscription's errors queue; older errors win when it is full
pub const ERROR_CAPACITY: usize = 10;

/// Unique identifier for subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    /// Create a new subscription ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SubscriptionId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::Parse {
                message: format!("Invalid subscription id '{}': {}", s, e),
            })
    }
}

/// Single-fire, broadcast completion signal.
///
/// Fires once the subscription is fully torn down. Any number of tasks may
/// wait on it, before or after it fires.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    token: CancellationToken,
}

impl Completion {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fire(&self) {
        self.token.cancel();
    }

    pub fn is_fired(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolve once the subscription has closed
    pub async fn wait(&self) {
        self.token.cancelled().await
    }
}

/// Caller-supplied subscription settings
#[derive(Clone)]
pub struct SubscriptionConfig {
    pub category: SubscriptionCategory,
    pub handler: Option<Arc<dyn EventHandler>>,
    /// Operation scope; the session's current operation when `None`
    pub operation_id: Option<i64>,
    pub filter: EventFilter,
    /// Events queue capacity; [`DEFAULT_EVENT_CAPACITY`] when `None`
    pub capacity: Option<usize>,
}

impl SubscriptionConfig {
    pub fn new(category: SubscriptionCategory) -> Self {
        Self {
            category,
            handler: None,
            operation_id: None,
            filter: EventFilter::new(),
            capacity: None,
        }
    }

    /// Invoke `handler` for every event before it is queued
    pub fn handler<F>(self, handler: F) -> Self
    where
        F: Fn(&SubscriptionEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.event_handler(Arc::new(FnHandler::new(handler)))
    }

    pub fn event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn operation(mut self, operation_id: i64) -> Self {
        self.operation_id = Some(operation_id);
        self
    }

    pub fn filter(mut self, filter: EventFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn filter_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.filter.insert(key, value);
        self
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Check the settings and return the effective queue capacity
    pub fn validate(&self) -> Result<usize> {
        if let Some(id) = self.operation_id {
            if id <= 0 {
                return Err(Error::Configuration {
                    message: format!("operation id must be positive, got {}", id),
                });
            }
        }
        match self.capacity {
            Some(0) => Err(Error::Configuration {
                message: "queue capacity must be greater than zero".to_string(),
            }),
            Some(capacity) => Ok(capacity),
            None => Ok(DEFAULT_EVENT_CAPACITY),
        }
    }
}

impl fmt::Debug for SubscriptionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionConfig")
            .field("category", &self.category)
            .field("handler", &self.handler.is_some())
            .field("operation_id", &self.operation_id)
            .field("filter", &self.filter)
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl fmt::Display for SubscriptionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.operation_id {
            Some(id) => write!(f, "Subscription: {} (operation {})", self.category, id),
            None => write!(f, "Subscription: {}", self.category),
        }
    }
}

/// State shared between a [`Subscription`] handle and its worker
#[derive(Debug)]
pub(crate) struct SubscriptionShared {
    pub id: SubscriptionId,
    pub category: SubscriptionCategory,
    pub active: AtomicBool,
    pub cancel: CancellationToken,
    pub done: Completion,
}

impl SubscriptionShared {
    pub fn new(category: SubscriptionCategory, cancel: CancellationToken) -> Self {
        Self {
            id: SubscriptionId::new(),
            category,
            active: AtomicBool::new(true),
            cancel,
            done: Completion::new(),
        }
    }

    /// Flip to inactive; true only for the first caller
    pub fn deactivate(&self) -> bool {
        self.active.swap(false, Ordering::SeqCst)
    }
}

/// A live subscription.
///
/// Drain `events` and `errors` and watch `done` in a `tokio::select!` loop.
/// Once `done` fires both queues yield their remaining items and then `None`.
/// Dropping the handle closes the subscription.
#[derive(Debug)]
pub struct Subscription {
    pub events: mpsc::Receiver<SubscriptionEvent>,
    pub errors: mpsc::Receiver<Error>,
    pub done: Completion,
    shared: Arc<SubscriptionShared>,
}

impl Subscription {
    pub(crate) fn new(
        shared: Arc<SubscriptionShared>,
        events: mpsc::Receiver<SubscriptionEvent>,
        errors: mpsc::Receiver<Error>,
    ) -> Self {
        Self {
            events,
            errors,
            done: shared.done.clone(),
            shared,
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.shared.id
    }

    pub fn category(&self) -> SubscriptionCategory {
        self.shared.category
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Tear the subscription down and wait for the worker to finish.
    /// Calling it again, or after a failure already closed it, is a no-op.
    pub async fn close(&self) -> Result<()> {
        if self.shared.deactivate() {
            tracing::debug!(subscription_id = %self.shared.id, "closing subscription");
        }
        self.shared.cancel.cancel();
        self.done.wait().await;
        Ok(())
    }
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.is_active() { "active" } else { "inactive" };
        write!(
            f,
            "Subscription {}: {} ({})",
            self.shared.id, self.shared.category, status
        )
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}
