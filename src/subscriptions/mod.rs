//! Real-time event subscriptions
//!
//! Every subscription shares one GraphQL-over-WebSocket connection owned by
//! the [`SubscriptionManager`]. Each accepted subscription gets its own worker
//! task that decodes pushes into [`SubscriptionEvent`]s, runs the optional
//! handler, and delivers into the subscription's bounded events queue.
//! Decode and handler failures surface on the errors queue without stopping
//! delivery; connection loss and server-side termination close the
//! subscription.

mod category;
mod dedup;
mod event;
mod handler;
mod manager;
mod query;
mod registry;
mod subscription;
pub mod transport;
mod websocket;
mod worker;

#[cfg(test)]
mod tests;

pub use category::SubscriptionCategory;
pub use dedup::SnapshotDeduplicator;
pub use event::{EventFilter, SubscriptionEvent};
pub use handler::{EventHandler, FnHandler};
pub use manager::SubscriptionManager;
pub use query::{build_subscription_query, SubscriptionQuery};
pub use subscription::{
    Completion, Subscription, SubscriptionConfig, SubscriptionId, DEFAULT_EVENT_CAPACITY,
    ERROR_CAPACITY,
};
pub use transport::{ConnectParams, SubscriptionTransport, TransportConnector};
pub use websocket::{WebSocketConnector, WebSocketTransport};
