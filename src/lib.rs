//! Mythic Rust SDK
//!
//! A client library for the Mythic command-and-control server. It authenticates
//! against the server, runs GraphQL queries and mutations, and streams live
//! operation events over a single multiplexed GraphQL-over-WebSocket connection.
//!
//! # Quick Start
//!
//! ```no_run
//! use mythic_sdk::{Client, SubscriptionCategory, SubscriptionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder()
//!         .server_url("https://mythic.example.com:7443")
//!         .api_token("your-api-token")
//!         .build()?;
//!
//!     client.set_current_operation(1);
//!
//!     let config = SubscriptionConfig::new(SubscriptionCategory::Callback)
//!         .handler(|event: &mythic_sdk::SubscriptionEvent| {
//!             println!("{}", event);
//!             Ok(())
//!         });
//!
//!     let mut sub = client.subscribe(config).await?;
//!     loop {
//!         tokio::select! {
//!             Some(event) = sub.events.recv() => println!("callback {:?}", event.id()),
//!             Some(err) = sub.errors.recv() => eprintln!("subscription error: {}", err),
//!             _ = sub.done.wait() => break,
//!         }
//!     }
//!
//!     client.close().await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod session;
pub mod subscriptions;

// Re-export main client types
pub use client::{Client, ClientBuilder};
pub use config::ClientConfig;
pub use session::Session;

// Re-export the subscription surface
pub use subscriptions::{
    build_subscription_query, Completion, EventFilter, EventHandler, SnapshotDeduplicator,
    Subscription, SubscriptionCategory, SubscriptionConfig, SubscriptionEvent, SubscriptionId,
    SubscriptionManager, SubscriptionQuery,
};

/// SDK version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type used throughout the SDK
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the SDK
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Authentication error: {message}")]
    Auth { message: String },

    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Parse error: {message}")]
    Parse { message: String },

    #[error("Connection error: {message}")]
    Connection { message: String },

    #[error("Subscription {subscription_id} failed: {message}")]
    Subscription {
        subscription_id: SubscriptionId,
        message: String,
    },

    #[error("Subscription {subscription_id} received a malformed push: {message}")]
    Decode {
        subscription_id: SubscriptionId,
        message: String,
    },

    #[error("Subscription {subscription_id} handler error: {message}")]
    Handler {
        subscription_id: SubscriptionId,
        message: String,
    },

    #[error("Subscription {subscription_id} teardown error: {message}")]
    Teardown {
        subscription_id: SubscriptionId,
        message: String,
    },

    #[error("Timeout: operation took longer than {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Client has been shut down")]
    Shutdown,
}

impl Error {
    /// Whether this error was raised before any I/O because the caller's input was invalid
    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::Configuration { .. })
    }
}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Error::Network {
                message: format!("Request timed out: {}", error),
            }
        } else if error.is_connect() {
            Error::Network {
                message: format!("Connection failed: {}", error),
            }
        } else {
            Error::Network {
                message: error.to_string(),
            }
        }
    }
}

impl From<url::ParseError> for Error {
    fn from(error: url::ParseError) -> Self {
        Error::Configuration {
            message: format!("Invalid URL: {}", error),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Parse {
            message: format!("JSON parse error: {}", error),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Connection {
            message: format!("WebSocket error: {}", error),
        }
    }
}

impl From<::config::ConfigError> for Error {
    fn from(error: ::config::ConfigError) -> Self {
        Error::Configuration {
            message: error.to_string(),
        }
    }
}
