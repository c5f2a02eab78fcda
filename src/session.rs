//! Authenticated session
//!
//! The subscription core only reads from the session: it verifies the session
//! before opening a subscription, resolves the default operation scope, and
//! forwards the auth headers into the WebSocket handshake.

use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;

/// Read-only view of the client's authentication state
#[async_trait]
pub trait Session: Send + Sync {
    /// Fail unless the session holds (or can obtain) a valid credential
    async fn ensure_authenticated(&self) -> Result<()>;

    /// Operation that scopes subscriptions when the caller sets none
    fn current_operation(&self) -> Option<i64>;

    /// Headers that authenticate a request
    fn auth_headers(&self) -> HashMap<String, String>;

    /// Payload sent with `connection_init` on the subscription socket
    fn connection_params(&self) -> serde_json::Value {
        serde_json::json!({ "headers": self.auth_headers() })
    }
}

/// Mutable credential state owned by [`crate::Client`]
#[derive(Debug, Clone, Default)]
pub(crate) struct SessionState {
    pub authenticated: bool,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub current_operation: Option<i64>,
}

/// Build auth headers, preferring an API token over a bearer token
pub(crate) fn auth_headers(
    api_token: Option<&str>,
    access_token: Option<&str>,
) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    if let Some(token) = api_token {
        headers.insert("apitoken".to_string(), token.to_string());
    } else if let Some(token) = access_token {
        headers.insert("Authorization".to_string(), format!("Bearer {}", token));
    }
    headers
}
