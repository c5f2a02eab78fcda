//! Mythic SDK Client
//!
//! This module provides the main client for talking to a Mythic server. It
//! handles authentication, GraphQL queries and mutations over HTTP, and owns
//! the subscription manager that streams live events over WebSocket.

use crate::config::ClientConfig;
use crate::session::{self, Session, SessionState};
use crate::subscriptions::{
    ConnectParams, Subscription, SubscriptionConfig, SubscriptionManager, TransportConnector,
    WebSocketConnector,
};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Client as HttpClient;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    access_token: &'a str,
    refresh_token: &'a str,
}

/// Body returned by both `/auth` and `/refresh`
#[derive(Deserialize)]
struct LoginResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    user: Option<LoginUser>,
}

#[derive(Deserialize)]
struct LoginUser {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    current_operation_id: Option<i64>,
}

/// State shared by every clone of a [`Client`] and by the subscription manager
struct ClientInner {
    config: ClientConfig,
    http: HttpClient,
    state: RwLock<SessionState>,
    login_lock: tokio::sync::Mutex<()>,
}

impl ClientInner {
    fn is_authenticated(&self) -> bool {
        self.state.read().authenticated
    }

    async fn login(&self) -> Result<()> {
        let _guard = self.login_lock.lock().await;

        if self.config.api_token.is_some() || self.state.read().access_token.is_some() {
            self.state.write().authenticated = true;
            return Ok(());
        }

        let (username, password) = match (&self.config.username, &self.config.password) {
            (Some(username), Some(password)) => (username, password),
            _ => {
                return Err(Error::Auth {
                    message: "username and password required".to_string(),
                })
            }
        };

        let response = self
            .http
            .post(self.config.auth_url())
            .json(&LoginRequest { username, password })
            .send()
            .await
            .map_err(|e| Error::Network {
                message: format!("Login request failed: {}", e),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Auth {
                message: format!("login failed with status {}: {}", status.as_u16(), body),
            });
        }

        let auth: LoginResponse = response.json().await.map_err(|e| Error::Parse {
            message: format!("Failed to parse login response: {}", e),
        })?;
        let user = self.store_tokens(auth)?;

        info!(
            "Logged in to {} as {}",
            self.config.host(),
            user.as_deref().unwrap_or("unknown user")
        );
        Ok(())
    }

    /// Trade the refresh token for a new token pair
    async fn refresh_access_token(&self) -> Result<()> {
        let _guard = self.login_lock.lock().await;

        let (access_token, refresh_token) = {
            let state = self.state.read();
            match (&state.access_token, &state.refresh_token) {
                (Some(access), Some(refresh)) => (access.clone(), refresh.clone()),
                (_, None) => {
                    return Err(Error::Auth {
                        message: "no refresh token available".to_string(),
                    })
                }
                (None, Some(_)) => {
                    return Err(Error::Auth {
                        message: "no access token to refresh".to_string(),
                    })
                }
            }
        };

        let mut request = self.http.post(self.config.refresh_url()).json(&RefreshRequest {
            access_token: &access_token,
            refresh_token: &refresh_token,
        });
        for (name, value) in self.auth_headers() {
            request = request.header(name, value);
        }

        let response = request.send().await.map_err(|e| Error::Network {
            message: format!("Refresh request failed: {}", e),
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Auth {
                message: format!("refresh failed with status {}: {}", status.as_u16(), body),
            });
        }

        let auth: LoginResponse = response.json().await.map_err(|e| Error::Parse {
            message: format!("Failed to parse refresh response: {}", e),
        })?;
        self.store_tokens(auth)?;

        debug!("Refreshed access token for {}", self.config.host());
        Ok(())
    }

    /// Record the tokens and operation from an auth response; returns the username
    fn store_tokens(&self, auth: LoginResponse) -> Result<Option<String>> {
        if auth.access_token.is_empty() {
            return Err(Error::Auth {
                message: "no access token returned".to_string(),
            });
        }

        let user = auth.user.as_ref().and_then(|u| u.username.clone());
        let mut state = self.state.write();
        state.access_token = Some(auth.access_token);
        state.refresh_token = auth.refresh_token.filter(|t| !t.is_empty());
        state.authenticated = true;
        if let Some(operation_id) = auth
            .user
            .and_then(|u| u.current_operation_id)
            .filter(|id| *id > 0)
        {
            state.current_operation = Some(operation_id);
        }
        Ok(user)
    }

    async fn graphql_request<T: DeserializeOwned>(
        &self,
        document: &str,
        variables: Value,
    ) -> Result<T> {
        #[derive(Serialize)]
        struct GraphQLRequest<'a> {
            query: &'a str,
            variables: Value,
        }

        #[derive(Deserialize)]
        struct GraphQLResponse<T> {
            data: Option<T>,
            errors: Option<Vec<GraphQLError>>,
        }

        #[derive(Deserialize)]
        struct GraphQLError {
            message: String,
        }

        if !self.is_authenticated() {
            return Err(Error::Auth {
                message: "not authenticated".to_string(),
            });
        }

        let mut request = self
            .http
            .post(self.config.graphql_url())
            .json(&GraphQLRequest {
                query: document,
                variables,
            });
        for (name, value) in self.auth_headers() {
            request = request.header(name, value);
        }

        let response = request.send().await.map_err(|e| Error::Network {
            message: format!("GraphQL request failed: {}", e),
        })?;

        if !response.status().is_success() {
            return Err(Error::Server {
                status: response.status().as_u16(),
                message: format!("GraphQL server error: {}", response.status()),
            });
        }

        let graphql_response: GraphQLResponse<T> =
            response.json().await.map_err(|e| Error::Parse {
                message: format!("Failed to parse GraphQL response: {}", e),
            })?;

        if let Some(errors) = graphql_response.errors.filter(|e| !e.is_empty()) {
            let error_messages: Vec<String> = errors.into_iter().map(|e| e.message).collect();
            return Err(Error::Server {
                status: 400,
                message: format!("GraphQL errors: {}", error_messages.join(", ")),
            });
        }

        graphql_response.data.ok_or_else(|| Error::Parse {
            message: "GraphQL response missing data field".to_string(),
        })
    }
}

#[async_trait]
impl Session for ClientInner {
    async fn ensure_authenticated(&self) -> Result<()> {
        if self.is_authenticated() {
            return Ok(());
        }
        self.login().await
    }

    fn current_operation(&self) -> Option<i64> {
        self.state.read().current_operation
    }

    fn auth_headers(&self) -> HashMap<String, String> {
        let state = self.state.read();
        session::auth_headers(self.config.api_token.as_deref(), state.access_token.as_deref())
    }
}

/// Main Mythic client
///
/// Cheap to clone; clones share the session and the subscription connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
    subscriptions: Arc<SubscriptionManager>,
}

impl Client {
    /// Create a new client with the given configuration
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::with_connector(config, Arc::new(WebSocketConnector::new()))
    }

    /// Create a client whose subscriptions use `connector` for their transport
    pub fn with_connector(
        config: ClientConfig,
        connector: Arc<dyn TransportConnector>,
    ) -> Result<Self> {
        config.validate()?;

        let http = HttpClient::builder()
            .timeout(config.timeout)
            .cookie_store(true)
            .danger_accept_invalid_certs(config.skip_tls_verify)
            .user_agent(format!("mythic-sdk-rust/{}", crate::VERSION))
            .build()
            .map_err(|e| Error::Configuration {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        let state = SessionState {
            authenticated: config.has_token(),
            access_token: config.access_token.clone(),
            refresh_token: config.refresh_token.clone(),
            current_operation: None,
        };

        let endpoint = ConnectParams {
            url: config.websocket_url(),
            connection_params: Value::Null,
            timeout: config.timeout,
            skip_tls_verify: config.skip_tls_verify,
            keep_alive: config.keep_alive,
        };

        debug!(
            "Client endpoints: GraphQL='{}', WebSocket='{}'",
            config.graphql_url(),
            endpoint.url
        );

        let inner = Arc::new(ClientInner {
            config,
            http,
            state: RwLock::new(state),
            login_lock: tokio::sync::Mutex::new(()),
        });
        let subscriptions = Arc::new(SubscriptionManager::new(
            inner.clone(),
            connector,
            endpoint,
        ));

        Ok(Self {
            inner,
            subscriptions,
        })
    }

    /// Create a client builder
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Authenticate with the configured credentials.
    ///
    /// An API token or existing access token authenticates without a round-trip;
    /// otherwise username and password are posted to the auth endpoint.
    pub async fn login(&self) -> Result<()> {
        self.inner.login().await
    }

    /// Forget the access token, refresh token and current operation, then
    /// close live subscriptions since they were opened with those credentials.
    /// The client stays usable after logging in again.
    pub async fn logout(&self) -> Result<()> {
        {
            let mut state = self.inner.state.write();
            state.access_token = None;
            state.refresh_token = None;
            state.authenticated = false;
            state.current_operation = None;
        }
        self.subscriptions.close_all().await
    }

    pub async fn ensure_authenticated(&self) -> Result<()> {
        self.inner.ensure_authenticated().await
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.is_authenticated()
    }

    /// JWT from the last login, if any
    pub fn access_token(&self) -> Option<String> {
        self.inner.state.read().access_token.clone()
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.inner.state.read().refresh_token.clone()
    }

    /// Exchange the refresh token from the last login for a new access and
    /// refresh token pair.
    ///
    /// Subscriptions already open keep their connection; new connections use
    /// the new token.
    pub async fn refresh_access_token(&self) -> Result<()> {
        self.inner.refresh_access_token().await
    }

    /// Set the operation that scopes subscriptions by default
    pub fn set_current_operation(&self, operation_id: i64) {
        self.inner.state.write().current_operation = Some(operation_id);
    }

    pub fn current_operation(&self) -> Option<i64> {
        self.inner.current_operation()
    }

    /// Execute a GraphQL query and decode its `data`
    pub async fn execute_query<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: Value,
    ) -> Result<T> {
        debug!("Executing GraphQL query");
        self.inner.graphql_request(query, variables).await
    }

    /// Execute a GraphQL mutation and decode its `data`
    pub async fn execute_mutation<T: DeserializeOwned>(
        &self,
        mutation: &str,
        variables: Value,
    ) -> Result<T> {
        debug!("Executing GraphQL mutation");
        self.inner.graphql_request(mutation, variables).await
    }

    /// Open a live subscription
    pub async fn subscribe(&self, config: SubscriptionConfig) -> Result<Subscription> {
        self.subscriptions.subscribe(config).await
    }

    /// Open a live subscription that also closes when `until` is cancelled
    pub async fn subscribe_until(
        &self,
        config: SubscriptionConfig,
        until: CancellationToken,
    ) -> Result<Subscription> {
        self.subscriptions.subscribe_until(config, until).await
    }

    /// Close a subscription; a no-op when it is already closed
    pub async fn unsubscribe(&self, subscription: &Subscription) -> Result<()> {
        self.subscriptions.unsubscribe(subscription).await
    }

    /// Number of subscriptions still open
    pub fn active_subscriptions(&self) -> usize {
        self.subscriptions.active_count()
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    /// Close every subscription and the subscription connection.
    /// Safe to call more than once.
    pub async fn close(&self) -> Result<()> {
        self.subscriptions.shutdown().await
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("server", &self.inner.config.host())
            .field("authenticated", &self.is_authenticated())
            .field("current_operation", &self.current_operation())
            .field("active_subscriptions", &self.active_subscriptions())
            .finish()
    }
}

/// Builder for creating clients
pub struct ClientBuilder {
    config: ClientConfig,
    connector: Option<Arc<dyn TransportConnector>>,
}

impl ClientBuilder {
    /// Create a new client builder
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
            connector: None,
        }
    }

    /// Start from a loaded configuration
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn server_url(mut self, server_url: impl Into<String>) -> Self {
        self.config.server_url = server_url.into();
        self
    }

    pub fn api_token(mut self, api_token: impl Into<String>) -> Self {
        self.config.api_token = Some(api_token.into());
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.username = Some(username.into());
        self.config.password = Some(password.into());
        self
    }

    pub fn access_token(mut self, access_token: impl Into<String>) -> Self {
        self.config.access_token = Some(access_token.into());
        self
    }

    pub fn refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.config.refresh_token = Some(refresh_token.into());
        self
    }

    pub fn ssl(mut self, ssl: bool) -> Self {
        self.config.ssl = ssl;
        self
    }

    /// Set the request timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn skip_tls_verify(mut self, skip: bool) -> Self {
        self.config.skip_tls_verify = skip;
        self
    }

    /// Set the WebSocket ping interval; `None` disables keep-alive pings
    pub fn keep_alive(mut self, interval: Option<Duration>) -> Self {
        self.config.keep_alive = interval;
        self
    }

    /// Replace the WebSocket transport
    pub fn connector(mut self, connector: Arc<dyn TransportConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Build the client
    pub fn build(self) -> Result<Client> {
        match self.connector {
            Some(connector) => Client::with_connector(self.config, connector),
            None => Client::new(self.config),
        }
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
