//! Client configuration
//!
//! [`ClientConfig`] holds everything needed to reach and authenticate against a
//! Mythic server. It can be built in code, through [`crate::ClientBuilder`], or
//! loaded from an optional config file layered under `MYTHIC_*` environment
//! variables.

use crate::{Error, Result};
use serde::Deserialize;
use std::time::Duration;

/// Default request timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Default WebSocket keep-alive ping interval
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Configuration for the Mythic client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address, with or without scheme (e.g. `mythic.example.com:7443`)
    pub server_url: String,
    /// API token, preferred over every other credential
    pub api_token: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// JWT access token from a previous login
    pub access_token: Option<String>,
    /// Refresh token paired with `access_token`, spent by
    /// [`crate::Client::refresh_access_token`]
    pub refresh_token: Option<String>,
    /// Use HTTPS/WSS when true, HTTP/WS otherwise
    pub ssl: bool,
    pub timeout: Duration,
    /// Accept self-signed certificates
    pub skip_tls_verify: bool,
    /// Interval between client pings on the subscription socket; `None` disables them
    pub keep_alive: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            api_token: None,
            username: None,
            password: None,
            access_token: None,
            refresh_token: None,
            ssl: true,
            timeout: DEFAULT_TIMEOUT,
            skip_tls_verify: false,
            keep_alive: Some(DEFAULT_KEEP_ALIVE),
        }
    }
}

/// Shape of the config file / environment layer
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawConfig {
    server_url: Option<String>,
    api_token: Option<String>,
    username: Option<String>,
    password: Option<String>,
    access_token: Option<String>,
    refresh_token: Option<String>,
    ssl: Option<bool>,
    timeout_secs: Option<u64>,
    skip_tls_verify: Option<bool>,
    keep_alive_secs: Option<u64>,
}

impl ClientConfig {
    /// Load configuration from an optional file and `MYTHIC_*` environment variables.
    ///
    /// Environment variables win over the file. Credentials are optional here;
    /// they are only checked when the client authenticates.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        builder = builder.add_source(config::Environment::with_prefix("MYTHIC").try_parsing(true));

        let raw: RawConfig = builder.build()?.try_deserialize()?;
        let defaults = Self::default();

        let config = Self {
            server_url: raw.server_url.unwrap_or_default(),
            api_token: raw.api_token.filter(|s| !s.is_empty()),
            username: raw.username.filter(|s| !s.is_empty()),
            password: raw.password.filter(|s| !s.is_empty()),
            access_token: raw.access_token.filter(|s| !s.is_empty()),
            refresh_token: raw.refresh_token.filter(|s| !s.is_empty()),
            ssl: raw.ssl.unwrap_or(defaults.ssl),
            timeout: raw
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            skip_tls_verify: raw.skip_tls_verify.unwrap_or(defaults.skip_tls_verify),
            keep_alive: match raw.keep_alive_secs {
                Some(0) => None,
                Some(secs) => Some(Duration::from_secs(secs)),
                None => defaults.keep_alive,
            },
        };
        tracing::debug!("Loaded client configuration for server '{}'", config.server_url);
        Ok(config)
    }

    /// Check that the configuration can produce a client
    pub fn validate(&self) -> Result<()> {
        if self.server_url.trim().is_empty() {
            return Err(Error::Configuration {
                message: "server URL is required".to_string(),
            });
        }
        if self.timeout.is_zero() {
            return Err(Error::Configuration {
                message: "timeout must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// Whether a credential is present that needs no login round-trip
    pub fn has_token(&self) -> bool {
        self.api_token.is_some() || self.access_token.is_some()
    }

    /// `host[:port]` with any scheme and trailing slashes removed
    pub fn host(&self) -> &str {
        let url = self.server_url.trim();
        let url = url
            .strip_prefix("https://")
            .or_else(|| url.strip_prefix("http://"))
            .unwrap_or(url);
        url.trim_end_matches('/')
    }

    /// GraphQL HTTP endpoint
    pub fn graphql_url(&self) -> String {
        let scheme = if self.ssl { "https" } else { "http" };
        format!("{}://{}/graphql/", scheme, self.host())
    }

    /// GraphQL WebSocket endpoint used for subscriptions
    pub fn websocket_url(&self) -> String {
        let scheme = if self.ssl { "wss" } else { "ws" };
        format!("{}://{}/graphql/", scheme, self.host())
    }

    /// Username/password login endpoint
    pub fn auth_url(&self) -> String {
        let scheme = if self.ssl { "https" } else { "http" };
        format!("{}://{}/auth", scheme, self.host())
    }

    /// Access token refresh endpoint
    pub fn refresh_url(&self) -> String {
        let scheme = if self.ssl { "https" } else { "http" };
        format!("{}://{}/refresh", scheme, self.host())
    }
}
