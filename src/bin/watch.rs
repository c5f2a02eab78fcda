//! Mythic Watch CLI
//!
//! Tails live events from a Mythic server and prints each one as a JSON line
//! on stdout. Diagnostics go to stderr through `tracing`.

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use mythic_sdk::{
    Client, ClientConfig, EventFilter, SnapshotDeduplicator, Subscription, SubscriptionCategory,
    SubscriptionConfig, SubscriptionEvent,
};
use serde_json::Value;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mythic-watch")]
#[command(about = "Stream real-time Mythic operation events as JSON lines")]
#[command(version)]
struct Cli {
    /// Event category to watch
    #[arg(short = 'c', long, default_value = "callback")]
    category: SubscriptionCategory,

    /// Mythic server address (host:port)
    #[arg(long, env = "MYTHIC_SERVER_URL")]
    server_url: Option<String>,

    /// API token
    #[arg(long, env = "MYTHIC_API_TOKEN", hide_env_values = true)]
    api_token: Option<String>,

    #[arg(long, env = "MYTHIC_USERNAME")]
    username: Option<String>,

    #[arg(long, env = "MYTHIC_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Operation to watch; defaults to the operator's current operation
    #[arg(short, long)]
    operation: Option<i64>,

    /// Only deliver events whose field equals the value (repeatable, key=value)
    #[arg(short, long = "filter", value_parser = parse_filter)]
    filters: Vec<(String, Value)>,

    /// Events queue capacity
    #[arg(long)]
    capacity: Option<usize>,

    /// Print each record once, skipping repeats from later snapshots
    #[arg(long)]
    new_only: bool,

    /// Accept self-signed certificates
    #[arg(long)]
    insecure: bool,

    /// Use plain HTTP/WS instead of HTTPS/WSS
    #[arg(long)]
    no_ssl: bool,

    /// Request timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Optional config file (toml, yaml or json)
    #[arg(long)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Parse `key=value`, reading the value as JSON when it parses and as a string otherwise
fn parse_filter(raw: &str) -> std::result::Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))?;
    if key.is_empty() {
        return Err(format!("empty filter key in '{}'", raw));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn client_config(cli: &Cli) -> Result<ClientConfig> {
    let mut config = ClientConfig::load(cli.config.as_deref())?;
    if let Some(server_url) = &cli.server_url {
        config.server_url = server_url.clone();
    }
    if let Some(token) = &cli.api_token {
        config.api_token = Some(token.clone());
    }
    if let Some(username) = &cli.username {
        config.username = Some(username.clone());
    }
    if let Some(password) = &cli.password {
        config.password = Some(password.clone());
    }
    if let Some(secs) = cli.timeout {
        config.timeout = Duration::from_secs(secs);
    }
    if cli.insecure {
        config.skip_tls_verify = true;
    }
    if cli.no_ssl {
        config.ssl = false;
    }
    Ok(config)
}

fn print_event(event: &SubscriptionEvent, dedup: &mut Option<SnapshotDeduplicator>) -> Result<()> {
    if let Some(dedup) = dedup.as_mut() {
        if !dedup.is_new(event) {
            return Ok(());
        }
    }
    println!("{}", serde_json::to_string(event)?);
    Ok(())
}

/// Flush whatever the worker queued before it closed
fn drain(sub: &mut Subscription, dedup: &mut Option<SnapshotDeduplicator>) -> Result<()> {
    while let Ok(event) = sub.events.try_recv() {
        print_event(&event, dedup)?;
    }
    while let Ok(err) = sub.errors.try_recv() {
        warn!("{}", err);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let client = Client::builder()
        .config(client_config(&cli)?)
        .build()
        .context("invalid client configuration")?;
    client
        .ensure_authenticated()
        .await
        .context("authentication failed")?;
    if let Some(operation_id) = cli.operation {
        client.set_current_operation(operation_id);
    }

    let filter: EventFilter = cli.filters.iter().cloned().collect();
    let mut config = SubscriptionConfig::new(cli.category).filter(filter);
    if let Some(capacity) = cli.capacity {
        config = config.capacity(capacity);
    }

    let mut sub = client.subscribe(config).await?;
    info!("Watching {} events ({})", cli.category, sub.id());

    let mut dedup = cli.new_only.then(SnapshotDeduplicator::new);
    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);

    loop {
        tokio::select! {
            _ = &mut interrupted => {
                info!("Interrupted, closing subscription");
                break;
            }
            Some(event) = sub.events.recv() => print_event(&event, &mut dedup)?,
            Some(err) = sub.errors.recv() => warn!("{}", err),
            _ = sub.done.wait() => {
                drain(&mut sub, &mut dedup)?;
                info!("Subscription closed");
                break;
            }
        }
    }

    client.close().await?;
    Ok(())
}
