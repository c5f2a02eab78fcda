use super::query::build_subscription_query;
use super::registry::SubscriptionRegistry;
use super::subscription::{
    Subscription, SubscriptionConfig, SubscriptionId, SubscriptionShared, ERROR_CAPACITY,
};
use super::transport::{ConnectParams, SubscriptionTransport, TransportConnector};
use super::worker::Worker;
use crate::session::Session;
use crate::{Error, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Owns the shared subscription connection and every live subscription.
///
/// The connection is opened on the first subscribe and reused until it
/// drops, at which point the next subscribe opens a fresh one. Concurrent
/// subscribers wait on the same connection attempt.
pub struct SubscriptionManager {
    session: Arc<dyn Session>,
    connector: Arc<dyn TransportConnector>,
    endpoint: ConnectParams,
    transport: Mutex<Option<Arc<dyn SubscriptionTransport>>>,
    registry: Arc<SubscriptionRegistry>,
    shutdown: CancellationToken,
}

impl SubscriptionManager {
    /// `endpoint.connection_params` is replaced by the session's at connect time
    pub fn new(
        session: Arc<dyn Session>,
        connector: Arc<dyn TransportConnector>,
        endpoint: ConnectParams,
    ) -> Self {
        Self {
            session,
            connector,
            endpoint,
            transport: Mutex::new(None),
            registry: Arc::new(SubscriptionRegistry::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Open a subscription that lives until closed, dropped, or the manager shuts down
    pub async fn subscribe(&self, config: SubscriptionConfig) -> Result<Subscription> {
        self.open(config, None).await
    }

    /// Like [`SubscriptionManager::subscribe`], also closing when `until` is cancelled
    pub async fn subscribe_until(
        &self,
        config: SubscriptionConfig,
        until: CancellationToken,
    ) -> Result<Subscription> {
        self.open(config, Some(until)).await
    }

    async fn open(
        &self,
        config: SubscriptionConfig,
        until: Option<CancellationToken>,
    ) -> Result<Subscription> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Shutdown);
        }
        let capacity = config.validate()?;

        self.session.ensure_authenticated().await?;
        let operation_id = config
            .operation_id
            .or_else(|| self.session.current_operation())
            .ok_or_else(|| Error::Configuration {
                message: "no current operation set".to_string(),
            })?;

        let query = build_subscription_query(config.category, operation_id, &config.filter);
        let transport = self.transport().await?;
        let accepted = transport.subscribe(&query).await?;

        let cancel = self.shutdown.child_token();
        let shared = Arc::new(SubscriptionShared::new(config.category, cancel.clone()));
        let (events_tx, events_rx) = mpsc::channel(capacity);
        let (errors_tx, errors_rx) = mpsc::channel(ERROR_CAPACITY);

        self.registry
            .register(shared.id, cancel.clone(), shared.done.clone());

        if let Some(until) = until {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = until.cancelled() => cancel.cancel(),
                    _ = cancel.cancelled() => {}
                }
            });
        }

        info!(
            subscription_id = %shared.id,
            transport_id = %accepted.id,
            "Subscribed to {} events for operation {}",
            config.category,
            operation_id
        );

        let worker = Worker {
            shared: shared.clone(),
            filter: config.filter,
            handler: config.handler,
            transport,
            transport_id: accepted.id,
            pushes: accepted.pushes,
            events: events_tx,
            errors: errors_tx,
            registry: self.registry.clone(),
        };
        tokio::spawn(worker.run());

        Ok(Subscription::new(shared, events_rx, errors_rx))
    }

    /// Reuse the live connection or open a new one
    async fn transport(&self) -> Result<Arc<dyn SubscriptionTransport>> {
        let mut slot = self.transport.lock().await;
        if let Some(transport) = slot.as_ref() {
            if transport.is_connected() {
                return Ok(transport.clone());
            }
            debug!("Subscription connection is down, reconnecting");
        }

        let params = ConnectParams {
            connection_params: self.session.connection_params(),
            ..self.endpoint.clone()
        };
        let transport = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(Error::Shutdown),
            result = self.connector.connect(params) => result?,
        };
        *slot = Some(transport.clone());
        Ok(transport)
    }

    /// Close `subscription` and wait for its teardown; a no-op when already closed
    pub async fn unsubscribe(&self, subscription: &Subscription) -> Result<()> {
        subscription.close().await
    }

    /// Close a subscription by id; unknown ids are ignored
    pub async fn unsubscribe_id(&self, id: &SubscriptionId) -> Result<()> {
        if let Some(done) = self.registry.cancel(id) {
            done.wait().await;
        }
        Ok(())
    }

    /// Whether the subscription is registered and not yet torn down
    pub fn is_active(&self, id: &SubscriptionId) -> bool {
        self.registry.contains(id)
    }

    /// Number of subscriptions that have not finished teardown
    pub fn active_count(&self) -> usize {
        self.registry.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Close every subscription, wait for them, then close the connection.
    /// Further subscribes fail with [`Error::Shutdown`].
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown.cancel();
        self.close_all().await
    }

    /// Close every subscription and the connection they share. Unlike
    /// [`SubscriptionManager::shutdown`] the manager stays usable and the next
    /// subscribe connects again with the session's current credentials.
    pub async fn close_all(&self) -> Result<()> {
        let pending = self.registry.cancel_all();
        if !pending.is_empty() {
            info!("Closing {} subscriptions", pending.len());
        }
        for done in pending {
            done.wait().await;
        }

        let transport = self.transport.lock().await.take();
        if let Some(transport) = transport {
            transport.close().await?;
        }
        Ok(())
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
