//! Subscription lifecycle scenarios driven through a fake transport

use super::transport::{
    push_channel, Push, PushSender, TransportSubscription, TransportSubscriptionId,
};
use super::*;
use crate::session::Session;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

struct StaticSession {
    operation: Option<i64>,
    authenticated: bool,
}

impl StaticSession {
    fn with_operation(operation: i64) -> Self {
        Self {
            operation: Some(operation),
            authenticated: true,
        }
    }
}

#[async_trait]
impl Session for StaticSession {
    async fn ensure_authenticated(&self) -> Result<()> {
        if self.authenticated {
            Ok(())
        } else {
            Err(Error::Auth {
                message: "not authenticated".to_string(),
            })
        }
    }

    fn current_operation(&self) -> Option<i64> {
        self.operation
    }

    fn auth_headers(&self) -> HashMap<String, String> {
        HashMap::from([("apitoken".to_string(), "test-token".to_string())])
    }
}

struct FakeTransport {
    next_id: AtomicUsize,
    routes: Mutex<HashMap<String, PushSender>>,
    subscribed: Mutex<Vec<(String, SubscriptionQuery)>>,
    unsubscribed: Mutex<Vec<String>>,
    connected: AtomicBool,
    fail_unsubscribe: AtomicBool,
}

impl FakeTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicUsize::new(0),
            routes: Mutex::new(HashMap::new()),
            subscribed: Mutex::new(Vec::new()),
            unsubscribed: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
            fail_unsubscribe: AtomicBool::new(false),
        })
    }

    fn push(&self, id: &str, push: Push) {
        let routes = self.routes.lock();
        let tx = routes.get(id).unwrap();
        tx.send(push).unwrap();
    }

    fn route_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.routes.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
        for (_, tx) in self.routes.lock().drain() {
            let _ = tx.send(Push::ConnectionLost("socket reset".to_string()));
        }
    }

    fn unsubscribed(&self) -> Vec<String> {
        self.unsubscribed.lock().clone()
    }
}

#[async_trait]
impl SubscriptionTransport for FakeTransport {
    async fn subscribe(&self, query: &SubscriptionQuery) -> Result<TransportSubscription> {
        let id = (self.next_id.fetch_add(1, Ordering::SeqCst) + 1).to_string();
        let (tx, rx) = push_channel();
        self.routes.lock().insert(id.clone(), tx);
        self.subscribed.lock().push((id.clone(), query.clone()));
        Ok(TransportSubscription {
            id: TransportSubscriptionId(id),
            pushes: rx,
        })
    }

    async fn unsubscribe(&self, id: &TransportSubscriptionId) -> Result<()> {
        self.unsubscribed.lock().push(id.0.clone());
        self.routes.lock().remove(&id.0);
        if self.fail_unsubscribe.load(Ordering::SeqCst) {
            return Err(Error::Connection {
                message: "unsubscribe rejected".to_string(),
            });
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct FakeConnector {
    connects: AtomicUsize,
    delay: Duration,
    fail: bool,
    last: Mutex<Option<(Arc<FakeTransport>, ConnectParams)>>,
}

impl FakeConnector {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Default::default()
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Default::default()
        })
    }

    fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    fn transport(&self) -> Arc<FakeTransport> {
        self.last.lock().as_ref().map(|(t, _)| t.clone()).unwrap()
    }

    fn params(&self) -> ConnectParams {
        self.last.lock().as_ref().map(|(_, p)| p.clone()).unwrap()
    }
}

#[async_trait]
impl TransportConnector for FakeConnector {
    async fn connect(&self, params: ConnectParams) -> Result<Arc<dyn SubscriptionTransport>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(Error::Connection {
                message: "connection refused".to_string(),
            });
        }
        let transport = FakeTransport::new();
        *self.last.lock() = Some((transport.clone(), params));
        Ok(transport)
    }
}

fn endpoint() -> ConnectParams {
    ConnectParams {
        url: "ws://mythic.test/graphql/".to_string(),
        connection_params: Value::Null,
        timeout: WAIT,
        skip_tls_verify: false,
        keep_alive: None,
    }
}

fn manager(session: StaticSession, connector: &Arc<FakeConnector>) -> SubscriptionManager {
    SubscriptionManager::new(Arc::new(session), connector.clone(), endpoint())
}

fn records(field: &str, rows: Value) -> Push {
    Push::Data(json!({ "data": { field: rows } }))
}

async fn wait_until(condition: impl Fn() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

async fn next_event(sub: &mut Subscription) -> SubscriptionEvent {
    timeout(WAIT, sub.events.recv()).await.unwrap().unwrap()
}

async fn next_error(sub: &mut Subscription) -> Error {
    timeout(WAIT, sub.errors.recv()).await.unwrap().unwrap()
}

#[tokio::test]
async fn test_concurrent_subscribes_open_one_connection() {
    let connector = FakeConnector::slow(Duration::from_millis(50));
    let manager = manager(StaticSession::with_operation(1), &connector);

    let attempts = (0..5).map(|_| {
        manager.subscribe(SubscriptionConfig::new(SubscriptionCategory::TaskOutput))
    });
    let subs: Vec<Subscription> = futures::future::join_all(attempts)
        .await
        .into_iter()
        .collect::<Result<_>>()
        .unwrap();

    assert_eq!(subs.len(), 5);
    assert_eq!(connector.connects(), 1);
    assert_eq!(manager.active_count(), 5);
    assert_eq!(connector.transport().route_ids().len(), 5);
    assert_eq!(
        connector.params().connection_params,
        json!({"headers": {"apitoken": "test-token"}})
    );
}

#[tokio::test]
async fn test_three_categories_share_connection_and_tear_down_independently() {
    let connector = FakeConnector::new();
    let manager = manager(StaticSession::with_operation(1), &connector);

    let (file, alert, process) = tokio::join!(
        manager.subscribe(SubscriptionConfig::new(SubscriptionCategory::File)),
        manager.subscribe(SubscriptionConfig::new(SubscriptionCategory::Alert)),
        manager.subscribe(SubscriptionConfig::new(SubscriptionCategory::Process)),
    );
    let (mut file, alert, mut process) = (file.unwrap(), alert.unwrap(), process.unwrap());

    assert_eq!(connector.connects(), 1);
    assert_eq!(manager.active_count(), 3);
    assert_ne!(file.id(), alert.id());
    assert_ne!(alert.id(), process.id());

    assert!(manager.is_active(&alert.id()));
    manager.unsubscribe(&alert).await.unwrap();
    assert!(!alert.is_active());
    assert!(!manager.is_active(&alert.id()));
    assert!(file.is_active());
    assert!(process.is_active());
    assert_eq!(manager.active_count(), 2);

    let transport = connector.transport();
    assert_eq!(transport.unsubscribed().len(), 1);
    for id in transport.route_ids() {
        transport.push(&id, records("rows", json!([{"id": 1}])));
    }
    assert_eq!(next_event(&mut file).await.category, SubscriptionCategory::File);
    assert_eq!(
        next_event(&mut process).await.category,
        SubscriptionCategory::Process
    );
}

#[tokio::test]
async fn test_unsubscribe_and_close_are_idempotent() {
    let connector = FakeConnector::new();
    let manager = manager(StaticSession::with_operation(1), &connector);
    let mut sub = manager
        .subscribe(SubscriptionConfig::new(SubscriptionCategory::Keylog))
        .await
        .unwrap();

    manager.unsubscribe(&sub).await.unwrap();
    manager.unsubscribe(&sub).await.unwrap();
    sub.close().await.unwrap();
    manager.unsubscribe_id(&sub.id()).await.unwrap();

    assert!(!sub.is_active());
    assert!(sub.done.is_fired());
    assert_eq!(manager.active_count(), 0);
    assert_eq!(connector.transport().unsubscribed(), vec!["1".to_string()]);
    assert!(sub.events.recv().await.is_none());
}

#[tokio::test]
async fn test_malformed_push_does_not_close_subscription() {
    let connector = FakeConnector::new();
    let manager = manager(StaticSession::with_operation(1), &connector);
    let mut sub = manager
        .subscribe(SubscriptionConfig::new(SubscriptionCategory::Callback))
        .await
        .unwrap();

    let transport = connector.transport();
    transport.push("1", Push::Data(json!("garbage")));
    assert!(matches!(next_error(&mut sub).await, Error::Decode { .. }));

    transport.push("1", records("callback", json!([{"id": 2}, {"id": 1}])));
    assert_eq!(next_event(&mut sub).await.id(), Some(2));
    assert_eq!(next_event(&mut sub).await.id(), Some(1));
    assert!(sub.is_active());
}

#[tokio::test]
async fn test_close_unblocks_worker_stuck_on_full_queue() {
    let connector = FakeConnector::new();
    let manager = manager(StaticSession::with_operation(1), &connector);

    let handled = Arc::new(AtomicUsize::new(0));
    let counter = handled.clone();
    let mut sub = manager
        .subscribe(
            SubscriptionConfig::new(SubscriptionCategory::TaskOutput)
                .capacity(1)
                .handler(move |_event: &SubscriptionEvent| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
        )
        .await
        .unwrap();

    connector.transport().push(
        "1",
        records("task_output", json!([{"id": 3}, {"id": 2}, {"id": 1}])),
    );
    // The second event has been handled, so the first fills the queue
    wait_until(|| handled.load(Ordering::SeqCst) >= 2).await;

    timeout(WAIT, sub.close()).await.unwrap().unwrap();
    assert!(!sub.is_active());
    assert_eq!(handled.load(Ordering::SeqCst), 2);
    assert_eq!(sub.events.recv().await.map(|e| e.id()), Some(Some(3)));
    assert!(sub.events.recv().await.is_none());
}

#[tokio::test]
async fn test_caller_token_cancels_subscription() {
    let connector = FakeConnector::new();
    let manager = manager(StaticSession::with_operation(1), &connector);
    let token = CancellationToken::new();

    let handled = Arc::new(AtomicUsize::new(0));
    let counter = handled.clone();
    let sub = manager
        .subscribe_until(
            SubscriptionConfig::new(SubscriptionCategory::Credential)
                .capacity(1)
                .handler(move |_event: &SubscriptionEvent| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            token.clone(),
        )
        .await
        .unwrap();
    connector
        .transport()
        .push("1", records("credential", json!([{"id": 2}, {"id": 1}])));
    // Blocked sending the second event behind the first
    wait_until(|| handled.load(Ordering::SeqCst) >= 2).await;

    token.cancel();
    timeout(WAIT, sub.done.wait()).await.unwrap();
    assert!(!sub.is_active());
    assert_eq!(handled.load(Ordering::SeqCst), 2);
    assert_eq!(manager.active_count(), 0);
    assert_eq!(connector.transport().unsubscribed().len(), 1);
}

#[tokio::test]
async fn test_missing_operation_fails_before_connecting() {
    let connector = FakeConnector::new();
    let session = StaticSession {
        operation: None,
        authenticated: true,
    };
    let manager = manager(session, &connector);

    let err = manager
        .subscribe(SubscriptionConfig::new(SubscriptionCategory::Alert))
        .await
        .unwrap_err();
    assert!(err.is_configuration(), "{}", err);
    assert_eq!(connector.connects(), 0);

    let sub = manager
        .subscribe(SubscriptionConfig::new(SubscriptionCategory::Alert).operation(9))
        .await
        .unwrap();
    assert!(sub.is_active());
    assert_eq!(connector.connects(), 1);
}

#[tokio::test]
async fn test_invalid_config_and_auth_fail_before_connecting() {
    let connector = FakeConnector::new();
    let manager = manager(StaticSession::with_operation(1), &connector);
    let err = manager
        .subscribe(SubscriptionConfig::new(SubscriptionCategory::Alert).capacity(0))
        .await
        .unwrap_err();
    assert!(err.is_configuration());

    let session = StaticSession {
        operation: Some(1),
        authenticated: false,
    };
    let manager = SubscriptionManager::new(Arc::new(session), connector.clone(), endpoint());
    let err = manager
        .subscribe(SubscriptionConfig::new(SubscriptionCategory::Alert))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Auth { .. }));
    assert_eq!(connector.connects(), 0);
}

#[tokio::test]
async fn test_connect_failure_is_returned_synchronously() {
    let connector = FakeConnector::failing();
    let manager = manager(StaticSession::with_operation(1), &connector);
    let err = manager
        .subscribe(SubscriptionConfig::new(SubscriptionCategory::Token))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Connection { .. }));
    assert_eq!(manager.active_count(), 0);
}

#[tokio::test]
async fn test_handler_error_is_reported_and_delivery_continues() {
    let connector = FakeConnector::new();
    let manager = manager(StaticSession::with_operation(1), &connector);
    let mut sub = manager
        .subscribe(
            SubscriptionConfig::new(SubscriptionCategory::Artifact).handler(
                |event: &SubscriptionEvent| {
                    if event.id() == Some(1) {
                        anyhow::bail!("cannot process artifact 1");
                    }
                    Ok(())
                },
            ),
        )
        .await
        .unwrap();

    connector
        .transport()
        .push("1", records("artifact", json!([{"id": 2}, {"id": 1}])));

    assert_eq!(next_event(&mut sub).await.id(), Some(2));
    assert_eq!(next_event(&mut sub).await.id(), Some(1));
    match next_error(&mut sub).await {
        Error::Handler { message, .. } => assert!(message.contains("artifact 1")),
        other => panic!("unexpected error: {}", other),
    }
    assert!(sub.is_active());
}

#[tokio::test]
async fn test_connection_loss_closes_every_subscription() {
    let connector = FakeConnector::new();
    let manager = manager(StaticSession::with_operation(1), &connector);
    let mut first = manager
        .subscribe(SubscriptionConfig::new(SubscriptionCategory::Callback))
        .await
        .unwrap();
    let mut second = manager
        .subscribe(SubscriptionConfig::new(SubscriptionCategory::Screenshot))
        .await
        .unwrap();

    let transport = connector.transport();
    transport.drop_connection();

    for sub in [&mut first, &mut second] {
        assert!(matches!(next_error(sub).await, Error::Connection { .. }));
        timeout(WAIT, sub.done.wait()).await.unwrap();
        assert!(!sub.is_active());
    }
    assert_eq!(manager.active_count(), 0);
    assert!(transport.unsubscribed().is_empty());

    // The next subscribe replaces the dead connection
    manager
        .subscribe(SubscriptionConfig::new(SubscriptionCategory::Callback))
        .await
        .unwrap();
    assert_eq!(connector.connects(), 2);
}

#[tokio::test]
async fn test_server_complete_and_error_end_subscription() {
    let connector = FakeConnector::new();
    let manager = manager(StaticSession::with_operation(1), &connector);
    let completed = manager
        .subscribe(SubscriptionConfig::new(SubscriptionCategory::File))
        .await
        .unwrap();
    let mut failed = manager
        .subscribe(SubscriptionConfig::new(SubscriptionCategory::Keylog))
        .await
        .unwrap();

    let transport = connector.transport();
    transport.push("1", Push::Complete);
    transport.push("2", Push::Error("permission denied".to_string()));

    timeout(WAIT, completed.done.wait()).await.unwrap();
    match next_error(&mut failed).await {
        Error::Subscription { message, .. } => assert_eq!(message, "permission denied"),
        other => panic!("unexpected error: {}", other),
    }
    timeout(WAIT, failed.done.wait()).await.unwrap();
    assert!(transport.unsubscribed().is_empty());
    completed.close().await.unwrap();
}

#[tokio::test]
async fn test_teardown_failure_still_closes() {
    let connector = FakeConnector::new();
    let manager = manager(StaticSession::with_operation(1), &connector);
    let mut sub = manager
        .subscribe(SubscriptionConfig::new(SubscriptionCategory::Process))
        .await
        .unwrap();
    connector
        .transport()
        .fail_unsubscribe
        .store(true, Ordering::SeqCst);

    sub.close().await.unwrap();
    assert!(!sub.is_active());
    assert_eq!(manager.active_count(), 0);
    assert!(matches!(next_error(&mut sub).await, Error::Teardown { .. }));
}

#[tokio::test]
async fn test_dropping_handle_tears_down() {
    let connector = FakeConnector::new();
    let manager = manager(StaticSession::with_operation(1), &connector);
    let sub = manager
        .subscribe(SubscriptionConfig::new(SubscriptionCategory::Token))
        .await
        .unwrap();
    drop(sub);

    wait_until(|| manager.active_count() == 0).await;
    assert_eq!(connector.transport().unsubscribed().len(), 1);
}

#[tokio::test]
async fn test_shutdown_closes_everything() {
    let connector = FakeConnector::new();
    let manager = manager(StaticSession::with_operation(1), &connector);
    let mut subs = Vec::new();
    for category in [
        SubscriptionCategory::Callback,
        SubscriptionCategory::Alert,
        SubscriptionCategory::All,
    ] {
        subs.push(
            manager
                .subscribe(SubscriptionConfig::new(category))
                .await
                .unwrap(),
        );
    }

    timeout(WAIT, manager.shutdown()).await.unwrap().unwrap();
    assert!(manager.is_shut_down());
    assert!(subs.iter().all(|s| !s.is_active() && s.done.is_fired()));
    assert_eq!(manager.active_count(), 0);

    let transport = connector.transport();
    assert_eq!(transport.unsubscribed().len(), 3);
    assert!(!transport.is_connected());

    let err = manager
        .subscribe(SubscriptionConfig::new(SubscriptionCategory::Callback))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Shutdown));
    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_callback_scenario_scoped_to_operation_seven() {
    let connector = FakeConnector::new();
    let manager = manager(StaticSession::with_operation(1), &connector);
    let mut sub = manager
        .subscribe(SubscriptionConfig::new(SubscriptionCategory::Callback).operation(7))
        .await
        .unwrap();

    let transport = connector.transport();
    {
        let subscribed = transport.subscribed.lock();
        let (_, query) = &subscribed[0];
        assert_eq!(query.variables, json!({"operation_id": 7}));
        assert!(query.document.contains("order_by: {id: desc}"));
    }

    transport.push(
        "1",
        records(
            "callback",
            json!([
                {"id": 12, "host": "WS01", "user": "alice"},
                {"id": 11, "host": "DC01", "user": "svc"}
            ]),
        ),
    );

    let first = next_event(&mut sub).await;
    let second = next_event(&mut sub).await;
    for event in [&first, &second] {
        assert_eq!(event.category, SubscriptionCategory::Callback);
    }
    assert_eq!(first.get("host"), Some(&json!("WS01")));
    assert_eq!(second.get("user"), Some(&json!("svc")));
}

#[tokio::test]
async fn test_filter_is_applied_per_event() {
    let connector = FakeConnector::new();
    let manager = manager(StaticSession::with_operation(1), &connector);
    let mut sub = manager
        .subscribe(
            SubscriptionConfig::new(SubscriptionCategory::Callback)
                .filter_field("host", json!("DC01")),
        )
        .await
        .unwrap();

    let transport = connector.transport();
    transport.push(
        "1",
        records(
            "callback",
            json!([{"id": 3, "host": "WS01"}, {"id": 2, "host": "DC01"}]),
        ),
    );
    assert_eq!(next_event(&mut sub).await.id(), Some(2));

    transport.push("1", records("callback", json!([{"id": 4, "host": "DC01"}])));
    assert_eq!(next_event(&mut sub).await.id(), Some(4));
}

#[tokio::test]
async fn test_slow_consumer_only_sees_latest_pending_snapshot() {
    let connector = FakeConnector::new();
    let manager = manager(StaticSession::with_operation(1), &connector);

    let handled = Arc::new(AtomicUsize::new(0));
    let counter = handled.clone();
    let mut sub = manager
        .subscribe(
            SubscriptionConfig::new(SubscriptionCategory::Keylog)
                .capacity(1)
                .handler(move |_event: &SubscriptionEvent| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
        )
        .await
        .unwrap();

    let transport = connector.transport();
    let snapshot = |newest: i64| {
        let rows: Vec<Value> = (1..=newest).rev().map(|id| json!({"id": id})).collect();
        records("keylog", Value::Array(rows))
    };

    transport.push("1", snapshot(1));
    wait_until(|| handled.load(Ordering::SeqCst) >= 1).await;
    transport.push("1", snapshot(2));
    // Event 2 is handled and waiting for room behind event 1
    wait_until(|| handled.load(Ordering::SeqCst) >= 2).await;

    for newest in 3..=5 {
        transport.push("1", snapshot(newest));
    }

    let mut ids = Vec::new();
    for _ in 0..8 {
        ids.push(next_event(&mut sub).await.id().unwrap());
    }
    assert_eq!(ids, vec![1, 2, 1, 5, 4, 3, 2, 1]);
    assert!(timeout(Duration::from_millis(100), sub.events.recv())
        .await
        .is_err());
}

#[tokio::test]
async fn test_close_all_keeps_manager_usable() {
    let connector = FakeConnector::new();
    let manager = manager(StaticSession::with_operation(1), &connector);
    let first = manager
        .subscribe(SubscriptionConfig::new(SubscriptionCategory::Callback))
        .await
        .unwrap();
    let second = manager
        .subscribe(SubscriptionConfig::new(SubscriptionCategory::Alert))
        .await
        .unwrap();

    timeout(WAIT, manager.close_all()).await.unwrap().unwrap();
    assert!(!first.is_active() && first.done.is_fired());
    assert!(!second.is_active() && second.done.is_fired());
    assert_eq!(manager.active_count(), 0);
    assert!(!manager.is_shut_down());

    let old = connector.transport();
    assert_eq!(old.unsubscribed().len(), 2);
    assert!(!old.is_connected());

    let third = manager
        .subscribe(SubscriptionConfig::new(SubscriptionCategory::Callback))
        .await
        .unwrap();
    assert!(third.is_active());
    assert_eq!(connector.connects(), 2);
}
