//! Mock implementations for testing
//!
//! Provides an in-process broker session ([`MockTransport`]), the factory that
//! hands it out ([`MockSessionFactory`]), a sleeper that records instead of
//! waiting, and a store that always fails.

use crate::messaging::Sleeper;
use crate::protocol::DeviceStatus;
use crate::store::{BindingStore, Device, DeviceStore, Record, StoreError};
use crate::transport::{
    ConnectionEvent, ConnectionState, HealthMonitor, InboundMessage, MqttError, SessionFactory,
    SessionHooks, SessionOptions, Transport,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One publish seen by a mock session
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

/// Mock broker session
///
/// Records publishes and subscriptions. Lifecycle changes are driven by the
/// test through the `simulate_*` methods and reported on the hooks the
/// session was opened with.
#[derive(Debug)]
pub struct MockTransport {
    client_id: String,
    state: Mutex<ConnectionState>,
    hooks: Mutex<Option<SessionHooks>>,
    published: Mutex<Vec<PublishedMessage>>,
    subscriptions: Mutex<Vec<String>>,
    unsubscriptions: Mutex<Vec<String>>,
    failing_publishes: AtomicU32,
    rejection: Mutex<Option<String>>,
    reconnect_attempts: AtomicU32,
    closed: AtomicBool,
}

impl MockTransport {
    /// Unattached session in the `Connecting` state
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            state: Mutex::new(ConnectionState::Connecting),
            hooks: Mutex::new(None),
            published: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            unsubscriptions: Mutex::new(Vec::new()),
            failing_publishes: AtomicU32::new(0),
            rejection: Mutex::new(None),
            reconnect_attempts: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn connected(client_id: impl Into<String>) -> Self {
        let transport = Self::new(client_id);
        transport.simulate_connect();
        transport
    }

    pub fn disconnected(client_id: impl Into<String>) -> Self {
        let transport = Self::new(client_id);
        transport.apply(ConnectionEvent::Disconnected("mock disconnected".to_string()));
        transport
    }

    /// Report into the given inbound channel and event broadcast from now on
    pub fn attach(&self, hooks: SessionHooks) {
        if let Ok(mut current) = self.hooks.lock() {
            *current = Some(hooks);
        }
    }

    fn apply(&self, event: ConnectionEvent) {
        if let Ok(mut state) = self.state.lock() {
            *state = HealthMonitor::determine_next_state(&state, &event);
        }
        let events = self
            .hooks
            .lock()
            .ok()
            .and_then(|hooks| hooks.as_ref().map(|h| h.events.clone()));
        if let Some(events) = events {
            let _ = events.send(event);
        }
    }

    pub fn simulate_connect(&self) {
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        self.apply(ConnectionEvent::Connected);
    }

    /// Drop the connection and start auto-reconnecting
    pub fn simulate_disconnect(&self, reason: &str) {
        self.apply(ConnectionEvent::Disconnected(reason.to_string()));
        let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        self.apply(ConnectionEvent::Reconnecting(attempt));
    }

    pub fn simulate_error(&self, reason: &str) {
        self.apply(ConnectionEvent::Errored(reason.to_string()));
    }

    /// Make the next `count` publishes fail
    pub fn fail_next_publishes(&self, count: u32) {
        self.failing_publishes.store(count, Ordering::SeqCst);
    }

    /// Answer every following publish with a negative PUBACK
    pub fn reject_publishes(&self, reason: &str) {
        if let Ok(mut rejection) = self.rejection.lock() {
            *rejection = Some(reason.to_string());
        }
    }

    /// Deliver a message as if the broker had sent it
    pub async fn inject(&self, topic: &str, payload: &[u8]) -> bool {
        let inbound = self
            .hooks
            .lock()
            .ok()
            .and_then(|hooks| hooks.as_ref().map(|h| h.inbound.clone()));
        match inbound {
            Some(inbound) => inbound
                .send(InboundMessage::new(topic, payload.to_vec()))
                .await
                .is_ok(),
            None => false,
        }
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().map(|p| p.clone()).unwrap_or_default()
    }

    /// Payloads published to `topic`, oldest first
    pub fn published_to(&self, topic: &str) -> Vec<Vec<u8>> {
        self.published()
            .into_iter()
            .filter(|p| p.topic == topic)
            .map(|p| p.payload)
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn unsubscriptions(&self) -> Vec<String> {
        self.unsubscriptions
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn clear_history(&self) {
        if let Ok(mut published) = self.published.lock() {
            published.clear();
        }
        if let Ok(mut subscriptions) = self.subscriptions.lock() {
            subscriptions.clear();
        }
    }

    fn check_usable(&self, allowed: fn(&ConnectionState) -> bool) -> Result<(), MqttError> {
        if self.is_closed() {
            return Err(MqttError::SessionClosed);
        }
        let state = self.connection_state();
        if !allowed(&state) {
            return Err(MqttError::NotConnected { state });
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), MqttError> {
        self.check_usable(HealthMonitor::can_publish)?;

        let injected_failure = self
            .failing_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected_failure {
            return Err(MqttError::publish_failed(topic, "injected publish failure"));
        }
        let rejection = self.rejection.lock().ok().and_then(|r| r.clone());
        if let Some(reason) = rejection {
            return Err(MqttError::publish_rejected(topic, reason));
        }

        if let Ok(mut published) = self.published.lock() {
            published.push(PublishedMessage {
                topic: topic.to_string(),
                payload,
                retain,
            });
        }
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<(), MqttError> {
        self.check_usable(HealthMonitor::can_subscribe)?;
        if let Ok(mut subscriptions) = self.subscriptions.lock() {
            subscriptions.push(pattern.to_string());
        }
        Ok(())
    }

    async fn unsubscribe(&self, pattern: &str) -> Result<(), MqttError> {
        self.check_usable(HealthMonitor::can_subscribe)?;
        if let Ok(mut unsubscriptions) = self.unsubscriptions.lock() {
            unsubscriptions.push(pattern.to_string());
        }
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        self.state
            .lock()
            .map(|s| s.clone())
            .unwrap_or(ConnectionState::Disconnected)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.connection_state() != ConnectionState::Disconnected {
            self.apply(ConnectionEvent::Disconnected("closed by client".to_string()));
        }
    }
}

/// What a mock session does when opened
#[derive(Debug, Clone, PartialEq)]
pub enum MockConnectBehavior {
    /// Report `Connected` immediately
    Connect,
    /// Stay in `Connecting` until the test drives it
    Stay,
    /// Report `Errored` with this reason
    Error(String),
    /// Fail `open` itself
    FailOpen(String),
}

/// Session factory handing out [`MockTransport`]s
#[derive(Debug)]
pub struct MockSessionFactory {
    behavior: Mutex<MockConnectBehavior>,
    prepared: Mutex<Option<Arc<MockTransport>>>,
    sessions: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockSessionFactory {
    pub fn new() -> Self {
        Self::with_behavior(MockConnectBehavior::Connect)
    }

    pub fn with_behavior(behavior: MockConnectBehavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            prepared: Mutex::new(None),
            sessions: Mutex::new(Vec::new()),
        }
    }

    pub fn set_behavior(&self, behavior: MockConnectBehavior) {
        if let Ok(mut current) = self.behavior.lock() {
            *current = behavior;
        }
    }

    /// The session the next `open` will return, for setup before it exists
    pub fn prepare_next(&self) -> Arc<MockTransport> {
        let session = Arc::new(MockTransport::new(format!(
            "mock-session-{}",
            self.open_count() + 1
        )));
        if let Ok(mut prepared) = self.prepared.lock() {
            *prepared = Some(session.clone());
        }
        session
    }

    /// Sessions opened so far, oldest first
    pub fn sessions(&self) -> Vec<Arc<MockTransport>> {
        self.sessions.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn last_session(&self) -> Option<Arc<MockTransport>> {
        self.sessions().last().cloned()
    }

    pub fn open_count(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl Default for MockSessionFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionFactory for MockSessionFactory {
    async fn open(
        &self,
        options: &SessionOptions,
        hooks: SessionHooks,
    ) -> Result<Arc<dyn Transport>, MqttError> {
        let behavior = self
            .behavior
            .lock()
            .map(|b| b.clone())
            .unwrap_or(MockConnectBehavior::Connect);
        if let MockConnectBehavior::FailOpen(reason) = behavior {
            return Err(MqttError::ConnectionFailed(reason.into()));
        }

        let session = self
            .prepared
            .lock()
            .ok()
            .and_then(|mut prepared| prepared.take())
            .unwrap_or_else(|| Arc::new(MockTransport::new(options.client_id.clone())));
        session.attach(hooks);
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.push(session.clone());
        }

        match behavior {
            MockConnectBehavior::Connect => session.simulate_connect(),
            MockConnectBehavior::Error(reason) => session.simulate_error(&reason),
            MockConnectBehavior::Stay | MockConnectBehavior::FailOpen(_) => {}
        }
        Ok(session)
    }
}

/// Sleeper that records requested delays and returns at once
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    recorded: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn recorded(&self) -> Vec<Duration> {
        self.recorded.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        if let Ok(mut recorded) = self.recorded.lock() {
            recorded.push(duration);
        }
        tokio::task::yield_now().await;
    }
}

/// Store whose every operation fails
#[derive(Debug, Default, Clone, Copy)]
pub struct FailingStore;

fn unavailable() -> StoreError {
    StoreError::Backend("store unavailable".to_string())
}

#[async_trait]
impl DeviceStore for FailingStore {
    async fn find_device(&self, _device_id: &str) -> Result<Option<Device>, StoreError> {
        Err(unavailable())
    }

    async fn upsert_device(
        &self,
        _device_id: &str,
        _status: &DeviceStatus,
        _seen_at: DateTime<Utc>,
    ) -> Result<Device, StoreError> {
        Err(unavailable())
    }

    async fn update_device_status(
        &self,
        _device_id: &str,
        _status: &DeviceStatus,
        _at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        Err(unavailable())
    }

    async fn list_devices(&self) -> Result<Vec<Device>, StoreError> {
        Err(unavailable())
    }

    async fn find_record_by_device(&self, _device_id: &str) -> Result<Option<Record>, StoreError> {
        Err(unavailable())
    }

    async fn find_record(&self, _record_id: &str) -> Result<Option<Record>, StoreError> {
        Err(unavailable())
    }
}

#[async_trait]
impl BindingStore for FailingStore {
    async fn bind_device(&self, _record_id: &str, _device_id: &str) -> Result<Record, StoreError> {
        Err(unavailable())
    }

    async fn unbind_device(&self, _record_id: &str) -> Result<Record, StoreError> {
        Err(unavailable())
    }

    async fn list_available_devices(&self) -> Result<Vec<Device>, StoreError> {
        Err(unavailable())
    }
}

/// Poll `condition` until it holds, giving background tasks time to run
///
/// Returns false after roughly two seconds.
pub async fn wait_for(condition: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
