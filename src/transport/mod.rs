//! Transport layer for broker communication
//!
//! The rest of the crate talks to the broker through two seams:
//!
//! - [`SessionFactory`] opens one live session from [`SessionOptions`]
//! - [`Transport`] is the open session: publish, subscribe, state, close
//!
//! Sessions report lifecycle changes on a broadcast channel and forward every
//! inbound publish to a single mpsc channel, both handed over in [`SessionHooks`].
//! The MQTT implementation lives in [`mqtt`]; tests use the mocks in
//! `crate::testing`.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};

pub mod mqtt;

pub use mqtt::{
    ConnectionEvent, ConnectionState, HealthMonitor, MqttError, MqttSession, MqttSessionFactory,
    SessionOptions, WillMessage,
};

/// Capacity of the lifecycle broadcast channel
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Capacity of the inbound message channel
pub const INBOUND_CHANNEL_CAPACITY: usize = 256;

/// A publish received from the broker
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub retain: bool,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain: false,
        }
    }
}

/// Channels a session reports into
#[derive(Debug, Clone)]
pub struct SessionHooks {
    pub inbound: mpsc::Sender<InboundMessage>,
    pub events: broadcast::Sender<ConnectionEvent>,
}

/// One open broker session
///
/// Implementations must accept concurrent calls; publishes from several tasks
/// share the same session.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish at QoS 1
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), MqttError>;

    /// Subscribe to a topic filter at QoS 1
    async fn subscribe(&self, pattern: &str) -> Result<(), MqttError>;

    async fn unsubscribe(&self, pattern: &str) -> Result<(), MqttError>;

    fn connection_state(&self) -> ConnectionState;

    fn is_connected(&self) -> bool {
        HealthMonitor::can_publish(&self.connection_state())
    }

    /// True once [`Transport::close`] ran; a closed session never reconnects
    fn is_closed(&self) -> bool;

    fn client_id(&self) -> &str;

    /// Hard close without waiting for in-flight acknowledgements
    async fn close(&self);
}

impl fmt::Debug for dyn Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("client_id", &self.client_id())
            .field("state", &self.connection_state())
            .finish()
    }
}

/// Opens sessions; injected so tests never touch a real broker
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(
        &self,
        options: &SessionOptions,
        hooks: SessionHooks,
    ) -> Result<Arc<dyn Transport>, MqttError>;
}

/// State watch plus lifecycle broadcast for one session
///
/// Every state change goes through [`ConnectionSignals::apply`] so the watched
/// state is updated before observers see the event.
#[derive(Debug)]
pub struct ConnectionSignals {
    state_tx: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionSignals {
    pub fn new(events: broadcast::Sender<ConnectionEvent>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        Self { state_tx, events }
    }

    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    /// Apply a lifecycle event and broadcast it
    pub fn apply(&self, event: ConnectionEvent) {
        let current = self.state();
        let next = HealthMonitor::determine_next_state(&current, &event);
        HealthMonitor::log_state_transition(&current, &next);
        self.state_tx.send_replace(next);
        // No receivers is fine, nobody may be watching yet
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_signals_update_state_before_broadcast() {
        let (events_tx, mut events_rx) = broadcast::channel(8);
        let signals = Arc::new(ConnectionSignals::new(events_tx));
        assert_eq!(signals.state(), ConnectionState::Connecting);

        signals.apply(ConnectionEvent::Connected);

        assert_eq!(events_rx.recv().await.unwrap(), ConnectionEvent::Connected);
        assert_eq!(signals.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_signals_without_receivers() {
        let (events_tx, _) = broadcast::channel(8);
        let signals = ConnectionSignals::new(events_tx);
        signals.apply(ConnectionEvent::Errored("refused".to_string()));
        assert_eq!(
            signals.state(),
            ConnectionState::Errored("refused".to_string())
        );
    }

    #[test]
    fn test_session_handle_debug_output() {
        let session: Arc<dyn Transport> = Arc::new(crate::testing::MockTransport::connected("core-1"));
        let rendered = format!("{session:?}");
        assert!(rendered.contains("core-1"));
        assert!(rendered.contains("Connected"));
    }

    #[test]
    fn test_inbound_message_defaults() {
        let msg = InboundMessage::new("parcela/D1/status", &b"{}"[..]);
        assert_eq!(msg.topic, "parcela/D1/status");
        assert!(!msg.retain);
    }
}
