//! Impure I/O for one MQTT session
//!
//! A session owns a rumqttc client and a supervisor task polling its event
//! loop. rumqttc reconnects on the next poll after an error, so the supervisor
//! only reports the failure, waits `reconnect_period` and polls again until the
//! session is closed.
//!
//! A publish completes when the broker's PUBACK arrives, not when rumqttc
//! takes the request.

use super::ack_tracker::{AckFailure, AckTracker};
use super::connection::{configure_mqtt_options, ConnectionState, MqttError, SessionOptions};
use super::health_monitor::{ConnectionEvent, HealthMonitor};
use super::message_handler::{EventRoute, MessageForwarder, MessageHandler};
use crate::transport::{ConnectionSignals, SessionFactory, SessionHooks, Transport};
use async_trait::async_trait;
use rumqttc::v5::{mqttbytes::QoS, AsyncClient, EventLoop};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capacity of the rumqttc request channel
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// Bound on handing a request to the event loop
const REQUEST_ENQUEUE_TIMEOUT: Duration = Duration::from_secs(2);

/// Bound on waiting for the broker to acknowledge a publish
const PUBACK_TIMEOUT: Duration = Duration::from_secs(10);

/// One live broker session
pub struct MqttSession {
    client_id: String,
    client: AsyncClient,
    signals: Arc<ConnectionSignals>,
    acks: Arc<AckTracker>,
    /// Keeps ack registration in request order
    publish_order: tokio::sync::Mutex<()>,
    shutdown_tx: watch::Sender<bool>,
    event_loop_handle: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl MqttSession {
    /// Create the client and spawn its event loop supervisor
    ///
    /// Returns immediately in the `Connecting` state; progress is reported on
    /// the hooks' event channel.
    pub fn start(options: &SessionOptions, hooks: SessionHooks) -> Result<Arc<Self>, MqttError> {
        let mqtt_options = configure_mqtt_options(options)?;
        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);

        let signals = Arc::new(ConnectionSignals::new(hooks.events));
        let acks = Arc::new(AckTracker::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let supervisor = EventLoopSupervisor {
            client_id: options.client_id.clone(),
            signals: signals.clone(),
            acks: acks.clone(),
            forwarder: MessageForwarder::new(hooks.inbound),
            reconnect_period: options.reconnect_period,
        };
        let handle = tokio::spawn(supervisor.run(event_loop, shutdown_rx));

        info!(client_id = %options.client_id, broker = %options.broker_url, "Opened MQTT session");

        Ok(Arc::new(Self {
            client_id: options.client_id.clone(),
            client,
            signals,
            acks,
            publish_order: tokio::sync::Mutex::new(()),
            shutdown_tx,
            event_loop_handle: Mutex::new(Some(handle)),
            closed: AtomicBool::new(false),
        }))
    }

    /// Check connection state before operations
    fn check_connection_state(
        &self,
        allowed: fn(&ConnectionState) -> bool,
    ) -> Result<(), MqttError> {
        if self.is_closed() {
            return Err(MqttError::SessionClosed);
        }

        let state = self.signals.state();
        if !allowed(&state) {
            return Err(MqttError::NotConnected { state });
        }

        Ok(())
    }

    fn take_handle(&self) -> Option<JoinHandle<()>> {
        self.event_loop_handle
            .lock()
            .ok()
            .and_then(|mut handle| handle.take())
    }
}

#[async_trait]
impl Transport for MqttSession {
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), MqttError> {
        self.check_connection_state(HealthMonitor::can_publish)?;

        let acked = {
            let _order = self.publish_order.lock().await;
            let acked = self.acks.register();
            let request = self
                .client
                .publish(topic.to_string(), QoS::AtLeastOnce, retain, payload);
            match tokio::time::timeout(REQUEST_ENQUEUE_TIMEOUT, request).await {
                Ok(Ok(())) => acked,
                Ok(Err(e)) => {
                    self.acks.withdraw_last();
                    return Err(MqttError::publish_failed(topic, e));
                }
                Err(_) => {
                    self.acks.withdraw_last();
                    return Err(MqttError::publish_failed(topic, "request queue full"));
                }
            }
        };

        match tokio::time::timeout(PUBACK_TIMEOUT, acked).await {
            Ok(Ok(Ok(()))) => {
                debug!(topic = %topic, retain, "Publish acknowledged by broker");
                Ok(())
            }
            Ok(Ok(Err(AckFailure::Rejected(reason)))) => {
                Err(MqttError::publish_rejected(topic, reason))
            }
            Ok(Ok(Err(AckFailure::Closed))) => Err(MqttError::SessionClosed),
            Ok(Ok(Err(AckFailure::Dropped))) => Err(MqttError::publish_failed(
                topic,
                "publish not resent after reconnect",
            )),
            Ok(Err(_)) => Err(MqttError::publish_failed(topic, "acknowledgement lost")),
            Err(_) => Err(MqttError::publish_failed(
                topic,
                format!("no PUBACK within {}s", PUBACK_TIMEOUT.as_secs()),
            )),
        }
    }

    async fn subscribe(&self, pattern: &str) -> Result<(), MqttError> {
        self.check_connection_state(HealthMonitor::can_subscribe)?;

        let request = self.client.subscribe(pattern.to_string(), QoS::AtLeastOnce);
        match tokio::time::timeout(REQUEST_ENQUEUE_TIMEOUT, request).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(MqttError::subscription_failed(pattern, e)),
            Err(_) => Err(MqttError::subscription_failed(pattern, "request queue full")),
        }
    }

    async fn unsubscribe(&self, pattern: &str) -> Result<(), MqttError> {
        self.check_connection_state(HealthMonitor::can_subscribe)?;

        let request = self.client.unsubscribe(pattern.to_string());
        match tokio::time::timeout(REQUEST_ENQUEUE_TIMEOUT, request).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(MqttError::subscription_failed(pattern, e)),
            Err(_) => Err(MqttError::subscription_failed(pattern, "request queue full")),
        }
    }

    fn connection_state(&self) -> ConnectionState {
        self.signals.state()
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

        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.take_handle() {
            // Hard close: dropping the event loop drops the socket
            handle.abort();
            let _ = handle.await;
        }
        self.acks.close();

        if self.signals.state() != ConnectionState::Disconnected {
            self.signals
                .apply(ConnectionEvent::Disconnected("closed by client".to_string()));
        }
        info!(client_id = %self.client_id, "MQTT session closed");
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        if let Some(handle) = self.take_handle() {
            handle.abort();
        }
    }
}

/// Polls the event loop and reports lifecycle changes
struct EventLoopSupervisor {
    client_id: String,
    signals: Arc<ConnectionSignals>,
    acks: Arc<AckTracker>,
    forwarder: MessageForwarder,
    reconnect_period: Duration,
}

impl EventLoopSupervisor {
    async fn run(self, mut event_loop: EventLoop, mut shutdown_rx: watch::Receiver<bool>) {
        debug!(client_id = %self.client_id, "Starting MQTT event loop supervisor");
        let mut reconnect_attempts = 0u32;

        loop {
            let result = tokio::select! {
                biased;
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
                result = event_loop.poll() => result,
            };

            match result {
                Ok(event) => {
                    let route = MessageHandler::route_mqtt_event(&event);
                    self.process_event_route(route, &mut reconnect_attempts).await;
                }
                Err(e) => {
                    let rejection = MessageHandler::publish_rejection(&e);
                    if let Some(reason) = &rejection {
                        warn!(client_id = %self.client_id, reason = %reason, "Broker refused a publish");
                    }
                    self.acks.on_connection_lost(rejection);

                    if let Some(event) =
                        HealthMonitor::failure_event(&self.signals.state(), e.to_string())
                    {
                        self.signals.apply(event);
                    }

                    reconnect_attempts = reconnect_attempts.saturating_add(1);
                    self.signals
                        .apply(ConnectionEvent::Reconnecting(reconnect_attempts));

                    if !interruptible_sleep(shutdown_rx.clone(), self.reconnect_period).await {
                        break;
                    }
                }
            }
        }

        debug!(client_id = %self.client_id, "MQTT event loop supervisor stopped");
    }

    async fn process_event_route(&self, route: EventRoute, reconnect_attempts: &mut u32) {
        match route {
            EventRoute::ConnectionAcknowledged => {
                *reconnect_attempts = 0;
                self.signals.apply(ConnectionEvent::Connected);
            }
            EventRoute::MessageReceived(message) => {
                self.forwarder.forward(message).await;
            }
            EventRoute::Disconnected(reason) => {
                warn!(client_id = %self.client_id, reason = %reason, "Broker closed the connection");
                if self.signals.state() == ConnectionState::Connected {
                    self.signals.apply(ConnectionEvent::Disconnected(reason));
                }
            }
            EventRoute::PublishWritten { packet_id } => self.acks.on_outgoing(packet_id),
            EventRoute::PublishDeferred { packet_id } => {
                debug!(target: "mqtt_transport", packet_id, "Publish waits for a free packet id");
                self.acks.on_deferred(packet_id);
            }
            EventRoute::PublishAcknowledged { packet_id } => self.acks.on_ack(packet_id),
            EventRoute::SubscriptionConfirmed { packet_id } => {
                debug!(target: "mqtt_transport", packet_id, "Subscription confirmed");
            }
            EventRoute::InfrastructureEvent(event) => {
                debug!(target: "mqtt_transport", "MQTT event: {}", event);
            }
            EventRoute::OutgoingEvent => {}
        }
    }
}

/// Perform interruptible sleep with shutdown monitoring
/// Returns true if sleep completed, false if shutdown requested
async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay: Duration) -> bool {
    if *shutdown_rx.borrow() {
        return false;
    }

    tokio::select! {
        changed = shutdown_rx.changed() => {
            changed.is_ok() && !*shutdown_rx.borrow()
        }
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Opens real rumqttc sessions
#[derive(Debug, Clone, Copy, Default)]
pub struct MqttSessionFactory;

#[async_trait]
impl SessionFactory for MqttSessionFactory {
    async fn open(
        &self,
        options: &SessionOptions,
        hooks: SessionHooks,
    ) -> Result<Arc<dyn Transport>, MqttError> {
        let session: Arc<dyn Transport> = MqttSession::start(options, hooks)?;
        Ok(session)
    }
}
