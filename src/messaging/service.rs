//! Service facade over the messaging core
//!
//! [`MessagingService`] wires the connection manager, router, reconciler,
//! dispatcher and sweep together and runs two background tasks:
//!
//! - the inbound loop, which handles broker messages one at a time in arrival order
//! - the lifecycle loop, which reacts to connection events (sweep, resubscribe, metrics)

use super::connection_manager::ConnectionManager;
use super::dispatcher::{CommandDispatcher, CommandReceipt};
use super::reconciler::DeviceReconciler;
use super::retry::Sleeper;
use super::router::TopicRouter;
use super::sweep::LivenessSweep;
use crate::config::{DispatchSection, ParcelaConfig};
use crate::error::{ParcelaError, ParcelaResult};
use crate::observability::metrics;
use crate::protocol::{AlarmAction, DecodeError, TopicScheme};
use crate::store::DeviceStore;
use crate::transport::{
    ConnectionEvent, ConnectionState, InboundMessage, SessionFactory, SessionOptions,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

pub struct MessagingService {
    connection: Arc<ConnectionManager>,
    router: Arc<TopicRouter>,
    reconciler: Arc<DeviceReconciler>,
    dispatcher: Arc<CommandDispatcher>,
    sweep: Arc<LivenessSweep>,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MessagingService {
    pub fn new(
        topics: TopicScheme,
        dispatch: &DispatchSection,
        factory: Arc<dyn SessionFactory>,
        options: SessionOptions,
        store: Arc<dyn DeviceStore>,
    ) -> Self {
        Self::build(topics, dispatch, factory, options, store, None)
    }

    /// Same as [`MessagingService::new`] with a custom retry sleeper
    pub fn with_sleeper(
        topics: TopicScheme,
        dispatch: &DispatchSection,
        factory: Arc<dyn SessionFactory>,
        options: SessionOptions,
        store: Arc<dyn DeviceStore>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self::build(topics, dispatch, factory, options, store, Some(sleeper))
    }

    /// Build from configuration, resolving broker credentials from the environment
    pub fn from_config(
        config: &ParcelaConfig,
        factory: Arc<dyn SessionFactory>,
        store: Arc<dyn DeviceStore>,
    ) -> ParcelaResult<Self> {
        let topics = config.topics()?;
        let options = config.session_options()?;
        Ok(Self::new(topics, &config.dispatch, factory, options, store))
    }

    fn build(
        topics: TopicScheme,
        dispatch: &DispatchSection,
        factory: Arc<dyn SessionFactory>,
        options: SessionOptions,
        store: Arc<dyn DeviceStore>,
        sleeper: Option<Arc<dyn Sleeper>>,
    ) -> Self {
        let connection = Arc::new(ConnectionManager::new(factory, options));

        let mut dispatcher =
            CommandDispatcher::new(connection.clone(), store.clone(), topics.clone(), dispatch);
        if let Some(sleeper) = sleeper {
            dispatcher = dispatcher.with_sleeper(sleeper);
        }
        let dispatcher = Arc::new(dispatcher);

        Self {
            router: Arc::new(TopicRouter::new(topics.clone())),
            reconciler: Arc::new(DeviceReconciler::new(store.clone(), dispatcher.clone())),
            sweep: Arc::new(LivenessSweep::new(store, topics)),
            dispatcher,
            connection,
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn dispatcher(&self) -> &Arc<CommandDispatcher> {
        &self.dispatcher
    }

    pub fn router(&self) -> &Arc<TopicRouter> {
        &self.router
    }

    /// Spawn the background loops once and start connecting
    ///
    /// Does not wait for the broker; use [`MessagingService::wait_until_connected`].
    pub async fn start(&self) -> ParcelaResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("Messaging service already started");
            return Ok(());
        }

        // Subscribe before connecting so the first Connected is seen
        let events = self.connection.events();
        let mut tasks = Vec::with_capacity(2);

        if let Some(inbound) = self.connection.take_inbound() {
            tasks.push(tokio::spawn(run_inbound_loop(
                inbound,
                self.router.clone(),
                self.reconciler.clone(),
            )));
        }
        tasks.push(tokio::spawn(run_lifecycle_loop(
            events,
            self.connection.clone(),
            self.router.clone(),
            self.sweep.clone(),
        )));

        if let Ok(mut handles) = self.tasks.lock() {
            handles.extend(tasks);
        }

        info!(
            client_id = %self.connection.options().client_id,
            namespace = %self.router.topics().namespace(),
            "Messaging service started"
        );
        self.connection.connect().await?;
        Ok(())
    }

    /// Wait for a connected session, opening one if needed
    pub async fn wait_until_connected(&self, timeout: Duration) -> ParcelaResult<()> {
        self.connection.connect_and_wait(timeout).await.map(|_| ())
    }

    /// Parse `action` and send it to the device bound to `record_id`
    pub async fn send_alarm_command(
        &self,
        record_id: &str,
        action: &str,
    ) -> ParcelaResult<CommandReceipt> {
        let action: AlarmAction = action.parse()?;
        self.dispatcher.send_alarm_command(record_id, action).await
    }

    pub async fn confirm_device_binding(
        &self,
        record_id: &str,
        device_id: &str,
    ) -> ParcelaResult<CommandReceipt> {
        self.dispatcher
            .confirm_device_binding(record_id, device_id)
            .await
    }

    pub async fn send_disconnect(&self, record_id: &str) -> ParcelaResult<CommandReceipt> {
        self.dispatcher.send_disconnect(record_id).await
    }

    pub fn current_connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Close the broker connection; background loops keep running
    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    /// Close the connection and stop the background loops
    ///
    /// A shut down service cannot be started again.
    pub async fn shutdown(&self) {
        self.connection.disconnect().await;

        let tasks = self
            .tasks
            .lock()
            .map(|mut handles| std::mem::take(&mut *handles))
            .unwrap_or_default();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
        info!("Messaging service stopped");
    }
}

/// Handle inbound messages strictly one at a time
async fn run_inbound_loop(
    mut inbound: mpsc::Receiver<InboundMessage>,
    router: Arc<TopicRouter>,
    reconciler: Arc<DeviceReconciler>,
) {
    while let Some(message) = inbound.recv().await {
        let span = crate::mqtt_span!(topic = %message.topic, retain = message.retain);
        handle_inbound(&message, &router, &reconciler)
            .instrument(span)
            .await;
    }
    debug!("Inbound channel closed, inbound loop exiting");
}

async fn handle_inbound(
    message: &InboundMessage,
    router: &TopicRouter,
    reconciler: &DeviceReconciler,
) {
    metrics().message_received();

    let routed = match router.route(&message.topic, &message.payload) {
        Ok(Some(routed)) => routed,
        Ok(None) => return,
        Err(ParcelaError::MessageDecode {
            source: DecodeError::Empty,
            ..
        }) => {
            // Retained snapshots cleared by the liveness sweep come back empty
            debug!(topic = %message.topic, "Ignoring empty payload");
            metrics().message_dropped();
            return;
        }
        Err(e) => {
            warn!(topic = %message.topic, error = %e, "Dropping malformed device message");
            metrics().message_dropped();
            return;
        }
    };

    let device_id = routed.announcement().device_id.clone();
    let kind = routed.kind();
    let span = crate::device_span!(device_id = %device_id, kind);
    if let Err(e) = reconciler.handle(routed).instrument(span).await {
        error!(
            topic = %message.topic,
            device_id = %device_id,
            error = %e,
            "Failed to reconcile device message"
        );
    }
}

/// React to connection lifecycle events of every session
async fn run_lifecycle_loop(
    mut events: broadcast::Receiver<ConnectionEvent>,
    connection: Arc<ConnectionManager>,
    router: Arc<TopicRouter>,
    sweep: Arc<LivenessSweep>,
) {
    loop {
        match events.recv().await {
            Ok(ConnectionEvent::Connected) => {
                metrics().mqtt_connection_established();
                restore_session(&connection, &router, &sweep).await;
            }
            Ok(ConnectionEvent::Disconnected(reason)) => {
                metrics().mqtt_connection_lost();
                warn!(reason = %reason, "Broker connection lost");
            }
            Ok(ConnectionEvent::Errored(reason)) => {
                metrics().mqtt_connection_errored();
                warn!(reason = %reason, "Broker connection error");
            }
            Ok(ConnectionEvent::Reconnecting(attempt)) => {
                metrics().mqtt_reconnect_attempt();
                info!(attempt, "Reconnecting to broker");
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Lifecycle loop lagged behind connection events");
                if connection.state() == ConnectionState::Connected {
                    restore_session(&connection, &router, &sweep).await;
                }
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Sweep stale retained snapshots, then re-establish subscriptions
async fn restore_session(
    connection: &ConnectionManager,
    router: &TopicRouter,
    sweep: &LivenessSweep,
) {
    let Some(session) = connection.settled_session().await else {
        debug!("Connected event for a session that is already gone");
        return;
    };

    let report = sweep.run(session.as_ref()).await;
    let subscribed = router.on_connected(session.as_ref()).await;
    info!(
        client_id = %session.client_id(),
        cleared = report.cleared,
        subscribed,
        "Session restored"
    );
}
