//! Ownership of the single broker session

use crate::error::{ParcelaError, ParcelaResult};
use crate::transport::{
    ConnectionEvent, ConnectionState, InboundMessage, MqttError, SessionFactory, SessionHooks,
    SessionOptions, Transport, EVENT_CHANNEL_CAPACITY, INBOUND_CHANNEL_CAPACITY,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

/// Opens, hands out and closes the process-wide broker session
///
/// At most one live session exists at a time. Every session reports into the
/// same inbound channel and event broadcast, so observers survive a
/// disconnect/connect cycle.
pub struct ConnectionManager {
    factory: Arc<dyn SessionFactory>,
    options: SessionOptions,
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundMessage>>>,
    events_tx: broadcast::Sender<ConnectionEvent>,
    session: Mutex<Option<Arc<dyn Transport>>>,
    open_lock: tokio::sync::Mutex<()>,
}

impl ConnectionManager {
    pub fn new(factory: Arc<dyn SessionFactory>, options: SessionOptions) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            factory,
            options,
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            events_tx,
            session: Mutex::new(None),
            open_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Take the receiving end of the inbound channel; only the first call gets it
    pub fn take_inbound(&self) -> Option<mpsc::Receiver<InboundMessage>> {
        self.inbound_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    /// Subscribe to lifecycle events of the current and all future sessions
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events_tx.subscribe()
    }

    /// The live session, if any
    pub fn session(&self) -> Option<Arc<dyn Transport>> {
        self.session
            .lock()
            .ok()
            .and_then(|session| session.clone())
            .filter(|session| !session.is_closed())
    }

    /// The live session once any in-progress open has finished
    pub async fn settled_session(&self) -> Option<Arc<dyn Transport>> {
        let _guard = self.open_lock.lock().await;
        self.session()
    }

    pub fn state(&self) -> ConnectionState {
        self.session()
            .map(|session| session.connection_state())
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// Return the live session or open a new one
    ///
    /// A session that is still connecting or auto-reconnecting counts as live
    /// and is returned unchanged.
    pub async fn connect(&self) -> Result<Arc<dyn Transport>, MqttError> {
        let _guard = self.open_lock.lock().await;
        if let Some(session) = self.session() {
            return Ok(session);
        }

        info!(
            broker = %self.options.broker_url,
            client_id = %self.options.client_id,
            "Opening broker session"
        );
        let hooks = SessionHooks {
            inbound: self.inbound_tx.clone(),
            events: self.events_tx.clone(),
        };
        let session = self.factory.open(&self.options, hooks).await?;

        if let Ok(mut current) = self.session.lock() {
            *current = Some(session.clone());
        }
        Ok(session)
    }

    /// Connect if needed and wait for the session to come up
    ///
    /// Resolves on the first `Connected` (ok) or `Errored` (error) event, or
    /// fails with `ConnectTimeout` once `timeout` elapses.
    pub async fn connect_and_wait(&self, timeout: Duration) -> ParcelaResult<Arc<dyn Transport>> {
        if let Some(session) = self.session() {
            if session.is_connected() {
                return Ok(session);
            }
        }

        // Subscribe before connecting so the first event cannot be missed
        let mut events = self.events_tx.subscribe();
        let session = self.connect().await?;
        if session.is_connected() {
            return Ok(session);
        }

        let outcome = tokio::time::timeout(timeout, async {
            loop {
                match events.recv().await {
                    Ok(ConnectionEvent::Connected) => return Ok(()),
                    Ok(ConnectionEvent::Errored(reason)) => {
                        return Err(ParcelaError::ConnectError(reason))
                    }
                    Ok(other) => debug!(event = other.as_str(), "Still waiting for connection"),
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Lagged behind connection events");
                        if session.is_connected() {
                            return Ok(());
                        }
                    }
                    Err(RecvError::Closed) => {
                        return Err(ParcelaError::ConnectError(
                            "connection event channel closed".to_string(),
                        ))
                    }
                }
            }
        })
        .await;

        match outcome {
            Ok(Ok(())) => Ok(session),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ParcelaError::ConnectTimeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Hard close of the live session; the next `connect` opens a fresh one
    pub async fn disconnect(&self) {
        let _guard = self.open_lock.lock().await;
        let session = self.session.lock().ok().and_then(|mut s| s.take());
        if let Some(session) = session {
            info!(client_id = %session.client_id(), "Closing broker session");
            session.close().await;
        }
    }
}
