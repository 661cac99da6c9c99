//! Pure connection state transitions for MQTT sessions
//!
//! The session event loop reports what happened as a [`ConnectionEvent`]; this
//! module decides the resulting [`ConnectionState`] and how it is logged.

use super::connection::ConnectionState;
use tracing::{debug, error, info, warn};

/// Lifecycle events broadcast by a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// ConnAck received
    Connected,
    /// An established connection was lost or closed
    Disconnected(String),
    /// A handshake or network operation failed before a connection existed
    Errored(String),
    /// Automatic reconnect attempt scheduled
    Reconnecting(u32),
}

impl ConnectionEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionEvent::Connected => "connected",
            ConnectionEvent::Disconnected(_) => "disconnected",
            ConnectionEvent::Errored(_) => "errored",
            ConnectionEvent::Reconnecting(_) => "reconnecting",
        }
    }
}

/// Pure state machine and health helpers
pub struct HealthMonitor;

impl HealthMonitor {
    /// Determine next state after a connection event (pure function)
    pub fn determine_next_state(
        _current_state: &ConnectionState,
        event: &ConnectionEvent,
    ) -> ConnectionState {
        match event {
            ConnectionEvent::Connected => ConnectionState::Connected,
            ConnectionEvent::Disconnected(_) => ConnectionState::Disconnected,
            ConnectionEvent::Errored(reason) => ConnectionState::Errored(reason.clone()),
            ConnectionEvent::Reconnecting(attempt) => ConnectionState::Reconnecting(*attempt),
        }
    }

    /// Event to report when the event loop fails (pure function)
    ///
    /// Losing an established connection is a disconnect; failing while not yet
    /// connected is an error. A broker-initiated disconnect was already reported,
    /// so the following socket error adds nothing.
    pub fn failure_event(current: &ConnectionState, reason: String) -> Option<ConnectionEvent> {
        match current {
            ConnectionState::Connected => Some(ConnectionEvent::Disconnected(reason)),
            ConnectionState::Disconnected => None,
            _ => Some(ConnectionEvent::Errored(reason)),
        }
    }

    /// Check if connection state allows publishing (pure function)
    pub fn can_publish(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    /// Check if connection state allows subscribing (pure function)
    pub fn can_subscribe(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    /// Log connection state transition
    pub fn log_state_transition(from: &ConnectionState, to: &ConnectionState) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!("MQTT connection established");
            }
            (ConnectionState::Reconnecting(attempt), ConnectionState::Connected) => {
                info!(attempt, "MQTT reconnection successful");
            }
            (ConnectionState::Connected, ConnectionState::Disconnected) => {
                warn!("MQTT connection lost");
            }
            (_, ConnectionState::Reconnecting(attempt)) => {
                debug!(attempt, "MQTT reconnect attempt scheduled");
            }
            (_, ConnectionState::Errored(reason)) => {
                error!(reason = %reason, "MQTT connection error");
            }
            _ => {
                debug!("MQTT connection state: {} -> {}", from, to);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_determine_next_state() {
        let initial_state = ConnectionState::Connecting;

        let next = HealthMonitor::determine_next_state(&initial_state, &ConnectionEvent::Connected);
        assert_eq!(next, ConnectionState::Connected);

        let next = HealthMonitor::determine_next_state(
            &ConnectionState::Connected,
            &ConnectionEvent::Disconnected("broker went away".to_string()),
        );
        assert_eq!(next, ConnectionState::Disconnected);

        let next = HealthMonitor::determine_next_state(
            &ConnectionState::Disconnected,
            &ConnectionEvent::Reconnecting(2),
        );
        assert_eq!(next, ConnectionState::Reconnecting(2));

        let next = HealthMonitor::determine_next_state(
            &ConnectionState::Connecting,
            &ConnectionEvent::Errored("connection refused".to_string()),
        );
        assert_eq!(
            next,
            ConnectionState::Errored("connection refused".to_string())
        );
    }

    #[test]
    fn test_failure_event_depends_on_current_state() {
        assert_eq!(
            HealthMonitor::failure_event(&ConnectionState::Connected, "reset".to_string()),
            Some(ConnectionEvent::Disconnected("reset".to_string()))
        );
        assert_eq!(
            HealthMonitor::failure_event(&ConnectionState::Connecting, "refused".to_string()),
            Some(ConnectionEvent::Errored("refused".to_string()))
        );
        assert_eq!(
            HealthMonitor::failure_event(&ConnectionState::Reconnecting(4), "refused".to_string()),
            Some(ConnectionEvent::Errored("refused".to_string()))
        );
        assert_eq!(
            HealthMonitor::failure_event(&ConnectionState::Disconnected, "eof".to_string()),
            None
        );
    }

    #[test]
    fn test_can_publish() {
        assert!(HealthMonitor::can_publish(&ConnectionState::Connected));
        assert!(!HealthMonitor::can_publish(&ConnectionState::Connecting));
        assert!(!HealthMonitor::can_publish(&ConnectionState::Reconnecting(1)));
        assert!(!HealthMonitor::can_subscribe(&ConnectionState::Disconnected));
    }

    #[test]
    fn test_event_names() {
        assert_eq!(ConnectionEvent::Connected.as_str(), "connected");
        assert_eq!(ConnectionEvent::Reconnecting(1).as_str(), "reconnecting");
    }
}
