//! Pure connection state management for MQTT sessions
//!
//! This module contains the session state machine types, session options and
//! the translation of those options into rumqttc configuration.

use rumqttc::v5::mqttbytes::v5::LastWill;
use rumqttc::v5::{mqttbytes::QoS, MqttOptions};
use rumqttc::Transport as RumqttcTransport;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Maximum packet size accepted from the broker
const MAX_PACKET_SIZE: u32 = 64 * 1024;

/// Connection state of one broker session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// No session, or a session closed by the client
    Disconnected,
    /// Handshake in progress
    Connecting,
    /// ConnAck received; publish and subscribe allowed
    Connected,
    /// Waiting for automatic reconnect attempt `n`
    Reconnecting(u32),
    /// Last handshake or network operation failed
    Errored(String),
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting(_) => "reconnecting",
            ConnectionState::Errored(_) => "errored",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Reconnecting(attempt) => write!(f, "reconnecting (attempt {attempt})"),
            ConnectionState::Errored(reason) => write!(f, "errored: {reason}"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Last will registered with the broker at connect time
#[derive(Debug, Clone, PartialEq)]
pub struct WillMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

/// Everything needed to open a session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    pub broker_url: String,
    /// Username and password
    pub credentials: Option<(String, String)>,
    /// Unique per process so sessions never collide at the broker
    pub client_id: String,
    pub keep_alive: Duration,
    /// Delay between automatic reconnect attempts
    pub reconnect_period: Duration,
    /// Bound on a single handshake
    pub connect_timeout: Duration,
    pub clean_session: bool,
    pub last_will: Option<WillMessage>,
}

impl SessionOptions {
    pub fn new(broker_url: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            broker_url: broker_url.into(),
            credentials: None,
            client_id: client_id.into(),
            keep_alive: Duration::from_secs(60),
            reconnect_period: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(30),
            clean_session: true,
            last_will: None,
        }
    }

    pub fn with_last_will(mut self, will: WillMessage) -> Self {
        self.last_will = Some(will);
        self
    }
}

/// MQTT transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection failed")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Publishing to '{topic}' failed")]
    PublishFailed {
        topic: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Broker rejected publish to '{topic}': {reason}")]
    PublishRejected { topic: String, reason: String },
    #[error("Subscription to '{pattern}' failed")]
    SubscriptionFailed {
        pattern: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Not connected - current state: {state}")]
    NotConnected { state: ConnectionState },
    #[error("Session closed")]
    SessionClosed,
}

impl MqttError {
    pub fn publish_failed(
        topic: &str,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::PublishFailed {
            topic: topic.to_string(),
            source: source.into(),
        }
    }

    pub fn publish_rejected(topic: &str, reason: impl Into<String>) -> Self {
        Self::PublishRejected {
            topic: topic.to_string(),
            reason: reason.into(),
        }
    }

    /// False when repeating the same request cannot succeed
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            MqttError::PublishRejected { .. } | MqttError::InvalidBrokerUrl(_)
        )
    }

    pub fn subscription_failed(
        pattern: &str,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::SubscriptionFailed {
            pattern: pattern.to_string(),
            source: source.into(),
        }
    }
}

/// Broker endpoint extracted from a URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

/// Parse `mqtt://`, `tcp://`, `mqtts://` or `ssl://` broker URLs (pure function)
pub fn parse_endpoint(broker_url: &str) -> Result<BrokerEndpoint, MqttError> {
    let url =
        Url::parse(broker_url).map_err(|_| MqttError::InvalidBrokerUrl(broker_url.to_string()))?;

    let tls = match url.scheme() {
        "mqtts" | "ssl" => true,
        "mqtt" | "tcp" => false,
        _ => return Err(MqttError::InvalidBrokerUrl(broker_url.to_string())),
    };

    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| MqttError::InvalidBrokerUrl(broker_url.to_string()))?;
    let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

    Ok(BrokerEndpoint {
        host: host.to_string(),
        port,
        tls,
    })
}

/// Translate session options into rumqttc options
pub fn configure_mqtt_options(options: &SessionOptions) -> Result<MqttOptions, MqttError> {
    let endpoint = parse_endpoint(&options.broker_url)?;
    let mut mqtt_options = MqttOptions::new(&options.client_id, endpoint.host, endpoint.port);

    if endpoint.tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some((username, password)) = &options.credentials {
        mqtt_options.set_credentials(username, password);
    }

    // rumqttc rejects keep-alive intervals between zero and one second
    let keep_alive = if options.keep_alive.is_zero() {
        Duration::ZERO
    } else {
        options.keep_alive.max(Duration::from_secs(1))
    };
    mqtt_options.set_keep_alive(keep_alive);
    mqtt_options.set_clean_start(options.clean_session);
    mqtt_options.set_connection_timeout(options.connect_timeout.as_secs().max(1));
    mqtt_options.set_max_packet_size(Some(MAX_PACKET_SIZE));

    if let Some(will) = &options.last_will {
        let lwt = LastWill::new(
            will.topic.clone(),
            will.payload.clone(),
            QoS::AtLeastOnce,
            will.retain,
            None,
        );
        mqtt_options.set_last_will(lwt);
    }

    Ok(mqtt_options)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoint_defaults() {
        assert_eq!(
            parse_endpoint("mqtt://localhost").unwrap(),
            BrokerEndpoint {
                host: "localhost".to_string(),
                port: 1883,
                tls: false
            }
        );
        assert_eq!(
            parse_endpoint("mqtts://broker.example.com").unwrap(),
            BrokerEndpoint {
                host: "broker.example.com".to_string(),
                port: 8883,
                tls: true
            }
        );
        assert_eq!(parse_endpoint("tcp://10.0.0.2:1884").unwrap().port, 1884);
    }

    #[test]
    fn test_parse_endpoint_rejects_invalid() {
        assert!(matches!(
            parse_endpoint("invalid-url"),
            Err(MqttError::InvalidBrokerUrl(_))
        ));
        assert!(matches!(
            parse_endpoint("http://localhost:1883"),
            Err(MqttError::InvalidBrokerUrl(_))
        ));
    }

    #[test]
    fn test_configure_mqtt_options() {
        let mut options = SessionOptions::new("mqtt://localhost:1883", "parcela-core-1234abcd");
        options.credentials = Some(("user".to_string(), "pass".to_string()));
        options.keep_alive = Duration::from_secs(30);

        let mqtt_options = configure_mqtt_options(&options).unwrap();
        assert_eq!(mqtt_options.client_id(), "parcela-core-1234abcd");
        assert_eq!(
            mqtt_options.broker_address(),
            ("localhost".to_string(), 1883)
        );
        assert_eq!(mqtt_options.keep_alive(), Duration::from_secs(30));
    }

    #[test]
    fn test_configure_mqtt_options_with_will() {
        let options = SessionOptions::new("mqtt://localhost:1883", "sim-1").with_last_will(
            WillMessage {
                topic: "parcela/sim-1/status".to_string(),
                payload: br#"{"deviceId":"sim-1","status":"offline"}"#.to_vec(),
                retain: true,
            },
        );
        assert!(configure_mqtt_options(&options).is_ok());
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(
            ConnectionState::Reconnecting(3).to_string(),
            "reconnecting (attempt 3)"
        );
        assert_eq!(
            ConnectionState::Errored("refused".to_string()).to_string(),
            "errored: refused"
        );
        assert_eq!(ConnectionState::Reconnecting(1).as_str(), "reconnecting");
    }

    #[test]
    fn test_mqtt_error_display() {
        let errors = vec![
            MqttError::ConnectionFailed("test".to_string().into()),
            MqttError::publish_failed("parcela/D1/control", "queue full"),
            MqttError::subscription_failed("parcela/+/status", "queue full"),
            MqttError::InvalidBrokerUrl("test".to_string()),
            MqttError::NotConnected {
                state: ConnectionState::Reconnecting(2),
            },
            MqttError::SessionClosed,
            MqttError::publish_rejected("parcela/D1/control", "NotAuthorized"),
        ];

        for error in errors {
            assert!(!error.to_string().is_empty());
        }
    }

    #[test]
    fn test_rejected_publish_is_not_transient() {
        assert!(!MqttError::publish_rejected("parcela/D1/control", "QuotaExceeded").is_transient());
        assert!(!MqttError::InvalidBrokerUrl("x".to_string()).is_transient());
        assert!(MqttError::publish_failed("parcela/D1/control", "no PUBACK").is_transient());
        assert!(MqttError::SessionClosed.is_transient());
    }
}
