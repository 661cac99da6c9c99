//! MQTT v5 implementation of the transport seam
//!
//! The module separates pure functions from I/O:
//!
//! - [`ack_tracker`] - pairing of QoS 1 publishes with their PUBACKs
//! - [`connection`] - session options, state types and rumqttc configuration
//! - [`message_handler`] - pure event routing and inbound forwarding
//! - [`health_monitor`] - pure state transitions and transition logging
//! - [`session`] - the live session and its event loop supervisor
//!
//! # Usage
//!
//! ```rust,no_run
//! use parcela::transport::mqtt::{MqttSessionFactory, SessionOptions};
//! use parcela::transport::{SessionFactory, SessionHooks};
//! use tokio::sync::{broadcast, mpsc};
//!
//! # tokio_test::block_on(async {
//! let (inbound, _inbound_rx) = mpsc::channel(16);
//! let (events, _events_rx) = broadcast::channel(16);
//! let options = SessionOptions::new("mqtt://localhost:1883", "parcela-doc");
//!
//! let session = MqttSessionFactory
//!     .open(&options, SessionHooks { inbound, events })
//!     .await?;
//! session.close().await;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod ack_tracker;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;
pub mod session;

pub use ack_tracker::{AckFailure, AckTracker};
pub use connection::{
    configure_mqtt_options, parse_endpoint, BrokerEndpoint, ConnectionState, MqttError,
    SessionOptions, WillMessage,
};
pub use health_monitor::{ConnectionEvent, HealthMonitor};
pub use message_handler::{EventRoute, MessageForwarder, MessageHandler};
pub use session::{MqttSession, MqttSessionFactory};
