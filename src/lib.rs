//! Parcela - device liveness and alarm command delivery
//!
//! The messaging core of the Parcela parcel-locker system. Devices announce
//! themselves over MQTT and report liveness (often through their last-will);
//! the core keeps the device store current and sends control commands back.
//!
//! # Overview
//!
//! - Protocol types: device topics, announcements and control commands
//! - MQTT transport behind an injectable session factory
//! - Messaging core: connection manager, topic router, device reconciler,
//!   command dispatcher with retry and fail-safe, liveness sweep
//! - Device/record binding workflow
//! - In-memory store, configuration, logging, metrics and a health endpoint
//!
//! # Quick Start
//!
//! ```rust
//! use parcela::protocol::{AlarmAction, DeviceAnnouncement, TopicScheme, TopicClass};
//!
//! let topics = TopicScheme::default();
//! assert_eq!(topics.control_topic("D1"), "parcela/D1/control");
//! assert_eq!(
//!     topics.classify("parcela/D1/status"),
//!     TopicClass::Status("D1".to_string())
//! );
//!
//! let announcement = DeviceAnnouncement::decode(br#"{"deviceId":"D1","status":"online"}"#).unwrap();
//! assert!(announcement.device_status().is_online());
//!
//! let action: AlarmAction = "reset".parse().unwrap();
//! assert_eq!(action.command().as_str(), "ALARM_OFF");
//! ```

pub mod binding;
pub mod config;
pub mod error;
pub mod messaging;
pub mod observability;
pub mod protocol;
pub mod store;
pub mod testing;
pub mod transport;

pub use binding::{BindingOutcome, BindingWorkflow, CommandDelivery};
pub use config::{ConfigError, ParcelaConfig};
pub use error::{Failure, FailureCode, ParcelaError, ParcelaResult};
pub use messaging::{CommandReceipt, MessagingService};
pub use protocol::*;
pub use store::{BindingStore, Device, DeviceStore, MemoryStore, Record, StoreError};
pub use transport::mqtt::MqttSessionFactory;
