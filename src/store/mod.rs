//! Device and record persistence contract
//!
//! The messaging core only needs the narrow [`DeviceStore`] contract. The
//! binding workflow additionally needs [`BindingStore`]. [`MemoryStore`]
//! implements both and backs the binary and the tests.

use crate::protocol::DeviceStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod memory;

pub use memory::MemoryStore;

/// A physical device as last reported over the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub device_id: String,
    pub status: DeviceStatus,
    /// Most recent registration
    pub last_seen: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    /// Most recent write of any kind
    pub updated_at: DateTime<Utc>,
}

/// A parcel record, keyed by receipt number
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub record_id: String,
    pub customer_name: String,
    pub address: String,
    pub order: String,
    pub device_id: Option<String>,
}

impl Record {
    pub fn new(record_id: impl Into<String>) -> Self {
        Self {
            record_id: record_id.into(),
            customer_name: String::new(),
            address: String::new(),
            order: String::new(),
            device_id: None,
        }
    }

    pub fn with_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    /// The bound device, treating an empty id as unbound
    pub fn bound_device(&self) -> Option<&str> {
        self.device_id.as_deref().filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("{entity} '{key}' not found")]
    NotFound { entity: &'static str, key: String },
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn record_not_found(record_id: &str) -> Self {
        Self::NotFound {
            entity: "record",
            key: record_id.to_string(),
        }
    }
}

/// Storage used by the messaging core
#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn find_device(&self, device_id: &str) -> Result<Option<Device>, StoreError>;

    /// Create the device or update its status and `last_seen`
    async fn upsert_device(
        &self,
        device_id: &str,
        status: &DeviceStatus,
        seen_at: DateTime<Utc>,
    ) -> Result<Device, StoreError>;

    /// Update the status of existing devices only; returns rows changed
    async fn update_device_status(
        &self,
        device_id: &str,
        status: &DeviceStatus,
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    async fn list_devices(&self) -> Result<Vec<Device>, StoreError>;

    async fn find_record_by_device(&self, device_id: &str) -> Result<Option<Record>, StoreError>;

    async fn find_record(&self, record_id: &str) -> Result<Option<Record>, StoreError>;
}

/// Record binding operations used by the binding workflow
#[async_trait]
pub trait BindingStore: DeviceStore {
    /// Point `record_id` at `device_id`
    async fn bind_device(&self, record_id: &str, device_id: &str) -> Result<Record, StoreError>;

    /// Clear the record's device reference
    async fn unbind_device(&self, record_id: &str) -> Result<Record, StoreError>;

    /// Devices reported online and not bound to any record
    async fn list_available_devices(&self) -> Result<Vec<Device>, StoreError>;
}
