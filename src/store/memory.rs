//! In-memory store seeded from configuration

use super::{BindingStore, Device, DeviceStore, Record, StoreError};
use crate::config::StoreSection;
use crate::protocol::DeviceStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::RwLock;
use tracing::debug;

#[derive(Debug, Default)]
pub struct MemoryStore {
    devices: RwLock<BTreeMap<String, Device>>,
    records: RwLock<BTreeMap<String, Record>>,
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Backend("store lock poisoned".to_string())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from `[store]` seed entries
    pub fn from_seed(seed: &StoreSection, now: DateTime<Utc>) -> Result<Self, StoreError> {
        let store = Self::new();

        {
            let mut devices = store.devices.write().map_err(poisoned)?;
            for entry in &seed.devices {
                devices.insert(
                    entry.device_id.clone(),
                    Device {
                        device_id: entry.device_id.clone(),
                        status: DeviceStatus::parse(&entry.status),
                        last_seen: now,
                        created_at: now,
                        updated_at: now,
                    },
                );
            }
        }

        for entry in &seed.records {
            store.insert_record(Record {
                record_id: entry.record_id.clone(),
                customer_name: entry.customer_name.clone(),
                address: entry.address.clone(),
                order: entry.order.clone(),
                device_id: entry.device_id.clone(),
            })?;
        }

        Ok(store)
    }

    /// Add a record; record ids and device bindings must stay unique
    pub fn insert_record(&self, record: Record) -> Result<(), StoreError> {
        let mut records = self.records.write().map_err(poisoned)?;

        if records.contains_key(&record.record_id) {
            return Err(StoreError::Conflict(format!(
                "record '{}' already exists",
                record.record_id
            )));
        }

        if let Some(device_id) = &record.device_id {
            if let Some(holder) = records
                .values()
                .find(|r| r.device_id.as_deref() == Some(device_id.as_str()))
            {
                return Err(StoreError::Conflict(format!(
                    "device '{device_id}' is already bound to record '{}'",
                    holder.record_id
                )));
            }
        }

        records.insert(record.record_id.clone(), record);
        Ok(())
    }

    pub fn list_records(&self) -> Result<Vec<Record>, StoreError> {
        Ok(self
            .records
            .read()
            .map_err(poisoned)?
            .values()
            .cloned()
            .collect())
    }
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn find_device(&self, device_id: &str) -> Result<Option<Device>, StoreError> {
        Ok(self.devices.read().map_err(poisoned)?.get(device_id).cloned())
    }

    async fn upsert_device(
        &self,
        device_id: &str,
        status: &DeviceStatus,
        seen_at: DateTime<Utc>,
    ) -> Result<Device, StoreError> {
        let mut devices = self.devices.write().map_err(poisoned)?;

        let device = devices
            .entry(device_id.to_string())
            .and_modify(|d| {
                d.status = status.clone();
                d.last_seen = seen_at;
                d.updated_at = seen_at;
            })
            .or_insert_with(|| Device {
                device_id: device_id.to_string(),
                status: status.clone(),
                last_seen: seen_at,
                created_at: seen_at,
                updated_at: seen_at,
            });

        debug!(device_id, status = %device.status, "Device upserted");
        Ok(device.clone())
    }

    async fn update_device_status(
        &self,
        device_id: &str,
        status: &DeviceStatus,
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut devices = self.devices.write().map_err(poisoned)?;

        match devices.get_mut(device_id) {
            Some(device) => {
                device.status = status.clone();
                device.updated_at = at;
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn list_devices(&self) -> Result<Vec<Device>, StoreError> {
        Ok(self
            .devices
            .read()
            .map_err(poisoned)?
            .values()
            .cloned()
            .collect())
    }

    async fn find_record_by_device(&self, device_id: &str) -> Result<Option<Record>, StoreError> {
        Ok(self
            .records
            .read()
            .map_err(poisoned)?
            .values()
            .find(|r| r.device_id.as_deref() == Some(device_id))
            .cloned())
    }

    async fn find_record(&self, record_id: &str) -> Result<Option<Record>, StoreError> {
        Ok(self.records.read().map_err(poisoned)?.get(record_id).cloned())
    }
}

#[async_trait]
impl BindingStore for MemoryStore {
    async fn bind_device(&self, record_id: &str, device_id: &str) -> Result<Record, StoreError> {
        let mut records = self.records.write().map_err(poisoned)?;

        if let Some(holder) = records
            .values()
            .find(|r| r.device_id.as_deref() == Some(device_id) && r.record_id != record_id)
        {
            return Err(StoreError::Conflict(format!(
                "device '{device_id}' is already bound to record '{}'",
                holder.record_id
            )));
        }

        let record = records
            .get_mut(record_id)
            .ok_or_else(|| StoreError::record_not_found(record_id))?;
        record.device_id = Some(device_id.to_string());
        Ok(record.clone())
    }

    async fn unbind_device(&self, record_id: &str) -> Result<Record, StoreError> {
        let mut records = self.records.write().map_err(poisoned)?;

        let record = records
            .get_mut(record_id)
            .ok_or_else(|| StoreError::record_not_found(record_id))?;
        record.device_id = None;
        Ok(record.clone())
    }

    async fn list_available_devices(&self) -> Result<Vec<Device>, StoreError> {
        let bound: HashSet<String> = self
            .records
            .read()
            .map_err(poisoned)?
            .values()
            .filter_map(|r| r.device_id.clone())
            .collect();

        Ok(self
            .devices
            .read()
            .map_err(poisoned)?
            .values()
            .filter(|d| d.status.is_online() && !bound.contains(&d.device_id))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceSeed, RecordSeed};
    use chrono::Duration;

    #[tokio::test]
    async fn test_upsert_creates_then_updates() {
        let store = MemoryStore::new();
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(30);

        let created = store.upsert_device("D1", &DeviceStatus::Online, t0).await.unwrap();
        assert_eq!(created.created_at, t0);
        assert_eq!(created.last_seen, t0);

        let updated = store.upsert_device("D1", &DeviceStatus::Offline, t1).await.unwrap();
        assert_eq!(updated.status, DeviceStatus::Offline);
        assert_eq!(updated.created_at, t0);
        assert_eq!(updated.last_seen, t1);
        assert_eq!(store.list_devices().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_status_never_creates() {
        let store = MemoryStore::new();
        let changed = store
            .update_device_status("ghost", &DeviceStatus::Offline, Utc::now())
            .await
            .unwrap();
        assert_eq!(changed, 0);
        assert!(store.find_device("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_status_keeps_last_seen() {
        let store = MemoryStore::new();
        let t0 = Utc::now();
        store.upsert_device("D1", &DeviceStatus::Online, t0).await.unwrap();

        let t1 = t0 + Duration::seconds(5);
        let changed = store
            .update_device_status("D1", &DeviceStatus::Offline, t1)
            .await
            .unwrap();
        assert_eq!(changed, 1);

        let device = store.find_device("D1").await.unwrap().unwrap();
        assert_eq!(device.status, DeviceStatus::Offline);
        assert_eq!(device.last_seen, t0);
        assert_eq!(device.updated_at, t1);
    }

    #[tokio::test]
    async fn test_binding_is_exclusive() {
        let store = MemoryStore::new();
        store.insert_record(Record::new("R1")).unwrap();
        store.insert_record(Record::new("R2")).unwrap();

        store.bind_device("R1", "D1").await.unwrap();
        // Rebinding the same pair is allowed
        store.bind_device("R1", "D1").await.unwrap();

        let err = store.bind_device("R2", "D1").await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let record = store.find_record_by_device("D1").await.unwrap().unwrap();
        assert_eq!(record.record_id, "R1");

        store.unbind_device("R1").await.unwrap();
        assert!(store.find_record_by_device("D1").await.unwrap().is_none());
        store.bind_device("R2", "D1").await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_unknown_record() {
        let store = MemoryStore::new();
        let err = store.bind_device("missing", "D1").await.unwrap_err();
        assert_eq!(err, StoreError::record_not_found("missing"));
    }

    #[tokio::test]
    async fn test_available_devices_are_online_and_unbound() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.upsert_device("D1", &DeviceStatus::Online, now).await.unwrap();
        store.upsert_device("D2", &DeviceStatus::Online, now).await.unwrap();
        store.upsert_device("D3", &DeviceStatus::Offline, now).await.unwrap();
        store.insert_record(Record::new("R1").with_device("D2")).unwrap();

        let available: Vec<String> = store
            .list_available_devices()
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.device_id)
            .collect();
        assert_eq!(available, vec!["D1".to_string()]);
    }

    #[tokio::test]
    async fn test_from_seed() {
        let seed = StoreSection {
            devices: vec![DeviceSeed {
                device_id: "D1".to_string(),
                status: "ONLINE".to_string(),
            }],
            records: vec![RecordSeed {
                record_id: "RESI-001".to_string(),
                customer_name: "Budi".to_string(),
                address: "Jl. Merdeka 1".to_string(),
                order: "Sepatu".to_string(),
                device_id: Some("D1".to_string()),
            }],
        };

        let store = MemoryStore::from_seed(&seed, Utc::now()).unwrap();
        let device = store.find_device("D1").await.unwrap().unwrap();
        assert!(device.status.is_online());

        let record = store.find_record("RESI-001").await.unwrap().unwrap();
        assert_eq!(record.device_id.as_deref(), Some("D1"));
        assert_eq!(store.list_records().unwrap().len(), 1);
    }

    #[test]
    fn test_from_seed_rejects_double_binding() {
        let seed = StoreSection {
            devices: vec![],
            records: vec![
                RecordSeed {
                    record_id: "R1".to_string(),
                    customer_name: String::new(),
                    address: String::new(),
                    order: String::new(),
                    device_id: Some("D1".to_string()),
                },
                RecordSeed {
                    record_id: "R2".to_string(),
                    customer_name: String::new(),
                    address: String::new(),
                    order: String::new(),
                    device_id: Some("D1".to_string()),
                },
            ],
        };
        assert!(matches!(
            MemoryStore::from_seed(&seed, Utc::now()),
            Err(StoreError::Conflict(_))
        ));
    }
}
