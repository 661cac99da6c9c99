//! Device to record binding
//!
//! Binding a device sends `CONFIRM_CONNECTED` to it, unbinding sends
//! `DISCONNECT`. Command delivery is best effort on both paths: the binding
//! change is kept even when the broker is unreachable.

use crate::error::{Failure, ParcelaError, ParcelaResult};
use crate::messaging::{CommandDispatcher, CommandReceipt};
use crate::protocol::ControlCommand;
use crate::store::{BindingStore, Device, Record};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// How the command that accompanies a binding change went
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CommandDelivery {
    Delivered(CommandReceipt),
    Failed(Failure),
}

impl CommandDelivery {
    fn from_result(result: ParcelaResult<CommandReceipt>) -> Self {
        match result {
            Ok(receipt) => CommandDelivery::Delivered(receipt),
            Err(e) => CommandDelivery::Failed(e.to_failure()),
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, CommandDelivery::Delivered(_))
    }
}

/// Record after a binding change plus the command delivery result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BindingOutcome {
    pub record: Record,
    pub delivery: CommandDelivery,
}

pub struct BindingWorkflow {
    store: Arc<dyn BindingStore>,
    dispatcher: Arc<CommandDispatcher>,
}

impl BindingWorkflow {
    pub fn new(store: Arc<dyn BindingStore>, dispatcher: Arc<CommandDispatcher>) -> Self {
        Self { store, dispatcher }
    }

    /// Bind `device_id` to `record_id` and confirm the binding to the device
    ///
    /// Fails with `InvalidDeviceId` when the id is not a single topic level and
    /// with `DeviceInUse` when another record holds the device. Rebinding the
    /// device already held by this record is allowed.
    pub async fn connect_device(
        &self,
        record_id: &str,
        device_id: &str,
    ) -> ParcelaResult<BindingOutcome> {
        ParcelaError::check_device_id(device_id)?;
        if self.store.find_record(record_id).await?.is_none() {
            return Err(ParcelaError::record_not_found(record_id));
        }
        if let Some(holder) = self.store.find_record_by_device(device_id).await? {
            if holder.record_id != record_id {
                return Err(ParcelaError::DeviceInUse {
                    device_id: device_id.to_string(),
                    record_id: holder.record_id,
                });
            }
        }

        let record = self.store.bind_device(record_id, device_id).await?;
        info!(record_id = %record_id, device_id = %device_id, "Device bound");

        let delivery = CommandDelivery::from_result(
            self.dispatcher
                .confirm_device_binding(record_id, device_id)
                .await,
        );
        if let CommandDelivery::Failed(failure) = &delivery {
            warn!(
                device_id = %device_id,
                error = %failure.message,
                "CONFIRM_CONNECTED not delivered, binding kept"
            );
        }

        Ok(BindingOutcome { record, delivery })
    }

    /// Tell the bound device to disconnect, then clear the binding
    pub async fn disconnect_device(&self, record_id: &str) -> ParcelaResult<BindingOutcome> {
        let record = self
            .store
            .find_record(record_id)
            .await?
            .ok_or_else(|| ParcelaError::record_not_found(record_id))?;
        let device_id = record
            .bound_device()
            .map(str::to_string)
            .ok_or_else(|| ParcelaError::no_device_bound(record_id))?;

        let delivery = CommandDelivery::from_result(
            self.dispatcher
                .deliver(&device_id, ControlCommand::Disconnect)
                .await,
        );
        if let CommandDelivery::Failed(failure) = &delivery {
            warn!(
                device_id = %device_id,
                error = %failure.message,
                "DISCONNECT not delivered, unbinding anyway"
            );
        }

        let record = self.store.unbind_device(record_id).await?;
        info!(record_id = %record_id, device_id = %device_id, "Device unbound");
        Ok(BindingOutcome { record, delivery })
    }

    /// Online devices not bound to any record
    pub async fn available_devices(&self) -> ParcelaResult<Vec<Device>> {
        let mut devices = self.store.list_available_devices().await?;
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        Ok(devices)
    }
}
