//! Turns decoded device messages into store writes

use super::dispatcher::{CommandDispatcher, FailsafeReport};
use super::router::RoutedMessage;
use crate::error::ParcelaResult;
use crate::observability::metrics;
use crate::store::{Device, DeviceStore};
use chrono::Utc;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// What handling one message did
#[derive(Debug)]
pub enum Reconciled {
    Upserted(Device),
    StatusUpdated {
        device_id: String,
        rows: u64,
        /// Present when the status was `offline`
        failsafe: Option<JoinHandle<FailsafeReport>>,
    },
}

pub struct DeviceReconciler {
    store: Arc<dyn DeviceStore>,
    dispatcher: Arc<CommandDispatcher>,
}

impl DeviceReconciler {
    pub fn new(store: Arc<dyn DeviceStore>, dispatcher: Arc<CommandDispatcher>) -> Self {
        Self { store, dispatcher }
    }

    pub async fn handle(&self, message: RoutedMessage) -> ParcelaResult<Reconciled> {
        match message {
            RoutedMessage::Register(announcement) => {
                let device = self
                    .store
                    .upsert_device(
                        &announcement.device_id,
                        &announcement.device_status(),
                        Utc::now(),
                    )
                    .await?;
                metrics().device_upserted();
                info!(
                    device_id = %device.device_id,
                    status = %device.status,
                    "Device registered"
                );
                Ok(Reconciled::Upserted(device))
            }
            RoutedMessage::Status(announcement) => {
                let status = announcement.device_status();
                let rows = self
                    .store
                    .update_device_status(&announcement.device_id, &status, Utc::now())
                    .await?;
                metrics().status_updated();

                if rows == 0 {
                    debug!(device_id = %announcement.device_id, "Status for unknown device");
                }
                info!(
                    device_id = %announcement.device_id,
                    status = %status,
                    rows,
                    "Device status updated"
                );

                // The fail-safe runs even for unknown devices
                let failsafe = status
                    .is_offline()
                    .then(|| self.dispatcher.schedule_failsafe_off(&announcement.device_id));

                Ok(Reconciled::StatusUpdated {
                    device_id: announcement.device_id,
                    rows,
                    failsafe,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatchSection;
    use crate::messaging::ConnectionManager;
    use crate::protocol::{DeviceAnnouncement, DeviceStatus, TopicScheme};
    use crate::store::MemoryStore;
    use crate::testing::{FailingStore, MockSessionFactory};
    use crate::transport::SessionOptions;

    fn reconciler_with(store: Arc<dyn DeviceStore>) -> (DeviceReconciler, Arc<MockSessionFactory>) {
        let factory = Arc::new(MockSessionFactory::new());
        let connection = Arc::new(ConnectionManager::new(
            factory.clone(),
            SessionOptions::new("mqtt://localhost:1883", "parcela-core-test"),
        ));
        let dispatcher = Arc::new(CommandDispatcher::new(
            connection,
            store.clone(),
            TopicScheme::default(),
            &DispatchSection::default(),
        ));
        (DeviceReconciler::new(store, dispatcher), factory)
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let (reconciler, _) = reconciler_with(store.clone());

        for _ in 0..2 {
            reconciler
                .handle(RoutedMessage::Register(DeviceAnnouncement::new("D1", "online")))
                .await
                .unwrap();
        }

        let devices = store.list_devices().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].status, DeviceStatus::Online);
    }

    #[tokio::test]
    async fn test_online_status_has_no_failsafe() {
        let store = Arc::new(MemoryStore::new());
        let (reconciler, factory) = reconciler_with(store.clone());

        let outcome = reconciler
            .handle(RoutedMessage::Status(DeviceAnnouncement::new("D1", "online")))
            .await
            .unwrap();

        match outcome {
            Reconciled::StatusUpdated { rows, failsafe, .. } => {
                assert_eq!(rows, 0);
                assert!(failsafe.is_none());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(store.find_device("D1").await.unwrap().is_none());
        assert_eq!(factory.open_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_status_triggers_failsafe() {
        let store = Arc::new(MemoryStore::new());
        let (reconciler, factory) = reconciler_with(store.clone());
        reconciler
            .handle(RoutedMessage::Register(DeviceAnnouncement::new("D1", "online")))
            .await
            .unwrap();

        let outcome = reconciler
            .handle(RoutedMessage::Status(DeviceAnnouncement::new("D1", "Offline")))
            .await
            .unwrap();

        let Reconciled::StatusUpdated { rows, failsafe, .. } = outcome else {
            panic!("expected a status update");
        };
        assert_eq!(rows, 1);
        let report = failsafe.unwrap().await.unwrap();
        assert_eq!(report.sent, 3);

        let device = store.find_device("D1").await.unwrap().unwrap();
        assert_eq!(device.status, DeviceStatus::Offline);

        let session = factory.last_session().unwrap();
        let published = session.published_to("parcela/D1/control");
        assert!(published.iter().all(|p| p == b"ALARM_OFF"));
        assert_eq!(published.len(), 3);
    }

    #[tokio::test]
    async fn test_store_errors_propagate() {
        let (reconciler, _) = reconciler_with(Arc::new(FailingStore));
        assert!(reconciler
            .handle(RoutedMessage::Register(DeviceAnnouncement::new("D1", "online")))
            .await
            .is_err());
    }
}
