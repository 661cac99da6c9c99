//! Clearing of stale retained device snapshots

use crate::observability::metrics;
use crate::protocol::TopicScheme;
use crate::store::DeviceStore;
use crate::transport::Transport;
use std::sync::Arc;
use tracing::{info, warn};

/// Outcome of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub devices: usize,
    /// Empty retained publishes accepted by the session
    pub cleared: u64,
    pub failures: u64,
    /// The device list could not be read; nothing was cleared
    pub enumeration_failed: bool,
}

/// Publishes an empty retained message to every known device's register and
/// status topics, which removes whatever the broker retained there
pub struct LivenessSweep {
    store: Arc<dyn DeviceStore>,
    topics: TopicScheme,
}

impl LivenessSweep {
    pub fn new(store: Arc<dyn DeviceStore>, topics: TopicScheme) -> Self {
        Self { store, topics }
    }

    pub async fn run(&self, session: &dyn Transport) -> SweepReport {
        let devices = match self.store.list_devices().await {
            Ok(devices) => devices,
            Err(e) => {
                warn!(error = %e, "Liveness sweep could not list devices");
                return SweepReport {
                    enumeration_failed: true,
                    ..SweepReport::default()
                };
            }
        };

        let mut report = SweepReport {
            devices: devices.len(),
            ..SweepReport::default()
        };

        for device in &devices {
            for topic in [
                self.topics.register_topic(&device.device_id),
                self.topics.status_topic(&device.device_id),
            ] {
                match session.publish(&topic, Vec::new(), true).await {
                    Ok(()) => report.cleared += 1,
                    Err(e) => {
                        report.failures += 1;
                        warn!(
                            device_id = %device.device_id,
                            topic = %topic,
                            error = %e,
                            "Failed to clear retained message"
                        );
                    }
                }
            }
        }

        metrics().sweep_completed(report.cleared, report.failures);
        info!(
            devices = report.devices,
            cleared = report.cleared,
            failures = report.failures,
            "Liveness sweep finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DeviceStatus;
    use crate::store::MemoryStore;
    use crate::testing::{FailingStore, MockTransport};
    use chrono::Utc;

    #[tokio::test]
    async fn test_sweep_clears_register_and_status() {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_device("D1", &DeviceStatus::Online, Utc::now())
            .await
            .unwrap();
        store
            .upsert_device("D2", &DeviceStatus::Offline, Utc::now())
            .await
            .unwrap();

        let session = MockTransport::connected("test");
        let sweep = LivenessSweep::new(store, TopicScheme::default());
        let report = sweep.run(&session).await;

        assert_eq!(report.devices, 2);
        assert_eq!(report.cleared, 4);
        assert_eq!(report.failures, 0);

        let published = session.published();
        assert_eq!(published.len(), 4);
        assert!(published.iter().all(|p| p.retain && p.payload.is_empty()));
        assert!(published.iter().any(|p| p.topic == "parcela/D1/register"));
        assert!(published.iter().any(|p| p.topic == "parcela/D2/status"));
    }

    #[tokio::test]
    async fn test_sweep_counts_publish_failures() {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_device("D1", &DeviceStatus::Online, Utc::now())
            .await
            .unwrap();

        let session = MockTransport::connected("test");
        session.fail_next_publishes(1);
        let report = LivenessSweep::new(store, TopicScheme::default())
            .run(&session)
            .await;

        assert_eq!(report.cleared, 1);
        assert_eq!(report.failures, 1);
    }

    #[tokio::test]
    async fn test_sweep_survives_store_failure() {
        let session = MockTransport::connected("test");
        let report = LivenessSweep::new(Arc::new(FailingStore), TopicScheme::default())
            .run(&session)
            .await;

        assert!(report.enumeration_failed);
        assert!(session.published().is_empty());
    }
}
