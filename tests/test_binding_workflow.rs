//! Binding workflow driven through a running messaging service
//!
//! A device announces itself, shows up as available, gets bound to a parcel,
//! receives an alarm and is released again.

use parcela::binding::{BindingWorkflow, CommandDelivery};
use parcela::config::DispatchSection;
use parcela::error::ParcelaError;
use parcela::messaging::MessagingService;
use parcela::protocol::TopicScheme;
use parcela::store::{DeviceStore, MemoryStore, Record};
use parcela::testing::{wait_for, MockSessionFactory};
use parcela::transport::SessionOptions;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_full_binding_lifecycle() {
    let factory = Arc::new(MockSessionFactory::new());
    let store = Arc::new(MemoryStore::new());
    store.insert_record(Record::new("RESI-1")).unwrap();
    store.insert_record(Record::new("RESI-2")).unwrap();

    let service = MessagingService::new(
        TopicScheme::default(),
        &DispatchSection::default(),
        factory.clone(),
        SessionOptions::new("mqtt://localhost:1883", "parcela-core-binding"),
        store.clone(),
    );
    let workflow = BindingWorkflow::new(store.clone(), service.dispatcher().clone());

    service.start().await.unwrap();
    service
        .wait_until_connected(Duration::from_secs(1))
        .await
        .unwrap();
    let session = factory.last_session().unwrap();
    assert!(wait_for(|| session.subscriptions().len() == 2).await);

    session
        .inject(
            "parcela/LOCKER-7/register",
            br#"{"deviceId":"LOCKER-7","status":"online"}"#,
        )
        .await;

    let mut available = Vec::new();
    for _ in 0..200 {
        available = workflow.available_devices().await.unwrap();
        if !available.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(available.len(), 1);
    assert_eq!(available[0].device_id, "LOCKER-7");

    let bound = workflow.connect_device("RESI-1", "LOCKER-7").await.unwrap();
    assert!(matches!(bound.delivery, CommandDelivery::Delivered(_)));
    assert!(workflow.available_devices().await.unwrap().is_empty());

    let err = workflow
        .connect_device("RESI-2", "LOCKER-7")
        .await
        .unwrap_err();
    assert!(matches!(err, ParcelaError::DeviceInUse { .. }));

    service.send_alarm_command("RESI-1", "on").await.unwrap();

    let released = workflow.disconnect_device("RESI-1").await.unwrap();
    assert!(released.record.device_id.is_none());
    assert!(store
        .find_record_by_device("LOCKER-7")
        .await
        .unwrap()
        .is_none());

    assert_eq!(
        session.published_to("parcela/LOCKER-7/control"),
        vec![
            b"CONFIRM_CONNECTED".to_vec(),
            b"ALARM_ON".to_vec(),
            b"DISCONNECT".to_vec()
        ]
    );

    service.shutdown().await;
}
