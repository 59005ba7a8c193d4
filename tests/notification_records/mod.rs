//! Record creation, the per-type policy gate, and listener fan-out.

use crate::common::{self, scratch_settings_path, FailingStore};
use orderbell::notifications::{
    NotificationService, NotificationType, OrderEvent,
};
use orderbell::settings::{SettingsPatch, SettingsStore};
use orderbell::store::memory::MemoryStore;
use orderbell::store::Store;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct Fixture {
    store: Arc<MemoryStore>,
    settings: Arc<SettingsStore>,
    service: Arc<NotificationService>,
}

async fn fixture(label: &str) -> Fixture {
    let store = MemoryStore::new();
    let settings = SettingsStore::new(
        store.clone() as Arc<dyn Store>,
        scratch_settings_path(label),
    );
    settings.load().await;
    let service = NotificationService::new(store.clone() as Arc<dyn Store>, settings.clone());
    Fixture {
        store,
        settings,
        service,
    }
}

fn created_event() -> OrderEvent {
    OrderEvent {
        notification_type: NotificationType::OrderCreated,
        order: common::order().call(),
        previous_status: None,
        previous_payment_status: None,
    }
}

#[tokio::test]
async fn create_persists_message_and_priority() {
    let f = fixture("create").await;
    let record = f.service.create(&created_event()).await.unwrap();

    assert_eq!(record.message, "New order #ORD-1 received from Mario");
    assert_eq!(record.notification_type, NotificationType::OrderCreated);
    assert_eq!(record.priority, 5);
    assert!(!record.is_read);
    assert!(record.read_at.is_none());
    assert_eq!(record.metadata["customer_name"], "Mario");

    let listed = f.service.list(false).await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, record.id);
}

#[tokio::test]
async fn disabled_type_is_gated_without_side_effects() {
    let f = fixture("gate").await;
    f.settings
        .update(
            serde_json::from_value::<SettingsPatch>(serde_json::json!({
                "notificationTypes": {
                    "order_created": { "enabled": false, "priority": 5 }
                }
            }))
            .unwrap(),
        )
        .await;

    assert!(f.service.create(&created_event()).await.is_none());
    assert!(f.service.list(false).await.is_empty());
    assert_eq!(f.service.count_unread().await, 0);
}

#[tokio::test]
async fn backend_failure_returns_none_not_an_error() {
    let settings = SettingsStore::new(
        FailingStore::new() as Arc<dyn Store>,
        scratch_settings_path("down"),
    );
    settings.load().await;
    let service = NotificationService::new(FailingStore::new() as Arc<dyn Store>, settings);

    assert!(service.create(&created_event()).await.is_none());
    assert!(service.list(false).await.is_empty());
    assert_eq!(service.count_unread().await, 0);
    assert!(!service.mark_read(Uuid::new_v4()).await);
    assert!(!service.mark_all_read().await);
    assert!(!service.delete(Uuid::new_v4()).await);
}

#[tokio::test]
async fn mark_read_twice_succeeds_and_keeps_read_at() {
    let f = fixture("idempotent").await;
    let record = f.service.create(&created_event()).await.unwrap();

    assert!(f.service.mark_read(record.id).await);
    let read_at = f.service.list(false).await[0].read_at;
    assert!(read_at.is_some());

    assert!(f.service.mark_read(record.id).await, "re-marking succeeds");
    let listed = f.service.list(false).await;
    assert!(listed[0].is_read);
    assert_eq!(listed[0].read_at, read_at);
    assert_eq!(f.service.count_unread().await, 0);
}

#[tokio::test]
async fn unread_listing_hides_read_records() {
    let f = fixture("unread").await;
    let first = f.service.create(&created_event()).await.unwrap();
    f.service.create(&created_event()).await.unwrap();

    f.service.mark_read(first.id).await;
    assert_eq!(f.service.list(true).await.len(), 1);
    assert_eq!(f.service.list(false).await.len(), 2);
    assert_eq!(f.service.count_unread().await, 1);

    assert!(f.service.mark_all_read().await);
    assert!(f.service.list(true).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn inserts_fan_out_to_every_listener_once() {
    let f = fixture("fanout").await;
    let cancel = CancellationToken::new();
    let pump = tokio::spawn(f.service.clone().deliver_inserts(cancel.clone()));
    tokio::time::sleep(Duration::from_millis(10)).await;

    let seen_a: Arc<Mutex<Vec<Uuid>>> = Arc::default();
    let seen_b: Arc<Mutex<Vec<Uuid>>> = Arc::default();
    let sink = seen_a.clone();
    f.service
        .subscribe("badge", move |record| sink.lock().unwrap().push(record.id));
    let sink = seen_b.clone();
    f.service
        .subscribe("popover", move |record| sink.lock().unwrap().push(record.id));

    let record = f.service.create(&created_event()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(*seen_a.lock().unwrap(), vec![record.id]);
    assert_eq!(*seen_b.lock().unwrap(), vec![record.id]);

    // Re-subscribing under the same id replaces; unsubscribing removes.
    let replaced: Arc<Mutex<Vec<Uuid>>> = Arc::default();
    let sink = replaced.clone();
    f.service
        .subscribe("badge", move |record| sink.lock().unwrap().push(record.id));
    f.service.unsubscribe("popover");

    let second = f.service.create(&created_event()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(*seen_a.lock().unwrap(), vec![record.id], "old callback gone");
    assert_eq!(*replaced.lock().unwrap(), vec![second.id]);
    assert_eq!(*seen_b.lock().unwrap(), vec![record.id], "unsubscribed");

    cancel.cancel();
    let _ = pump.await;
    drop(f.store);
}
