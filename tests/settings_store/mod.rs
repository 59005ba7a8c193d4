//! Settings merge semantics and the backend → file → defaults chain.

use crate::common::{scratch_settings_path, FailingStore};
use orderbell::notifications::NotificationType;
use orderbell::settings::{Settings, SettingsPatch, SettingsSource, SettingsStore};
use orderbell::store::memory::MemoryStore;
use orderbell::store::Store;
use std::sync::Arc;

fn patch(json: serde_json::Value) -> SettingsPatch {
    serde_json::from_value(json).unwrap()
}

#[tokio::test]
async fn update_then_get_keeps_unrelated_fields() {
    let store = MemoryStore::new();
    let settings = SettingsStore::new(
        store as Arc<dyn Store>,
        scratch_settings_path("merge"),
    );
    settings.load().await;

    settings
        .update(patch(serde_json::json!({ "maxRings": 6 })))
        .await;
    settings
        .update(patch(serde_json::json!({ "soundEnabled": false })))
        .await;

    let current = settings.get();
    assert!(!current.sound_enabled);
    assert_eq!(current.max_rings, 6, "earlier update must survive");
    assert!(current.enabled);
    assert_eq!(current.ring_duration, 3);
    assert_eq!(current.ring_interval, 2);
}

#[tokio::test]
async fn backend_copy_wins_over_everything() {
    let store = MemoryStore::new();
    let mut stored = Settings::default();
    stored.max_rings = 2;
    store.save_settings(&stored).await.unwrap();

    let path = scratch_settings_path("backend-wins");
    std::fs::write(
        &path,
        serde_json::to_string(&Settings::default()).unwrap(),
    )
    .unwrap();

    let settings = SettingsStore::new(store as Arc<dyn Store>, path);
    settings.load().await;
    assert_eq!(settings.source(), SettingsSource::Backend);
    assert_eq!(settings.get().max_rings, 2);
}

#[tokio::test]
async fn unreachable_backend_falls_back_to_the_local_file() {
    let path = scratch_settings_path("file-fallback");
    let mut on_disk = Settings::default();
    on_disk.ring_duration = 7;
    std::fs::write(&path, serde_json::to_string(&on_disk).unwrap()).unwrap();

    let settings = SettingsStore::new(FailingStore::new() as Arc<dyn Store>, path);
    settings.load().await;
    assert_eq!(settings.source(), SettingsSource::LocalFile);
    assert_eq!(settings.get().ring_duration, 7);
}

#[tokio::test]
async fn nothing_anywhere_means_defaults() {
    let settings = SettingsStore::new(
        FailingStore::new() as Arc<dyn Store>,
        scratch_settings_path("defaults"),
    );
    settings.load().await;
    assert_eq!(settings.source(), SettingsSource::Defaults);
    assert_eq!(settings.get(), Settings::default());
}

#[tokio::test]
async fn a_corrupt_local_file_still_yields_defaults() {
    let path = scratch_settings_path("corrupt");
    std::fs::write(&path, "{ not json").unwrap();

    let settings = SettingsStore::new(FailingStore::new() as Arc<dyn Store>, path);
    settings.load().await;
    assert_eq!(settings.source(), SettingsSource::Defaults);
}

#[tokio::test]
async fn failed_saves_keep_memory_authoritative_and_land_in_the_file() {
    let path = scratch_settings_path("save-fallback");
    let settings = SettingsStore::new(FailingStore::new() as Arc<dyn Store>, path.clone());
    settings.load().await;

    let merged = settings
        .update(patch(serde_json::json!({
            "vibrationEnabled": false,
            "notificationTypes": {
                "order_updated": { "enabled": false, "priority": 1 }
            }
        })))
        .await;

    // No rollback: the process sees what it just saved.
    assert!(!merged.vibration_enabled);
    assert!(!settings.get().vibration_enabled);
    assert!(
        !settings
            .type_settings(NotificationType::OrderUpdated)
            .enabled
    );

    // And a fresh store on the same path recovers it from the file.
    let reloaded = SettingsStore::new(FailingStore::new() as Arc<dyn Store>, path);
    reloaded.load().await;
    assert_eq!(reloaded.source(), SettingsSource::LocalFile);
    assert!(!reloaded.get().vibration_enabled);
}

#[tokio::test]
async fn a_stored_copy_missing_types_gets_the_table_defaults_back() {
    // Settings saved by an older build that knew fewer types.
    let store = MemoryStore::new();
    let mut stored = Settings::default();
    stored
        .notification_types
        .remove(&NotificationType::OrderCreated);
    stored
        .notification_types
        .remove(&NotificationType::PaymentFailed);
    store.save_settings(&stored).await.unwrap();

    let settings = SettingsStore::new(
        store as Arc<dyn Store>,
        scratch_settings_path("old-build"),
    );
    settings.load().await;

    assert_eq!(settings.source(), SettingsSource::Backend);
    let created = settings.type_settings(NotificationType::OrderCreated);
    assert_eq!(created.priority, 5);
    assert!(created.persistent_notification);
    assert!(
        settings
            .type_settings(NotificationType::PaymentFailed)
            .persistent_notification
    );
}
