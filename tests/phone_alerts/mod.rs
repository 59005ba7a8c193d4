//! The orchestrator's policy gates: route, settings, de-duplication, and
//! the stop controls.

use crate::common::{self, TestBed};
use orderbell::settings::SettingsPatch;

fn patch(json: serde_json::Value) -> SettingsPatch {
    serde_json::from_value(json).unwrap()
}

#[tokio::test(start_paused = true)]
async fn customer_facing_views_never_ring() {
    let bed = TestBed::start().await;
    bed.services.phone.set_active_view("/shop/roses");

    bed.store.push_order(common::order().call());
    bed.settle().await;

    assert!(!bed.services.phone.is_ringing());
    assert_eq!(bed.sink.count(), 0);
    assert_eq!(bed.platform.notification_count(), 0);
    assert_eq!(bed.platform.vibration_count(), 0);
    // The record still exists; only the alert was suppressed.
    assert_eq!(bed.services.notifications.count_unread().await, 1);

    // The same class of event on a staff view starts exactly one session.
    bed.services.phone.set_active_view("/admin/orders");
    bed.store.push_order(common::order().order_number("ORD-2").call());
    bed.settle().await;
    assert!(bed.services.phone.is_ringing());
    assert_eq!(bed.platform.notification_count(), 1);

    bed.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn global_disable_suppresses_every_channel() {
    let bed = TestBed::start().await;
    bed.services
        .settings
        .update(patch(serde_json::json!({ "enabled": false })))
        .await;

    bed.store.push_order(common::order().call());
    bed.settle().await;

    assert!(!bed.services.phone.is_ringing());
    assert_eq!(bed.platform.notification_count(), 0);
    assert_eq!(bed.platform.vibration_count(), 0);

    bed.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn sound_off_still_notifies_and_vibrates() {
    let bed = TestBed::start().await;
    bed.services
        .settings
        .update(patch(serde_json::json!({ "soundEnabled": false })))
        .await;

    bed.store.push_order(common::order().call());
    bed.settle().await;

    assert!(!bed.services.phone.is_ringing());
    assert_eq!(bed.sink.count(), 0);
    assert_eq!(bed.platform.notification_count(), 1);
    assert_eq!(bed.platform.vibration_count(), 1);

    bed.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn redelivered_records_alert_only_once() {
    let bed = TestBed::start().await;

    bed.store.push_order(common::order().call());
    bed.settle().await;
    assert_eq!(bed.platform.notification_count(), 1);
    bed.services.phone.stop_ringing().await;

    // A realtime reconnect replays the same insert.
    let record = bed.services.notifications.list(false).await.remove(0);
    bed.store.replay_notification(record.clone());
    bed.store.replay_notification(record);
    bed.settle().await;

    assert!(!bed.services.phone.is_ringing(), "duplicate must not re-ring");
    assert_eq!(bed.platform.notification_count(), 1);

    bed.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn stop_ringing_is_safe_when_idle() {
    let bed = TestBed::start().await;

    assert!(!bed.services.phone.is_ringing());
    bed.services.phone.stop_ringing().await;
    bed.services.phone.stop_ringing().await;
    assert!(!bed.services.phone.is_ringing());
    assert_eq!(bed.services.phone.ring_count(), 0);

    bed.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn acknowledging_the_last_unread_stops_the_ring() {
    let bed = TestBed::start().await;

    bed.store.push_order(common::order().call());
    bed.settle().await;
    assert!(bed.services.phone.is_ringing());
    assert!(bed.services.device.holds_wake_lock());

    // Reading only one of two leaves the phone ringing.
    bed.store.push_order(common::order().order_number("ORD-2").call());
    bed.settle().await;
    let records = bed.services.notifications.list(false).await;
    assert!(bed.services.notifications.mark_read(records[0].id).await);
    bed.services.phone.stop_if_all_read().await;
    assert!(bed.services.phone.is_ringing());

    assert!(bed.services.notifications.mark_read(records[1].id).await);
    bed.services.phone.stop_if_all_read().await;
    assert!(!bed.services.phone.is_ringing());
    assert!(!bed.services.device.holds_wake_lock());

    bed.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn a_second_order_keeps_the_existing_session_ringing() {
    let bed = TestBed::start().await;

    bed.store.push_order(common::order().call());
    bed.settle().await;
    assert!(bed.services.phone.is_ringing());

    bed.store.push_order(common::order().order_number("ORD-2").call());
    bed.settle().await;

    assert!(bed.services.phone.is_ringing());
    // Both records exist; both staff notifications went out.
    assert_eq!(bed.services.notifications.count_unread().await, 2);
    assert_eq!(bed.platform.notification_count(), 2);

    bed.shutdown().await;
}
