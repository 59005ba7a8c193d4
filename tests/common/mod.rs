//! Shared harness for the orderbell testsuite.
//!
//! [`TestBed`] wires [`Services`] exactly like `main` does, but onto the
//! in-memory store, a [`RecordingSink`] instead of the speaker, and a
//! [`RecordingPlatform`] instead of the staff webhook. Tests drive the
//! backend by pushing rows into the store and assert on what was
//! recorded. [`FailingStore`] errors on every operation, for the
//! fallback and error-absorption suites; [`FlakyStore`] fails a set
//! number of writes and then recovers, for the reconciliation suite.

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use bon::builder;
use chrono::{DateTime, Utc};
use orderbell::device::{DevicePlatform, StaffNotification};
use orderbell::notifications::{
    NewNotification, NotificationRecord, NotificationType,
};
use orderbell::orders::{Order, OrderChange, OrderStatus, PaymentStatus};
use orderbell::phone::{staff_view_set, DEFAULT_STAFF_VIEWS};
use orderbell::ring::tone::ToneSink;
use orderbell::ring::ToneSpec;
use orderbell::settings::Settings;
use orderbell::store::memory::MemoryStore;
use orderbell::store::Store;
use orderbell::Services;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Collects every tone handed to the engine, with the (test-clock) time
/// it was played at.
#[derive(Default)]
pub struct RecordingSink {
    plays: Mutex<Vec<(Instant, ToneSpec)>>,
}

impl RecordingSink {
    pub fn plays(&self) -> Vec<(Instant, ToneSpec)> {
        self.plays.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.plays.lock().unwrap().len()
    }

    /// Tone start offsets in seconds, relative to the first tone.
    pub fn offsets(&self) -> Vec<f32> {
        let plays = self.plays.lock().unwrap();
        let Some((first, _)) = plays.first() else {
            return Vec::new();
        };
        plays
            .iter()
            .map(|(at, _)| at.duration_since(*first).as_secs_f32())
            .collect()
    }
}

impl ToneSink for RecordingSink {
    fn play(&self, spec: &ToneSpec) {
        self.plays.lock().unwrap().push((Instant::now(), *spec));
    }
}

/// A device platform that records instead of buzzing. Every capability
/// probe says yes.
#[derive(Default)]
pub struct RecordingPlatform {
    pub vibrations: Mutex<Vec<Vec<u64>>>,
    pub notifications: Mutex<Vec<StaffNotification>>,
    pub wake_holds: Mutex<u32>,
    pub wake_drops: Mutex<u32>,
}

impl RecordingPlatform {
    pub fn notification_count(&self) -> usize {
        self.notifications.lock().unwrap().len()
    }

    pub fn vibration_count(&self) -> usize {
        // The empty pattern is the cancel signal, not a buzz.
        self.vibrations
            .lock()
            .unwrap()
            .iter()
            .filter(|p| !p.is_empty())
            .count()
    }
}

#[async_trait]
impl DevicePlatform for RecordingPlatform {
    fn has_vibration(&self) -> bool {
        true
    }
    fn has_wake_lock(&self) -> bool {
        true
    }
    fn has_notifications(&self) -> bool {
        true
    }

    async fn vibrate(&self, pattern_ms: &[u64]) -> Result<()> {
        self.vibrations.lock().unwrap().push(pattern_ms.to_vec());
        Ok(())
    }

    async fn hold_wake_lock(&self) -> Result<()> {
        *self.wake_holds.lock().unwrap() += 1;
        Ok(())
    }

    async fn drop_wake_lock(&self) -> Result<()> {
        *self.wake_drops.lock().unwrap() += 1;
        Ok(())
    }

    async fn show_notification(&self, notification: &StaffNotification) -> Result<()> {
        self.notifications.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

/// A store where the backend is always down.
pub struct FailingStore {
    order_tx: broadcast::Sender<OrderChange>,
    notification_tx: broadcast::Sender<NotificationRecord>,
}

impl FailingStore {
    pub fn new() -> Arc<Self> {
        let (order_tx, _) = broadcast::channel(8);
        let (notification_tx, _) = broadcast::channel(8);
        Arc::new(FailingStore {
            order_tx,
            notification_tx,
        })
    }
}

#[async_trait]
impl Store for FailingStore {
    async fn insert_notification(&self, _new: &NewNotification) -> Result<NotificationRecord> {
        anyhow::bail!("backend down")
    }
    async fn list_notifications(&self, _unread_only: bool) -> Result<Vec<NotificationRecord>> {
        anyhow::bail!("backend down")
    }
    async fn count_unread(&self) -> Result<i64> {
        anyhow::bail!("backend down")
    }
    async fn mark_notification_read(&self, _id: Uuid) -> Result<()> {
        anyhow::bail!("backend down")
    }
    async fn mark_all_notifications_read(&self) -> Result<u64> {
        anyhow::bail!("backend down")
    }
    async fn delete_notification(&self, _id: Uuid) -> Result<()> {
        anyhow::bail!("backend down")
    }
    async fn notification_exists(&self, _order_id: Uuid, _ty: NotificationType) -> Result<bool> {
        anyhow::bail!("backend down")
    }
    async fn orders_created_since(&self, _cutoff: DateTime<Utc>) -> Result<Vec<Order>> {
        anyhow::bail!("backend down")
    }
    async fn load_settings(&self) -> Result<Option<Settings>> {
        anyhow::bail!("backend down")
    }
    async fn save_settings(&self, _settings: &Settings) -> Result<()> {
        anyhow::bail!("backend down")
    }
    fn subscribe_order_changes(&self) -> broadcast::Receiver<OrderChange> {
        self.order_tx.subscribe()
    }
    fn subscribe_notification_inserts(&self) -> broadcast::Receiver<NotificationRecord> {
        self.notification_tx.subscribe()
    }
    async fn run_realtime(&self, cancel: CancellationToken) {
        cancel.cancelled().await;
    }
}

/// A store that fails a configured number of insert writes, then
/// recovers. Everything else delegates to the wrapped [`MemoryStore`].
pub struct FlakyStore {
    pub inner: Arc<MemoryStore>,
    fail_inserts: AtomicU32,
}

impl FlakyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            fail_inserts: AtomicU32::new(0),
        })
    }

    /// Make the next `n` insert calls fail.
    pub fn fail_next_inserts(&self, n: u32) {
        self.fail_inserts.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl Store for FlakyStore {
    async fn insert_notification(&self, new: &NewNotification) -> Result<NotificationRecord> {
        let remaining = self.fail_inserts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_inserts.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("backend write timed out");
        }
        self.inner.insert_notification(new).await
    }
    async fn list_notifications(&self, unread_only: bool) -> Result<Vec<NotificationRecord>> {
        self.inner.list_notifications(unread_only).await
    }
    async fn count_unread(&self) -> Result<i64> {
        self.inner.count_unread().await
    }
    async fn mark_notification_read(&self, id: Uuid) -> Result<()> {
        self.inner.mark_notification_read(id).await
    }
    async fn mark_all_notifications_read(&self) -> Result<u64> {
        self.inner.mark_all_notifications_read().await
    }
    async fn delete_notification(&self, id: Uuid) -> Result<()> {
        self.inner.delete_notification(id).await
    }
    async fn notification_exists(&self, order_id: Uuid, ty: NotificationType) -> Result<bool> {
        self.inner.notification_exists(order_id, ty).await
    }
    async fn orders_created_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Order>> {
        self.inner.orders_created_since(cutoff).await
    }
    async fn load_settings(&self) -> Result<Option<Settings>> {
        self.inner.load_settings().await
    }
    async fn save_settings(&self, settings: &Settings) -> Result<()> {
        self.inner.save_settings(settings).await
    }
    fn subscribe_order_changes(&self) -> broadcast::Receiver<OrderChange> {
        self.inner.subscribe_order_changes()
    }
    fn subscribe_notification_inserts(&self) -> broadcast::Receiver<NotificationRecord> {
        self.inner.subscribe_notification_inserts()
    }
    async fn run_realtime(&self, cancel: CancellationToken) {
        self.inner.run_realtime(cancel).await
    }
}

/// An order row fixture. Every field has a sensible default.
#[builder]
pub fn order(
    #[builder(into, default = "ORD-1".to_owned())] order_number: String,
    #[builder(into, default = "Mario".to_owned())] customer_name: String,
    #[builder(default = OrderStatus::Pending)] status: OrderStatus,
    #[builder(default = PaymentStatus::Pending)] payment_status: PaymentStatus,
    #[builder(default = 24.5)] total_amount: f64,
    created_at: Option<DateTime<Utc>>,
) -> Order {
    Order {
        id: Uuid::new_v4(),
        order_number,
        customer_name,
        status,
        payment_status,
        total_amount,
        created_at: created_at.unwrap_or_else(Utc::now),
    }
}

/// A unique scratch path for the settings fallback file.
pub fn scratch_settings_path(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!("orderbell-{label}-{}.json", Uuid::new_v4()))
}

/// The full daemon wiring on test doubles.
pub struct TestBed {
    pub store: Arc<MemoryStore>,
    pub sink: Arc<RecordingSink>,
    pub platform: Arc<RecordingPlatform>,
    pub services: Services,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl TestBed {
    /// Build and start the services, then let the pumps subscribe before
    /// the test pushes its first row.
    pub async fn start() -> TestBed {
        let store = MemoryStore::new();
        let sink = Arc::new(RecordingSink::default());
        let platform = Arc::new(RecordingPlatform::default());
        let patterns: Vec<String> = DEFAULT_STAFF_VIEWS.iter().map(|s| s.to_string()).collect();
        let services = Services::build(
            store.clone() as Arc<dyn Store>,
            sink.clone() as Arc<dyn ToneSink>,
            platform.clone() as Arc<dyn DevicePlatform>,
            scratch_settings_path("bed"),
            staff_view_set(&patterns).unwrap(),
        );
        services.settings.load().await;
        let cancel = CancellationToken::new();
        let tasks = services.start(&cancel);

        let bed = TestBed {
            store,
            sink,
            platform,
            services,
            cancel,
            tasks,
        };
        bed.settle().await;
        bed
    }

    /// Let queued work drain. On the paused clock this is instant.
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    pub async fn shutdown(self) {
        self.services.phone.shutdown().await;
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
    }

    /// Records of one type, newest first.
    pub async fn records_of(&self, ty: NotificationType) -> Vec<NotificationRecord> {
        self.services
            .notifications
            .list(false)
            .await
            .into_iter()
            .filter(|r| r.notification_type == ty)
            .collect()
    }
}
