//! In-memory store: plain tables plus the same realtime fan-out the hosted
//! store provides. Substrate for tests and `memory:` dev runs; nothing
//! survives the process.

use super::{Store, REALTIME_CHANNEL_CAPACITY};
use crate::notifications::{NewNotification, NotificationRecord, NotificationType};
use crate::orders::{Order, OrderChange};
use crate::settings::Settings;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing as log;
use uuid::Uuid;

pub struct MemoryStore {
    orders: Mutex<Vec<Order>>,
    notifications: Mutex<Vec<NotificationRecord>>,
    settings: Mutex<Option<Settings>>,
    order_tx: broadcast::Sender<OrderChange>,
    notification_tx: broadcast::Sender<NotificationRecord>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        let (order_tx, _) = broadcast::channel(REALTIME_CHANNEL_CAPACITY);
        let (notification_tx, _) = broadcast::channel(REALTIME_CHANNEL_CAPACITY);
        Arc::new(MemoryStore {
            orders: Mutex::new(Vec::new()),
            notifications: Mutex::new(Vec::new()),
            settings: Mutex::new(None),
            order_tx,
            notification_tx,
        })
    }

    /// Simulate the backend inserting an order row. Stores it and publishes
    /// the change as the realtime feed would.
    pub fn push_order(&self, order: Order) {
        self.orders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(order.clone());
        let _ = self.order_tx.send(OrderChange::Inserted(order));
    }

    /// Simulate the backend updating an order row in place.
    pub fn apply_order_update(&self, updated: Order) {
        let mut orders = self.orders.lock().unwrap_or_else(|e| e.into_inner());
        match orders.iter_mut().find(|o| o.id == updated.id) {
            Some(slot) => {
                let old = slot.clone();
                *slot = updated.clone();
                drop(orders);
                let _ = self.order_tx.send(OrderChange::Updated {
                    old,
                    new: updated,
                });
            }
            None => {
                log::debug!("update for unknown order {}, treating as insert", updated.id);
                drop(orders);
                self.push_order(updated);
            }
        }
    }

    /// Re-publish an already stored notification on the insert stream, as
    /// a realtime reconnect would. The row itself is not duplicated.
    pub fn replay_notification(&self, record: NotificationRecord) {
        let _ = self.notification_tx.send(record);
    }

    /// Simulate the backend deleting an order row.
    pub fn remove_order(&self, id: Uuid) {
        self.orders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|o| o.id != id);
        let _ = self.order_tx.send(OrderChange::Deleted { id });
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_notification(&self, new: &NewNotification) -> Result<NotificationRecord> {
        let record = NotificationRecord {
            id: Uuid::new_v4(),
            order_id: new.order_id,
            message: new.message.clone(),
            notification_type: new.notification_type,
            priority: new.priority,
            is_read: false,
            read_at: None,
            created_at: Utc::now(),
            metadata: new.metadata.clone(),
        };
        self.notifications
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record.clone());
        let _ = self.notification_tx.send(record.clone());
        Ok(record)
    }

    async fn list_notifications(&self, unread_only: bool) -> Result<Vec<NotificationRecord>> {
        let notifications = self.notifications.lock().unwrap_or_else(|e| e.into_inner());
        // Rows are appended in creation order, so newest-first is a reverse
        // walk.
        Ok(notifications
            .iter()
            .rev()
            .filter(|n| !unread_only || !n.is_read)
            .cloned()
            .collect())
    }

    async fn count_unread(&self) -> Result<i64> {
        let notifications = self.notifications.lock().unwrap_or_else(|e| e.into_inner());
        Ok(notifications.iter().filter(|n| !n.is_read).count() as i64)
    }

    async fn mark_notification_read(&self, id: Uuid) -> Result<()> {
        let mut notifications = self.notifications.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(record) = notifications.iter_mut().find(|n| n.id == id) {
            if !record.is_read {
                record.is_read = true;
                record.read_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn mark_all_notifications_read(&self) -> Result<u64> {
        let mut notifications = self.notifications.lock().unwrap_or_else(|e| e.into_inner());
        let mut flipped = 0;
        let now = Utc::now();
        for record in notifications.iter_mut().filter(|n| !n.is_read) {
            record.is_read = true;
            record.read_at = Some(now);
            flipped += 1;
        }
        Ok(flipped)
    }

    async fn delete_notification(&self, id: Uuid) -> Result<()> {
        self.notifications
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|n| n.id != id);
        Ok(())
    }

    async fn notification_exists(
        &self,
        order_id: Uuid,
        ty: NotificationType,
    ) -> Result<bool> {
        let notifications = self.notifications.lock().unwrap_or_else(|e| e.into_inner());
        Ok(notifications
            .iter()
            .any(|n| n.order_id == Some(order_id) && n.notification_type == ty))
    }

    async fn orders_created_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Order>> {
        let orders = self.orders.lock().unwrap_or_else(|e| e.into_inner());
        let mut recent: Vec<Order> = orders
            .iter()
            .filter(|o| o.created_at > cutoff)
            .cloned()
            .collect();
        recent.sort_by_key(|o| o.created_at);
        Ok(recent)
    }

    async fn load_settings(&self) -> Result<Option<Settings>> {
        Ok(self.settings.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn save_settings(&self, settings: &Settings) -> Result<()> {
        *self.settings.lock().unwrap_or_else(|e| e.into_inner()) = Some(settings.clone());
        Ok(())
    }

    fn subscribe_order_changes(&self) -> broadcast::Receiver<OrderChange> {
        self.order_tx.subscribe()
    }

    fn subscribe_notification_inserts(&self) -> broadcast::Receiver<NotificationRecord> {
        self.notification_tx.subscribe()
    }

    async fn run_realtime(&self, cancel: CancellationToken) {
        // Changes are published synchronously by the mutators above.
        cancel.cancelled().await;
    }
}
