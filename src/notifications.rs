//! Notification records and the service that owns them.
//!
//! A [`NotificationRecord`] is written to the backend's `order_notifications`
//! table whenever the router classifies an order change as worth telling the
//! staff about. Records are immutable after creation except for the
//! `is_read`/`read_at` pair.
//!
//! [`NotificationService`] is the only writer of that table in this process.
//! It also fans newly inserted records out to in-process listeners: exactly
//! one task ([`NotificationService::deliver_inserts`]) reads the backend's
//! realtime insert stream and republishes to every registered callback, so
//! the backend connection is never subscribed more than once per process.

use crate::orders::{Order, OrderStatus, PaymentStatus};
use crate::settings::SettingsStore;
use crate::store::Store;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing as log;
use uuid::Uuid;

/// Why a notification exists. Fixed at creation, never rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    OrderCreated,
    OrderPaid,
    OrderUpdated,
    OrderCancelled,
    PaymentFailed,
    PaymentCompleted,
}

impl NotificationType {
    pub const ALL: [NotificationType; 6] = [
        NotificationType::OrderCreated,
        NotificationType::OrderPaid,
        NotificationType::OrderUpdated,
        NotificationType::OrderCancelled,
        NotificationType::PaymentFailed,
        NotificationType::PaymentCompleted,
    ];
}

impl fmt::Display for NotificationType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            NotificationType::OrderCreated => "order_created",
            NotificationType::OrderPaid => "order_paid",
            NotificationType::OrderUpdated => "order_updated",
            NotificationType::OrderCancelled => "order_cancelled",
            NotificationType::PaymentFailed => "payment_failed",
            NotificationType::PaymentCompleted => "payment_completed",
        })
    }
}

impl std::str::FromStr for NotificationType {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<NotificationType> {
        Ok(match s {
            "order_created" => NotificationType::OrderCreated,
            "order_paid" => NotificationType::OrderPaid,
            "order_updated" => NotificationType::OrderUpdated,
            "order_cancelled" => NotificationType::OrderCancelled,
            "payment_failed" => NotificationType::PaymentFailed,
            "payment_completed" => NotificationType::PaymentCompleted,
            other => anyhow::bail!("unknown notification type `{other}`"),
        })
    }
}

/// A persisted staff notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: Uuid,
    /// Originating order; `None` for synthetic/test notifications.
    pub order_id: Option<Uuid>,
    pub message: String,
    pub notification_type: NotificationType,
    /// 1 (lowest) to 5 (highest), copied from the per-type config at
    /// creation time.
    pub priority: u8,
    pub is_read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Display-only snapshot of order fields at creation time. Never
    /// queried structurally.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Insert payload for `order_notifications`; the backend fills in `id`,
/// `created_at`, and the unread flags.
#[derive(Debug, Clone, Serialize)]
pub struct NewNotification {
    pub order_id: Option<Uuid>,
    pub message: String,
    pub notification_type: NotificationType,
    pub priority: u8,
    pub metadata: serde_json::Value,
}

/// A classified, notification-worthy order change, produced by the router.
#[derive(Debug, Clone)]
pub struct OrderEvent {
    pub notification_type: NotificationType,
    /// Snapshot of the row as of this change (the *new* row for updates).
    pub order: Order,
    pub previous_status: Option<OrderStatus>,
    pub previous_payment_status: Option<PaymentStatus>,
}

impl OrderEvent {
    /// Render the human-readable message for this event.
    ///
    /// The exact wording is load-bearing: the bell popover, the staff
    /// webhook, and the tests all show these strings verbatim.
    pub fn message(&self) -> String {
        let order = &self.order;
        match self.notification_type {
            NotificationType::OrderCreated => format!(
                "New order #{} received from {}",
                order.order_number, order.customer_name
            ),
            NotificationType::OrderPaid => format!(
                "Payment completed for order #{} by {}",
                order.order_number, order.customer_name
            ),
            NotificationType::OrderUpdated => {
                format!("Order #{} has been updated", order.order_number)
            }
            NotificationType::OrderCancelled => {
                format!("Order #{} has been cancelled", order.order_number)
            }
            NotificationType::PaymentFailed => {
                format!("Payment failed for order #{}", order.order_number)
            }
            NotificationType::PaymentCompleted => format!(
                "Payment of €{:.2} completed for order #{}",
                order.total_amount, order.order_number
            ),
        }
    }

    /// Display-only snapshot stored in the record's metadata bag.
    pub fn metadata(&self) -> serde_json::Value {
        serde_json::json!({
            "order_number": self.order.order_number,
            "customer_name": self.order.customer_name,
            "amount": self.order.total_amount,
            "previous_status": self.previous_status.map(|s| s.to_string()),
            "new_status": self.order.status.to_string(),
            "previous_payment_status": self.previous_payment_status.map(|s| s.to_string()),
            "payment_status": self.order.payment_status.to_string(),
        })
    }
}

type Listener = Arc<dyn Fn(&NotificationRecord) + Send + Sync>;

/// CRUD on notification records plus in-process fan-out of inserts.
///
/// Every operation absorbs backend failures: reads degrade to empty/zero,
/// writes report `false`/`None` and log. Nothing here returns an error to
/// UI code.
pub struct NotificationService {
    store: Arc<dyn Store>,
    settings: Arc<SettingsStore>,
    listeners: Mutex<HashMap<String, Listener>>,
}

impl NotificationService {
    pub fn new(store: Arc<dyn Store>, settings: Arc<SettingsStore>) -> Arc<Self> {
        Arc::new(NotificationService {
            store,
            settings,
            listeners: Mutex::new(HashMap::new()),
        })
    }

    /// Create and persist a record for a classified order event.
    ///
    /// Returns `None` without side effects when the per-type config has the
    /// type disabled (a policy gate, not an error), and `None` with a log
    /// line when persistence fails.
    pub async fn create(&self, event: &OrderEvent) -> Option<NotificationRecord> {
        let type_config = self.settings.type_settings(event.notification_type);
        if !type_config.enabled {
            log::debug!(
                "skipping {} notification for order {}: type disabled",
                event.notification_type,
                event.order.order_number
            );
            return None;
        }

        let new = NewNotification {
            order_id: Some(event.order.id),
            message: event.message(),
            notification_type: event.notification_type,
            priority: type_config.priority,
            metadata: event.metadata(),
        };
        match self.store.insert_notification(&new).await {
            Ok(record) => {
                log::info!(
                    "recorded {} notification for order #{}",
                    record.notification_type,
                    event.order.order_number
                );
                Some(record)
            }
            Err(err) => {
                log::error!(
                    "failed to persist {} notification for order #{}: {err:?}",
                    event.notification_type,
                    event.order.order_number
                );
                None
            }
        }
    }

    /// Whether the per-type config currently allows records of this type.
    pub fn type_enabled(&self, ty: NotificationType) -> bool {
        self.settings.type_settings(ty).enabled
    }

    /// All records, newest first. Empty on backend failure.
    pub async fn list(&self, unread_only: bool) -> Vec<NotificationRecord> {
        match self.store.list_notifications(unread_only).await {
            Ok(records) => records,
            Err(err) => {
                log::error!("failed to list notifications: {err:?}");
                Vec::new()
            }
        }
    }

    /// Unread count for UI badges; zero on backend failure.
    pub async fn count_unread(&self) -> i64 {
        match self.try_count_unread().await {
            Ok(count) => count,
            Err(err) => {
                log::error!("failed to count unread notifications: {err:?}");
                0
            }
        }
    }

    /// Unread count that surfaces backend failures, for callers that must
    /// distinguish "none left" from "could not tell" (the ring-stop path).
    pub async fn try_count_unread(&self) -> Result<i64> {
        self.store.count_unread().await
    }

    /// Mark one record read. Idempotent: re-marking an already-read record
    /// succeeds and leaves its original `read_at` untouched.
    pub async fn mark_read(&self, id: Uuid) -> bool {
        match self.store.mark_notification_read(id).await {
            Ok(_) => true,
            Err(err) => {
                log::error!("failed to mark notification {id} read: {err:?}");
                false
            }
        }
    }

    pub async fn mark_all_read(&self) -> bool {
        match self.store.mark_all_notifications_read().await {
            Ok(count) => {
                if count > 0 {
                    log::info!("marked {count} notifications read");
                }
                true
            }
            Err(err) => {
                log::error!("failed to mark all notifications read: {err:?}");
                false
            }
        }
    }

    pub async fn delete(&self, id: Uuid) -> bool {
        match self.store.delete_notification(id).await {
            Ok(_) => true,
            Err(err) => {
                log::error!("failed to delete notification {id}: {err:?}");
                false
            }
        }
    }

    /// Register a callback invoked once per newly inserted record.
    ///
    /// Listeners are keyed by a caller-chosen id; subscribing again under
    /// the same id replaces the previous callback. Delivery is at-least-once
    /// (a realtime reconnect can replay an insert), so listeners that mutate
    /// state must de-duplicate by record id.
    pub fn subscribe(
        &self,
        listener_id: impl Into<String>,
        callback: impl Fn(&NotificationRecord) + Send + Sync + 'static,
    ) {
        let listener_id = listener_id.into();
        log::debug!("notification listener `{listener_id}` registered");
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(listener_id, Arc::new(callback));
    }

    pub fn unsubscribe(&self, listener_id: &str) {
        let removed = self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(listener_id)
            .is_some();
        if removed {
            log::debug!("notification listener `{listener_id}` removed");
        }
    }

    /// Pump newly inserted records from the backend stream to listeners.
    ///
    /// This is the single subscriber to the backend's insert feed; spawn it
    /// once at startup and cancel it on shutdown.
    pub async fn deliver_inserts(self: Arc<Self>, cancel: CancellationToken) {
        let mut inserts = self.store.subscribe_notification_inserts();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = inserts.recv() => match next {
                    Ok(record) => self.dispatch(&record),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        log::warn!("notification insert stream lagged, {missed} records dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        log::debug!("notification delivery pump stopped");
    }

    fn dispatch(&self, record: &NotificationRecord) {
        // Snapshot under the lock, invoke outside it, so a callback may
        // re-subscribe without deadlocking.
        let listeners: Vec<(String, Listener)> = self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(id, cb)| (id.clone(), Arc::clone(cb)))
            .collect();
        log::trace!(
            "dispatching notification {} to {} listener(s)",
            record.id,
            listeners.len()
        );
        for (_, callback) in listeners {
            callback(record);
        }
    }
}
