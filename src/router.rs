//! Turns raw order-row changes into notification-worthy events.
//!
//! Classification is a pure function over the old and new rows, so a
//! redelivered change simply classifies the same way again; de-duplication
//! is the alert layer's business. The [`OrderRouter`] pump is the single
//! consumer of the store's order-change stream: it classifies, persists a
//! record per event, and advances the creation watermark the
//! reconciliation job fetches against.

use crate::notifications::{NotificationService, NotificationType, OrderEvent};
use crate::orders::{Order, OrderChange, OrderStatus, PaymentStatus};
use crate::store::Store;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing as log;

/// High-water mark of order creation we have a record for. Starts at
/// process start, so old rows never flood the counter on boot; advanced by
/// both the realtime and the reconciliation path once a record is stored.
pub struct Watermark(Mutex<DateTime<Utc>>);

impl Watermark {
    pub fn starting_now() -> Arc<Watermark> {
        Watermark::at(Utc::now())
    }

    pub fn at(start: DateTime<Utc>) -> Arc<Watermark> {
        Arc::new(Watermark(Mutex::new(start)))
    }

    pub fn get(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Move forward, never back.
    pub fn advance(&self, to: DateTime<Utc>) {
        let mut current = self.0.lock().unwrap_or_else(|e| e.into_inner());
        if to > *current {
            *current = to;
        }
    }
}

/// Classify one change into zero or more events, per the order lifecycle:
///
/// * an insert is always `order_created`;
/// * an update produces `order_cancelled`, `order_updated` (on moving to
///   accepted or completed), `payment_completed`, and/or `payment_failed`
///   per transition, several at once when transitions coincide;
/// * an update that fired nothing specific but touched status, payment
///   status, or the total produces a generic `order_updated`;
/// * anything else (no watched field changed, or a delete) is nothing.
pub fn classify(change: &OrderChange) -> Vec<OrderEvent> {
    match change {
        OrderChange::Inserted(order) => vec![OrderEvent {
            notification_type: NotificationType::OrderCreated,
            order: order.clone(),
            previous_status: None,
            previous_payment_status: None,
        }],
        OrderChange::Updated { old, new } => classify_update(old, new),
        OrderChange::Deleted { id } => {
            log::debug!("ignoring delete of order {id}");
            Vec::new()
        }
    }
}

fn classify_update(old: &Order, new: &Order) -> Vec<OrderEvent> {
    let status_changed = old.status != new.status;
    let payment_changed = old.payment_status != new.payment_status;
    let amount_changed = old.total_amount != new.total_amount;

    let mut events = Vec::new();
    if status_changed && new.status == OrderStatus::Cancelled {
        events.push(event(NotificationType::OrderCancelled, old, new));
    }
    if status_changed && matches!(new.status, OrderStatus::Accepted | OrderStatus::Completed) {
        events.push(event(NotificationType::OrderUpdated, old, new));
    }
    if payment_changed && new.payment_status == PaymentStatus::Completed {
        events.push(event(NotificationType::PaymentCompleted, old, new));
    }
    if payment_changed && new.payment_status == PaymentStatus::Failed {
        events.push(event(NotificationType::PaymentFailed, old, new));
    }
    if events.is_empty() && (status_changed || payment_changed || amount_changed) {
        events.push(event(NotificationType::OrderUpdated, old, new));
    }
    events
}

fn event(notification_type: NotificationType, old: &Order, new: &Order) -> OrderEvent {
    OrderEvent {
        notification_type,
        order: new.clone(),
        previous_status: Some(old.status),
        previous_payment_status: Some(old.payment_status),
    }
}

/// The single consumer of the order-change stream.
pub struct OrderRouter {
    notifications: Arc<NotificationService>,
    watermark: Arc<Watermark>,
}

impl OrderRouter {
    pub fn new(notifications: Arc<NotificationService>, watermark: Arc<Watermark>) -> Arc<Self> {
        Arc::new(OrderRouter {
            notifications,
            watermark,
        })
    }

    /// Classify a change and persist a record per event.
    ///
    /// The creation watermark advances only once the `order_created`
    /// record is persisted, or when the type is switched off. A failed
    /// write stays below the watermark, so the reconciliation job
    /// fetches the order again and retries.
    pub async fn process(&self, change: &OrderChange) {
        for order_event in classify(change) {
            log::debug!(
                "order #{} classified as {}",
                order_event.order.order_number,
                order_event.notification_type
            );
            let record = self.notifications.create(&order_event).await;
            if order_event.notification_type == NotificationType::OrderCreated
                && (record.is_some()
                    || !self.notifications.type_enabled(NotificationType::OrderCreated))
            {
                self.watermark.advance(order_event.order.created_at);
            }
        }
    }

    /// Pump changes off the store's realtime stream until cancelled.
    pub async fn run(self: Arc<Self>, store: Arc<dyn Store>, cancel: CancellationToken) {
        let mut changes = store.subscribe_order_changes();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = changes.recv() => match next {
                    Ok(change) => self.process(&change).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        // The reconciliation job will pick up missed
                        // creations; transitions are lost.
                        log::warn!("order change stream lagged, {missed} changes dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        log::debug!("order router stopped");
    }
}
