//! Order rows and the change events the backend emits for them.
//!
//! The shop backend streams row-level changes over its realtime channel.
//! [`OrderChange`] is the decoded form handed to the event router; the raw
//! wire envelope lives in `store::hosted`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A row of the `orders` table, as far as the alert pipeline cares.
///
/// The table has more columns (delivery address, line items, ...) than
/// listed here; unknown fields are ignored on deserialization and carried
/// only by the storefront.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub order_number: String,
    pub customer_name: String,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub total_amount: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Accepted,
    Processing,
    Completed,
    Cancelled,
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Accepted => "accepted",
            OrderStatus::Processing => "processing",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        })
    }
}

/// A single change to the `orders` table.
///
/// Updates carry both row versions so the router can diff the watched
/// columns. Delivery is at-least-once; the same change may arrive again
/// after a realtime reconnect and classification must stay idempotent.
#[derive(Debug, Clone)]
pub enum OrderChange {
    Inserted(Order),
    Updated { old: Order, new: Order },
    Deleted { id: Uuid },
}

impl OrderChange {
    /// The row id the change refers to.
    pub fn order_id(&self) -> Uuid {
        match self {
            OrderChange::Inserted(order) => order.id,
            OrderChange::Updated { new, .. } => new.id,
            OrderChange::Deleted { id } => *id,
        }
    }
}
