//! Backend access.
//!
//! Everything the daemon knows about orders, notification records, and the
//! persisted settings row goes through the [`Store`] trait. Two
//! implementations exist: [`hosted::HostedStore`] speaks HTTPS + websocket
//! realtime to the shop's hosted backend, and [`memory::MemoryStore`] keeps
//! plain tables in process memory for tests and `memory:` dev runs.
//!
//! Realtime changes fan out through tokio broadcast channels. The store
//! publishes, interested components subscribe; only one component per
//! concern should subscribe in production (the router for order changes,
//! the notification service for inserts) so the backend feed is consumed
//! exactly once per process.

pub mod hosted;
pub mod memory;

use crate::config::BackendConfig;
use crate::notifications::{NewNotification, NotificationRecord, NotificationType};
use crate::orders::{Order, OrderChange};
use crate::settings::Settings;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing as log;
use uuid::Uuid;

/// Buffered realtime events per subscriber before the channel lags.
pub(crate) const REALTIME_CHANNEL_CAPACITY: usize = 64;

#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a notification record; the store assigns `id`, `created_at`,
    /// and the unread flags, and returns the stored row.
    async fn insert_notification(&self, new: &NewNotification) -> Result<NotificationRecord>;

    /// Records newest first, optionally only unread ones.
    async fn list_notifications(&self, unread_only: bool) -> Result<Vec<NotificationRecord>>;

    async fn count_unread(&self) -> Result<i64>;

    /// Idempotent: marking a missing or already-read record succeeds and
    /// never rewrites an existing `read_at`.
    async fn mark_notification_read(&self, id: Uuid) -> Result<()>;

    /// Returns how many records flipped to read.
    async fn mark_all_notifications_read(&self) -> Result<u64>;

    /// Idempotent: deleting a missing record succeeds.
    async fn delete_notification(&self, id: Uuid) -> Result<()>;

    /// Whether a record of this type already exists for the order. Guards
    /// reconciliation against double-alerting.
    async fn notification_exists(&self, order_id: Uuid, ty: NotificationType) -> Result<bool>;

    /// Orders with `created_at` strictly after the cutoff, oldest first.
    /// Feeds the reconciliation job.
    async fn orders_created_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Order>>;

    /// The single settings row, `None` when never saved.
    async fn load_settings(&self) -> Result<Option<Settings>>;

    async fn save_settings(&self, settings: &Settings) -> Result<()>;

    /// Subscribe to order-row changes from the realtime feed.
    fn subscribe_order_changes(&self) -> broadcast::Receiver<OrderChange>;

    /// Subscribe to newly inserted notification records.
    fn subscribe_notification_inserts(&self) -> broadcast::Receiver<NotificationRecord>;

    /// Drive the realtime connection until cancelled. Hosted stores hold a
    /// websocket open (reconnecting as needed); the memory store publishes
    /// synchronously and just parks here.
    async fn run_realtime(&self, cancel: CancellationToken);
}

/// Pick a store implementation from the configured backend URL:
/// `memory:` for the in-process store, `http(s)://` for the hosted one.
pub fn open(config: &BackendConfig) -> Result<Arc<dyn Store>> {
    if config.url.starts_with("memory:") {
        log::warn!("using in-memory store; nothing will be persisted");
        Ok(memory::MemoryStore::new())
    } else if config.url.starts_with("http") {
        Ok(hosted::HostedStore::new(config)?)
    } else {
        anyhow::bail!("unsupported backend url scheme in `{}`", config.url)
    }
}
