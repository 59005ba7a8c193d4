//! Scheduled background work.
//!
//! One job so far: order reconciliation. The realtime feed is the primary
//! alert path, but a websocket outage silently drops whatever happened
//! while it was down. Every cadence tick we fetch orders created after the
//! watermark and push them through the same router path a realtime insert
//! would take; the watermark advances on both paths, so an order alerted
//! live is not alerted again here. The tick also refreshes settings from
//! the backend, picking up edits made elsewhere.

use crate::notifications::NotificationType;
use crate::orders::OrderChange;
use crate::router::{OrderRouter, Watermark};
use crate::settings::SettingsStore;
use crate::store::Store;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing as log;

pub const RECONCILIATION_CADENCE_IN_SECS: u64 = 30;

/// Run the reconciliation loop until cancelled. The first pass happens one
/// cadence after startup; the watermark starts at process start, so there
/// is nothing to catch up on earlier than that anyway.
pub async fn run_reconciliation(
    store: Arc<dyn Store>,
    router: Arc<OrderRouter>,
    watermark: Arc<Watermark>,
    settings: Arc<SettingsStore>,
    cancel: CancellationToken,
) {
    let mut ticker =
        tokio::time::interval(Duration::from_secs(RECONCILIATION_CADENCE_IN_SECS));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.reset();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                settings.refresh().await;
                if let Err(err) = reconcile_once(&store, &router, &watermark).await {
                    log::warn!("order reconciliation failed: {err:#}");
                }
            }
        }
    }
    log::debug!("reconciliation job stopped");
}

/// One reconciliation pass, also the `sync-once` subcommand.
pub async fn reconcile_once(
    store: &Arc<dyn Store>,
    router: &OrderRouter,
    watermark: &Watermark,
) -> Result<()> {
    let cutoff = watermark.get();
    let orders = store.orders_created_since(cutoff).await?;
    if orders.is_empty() {
        return Ok(());
    }
    log::info!(
        "reconciling {} order(s) created since {cutoff}",
        orders.len()
    );
    for order in orders {
        // The realtime pump may have alerted this one while we were
        // fetching; the watermark knows.
        if order.created_at <= watermark.get() {
            continue;
        }
        // Manual passes can reach back past the watermark; never alert an
        // order that already has its record.
        if store
            .notification_exists(order.id, NotificationType::OrderCreated)
            .await?
        {
            watermark.advance(order.created_at);
            continue;
        }
        router.process(&OrderChange::Inserted(order)).await;
    }
    Ok(())
}
