//! Order alerts for the flower shop back office.
//!
//! The daemon watches the shop backend's order table over a realtime feed,
//! classifies every change, writes a notification record per event, and
//! turns qualifying records into a counter-side phone ring with vibration,
//! staff notification, and a bounded wake lock. A small HTTP API serves
//! the bell popover, the settings panel, and the ring controls.
//!
//! Event flow, one subscriber per stage:
//!
//! ```text
//! backend realtime ─→ store (broadcast) ─→ router ─→ records ─→ phone alerts
//!                                                      ↑
//!                                    reconciliation job (missed creations)
//! ```

pub mod config;
pub mod device;
pub mod jobs;
pub mod logger;
pub mod notifications;
pub mod orders;
pub mod phone;
pub mod ring;
pub mod router;
pub mod server;
pub mod settings;
pub mod store;

use crate::device::{DeviceAlerts, DevicePlatform};
use crate::notifications::NotificationService;
use crate::phone::PhoneAlerts;
use crate::ring::pattern::RingEngine;
use crate::ring::tone::ToneSink;
use crate::router::{OrderRouter, Watermark};
use crate::settings::SettingsStore;
use crate::store::Store;
use globset::GlobSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Everything the daemon runs on, wired together once at startup (and by
/// the test harness, with recording stand-ins).
pub struct Services {
    pub store: Arc<dyn Store>,
    pub settings: Arc<SettingsStore>,
    pub notifications: Arc<NotificationService>,
    pub engine: Arc<RingEngine>,
    pub device: Arc<DeviceAlerts>,
    pub phone: Arc<PhoneAlerts>,
    pub router: Arc<OrderRouter>,
    pub watermark: Arc<Watermark>,
}

impl Services {
    pub fn build(
        store: Arc<dyn Store>,
        sink: Arc<dyn ToneSink>,
        platform: Arc<dyn DevicePlatform>,
        settings_path: PathBuf,
        staff_views: GlobSet,
    ) -> Services {
        let settings = SettingsStore::new(Arc::clone(&store), settings_path);
        let notifications = NotificationService::new(Arc::clone(&store), Arc::clone(&settings));
        let engine = Arc::new(RingEngine::new(sink));
        let device = DeviceAlerts::new(platform);
        let phone = PhoneAlerts::new(
            Arc::clone(&engine),
            Arc::clone(&device),
            Arc::clone(&settings),
            Arc::clone(&notifications),
            staff_views,
        );
        let watermark = Watermark::starting_now();
        let router = OrderRouter::new(Arc::clone(&notifications), Arc::clone(&watermark));
        Services {
            store,
            settings,
            notifications,
            engine,
            device,
            phone,
            router,
            watermark,
        }
    }

    /// Spawn the long-running pieces: the realtime connection, the insert
    /// delivery pump, the order router, the alert worker, and the
    /// reconciliation job. Each stream gets exactly one consumer here.
    pub fn start(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();

        let store = Arc::clone(&self.store);
        let realtime_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            store.run_realtime(realtime_cancel).await;
        }));

        tasks.push(tokio::spawn(
            Arc::clone(&self.notifications).deliver_inserts(cancel.clone()),
        ));

        tasks.push(tokio::spawn(Arc::clone(&self.router).run(
            Arc::clone(&self.store),
            cancel.clone(),
        )));

        self.phone.start();

        tasks.push(tokio::spawn(jobs::run_reconciliation(
            Arc::clone(&self.store),
            Arc::clone(&self.router),
            Arc::clone(&self.watermark),
            Arc::clone(&self.settings),
            cancel.clone(),
        )));

        tasks
    }
}
