//! The alert orchestrator: decides what each new notification record does
//! at the counter.
//!
//! One listener registration ("phone-alerts") feeds a bounded queue; one
//! worker task drains it. Qualifying records (new orders, completed
//! payments) start the continuous phone ring plus vibration, staff
//! notification, and a bounded wake lock, each behind its own settings
//! flag and none blocking the others. Everything else gets at most a
//! short chime, and never while the phone ring is active.
//!
//! Delivery from the store is at-least-once, so records are de-duplicated
//! here by id before any side effect fires.

use crate::device::{DeviceAlerts, StaffNotification};
use crate::notifications::{NotificationRecord, NotificationService, NotificationType};
use crate::ring::pattern::{PatternOpts, RingEngine, RingStatus};
use crate::ring::{alert_sound, RingPattern, ToneSpec};
use crate::settings::{Settings, SettingsStore};
use anyhow::{Context as _, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing as log;
use uuid::Uuid;

const LISTENER_ID: &str = "phone-alerts";
/// Pending alerts before the queue sheds load.
const QUEUE_CAPACITY: usize = 64;
/// Record ids remembered for de-duplication.
const RECENT_IDS: usize = 64;
/// Buzz cadence for qualifying alerts, on/off milliseconds.
const RING_VIBRATION_MS: &[u64] = &[200, 100, 200];

/// Routes the shop staff works in; everything else is customer-facing and
/// must stay silent.
pub const DEFAULT_STAFF_VIEWS: &[&str] = &["/admin*", "/orders*", "/dashboard*"];

/// Build the staff-view matcher from glob patterns.
pub fn staff_view_set(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("bad view glob `{pattern}`"))?);
    }
    builder.build().context("failed to build staff view set")
}

pub struct PhoneAlerts {
    engine: Arc<RingEngine>,
    device: Arc<DeviceAlerts>,
    settings: Arc<SettingsStore>,
    notifications: Arc<NotificationService>,
    staff_views: GlobSet,
    active_view: Mutex<String>,
    recent: Mutex<VecDeque<Uuid>>,
    queue_tx: mpsc::Sender<NotificationRecord>,
    queue_rx: Mutex<Option<mpsc::Receiver<NotificationRecord>>>,
    cancel: CancellationToken,
}

impl PhoneAlerts {
    pub fn new(
        engine: Arc<RingEngine>,
        device: Arc<DeviceAlerts>,
        settings: Arc<SettingsStore>,
        notifications: Arc<NotificationService>,
        staff_views: GlobSet,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_CAPACITY);
        Arc::new(PhoneAlerts {
            engine,
            device,
            settings,
            notifications,
            staff_views,
            active_view: Mutex::new("/admin".to_string()),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_IDS)),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            cancel: CancellationToken::new(),
        })
    }

    /// Register the listener and spawn the worker. Call once.
    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        self.notifications.subscribe(LISTENER_ID, move |record| {
            if this.queue_tx.try_send(record.clone()).is_err() {
                log::warn!("alert queue full, dropping notification {}", record.id);
            }
        });

        let this = Arc::clone(self);
        tokio::spawn(async move { this.worker_loop().await });
    }

    async fn worker_loop(&self) {
        let Some(mut queue) = self
            .queue_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            log::error!("alert worker started twice");
            return;
        };
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = queue.recv() => match next {
                    Some(record) => self.handle_record(&record).await,
                    None => break,
                },
            }
        }
        log::debug!("alert worker stopped");
    }

    /// Unregister, stop the worker, and silence everything.
    pub async fn shutdown(&self) {
        self.notifications.unsubscribe(LISTENER_ID);
        self.cancel.cancel();
        self.stop_ringing().await;
    }

    async fn handle_record(&self, record: &NotificationRecord) {
        if !self.remember(record.id) {
            log::debug!("duplicate delivery of notification {}, ignoring", record.id);
            return;
        }
        if !self.view_is_staff() {
            log::debug!(
                "customer-facing view active, staying silent for {}",
                record.notification_type
            );
            return;
        }
        let settings = self.settings.get();
        if !settings.enabled {
            log::debug!("alerts disabled, skipping {}", record.notification_type);
            return;
        }

        let qualifying = matches!(
            record.notification_type,
            NotificationType::OrderCreated | NotificationType::PaymentCompleted
        );
        if qualifying {
            self.ring_for(record, &settings).await;
        } else {
            self.chime_for(record, &settings);
        }
    }

    /// Full phone alert: continuous ring plus the side channels, each one
    /// behind its own flag and absorbed on failure.
    async fn ring_for(&self, record: &NotificationRecord, settings: &Settings) {
        if settings.sound_enabled {
            let status = self.engine.status();
            if status.ringing && status.pattern == Some(RingPattern::Continuous) {
                // Already demanding acknowledgement; one session covers
                // every unread order. A chime, though, gets preempted.
                log::debug!("phone already ringing, keeping the session");
            } else {
                let (_, table_tone) = alert_sound(record.notification_type);
                let tone = ToneSpec {
                    duration_secs: settings.ring_duration as f32,
                    ..table_tone
                };
                self.engine
                    .start(RingPattern::Continuous, tone, PatternOpts::default());
            }
        }
        if settings.vibration_enabled {
            self.device.vibrate(RING_VIBRATION_MS).await;
        }
        self.device.acquire_wake_lock().await;
        if settings.browser_notification_enabled {
            let type_config = settings.type_settings(record.notification_type);
            self.device
                .notify(&StaffNotification {
                    title: notification_title(record.notification_type).to_string(),
                    body: record.message.clone(),
                    tag: record
                        .order_id
                        .map(|id| format!("order-{id}"))
                        .unwrap_or_else(|| format!("notification-{}", record.id)),
                    require_interaction: type_config.persistent_notification,
                })
                .await;
        }
    }

    /// Short per-type chime for the rest, unless the phone is ringing.
    fn chime_for(&self, record: &NotificationRecord, settings: &Settings) {
        let type_config = settings.type_settings(record.notification_type);
        if !settings.sound_enabled || !type_config.sound_enabled {
            log::debug!("sound off for {}, no chime", record.notification_type);
            return;
        }
        if self.engine.is_ringing() {
            log::debug!(
                "phone ring active, skipping {} chime",
                record.notification_type
            );
            return;
        }
        let (pattern, tone) = alert_sound(record.notification_type);
        self.engine.start(
            pattern,
            tone,
            PatternOpts {
                interval_secs: settings.ring_interval as f32,
                max_repeats: settings.max_rings,
            },
        );
    }

    /// Silence the ring, the vibration, and the wake lock. Safe when idle.
    pub async fn stop_ringing(&self) {
        self.engine.stop();
        self.device.stop_vibration().await;
        self.device.release_wake_lock().await;
    }

    /// Stop ringing once nothing is unread. Does nothing when the count
    /// cannot be read, so a backend hiccup never silences a live alert.
    pub async fn stop_if_all_read(&self) {
        match self.notifications.try_count_unread().await {
            Ok(0) => {
                log::debug!("no unread notifications left, stopping ring");
                self.stop_ringing().await;
            }
            Ok(_) => {}
            Err(err) => log::warn!("could not check unread count: {err:#}"),
        }
    }

    pub fn is_ringing(&self) -> bool {
        self.engine.is_ringing()
    }

    pub fn ring_count(&self) -> u32 {
        self.engine.ring_count()
    }

    pub fn ring_status(&self) -> RingStatus {
        self.engine.status()
    }

    pub fn active_view(&self) -> String {
        self.active_view
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Record the route the UI currently shows.
    pub fn set_active_view(&self, route: impl Into<String>) {
        let route = route.into();
        log::debug!("active view now `{route}`");
        *self.active_view.lock().unwrap_or_else(|e| e.into_inner()) = route;
    }

    fn view_is_staff(&self) -> bool {
        let view = self.active_view.lock().unwrap_or_else(|e| e.into_inner());
        self.staff_views.is_match(view.as_str())
    }

    /// True when the id is new; remembers it for later duplicates.
    fn remember(&self, id: Uuid) -> bool {
        let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        if recent.contains(&id) {
            return false;
        }
        if recent.len() == RECENT_IDS {
            recent.pop_front();
        }
        recent.push_back(id);
        true
    }
}

fn notification_title(ty: NotificationType) -> &'static str {
    match ty {
        NotificationType::OrderCreated => "New Order",
        NotificationType::OrderPaid => "Order Paid",
        NotificationType::OrderUpdated => "Order Updated",
        NotificationType::OrderCancelled => "Order Cancelled",
        NotificationType::PaymentFailed => "Payment Failed",
        NotificationType::PaymentCompleted => "Payment Completed",
    }
}
