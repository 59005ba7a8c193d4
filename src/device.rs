//! Device-side alert effects: vibration, wake lock, staff notifications.
//!
//! The [`DevicePlatform`] trait models whatever hardware or service the
//! daemon can reach. Capabilities are probed up front; an unsupported
//! operation is skipped silently (with a debug log), a supported one that
//! fails is logged and absorbed. Nothing in this module ever returns an
//! error to alert orchestration, and one channel failing must not stop the
//! others.
//!
//! Shipped platforms: [`WebhookPlatform`] forwards notifications to a
//! configurable staff webhook and reports no vibration or wake-lock
//! support; [`NullPlatform`] supports nothing and is the default when no
//! webhook is configured.

use anyhow::Result;
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing as log;

/// Wake locks are dropped after this long no matter what, so a missed
/// release can never pin the device awake indefinitely.
const WAKE_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// One staff-facing notification.
#[derive(Debug, Clone, Serialize)]
pub struct StaffNotification {
    pub title: String,
    pub body: String,
    /// Stable replacement key: re-notifying the same tag updates in place.
    pub tag: String,
    /// Ask the receiving side to keep the notification up until
    /// acknowledged.
    pub require_interaction: bool,
}

/// Raw platform operations plus their capability probes.
#[async_trait]
pub trait DevicePlatform: Send + Sync {
    fn has_vibration(&self) -> bool;
    fn has_wake_lock(&self) -> bool;
    fn has_notifications(&self) -> bool;

    /// Buzz with alternating on/off durations; an empty pattern cancels
    /// any ongoing vibration.
    async fn vibrate(&self, pattern_ms: &[u64]) -> Result<()>;

    async fn hold_wake_lock(&self) -> Result<()>;
    async fn drop_wake_lock(&self) -> Result<()>;

    async fn show_notification(&self, notification: &StaffNotification) -> Result<()>;
}

/// Error- and capability-absorbing front of a [`DevicePlatform`].
pub struct DeviceAlerts {
    platform: Arc<dyn DevicePlatform>,
    wake_lock_held: AtomicBool,
    release_timer: Mutex<Option<AbortHandle>>,
}

impl DeviceAlerts {
    pub fn new(platform: Arc<dyn DevicePlatform>) -> Arc<Self> {
        Arc::new(DeviceAlerts {
            platform,
            wake_lock_held: AtomicBool::new(false),
            release_timer: Mutex::new(None),
        })
    }

    pub async fn vibrate(&self, pattern_ms: &[u64]) {
        if !self.platform.has_vibration() {
            log::debug!("vibration unsupported, skipping");
            return;
        }
        if let Err(err) = self.platform.vibrate(pattern_ms).await {
            log::warn!("vibration failed: {err:#}");
        }
    }

    pub async fn stop_vibration(&self) {
        self.vibrate(&[]).await;
    }

    /// Hold the wake lock, (re)starting the auto-release timer.
    pub async fn acquire_wake_lock(self: &Arc<Self>) {
        if !self.platform.has_wake_lock() {
            log::debug!("wake lock unsupported, skipping");
            return;
        }
        if let Err(err) = self.platform.hold_wake_lock().await {
            log::warn!("failed to acquire wake lock: {err:#}");
            return;
        }
        self.wake_lock_held.store(true, Ordering::SeqCst);

        let this = Arc::clone(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(WAKE_LOCK_TIMEOUT).await;
            log::debug!("wake lock timed out");
            this.release_wake_lock().await;
        })
        .abort_handle();
        let mut slot = self.release_timer.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = slot.replace(timer) {
            old.abort();
        }
    }

    /// Drop the wake lock. Idempotent; a release without a hold is a no-op.
    pub async fn release_wake_lock(&self) {
        if !self.wake_lock_held.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(timer) = self
            .release_timer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            timer.abort();
        }
        if let Err(err) = self.platform.drop_wake_lock().await {
            log::warn!("failed to release wake lock: {err:#}");
        }
    }

    pub fn holds_wake_lock(&self) -> bool {
        self.wake_lock_held.load(Ordering::SeqCst)
    }

    pub async fn notify(&self, notification: &StaffNotification) {
        if !self.platform.has_notifications() {
            log::debug!("staff notifications unsupported, skipping");
            return;
        }
        if let Err(err) = self.platform.show_notification(notification).await {
            log::warn!("staff notification failed: {err:#}");
        }
    }
}

/// A platform with nothing attached. Every capability probe says no.
pub struct NullPlatform;

#[async_trait]
impl DevicePlatform for NullPlatform {
    fn has_vibration(&self) -> bool {
        false
    }
    fn has_wake_lock(&self) -> bool {
        false
    }
    fn has_notifications(&self) -> bool {
        false
    }
    async fn vibrate(&self, _pattern_ms: &[u64]) -> Result<()> {
        Ok(())
    }
    async fn hold_wake_lock(&self) -> Result<()> {
        Ok(())
    }
    async fn drop_wake_lock(&self) -> Result<()> {
        Ok(())
    }
    async fn show_notification(&self, _notification: &StaffNotification) -> Result<()> {
        Ok(())
    }
}

const PERMISSION_UNKNOWN: u8 = 0;
const PERMISSION_GRANTED: u8 = 1;
const PERMISSION_DENIED: u8 = 2;

/// Forwards staff notifications to an HTTP webhook.
///
/// Permission is resolved lazily by the first delivery: a 4xx answer means
/// the receiver refuses us and we stop asking for good; transient failures
/// leave the question open for the next notification.
pub struct WebhookPlatform {
    http: reqwest::Client,
    url: String,
    token: Option<SecretString>,
    permission: AtomicU8,
}

impl WebhookPlatform {
    pub fn new(url: String, token: Option<SecretString>) -> WebhookPlatform {
        // A hung webhook must not stall the alert worker.
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build webhook http client");
        WebhookPlatform {
            http,
            url,
            token,
            permission: AtomicU8::new(PERMISSION_UNKNOWN),
        }
    }
}

#[async_trait]
impl DevicePlatform for WebhookPlatform {
    fn has_vibration(&self) -> bool {
        false
    }
    fn has_wake_lock(&self) -> bool {
        false
    }
    fn has_notifications(&self) -> bool {
        true
    }

    async fn vibrate(&self, _pattern_ms: &[u64]) -> Result<()> {
        Ok(())
    }
    async fn hold_wake_lock(&self) -> Result<()> {
        Ok(())
    }
    async fn drop_wake_lock(&self) -> Result<()> {
        Ok(())
    }

    async fn show_notification(&self, notification: &StaffNotification) -> Result<()> {
        if self.permission.load(Ordering::SeqCst) == PERMISSION_DENIED {
            log::debug!("webhook refused us before, skipping notification");
            return Ok(());
        }

        let mut request = self.http.post(&self.url).json(notification);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose_secret());
        }
        let response = request.send().await?;
        let status = response.status();

        if status.is_success() {
            if self
                .permission
                .compare_exchange(
                    PERMISSION_UNKNOWN,
                    PERMISSION_GRANTED,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                log::info!("staff webhook accepted us");
            }
            return Ok(());
        }
        if status.is_client_error() {
            self.permission.store(PERMISSION_DENIED, Ordering::SeqCst);
            anyhow::bail!("webhook rejected notification with {status}, not asking again");
        }
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("webhook delivery failed: {status}: {body}")
    }
}
