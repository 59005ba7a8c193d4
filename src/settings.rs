//! Alert settings: one shared document controlling every alert channel.
//!
//! The in-memory copy inside [`SettingsStore`] is authoritative for the
//! running process. Updates land there first and are then persisted on a
//! best-effort basis: backend if reachable, local JSON file otherwise. A
//! persistence failure is logged and never rolls back the in-memory state,
//! so the UI always observes what it just saved.

use crate::notifications::NotificationType;
use crate::store::Store;
use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tracing as log;

/// Key of the settings row in the backend `settings` table.
pub const SETTINGS_KEY: &str = "phoneNotificationSettings";

/// Per-notification-type knobs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TypeSettings {
    /// Master switch for the type: disabled types produce no record and no
    /// alert at all.
    pub enabled: bool,
    /// 1 (lowest) to 5 (highest); stamped onto records at creation.
    pub priority: u8,
    pub sound_enabled: bool,
    /// Whether the staff-notification channel should ask for a
    /// non-dismissing notification.
    pub persistent_notification: bool,
}

impl Default for TypeSettings {
    fn default() -> Self {
        TypeSettings {
            enabled: true,
            priority: 3,
            sound_enabled: true,
            persistent_notification: false,
        }
    }
}

impl TypeSettings {
    /// Pin the priority to the 1..=5 scale records are stamped with.
    fn clamped(mut self) -> TypeSettings {
        self.priority = self.priority.clamp(1, 5);
        self
    }
}

/// The whole settings document, camelCase on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Global kill switch for the alert pipeline.
    pub enabled: bool,
    /// Gate for everything audible (ring and chimes alike).
    pub sound_enabled: bool,
    /// Continuous ring length for qualifying events, in seconds.
    pub ring_duration: u32,
    /// Pause between chime repeats, in seconds.
    pub ring_interval: u32,
    /// Total plays of a repeating chime.
    pub max_rings: u32,
    pub vibration_enabled: bool,
    pub browser_notification_enabled: bool,
    /// Number the shop wants urgent-alert texts sent to. Stored and shown
    /// in the settings panel; this daemon does not dial it.
    pub phone_number: Option<String>,
    pub custom_notification_sound: bool,
    pub notification_sound_url: Option<String>,
    pub notification_sound_name: Option<String>,
    pub notification_types: HashMap<NotificationType, TypeSettings>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            enabled: true,
            sound_enabled: true,
            ring_duration: 3,
            ring_interval: 2,
            max_rings: 10,
            vibration_enabled: true,
            browser_notification_enabled: true,
            phone_number: None,
            custom_notification_sound: false,
            notification_sound_url: None,
            notification_sound_name: None,
            notification_types: default_type_settings(),
        }
    }
}

fn default_type_settings() -> HashMap<NotificationType, TypeSettings> {
    fn entry(priority: u8, persistent_notification: bool) -> TypeSettings {
        TypeSettings {
            enabled: true,
            priority,
            sound_enabled: true,
            persistent_notification,
        }
    }
    HashMap::from([
        (NotificationType::OrderCreated, entry(5, true)),
        (NotificationType::OrderPaid, entry(4, false)),
        (NotificationType::OrderUpdated, entry(2, false)),
        (NotificationType::OrderCancelled, entry(3, false)),
        (NotificationType::PaymentFailed, entry(4, true)),
        (NotificationType::PaymentCompleted, entry(4, false)),
    ])
}

impl Settings {
    /// Per-type settings, falling back to [`TypeSettings::default`] for a
    /// type missing from the map (e.g. settings saved by an older build).
    pub fn type_settings(&self, ty: NotificationType) -> TypeSettings {
        self.notification_types.get(&ty).copied().unwrap_or_default()
    }

    /// Repair a stored document: types an older build's map lacks get
    /// their table defaults (not the generic fallback), and every
    /// priority is pinned to the 1..=5 scale.
    fn normalized(mut self) -> Settings {
        for cfg in self.notification_types.values_mut() {
            *cfg = cfg.clamped();
        }
        for (ty, cfg) in default_type_settings() {
            self.notification_types.entry(ty).or_insert(cfg);
        }
        self
    }
}

/// Partial update: absent fields keep their current value. Types present in
/// `notification_types` are replaced per key, absent types are untouched.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SettingsPatch {
    pub enabled: Option<bool>,
    pub sound_enabled: Option<bool>,
    pub ring_duration: Option<u32>,
    pub ring_interval: Option<u32>,
    pub max_rings: Option<u32>,
    pub vibration_enabled: Option<bool>,
    pub browser_notification_enabled: Option<bool>,
    /// Empty string clears the stored number.
    pub phone_number: Option<String>,
    pub custom_notification_sound: Option<bool>,
    pub notification_sound_url: Option<String>,
    pub notification_sound_name: Option<String>,
    pub notification_types: Option<HashMap<NotificationType, TypeSettings>>,
}

impl SettingsPatch {
    fn apply(self, settings: &mut Settings) {
        if let Some(v) = self.enabled {
            settings.enabled = v;
        }
        if let Some(v) = self.sound_enabled {
            settings.sound_enabled = v;
        }
        if let Some(v) = self.ring_duration {
            settings.ring_duration = v;
        }
        if let Some(v) = self.ring_interval {
            settings.ring_interval = v;
        }
        if let Some(v) = self.max_rings {
            settings.max_rings = v;
        }
        if let Some(v) = self.vibration_enabled {
            settings.vibration_enabled = v;
        }
        if let Some(v) = self.browser_notification_enabled {
            settings.browser_notification_enabled = v;
        }
        if let Some(v) = self.phone_number {
            settings.phone_number = (!v.is_empty()).then_some(v);
        }
        if let Some(v) = self.custom_notification_sound {
            settings.custom_notification_sound = v;
        }
        if let Some(v) = self.notification_sound_url {
            settings.notification_sound_url = (!v.is_empty()).then_some(v);
        }
        if let Some(v) = self.notification_sound_name {
            settings.notification_sound_name = (!v.is_empty()).then_some(v);
        }
        if let Some(types) = self.notification_types {
            for (ty, cfg) in types {
                settings.notification_types.insert(ty, cfg.clamped());
            }
        }
    }
}

/// Where the current settings were loaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingsSource {
    Backend,
    LocalFile,
    Defaults,
}

impl fmt::Display for SettingsSource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            SettingsSource::Backend => "backend",
            SettingsSource::LocalFile => "local file",
            SettingsSource::Defaults => "defaults",
        })
    }
}

struct Inner {
    settings: Settings,
    source: SettingsSource,
}

/// Process-wide settings holder.
pub struct SettingsStore {
    store: Arc<dyn Store>,
    /// Local fallback copy, e.g. `orderbell-settings.json`.
    path: PathBuf,
    inner: RwLock<Inner>,
}

impl SettingsStore {
    pub fn new(store: Arc<dyn Store>, path: PathBuf) -> Arc<Self> {
        Arc::new(SettingsStore {
            store,
            path,
            inner: RwLock::new(Inner {
                settings: Settings::default(),
                source: SettingsSource::Defaults,
            }),
        })
    }

    /// Populate from the first source that answers: backend, then the local
    /// file, then built-in defaults. Called once at startup and again by the
    /// reconciliation job.
    pub async fn load(&self) {
        let (settings, source) = match self.store.load_settings().await {
            Ok(Some(settings)) => (settings, SettingsSource::Backend),
            Ok(None) => {
                log::info!("no settings stored in backend yet");
                self.load_local()
            }
            Err(err) => {
                log::warn!("failed to load settings from backend: {err:?}");
                self.load_local()
            }
        };
        log::info!("alert settings loaded from {source}");
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.settings = settings.normalized();
        inner.source = source;
    }

    fn load_local(&self) -> (Settings, SettingsSource) {
        match self.read_local() {
            Ok(Some(settings)) => (settings, SettingsSource::LocalFile),
            Ok(None) => (Settings::default(), SettingsSource::Defaults),
            Err(err) => {
                log::warn!(
                    "failed to read settings file {}: {err:?}",
                    self.path.display()
                );
                (Settings::default(), SettingsSource::Defaults)
            }
        }
    }

    fn read_local(&self) -> Result<Option<Settings>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let settings = serde_json::from_str(&raw)
            .with_context(|| format!("malformed settings file {}", self.path.display()))?;
        Ok(Some(settings))
    }

    fn write_local(&self, settings: &Settings) -> Result<()> {
        let raw = serde_json::to_string_pretty(settings)?;
        std::fs::write(&self.path, raw)
            .with_context(|| format!("failed to write {}", self.path.display()))
    }

    /// Pull the backend copy if there is one, picking up edits made by
    /// other processes. Unlike [`SettingsStore::load`] this never falls
    /// back: when the backend is unreachable the current state stands.
    pub async fn refresh(&self) {
        match self.store.load_settings().await {
            Ok(Some(settings)) => {
                let settings = settings.normalized();
                let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
                if inner.settings != settings {
                    log::info!("settings updated from backend");
                }
                inner.settings = settings;
                inner.source = SettingsSource::Backend;
            }
            Ok(None) => {}
            Err(err) => log::debug!("settings refresh skipped: {err:#}"),
        }
    }

    /// Current settings snapshot.
    pub fn get(&self) -> Settings {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .settings
            .clone()
    }

    pub fn source(&self) -> SettingsSource {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).source
    }

    pub fn type_settings(&self, ty: NotificationType) -> TypeSettings {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .settings
            .type_settings(ty)
    }

    /// Merge a patch into memory, then persist best-effort. The merged
    /// document is returned and is what subsequent alerts will use, whether
    /// or not persistence succeeded.
    pub async fn update(&self, patch: SettingsPatch) -> Settings {
        let merged = {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            patch.apply(&mut inner.settings);
            inner.settings.clone()
        };

        match self.store.save_settings(&merged).await {
            Ok(()) => log::debug!("settings saved to backend"),
            Err(err) => {
                log::warn!("failed to save settings to backend: {err:?}");
                match self.write_local(&merged) {
                    Ok(()) => log::info!(
                        "settings saved to fallback file {}",
                        self.path.display()
                    ),
                    Err(err) => log::error!("failed to save settings locally: {err:?}"),
                }
            }
        }
        merged
    }
}
