//! Store backed by the shop's hosted backend.
//!
//! Reads and writes go through the backend's PostgREST-style REST surface
//! (`/rest/v1/<table>?<filters>` with `apikey` + bearer auth). Realtime
//! changes arrive over a phoenix-channel websocket: we join one channel
//! subscribed to `orders` (all events) and `order_notifications` (inserts),
//! answer with heartbeats, and feed decoded rows into the broadcast
//! channels. The websocket loop reconnects forever with jittered backoff;
//! REST calls fail individually and let callers decide.

use super::{Store, REALTIME_CHANNEL_CAPACITY};
use crate::config::BackendConfig;
use crate::notifications::{NewNotification, NotificationRecord, NotificationType};
use crate::orders::{Order, OrderChange};
use crate::settings::{Settings, SETTINGS_KEY};
use anyhow::{Context as _, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::{SinkExt, StreamExt};
use rand::Rng;
use reqwest::header::CONTENT_RANGE;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing as log;
use url::Url;
use uuid::Uuid;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);
/// Channel topic for our postgres-changes subscription.
const REALTIME_TOPIC: &str = "realtime:orderbell";

pub struct HostedStore {
    http: reqwest::Client,
    /// Backend origin without a trailing slash.
    base_url: String,
    realtime_url: String,
    api_key: SecretString,
    order_tx: broadcast::Sender<OrderChange>,
    notification_tx: broadcast::Sender<NotificationRecord>,
}

impl HostedStore {
    pub fn new(config: &BackendConfig) -> Result<Arc<Self>> {
        let parsed = Url::parse(&config.url).context("invalid backend url")?;
        let base_url = config.url.trim_end_matches('/').to_string();
        let realtime_url = realtime_endpoint(&base_url, config.api_key.expose_secret())?;
        log::info!(
            "hosted backend at {}",
            parsed.host_str().unwrap_or("<unknown host>")
        );
        let (order_tx, _) = broadcast::channel(REALTIME_CHANNEL_CAPACITY);
        let (notification_tx, _) = broadcast::channel(REALTIME_CHANNEL_CAPACITY);
        Ok(Arc::new(HostedStore {
            http: reqwest::Client::new(),
            base_url,
            realtime_url,
            api_key: config.api_key.clone(),
            order_tx,
            notification_tx,
        }))
    }

    fn rest(&self, path_and_query: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, path_and_query)
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let key = self.api_key.expose_secret();
        builder
            .header("apikey", key)
            .header(reqwest::header::AUTHORIZATION, format!("Bearer {key}"))
    }

    async fn expect_success(
        response: reqwest::Response,
        what: &'static str,
    ) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("{what} failed: {status}: {body}")
    }

    /// One websocket session: connect, join, pump until the server goes
    /// away or we are cancelled.
    async fn connect_and_pump(&self, cancel: &CancellationToken) -> Result<()> {
        let (ws, _) = tokio_tungstenite::connect_async(self.realtime_url.as_str())
            .await
            .context("realtime connect failed")?;
        log::info!("realtime channel connected");
        let (mut sink, mut stream) = ws.split();

        let mut next_ref: u64 = 1;
        let join = outgoing_frame(
            REALTIME_TOPIC,
            "phx_join",
            serde_json::json!({
                "config": {
                    "postgres_changes": [
                        { "event": "*", "schema": "public", "table": "orders" },
                        { "event": "INSERT", "schema": "public", "table": "order_notifications" },
                    ]
                }
            }),
            &mut next_ref,
        );
        sink.send(Message::text(join)).await.context("join frame")?;

        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.reset();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(());
                }
                _ = heartbeat.tick() => {
                    let frame = outgoing_frame(
                        "phoenix",
                        "heartbeat",
                        serde_json::json!({}),
                        &mut next_ref,
                    );
                    sink.send(Message::text(frame)).await.context("heartbeat")?;
                }
                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => self.handle_frame(&text),
                    Some(Ok(Message::Ping(payload))) => {
                        sink.send(Message::Pong(payload)).await.context("pong")?;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("realtime channel closed by server");
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return Err(err).context("realtime stream error"),
                },
            }
        }
    }

    fn handle_frame(&self, raw: &str) {
        let frame: IncomingFrame = match serde_json::from_str(raw) {
            Ok(frame) => frame,
            Err(err) => {
                log::warn!("undecodable realtime frame: {err}");
                return;
            }
        };
        match frame.event.as_str() {
            "postgres_changes" => {
                let Some(data) = frame.payload.get("data") else {
                    log::warn!("postgres_changes frame without data");
                    return;
                };
                match deserialize_payload::<ChangeData>(data) {
                    Ok(change) => self.route_change(change),
                    Err(err) => log::warn!("undecodable postgres change: {err:#}"),
                }
            }
            "phx_reply" | "presence_state" | "system" => {
                log::trace!("realtime {} on {}", frame.event, frame.topic);
            }
            other => log::trace!("ignoring realtime event `{other}`"),
        }
    }

    fn route_change(&self, change: ChangeData) {
        match change.table.as_str() {
            "orders" => match decode_order_change(change) {
                Ok(Some(order_change)) => {
                    let _ = self.order_tx.send(order_change);
                }
                Ok(None) => {}
                Err(err) => log::warn!("dropping undecodable order change: {err:#}"),
            },
            "order_notifications" => {
                if change.kind != ChangeKind::Insert {
                    return;
                }
                match deserialize_payload::<NotificationRecord>(&change.record) {
                    Ok(record) => {
                        let _ = self.notification_tx.send(record);
                    }
                    Err(err) => log::warn!("dropping undecodable notification row: {err:#}"),
                }
            }
            other => log::debug!("change on unwatched table `{other}`"),
        }
    }
}

#[async_trait]
impl Store for HostedStore {
    async fn insert_notification(&self, new: &NewNotification) -> Result<NotificationRecord> {
        let response = self
            .authed(self.http.post(self.rest("order_notifications")))
            .header("Prefer", "return=representation")
            .json(new)
            .send()
            .await
            .context("backend unreachable")?;
        let response = Self::expect_success(response, "notification insert").await?;
        let rows: Vec<NotificationRecord> = response.json().await.context("insert response")?;
        rows.into_iter()
            .next()
            .context("backend returned no inserted row")
    }

    async fn list_notifications(&self, unread_only: bool) -> Result<Vec<NotificationRecord>> {
        let mut query = String::from("order_notifications?select=*&order=created_at.desc");
        if unread_only {
            query.push_str("&is_read=eq.false");
        }
        let response = self
            .authed(self.http.get(self.rest(&query)))
            .send()
            .await
            .context("backend unreachable")?;
        let response = Self::expect_success(response, "notification list").await?;
        response.json().await.context("list response")
    }

    async fn count_unread(&self) -> Result<i64> {
        let response = self
            .authed(
                self.http
                    .get(self.rest("order_notifications?select=id&is_read=eq.false&limit=1")),
            )
            .header("Prefer", "count=exact")
            .send()
            .await
            .context("backend unreachable")?;
        let response = Self::expect_success(response, "unread count").await?;
        let range = response
            .headers()
            .get(CONTENT_RANGE)
            .context("count response missing content-range")?
            .to_str()
            .context("content-range not ascii")?;
        parse_total_count(range)
    }

    async fn mark_notification_read(&self, id: Uuid) -> Result<()> {
        // Filtering on is_read makes the write idempotent: a re-mark
        // matches zero rows and read_at keeps its first value.
        let query = format!("order_notifications?id=eq.{id}&is_read=eq.false");
        let response = self
            .authed(self.http.patch(self.rest(&query)))
            .header("Prefer", "return=minimal")
            .json(&serde_json::json!({
                "is_read": true,
                "read_at": Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            }))
            .send()
            .await
            .context("backend unreachable")?;
        Self::expect_success(response, "mark read").await?;
        Ok(())
    }

    async fn mark_all_notifications_read(&self) -> Result<u64> {
        let response = self
            .authed(
                self.http
                    .patch(self.rest("order_notifications?is_read=eq.false")),
            )
            .header("Prefer", "return=representation")
            .json(&serde_json::json!({
                "is_read": true,
                "read_at": Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            }))
            .send()
            .await
            .context("backend unreachable")?;
        let response = Self::expect_success(response, "mark all read").await?;
        let rows: Vec<serde_json::Value> = response.json().await.context("mark-all response")?;
        Ok(rows.len() as u64)
    }

    async fn delete_notification(&self, id: Uuid) -> Result<()> {
        let query = format!("order_notifications?id=eq.{id}");
        let response = self
            .authed(self.http.delete(self.rest(&query)))
            .send()
            .await
            .context("backend unreachable")?;
        Self::expect_success(response, "notification delete").await?;
        Ok(())
    }

    async fn notification_exists(&self, order_id: Uuid, ty: NotificationType) -> Result<bool> {
        let query = format!(
            "order_notifications?select=id&order_id=eq.{order_id}&notification_type=eq.{ty}&limit=1"
        );
        let response = self
            .authed(self.http.get(self.rest(&query)))
            .send()
            .await
            .context("backend unreachable")?;
        let response = Self::expect_success(response, "notification lookup").await?;
        let rows: Vec<RowId> = response.json().await.context("lookup response")?;
        Ok(!rows.is_empty())
    }

    async fn orders_created_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Order>> {
        let query = format!(
            "orders?select=*&created_at=gt.{}&order=created_at.asc",
            cutoff.to_rfc3339_opts(SecondsFormat::Micros, true)
        );
        let response = self
            .authed(self.http.get(self.rest(&query)))
            .send()
            .await
            .context("backend unreachable")?;
        let response = Self::expect_success(response, "order listing").await?;
        response.json().await.context("order listing response")
    }

    async fn load_settings(&self) -> Result<Option<Settings>> {
        let query = format!("settings?select=value&key=eq.{SETTINGS_KEY}&limit=1");
        let response = self
            .authed(self.http.get(self.rest(&query)))
            .send()
            .await
            .context("backend unreachable")?;
        let response = Self::expect_success(response, "settings load").await?;
        let mut rows: Vec<SettingsRow> = response.json().await.context("settings response")?;
        match rows.pop() {
            Some(row) => Ok(Some(
                deserialize_payload(&row.value).context("stored settings are malformed")?,
            )),
            None => Ok(None),
        }
    }

    async fn save_settings(&self, settings: &Settings) -> Result<()> {
        let response = self
            .authed(self.http.post(self.rest("settings?on_conflict=key")))
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&serde_json::json!([{
                "key": SETTINGS_KEY,
                "value": settings,
            }]))
            .send()
            .await
            .context("backend unreachable")?;
        Self::expect_success(response, "settings save").await?;
        Ok(())
    }

    fn subscribe_order_changes(&self) -> broadcast::Receiver<OrderChange> {
        self.order_tx.subscribe()
    }

    fn subscribe_notification_inserts(&self) -> broadcast::Receiver<NotificationRecord> {
        self.notification_tx.subscribe()
    }

    async fn run_realtime(&self, cancel: CancellationToken) {
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                break;
            }
            match self.connect_and_pump(&cancel).await {
                Ok(()) => attempt = 0,
                Err(err) => {
                    attempt = attempt.saturating_add(1);
                    log::warn!("realtime connection lost (attempt {attempt}): {err:#}");
                }
            }
            if cancel.is_cancelled() {
                break;
            }
            let delay = reconnect_delay(attempt);
            log::info!("reconnecting realtime in {delay:?}");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        log::debug!("realtime loop stopped");
    }
}

#[derive(Deserialize)]
struct SettingsRow {
    value: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct IncomingFrame {
    #[serde(default)]
    topic: String,
    event: String,
    #[serde(default)]
    payload: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ChangeData {
    #[serde(rename = "type")]
    kind: ChangeKind,
    table: String,
    #[serde(default)]
    record: serde_json::Value,
    #[serde(default)]
    old_record: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Deletes only replicate the row identity.
#[derive(Deserialize)]
struct RowId {
    id: Uuid,
}

fn decode_order_change(change: ChangeData) -> Result<Option<OrderChange>> {
    Ok(Some(match change.kind {
        ChangeKind::Insert => {
            OrderChange::Inserted(deserialize_payload(&change.record).context("inserted row")?)
        }
        ChangeKind::Update => OrderChange::Updated {
            old: deserialize_payload(&change.old_record).context("previous row")?,
            new: deserialize_payload(&change.record).context("updated row")?,
        },
        ChangeKind::Delete => {
            let RowId { id } =
                deserialize_payload(&change.old_record).context("deleted row identity")?;
            OrderChange::Deleted { id }
        }
    }))
}

/// Deserialize with a path in the error, so a malformed field names itself
/// in the logs.
fn deserialize_payload<'de, T: Deserialize<'de>>(value: &'de serde_json::Value) -> Result<T> {
    let mut track = serde_path_to_error::Track::new();
    let deserializer = serde_path_to_error::Deserializer::new(value, &mut track);
    T::deserialize(deserializer)
        .map_err(|err| anyhow::anyhow!("{err} at `{}`", track.path()))
}

fn outgoing_frame(
    topic: &str,
    event: &str,
    payload: serde_json::Value,
    next_ref: &mut u64,
) -> String {
    let frame = serde_json::json!({
        "topic": topic,
        "event": event,
        "payload": payload,
        "ref": next_ref.to_string(),
    });
    *next_ref += 1;
    frame.to_string()
}

fn realtime_endpoint(base_url: &str, api_key: &str) -> Result<String> {
    let ws_base = if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        anyhow::bail!("backend url `{base_url}` is not http(s)");
    };
    Ok(format!(
        "{ws_base}/realtime/v1/websocket?apikey={api_key}&vsn=1.0.0"
    ))
}

/// Exponential backoff with a little jitter, capped at
/// [`MAX_RECONNECT_DELAY`], so a flapping backend is not hammered and a
/// fleet of daemons does not reconnect in lockstep.
fn reconnect_delay(attempt: u32) -> Duration {
    let base = Duration::from_secs(1u64 << attempt.min(6));
    let capped = base.min(MAX_RECONNECT_DELAY);
    let jitter_ms = rand::thread_rng().gen_range(0..=capped.as_millis() as u64 / 4);
    capped + Duration::from_millis(jitter_ms)
}

/// `Content-Range: 0-0/17` (or `*/0` when nothing matched).
fn parse_total_count(content_range: &str) -> Result<i64> {
    let total = content_range
        .rsplit('/')
        .next()
        .context("empty content-range")?;
    total
        .parse()
        .with_context(|| format!("unparseable content-range `{content_range}`"))
}
