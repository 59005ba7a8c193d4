//! The HTTP surface the shop UI polls.
//!
//! Everything under `/api` is bearer-guarded when a token is configured
//! (compare in constant time; the token is the only secret between the
//! counter tablet and the daemon). Handlers stay thin: they call the same
//! service methods the alert pipeline uses and absorb nothing themselves.
//!
//! The read/mark endpoints also give the ring its second stop condition:
//! when an acknowledgement leaves nothing unread, the phone goes quiet.

use crate::notifications::{NotificationRecord, NotificationService};
use crate::phone::PhoneAlerts;
use crate::ring::pattern::{PatternOpts, RingEngine};
use crate::ring::{RingPattern, ToneSpec};
use crate::settings::{Settings, SettingsPatch, SettingsStore};
use anyhow::{Context as _, Result};
use axum::extract::{Path, Query, Request, State};
use axum::http::{header::AUTHORIZATION, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::compression::CompressionLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing as log;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub notifications: Arc<NotificationService>,
    pub phone: Arc<PhoneAlerts>,
    pub engine: Arc<RingEngine>,
    pub settings: Arc<SettingsStore>,
    pub api_token: Option<SecretString>,
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/notifications", get(list_notifications))
        .route("/notifications/unread-count", get(unread_count))
        .route("/notifications/read-all", post(mark_all_read))
        .route("/notifications/{id}/read", post(mark_read))
        .route("/notifications/{id}", delete(delete_notification))
        .route("/ring/status", get(ring_status))
        .route("/ring/stop", post(ring_stop))
        .route("/ring/test", post(ring_test))
        .route("/settings", get(get_settings).put(update_settings))
        .route("/view", put(set_view))
        .layer(middleware::from_fn_with_state(state.clone(), require_bearer));

    Router::new()
        .route("/", get(banner))
        .nest("/api", api)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(CatchPanicLayer::new())
                .layer(CompressionLayer::new())
                .layer(TraceLayer::new_for_http()),
        )
        .with_state(state)
}

/// Bind and serve until the token is cancelled.
pub async fn serve(state: AppState, bind: SocketAddr, cancel: CancellationToken) -> Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    log::info!("listening on http://{bind}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("server error")
}

async fn require_bearer(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(expected) = &state.api_token else {
        return next.run(request).await;
    };
    let authorized = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .is_some_and(|presented| {
            presented
                .as_bytes()
                .ct_eq(expected.expose_secret().as_bytes())
                .into()
        });
    if authorized {
        next.run(request).await
    } else {
        (StatusCode::UNAUTHORIZED, "invalid api token").into_response()
    }
}

async fn banner() -> &'static str {
    "Orderbell is listening for orders.\n"
}

#[derive(Deserialize, Default)]
struct ListParams {
    unread: Option<bool>,
}

async fn list_notifications(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Json<Vec<NotificationRecord>> {
    Json(
        state
            .notifications
            .list(params.unread.unwrap_or(false))
            .await,
    )
}

#[derive(Serialize)]
struct CountResponse {
    count: i64,
}

async fn unread_count(State(state): State<AppState>) -> Json<CountResponse> {
    Json(CountResponse {
        count: state.notifications.count_unread().await,
    })
}

#[derive(Serialize)]
struct OkResponse {
    ok: bool,
}

async fn mark_read(State(state): State<AppState>, Path(id): Path<Uuid>) -> Json<OkResponse> {
    let ok = state.notifications.mark_read(id).await;
    if ok {
        state.phone.stop_if_all_read().await;
    }
    Json(OkResponse { ok })
}

async fn mark_all_read(State(state): State<AppState>) -> Json<OkResponse> {
    let ok = state.notifications.mark_all_read().await;
    if ok {
        state.phone.stop_if_all_read().await;
    }
    Json(OkResponse { ok })
}

async fn delete_notification(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Json<OkResponse> {
    let ok = state.notifications.delete(id).await;
    if ok {
        state.phone.stop_if_all_read().await;
    }
    Json(OkResponse { ok })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RingStatusResponse {
    ringing: bool,
    pattern: Option<RingPattern>,
    tones_played: u32,
    repetitions: u32,
    active_view: String,
}

async fn ring_status(State(state): State<AppState>) -> Json<RingStatusResponse> {
    let status = state.phone.ring_status();
    Json(RingStatusResponse {
        ringing: status.ringing,
        pattern: status.pattern,
        tones_played: status.tones_played,
        repetitions: status.repetitions,
        active_view: state.phone.active_view(),
    })
}

async fn ring_stop(State(state): State<AppState>) -> Json<OkResponse> {
    state.phone.stop_ringing().await;
    Json(OkResponse { ok: true })
}

/// Speaker check without waiting for an order.
#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct RingTestRequest {
    pattern: Option<RingPattern>,
    frequency: Option<f32>,
    duration_secs: Option<f32>,
    volume: Option<f32>,
}

#[derive(Serialize)]
struct RingTestResponse {
    ok: bool,
    pattern: RingPattern,
}

async fn ring_test(
    State(state): State<AppState>,
    body: Option<Json<RingTestRequest>>,
) -> Json<RingTestResponse> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let pattern = request.pattern.unwrap_or(RingPattern::Single);
    let settings = state.settings.get();
    state.engine.start(
        pattern,
        ToneSpec {
            frequency: request.frequency.unwrap_or(800.0),
            duration_secs: request.duration_secs.unwrap_or(0.5),
            volume: request.volume.unwrap_or(0.7),
        },
        PatternOpts {
            interval_secs: settings.ring_interval as f32,
            max_repeats: 1,
        },
    );
    Json(RingTestResponse { ok: true, pattern })
}

async fn get_settings(State(state): State<AppState>) -> Json<Settings> {
    Json(state.settings.get())
}

async fn update_settings(
    State(state): State<AppState>,
    Json(patch): Json<SettingsPatch>,
) -> Json<Settings> {
    Json(state.settings.update(patch).await)
}

#[derive(Deserialize)]
struct ViewReport {
    view: String,
}

async fn set_view(
    State(state): State<AppState>,
    Json(report): Json<ViewReport>,
) -> Json<OkResponse> {
    state.phone.set_active_view(report.view);
    Json(OkResponse { ok: true })
}
