use std::convert::Infallible;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{
    extract::{Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tokio_stream::{wrappers::ReceiverStream, Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tower_http::{services::ServeDir, set_header::SetResponseHeaderLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::config::ScanConfig;
use crate::error::ScanError;
use crate::orchestrator::Orchestrator;
use crate::validate::validate_targets;

/// Number of runs returned by `/api/scans`.
const RECENT_RUNS: usize = 50;

#[derive(Clone)]
pub struct AppState {
    orchestrator: Orchestrator,
    scan_defaults: Arc<ScanConfig>,
    auth_token: Arc<str>,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator, scan_defaults: ScanConfig, auth_token: &str) -> Self {
        Self {
            orchestrator,
            scan_defaults: Arc::new(scan_defaults),
            auth_token: auth_token.trim().into(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CustomScanRequest {
    pub targets: Vec<String>,
    #[serde(default)]
    pub ports: String,
}

/// JSON error body with a status derived from the scan error kind.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<ScanError> for ApiError {
    fn from(err: ScanError) -> Self {
        let status = match &err {
            ScanError::Validation(_) => StatusCode::FORBIDDEN,
            ScanError::Busy => StatusCode::CONFLICT,
            ScanError::NoTargets | ScanError::AutoTargets => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Full HTTP surface: JSON API under `/api`, static UI from `assets_dir`.
pub fn router(state: AppState, assets_dir: &Path) -> Router {
    let protected = Router::new()
        .route("/api/stats", get(get_stats))
        .route("/api/results", get(get_results))
        .route("/api/scans", get(get_scans))
        .route("/api/netinfo", get(get_netinfo))
        .route("/api/scan", post(post_scan))
        .route("/api/scan/custom", post(post_custom_scan))
        .route("/api/scan/cancel", post(post_cancel))
        .route("/api/scan/plan", get(get_plan))
        .route("/api/scan/status", get(get_scan_status))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    let open = Router::new()
        .route("/api/health", get(get_health))
        .route("/api/scan/stream", get(get_stream));

    let static_svc = ServeDir::new(assets_dir).append_index_html_on_directories(true);

    Router::new()
        .merge(protected)
        .merge(open)
        .with_state(state)
        .fallback_service(static_svc)
        .layer(SetResponseHeaderLayer::if_not_present(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("Content-Type, Authorization"),
        ))
        .layer(TraceLayer::new_for_http())
}

/// Serve until `shutdown` fires.
pub async fn serve(bind: &str, app: Router, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("serving UI on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn require_token(State(app): State<AppState>, req: Request, next: Next) -> Response {
    if app.auth_token.is_empty() {
        return next.run(req).await;
    }
    let value = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .unwrap_or("");
    if value.is_empty() {
        return ApiError::new(StatusCode::UNAUTHORIZED, "missing Authorization header").into_response();
    }
    let token = match value.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("bearer ") => value[7..].trim(),
        _ => value,
    };
    if token != &*app.auth_token {
        return ApiError::new(StatusCode::FORBIDDEN, "invalid token").into_response();
    }
    next.run(req).await
}

async fn get_health() -> impl IntoResponse {
    let ts = OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default();
    Json(json!({ "ok": true, "ts": ts }))
}

async fn get_stats(State(app): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(app.orchestrator.store().get_stats().await?))
}

async fn get_results(State(app): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(app.orchestrator.store().list_results().await?))
}

async fn get_scans(State(app): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(app.orchestrator.store().list_scan_runs(RECENT_RUNS).await?))
}

async fn get_netinfo(State(app): State<AppState>) -> impl IntoResponse {
    Json(app.orchestrator.decision().facts().net_info())
}

async fn post_scan(State(app): State<AppState>) -> ApiResult<impl IntoResponse> {
    let handle = app.orchestrator.spawn((*app.scan_defaults).clone())?;
    let run_id = handle.run_id().to_string();
    handle.detach();
    Ok(Json(json!({ "status": "started", "run_id": run_id })))
}

async fn post_custom_scan(
    State(app): State<AppState>,
    Json(req): Json<CustomScanRequest>,
) -> ApiResult<impl IntoResponse> {
    if let Err(e) = validate_targets(&req.targets, app.orchestrator.decision().facts()) {
        warn!("rejected custom scan: {e}");
        return Err(e.into());
    }
    let cfg = ScanConfig {
        targets: req.targets,
        ports: req.ports,
        ..(*app.scan_defaults).clone()
    };
    let handle = app.orchestrator.spawn(cfg)?;
    let run_id = handle.run_id().to_string();
    handle.detach();
    Ok(Json(json!({ "status": "started", "run_id": run_id })))
}

async fn post_cancel(State(app): State<AppState>) -> impl IntoResponse {
    Json(json!({ "cancelled": app.orchestrator.cancel() }))
}

async fn get_plan(State(app): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(app.orchestrator.plan(&app.scan_defaults)?))
}

async fn get_scan_status(State(app): State<AppState>) -> impl IntoResponse {
    Json(json!({ "running": app.orchestrator.is_running() }))
}

async fn get_stream(
    State(app): State<AppState>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let (rx, guard) = app.orchestrator.hub().subscribe().into_parts();
    let stream = ReceiverStream::new(rx).map(move |payload| {
        // Unsubscribes once the client goes away and the stream is dropped.
        let _registered = &guard;
        Ok(Event::default().data(&*payload))
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}
