//! REST + WebSocket front door.
//!
//! The request-serving layer is fully async and never blocks: one-shot
//! outbound work (token test, manual calibration) runs on the blocking
//! pool, registration engines run on their own worker threads, and each
//! session's events reach its websocket subscribers through a broadcast
//! fanout fed by a drain task.

use anyhow::Result;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, Query, Request, State, WebSocketUpgrade};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::calibration::{CalibrationReport, SampleSource};
use crate::clock::wall_now;
use crate::config::{AppConfig, ConfigRequest, ConfigResponse};
use crate::engine::{Engine, EngineConfig};
use crate::events::{Event, EventBus, EventKind, LogLevel};
use crate::ntp::SntpSource;
use crate::protocol::{self, CrnStatus, TokenTestResult};
use crate::ratelimit::RateLimiter;
use crate::session::{EngineHandle, RegistryError, Session, SessionRegistry};
use crate::status::{EngineStatus, Phase};
use crate::transport::HttpTransport;

const RATE_WINDOW: Duration = Duration::from_secs(60);
const TEST_TOKEN_LIMIT: u32 = 10;
const CALIBRATE_LIMIT: u32 = 6;
const START_LIMIT: u32 = 6;

// ============================================================================
// STATE & ERRORS
// ============================================================================

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub limiter: Arc<RateLimiter>,
    pub cfg: Arc<AppConfig>,
}

/// Error responses follow the `{"detail": ...}` shape the front end expects.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        ApiError {
            status,
            detail: detail.into(),
        }
    }

    fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, detail)
    }

    fn not_found(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, detail)
    }

    fn conflict(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, detail)
    }

    fn too_many(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::TOO_MANY_REQUESTS, detail)
    }

    fn internal(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, detail)
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::InvalidId => Self::bad_request(e.to_string()),
            RegistryError::Capacity => Self::new(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ============================================================================
// SERVER
// ============================================================================

pub async fn serve(cfg: AppConfig) -> Result<()> {
    let state = AppState {
        registry: Arc::new(SessionRegistry::new()),
        limiter: Arc::new(RateLimiter::new()),
        cfg: Arc::new(cfg),
    };

    let app = router(state.clone());
    let listener = tokio::net::TcpListener::bind(state.cfg.bind).await?;
    info!("listening on {}", state.cfg.bind);

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let shutdown_tx = Arc::new(Mutex::new(Some(shutdown_tx)));
    ctrlc::set_handler(move || {
        info!("Ctrl+C received, shutting down...");
        if let Some(tx) = shutdown_tx.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = tx.send(());
        }
    })?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown_rx.await;
    })
    .await?;

    // Running engines get a cooperative cancel on the way out.
    state.registry.cancel_all();
    info!("shut down");
    Ok(())
}

pub fn router(state: AppState) -> Router {
    let cors = cors_layer(&state.cfg);
    Router::new()
        .route("/api/health", get(health))
        .route("/api/config", get(get_config).post(set_config))
        .route("/api/test-token", post(test_token))
        .route("/api/calibrate", post(calibrate))
        .route("/api/register/start", post(register_start))
        .route("/api/register/cancel", post(register_cancel))
        .route("/api/register/reset", post(register_reset))
        .route("/api/register/status", get(register_status))
        .route("/docs", get(docs_index))
        .route("/ws", get(ws_endpoint))
        .layer(middleware::from_fn(security_headers))
        .layer(cors)
        .with_state(state)
}

fn cors_layer(cfg: &AppConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = cfg
        .cors_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, HeaderName::from_static("x-session-id")])
        .allow_credentials(true)
}

async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        "X-Content-Type-Options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
    headers.insert(
        "Referrer-Policy",
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    headers.insert(
        "Permissions-Policy",
        HeaderValue::from_static("camera=(), microphone=(), geolocation=()"),
    );
    response
}

fn session_id(headers: &HeaderMap) -> ApiResult<String> {
    let sid = headers
        .get("x-session-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if sid.is_empty() {
        return Err(ApiError::bad_request("X-Session-ID header required"));
    }
    Ok(sid.to_string())
}

fn check_rate(
    state: &AppState,
    addr: SocketAddr,
    route: &'static str,
    limit: u32,
) -> ApiResult<()> {
    if state.limiter.check(addr.ip(), route, limit, RATE_WINDOW) {
        Ok(())
    } else {
        warn!("rate limit hit: {} from {}", route, addr.ip());
        Err(ApiError::too_many("request limit exceeded, please wait"))
    }
}

// ============================================================================
// BASIC ENDPOINTS
// ============================================================================

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "time": wall_now() }))
}

async fn docs_index(State(state): State<AppState>) -> Response {
    if state.cfg.production {
        StatusCode::NOT_FOUND.into_response()
    } else {
        Json(json!({
            "service": "regburst",
            "endpoints": [
                "GET  /api/health",
                "GET  /api/config",
                "POST /api/config",
                "POST /api/test-token",
                "POST /api/calibrate",
                "POST /api/register/start",
                "POST /api/register/cancel",
                "POST /api/register/reset",
                "GET  /api/register/status",
                "WS   /ws?session_id=<uuid>",
            ],
        }))
        .into_response()
    }
}

// ============================================================================
// CONFIG
// ============================================================================

async fn get_config(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<ConfigResponse>> {
    let sid = session_id(&headers)?;
    let response = state.registry.with_session(&sid, |session| {
        ConfigResponse::from_session(&session.config, !session.token.is_empty())
    })?;
    Ok(Json(response))
}

async fn set_config(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ConfigRequest>,
) -> ApiResult<Json<ConfigResponse>> {
    let sid = session_id(&headers)?;
    request.validate().map_err(ApiError::bad_request)?;

    let response = state.registry.with_session(&sid, |session| {
        if let Some(token) = &request.token {
            if !token.is_empty() {
                session.token = token.clone();
            }
        }
        request.apply_to(&mut session.config);
        ConfigResponse::from_session(&session.config, !session.token.is_empty())
    })?;
    Ok(Json(response))
}

// ============================================================================
// ONE-SHOT HELPERS
// ============================================================================

async fn test_token(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> ApiResult<Json<TokenTestResult>> {
    check_rate(&state, addr, "test-token", TEST_TOKEN_LIMIT)?;
    let sid = session_id(&headers)?;
    let token = state
        .registry
        .with_session(&sid, |session| session.token.clone())?;
    if token.is_empty() {
        return Err(ApiError::bad_request("token not configured"));
    }

    let result = tokio::task::spawn_blocking(move || -> Result<TokenTestResult> {
        let client = HttpTransport::new(&token)?;
        Ok(protocol::test_token(&client))
    })
    .await
    .map_err(|e| ApiError::internal(e.to_string()))?
    .map_err(|e| ApiError::bad_request(e.to_string()))?;

    Ok(Json(result))
}

async fn calibrate(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> ApiResult<Json<CalibrationReport>> {
    check_rate(&state, addr, "calibrate", CALIBRATE_LIMIT)?;
    let sid = session_id(&headers)?;
    let token = state
        .registry
        .with_session(&sid, |session| session.token.clone())?;
    if token.is_empty() {
        return Err(ApiError::bad_request("token not configured"));
    }

    let report = tokio::task::spawn_blocking(move || -> Result<CalibrationReport> {
        let client = HttpTransport::new(&token)?;
        let mut engine = Engine::standalone(client, SntpSource::new());
        Ok(engine.calibrate(SampleSource::Manual))
    })
    .await
    .map_err(|e| ApiError::internal(e.to_string()))?
    .map_err(|e| ApiError::bad_request(e.to_string()))?;

    Ok(Json(report))
}

// ============================================================================
// REGISTRATION LIFECYCLE
// ============================================================================

async fn register_start(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    check_rate(&state, addr, "register-start", START_LIMIT)?;
    let sid = session_id(&headers)?;

    let (events_rx, fanout) = state
        .registry
        .with_session(&sid, start_engine_in_session)??;

    tokio::spawn(drain_events(events_rx, fanout));
    Ok(Json(json!({ "status": "started", "message": "registration started" })))
}

/// Validate the session, spawn the engine worker, and hand back the event
/// receiver plus the fanout the drain task should feed.
fn start_engine_in_session(
    session: &mut Session,
) -> ApiResult<(mpsc::UnboundedReceiver<Event>, broadcast::Sender<String>)> {
    if session.token.is_empty() {
        return Err(ApiError::bad_request("token not configured"));
    }
    if session.config.ecrn_list.is_empty() {
        return Err(ApiError::bad_request("CRN list is empty"));
    }
    if session.config.kayit_saati.is_empty() {
        return Err(ApiError::bad_request("registration time not configured"));
    }

    // A dead worker can leave the running flag stuck; clear that instead of
    // refusing forever.
    let stuck = match &session.engine {
        Some(engine) if engine.is_running() => {
            if engine.thread_alive() {
                return Err(ApiError::conflict("registration already running"));
            }
            true
        }
        _ => false,
    };
    if stuck {
        if let Some(engine) = &session.engine {
            engine.force_clear();
        }
        session.engine = None;
    }

    let status = Arc::new(RwLock::new(EngineStatus::default()));
    // Claimed before the worker starts so a concurrent start sees 409.
    status.write().unwrap_or_else(|e| e.into_inner()).running = true;
    let cancel = Arc::new(AtomicBool::new(false));
    let (bus, events_rx) = EventBus::channel();

    let engine_cfg = EngineConfig {
        ecrn_list: session.config.ecrn_list.clone(),
        scrn_list: session.config.scrn_list.clone(),
        target_hms: session.config.kayit_saati.clone(),
        max_attempts: session.config.max_deneme,
        retry_interval_s: session.config.retry_aralik,
        initial_buffer_s: session.config.gecikme_buffer.max(0.025),
        dry_run: session.config.dry_run,
    };

    let token = session.token.clone();
    let thread_status = status.clone();
    let thread_cancel = cancel.clone();
    let thread = std::thread::spawn(move || {
        // The blocking client is built on the worker, never on the runtime.
        match HttpTransport::new(&token) {
            Ok(client) => Engine::new(
                client,
                SntpSource::new(),
                engine_cfg,
                bus,
                thread_status,
                thread_cancel,
            )
            .run(),
            Err(e) => {
                bus.log(LogLevel::Error, format!("failed to build HTTP client: {}", e));
                bus.emit(EventKind::State {
                    phase: Phase::Done,
                    running: true,
                });
                bus.emit(EventKind::Done {
                    results: BTreeMap::new(),
                });
                let mut status = thread_status.write().unwrap_or_else(|p| p.into_inner());
                status.phase = Phase::Done;
                status.running = false;
            }
        }
    });

    let max_attempts = session.config.max_deneme;
    session.engine = Some(EngineHandle::new(status, cancel, max_attempts, thread));
    Ok((events_rx, session.fanout.clone()))
}

/// Forward every engine event to the session fanout as a JSON frame.
/// Ends when the engine drops its sender; subscribers that went away are
/// the broadcast channel's problem, publishing continues.
async fn drain_events(
    mut events_rx: mpsc::UnboundedReceiver<Event>,
    fanout: broadcast::Sender<String>,
) {
    while let Some(event) = events_rx.recv().await {
        if let Ok(frame) = serde_json::to_string(&event) {
            let _ = fanout.send(frame);
        }
    }
}

async fn register_cancel(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    let sid = session_id(&headers)?;
    let cancelled = state.registry.with_session(&sid, |session| {
        match &session.engine {
            Some(engine) if engine.is_running() => {
                engine.cancel();
                true
            }
            _ => false,
        }
    })?;

    if !cancelled {
        return Err(ApiError::not_found("no running registration"));
    }
    Ok(Json(json!({ "status": "cancelled" })))
}

async fn register_reset(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    let sid = session_id(&headers)?;
    state.registry.with_session(&sid, |session| {
        if let Some(engine) = &session.engine {
            engine.force_clear();
        }
        session.engine = None;
    })?;
    Ok(Json(json!({ "status": "reset", "message": "engine state cleared" })))
}

#[derive(Debug, Serialize)]
struct CrnResultItem {
    crn: String,
    status: CrnStatus,
    message: String,
}

#[derive(Debug, Serialize)]
struct RegistrationState {
    phase: Phase,
    running: bool,
    current_attempt: u32,
    max_attempts: u32,
    crn_results: Vec<CrnResultItem>,
    calibration: Option<CalibrationReport>,
    countdown_seconds: Option<f64>,
    trigger_time: Option<f64>,
}

async fn register_status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<RegistrationState>> {
    let sid = session_id(&headers)?;
    let response = state.registry.with_session(&sid, |session| {
        let max_attempts = session.config.max_deneme;
        match &session.engine {
            None => RegistrationState {
                phase: Phase::Idle,
                running: false,
                current_attempt: 0,
                max_attempts,
                crn_results: Vec::new(),
                calibration: None,
                countdown_seconds: None,
                trigger_time: None,
            },
            Some(engine) => {
                let snapshot = engine
                    .status
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone();
                let crn_results = snapshot
                    .crn_results
                    .iter()
                    .map(|(crn, result)| CrnResultItem {
                        crn: crn.clone(),
                        status: result.status,
                        message: result.message.clone(),
                    })
                    .collect();
                RegistrationState {
                    phase: snapshot.phase,
                    running: snapshot.running,
                    current_attempt: snapshot.current_attempt,
                    max_attempts: engine.max_attempts,
                    crn_results,
                    calibration: snapshot.calibration,
                    countdown_seconds: snapshot
                        .trigger_time
                        .map(|t| (t - wall_now()).max(0.0)),
                    trigger_time: snapshot.trigger_time,
                }
            }
        }
    })?;
    Ok(Json(response))
}

// ============================================================================
// WEBSOCKET
// ============================================================================

#[derive(Debug, Deserialize)]
struct WsParams {
    session_id: String,
}

async fn ws_endpoint(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> Response {
    match state.registry.subscribe(&params.session_id) {
        Ok(events) => ws.on_upgrade(move |socket| ws_session(socket, events)),
        Err(e) => ApiError::from(e).into_response(),
    }
}

async fn ws_session(mut socket: WebSocket, mut events: broadcast::Receiver<String>) {
    loop {
        tokio::select! {
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if text == "ping"
                        && socket
                            .send(Message::Text(r#"{"type":"pong"}"#.to_string()))
                            .await
                            .is_err()
                    {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            event = events.recv() => match event {
                Ok(frame) => {
                    if socket.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                // Slow subscriber: skip the lost frames, keep following.
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}
