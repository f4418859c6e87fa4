use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::config::DashboardConfig;
use crate::credentials::CredentialPool;
use crate::events::{BotEvent, EventSink};
use crate::session::{Mood, SessionManager, Turn, UserSession};
use crate::store::StoredTurn;
use crate::transport::ChatTransport;

#[derive(Clone)]
pub struct DashboardState {
    pub sessions: Arc<SessionManager>,
    pub transport: Arc<dyn ChatTransport>,
    pub credentials: Arc<CredentialPool>,
    pub events: EventSink,
    pub auth: DashboardAuthConfig,
    pub ws_events: broadcast::Sender<ApiEventEnvelope>,
}

#[derive(Debug, Clone)]
pub struct DashboardAuthConfig {
    mode: AuthMode,
    token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthMode {
    Required,
    Disabled,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiEventEnvelope {
    pub event_id: String,
    pub event_type: String,
    pub emitted_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    total_sessions: usize,
    active_last_24h: usize,
    notified_last_24h: usize,
    neutral_sessions: usize,
    warm_sessions: usize,
    angry_sessions: usize,
    credential_pool_size: usize,
    active_credential: usize,
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    page: Option<usize>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct SessionSummary {
    user_id: i64,
    display_name: String,
    mood: Mood,
    affinity: u32,
    relationship_tier: &'static str,
    created_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
    last_notified_at: Option<DateTime<Utc>>,
}

impl From<&UserSession> for SessionSummary {
    fn from(session: &UserSession) -> Self {
        Self {
            user_id: session.user_id,
            display_name: session.display_name.clone(),
            mood: session.mood,
            affinity: session.affinity,
            relationship_tier: session.relationship_tier().as_str(),
            created_at: session.created_at,
            last_seen_at: session.last_seen_at,
            last_notified_at: session.last_notified_at,
        }
    }
}

#[derive(Debug, Serialize)]
struct SessionsPage {
    page: usize,
    limit: usize,
    total: usize,
    sessions: Vec<SessionSummary>,
}

#[derive(Debug, Serialize)]
struct SessionDetail {
    #[serde(flatten)]
    summary: SessionSummary,
    recent_history: Vec<Turn>,
}

#[derive(Debug, Deserialize)]
struct SendMessageRequest {
    content: String,
}

#[derive(Debug, Serialize)]
struct SendMessageResponse {
    status: &'static str,
    turn: Turn,
}

pub async fn serve_dashboard(
    binding: DashboardBinding,
    sessions: Arc<SessionManager>,
    transport: Arc<dyn ChatTransport>,
    credentials: Arc<CredentialPool>,
    events: EventSink,
    event_rx: flume::Receiver<BotEvent>,
) -> Result<()> {
    let DashboardBinding { bind_addr, auth } = binding;
    let (ws_events, _) = broadcast::channel(512);

    let state = Arc::new(DashboardState {
        sessions,
        transport,
        credentials,
        events,
        auth,
        ws_events: ws_events.clone(),
    });

    spawn_event_bridge(event_rx, ws_events);

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind dashboard to {}", bind_addr))?;
    tracing::info!("Dashboard listening on http://{}", bind_addr);
    axum::serve(listener, app)
        .await
        .context("Dashboard server failed")?;
    Ok(())
}

pub fn router(state: Arc<DashboardState>) -> Router {
    let protected = Router::new()
        .route("/health", get(health))
        .route("/stats", get(get_stats))
        .route("/sessions", get(list_sessions))
        .route("/sessions/:id", get(get_session))
        .route("/sessions/:id/history", get(get_history))
        .route(
            "/sessions/:id/messages",
            axum::routing::post(send_operator_message),
        )
        .route("/ws/events", get(ws_events_route))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new().nest("/v1", protected)
}

fn spawn_event_bridge(
    event_rx: flume::Receiver<BotEvent>,
    ws_events: broadcast::Sender<ApiEventEnvelope>,
) {
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv_async().await {
            let envelope = map_bot_event(event);
            let _ = ws_events.send(envelope);
        }
    });
}

fn map_bot_event(event: BotEvent) -> ApiEventEnvelope {
    match event {
        BotEvent::MessageReceived { user_id, mood } => envelope(
            "message_received",
            serde_json::json!({ "user_id": user_id, "mood": mood }),
        ),
        BotEvent::ReplySent { user_id } => {
            envelope("reply_sent", serde_json::json!({ "user_id": user_id }))
        }
        BotEvent::FarewellSent { user_id } => {
            envelope("farewell_sent", serde_json::json!({ "user_id": user_id }))
        }
        BotEvent::CompletionFailed {
            user_id,
            reason,
            active_credential,
        } => envelope(
            "completion_failed",
            serde_json::json!({
                "user_id": user_id,
                "reason": reason.as_str(),
                "active_credential": active_credential,
            }),
        ),
        BotEvent::AccessDenied { user_id } => {
            envelope("access_denied", serde_json::json!({ "user_id": user_id }))
        }
        BotEvent::AccessGranted { user_id } => {
            envelope("access_granted", serde_json::json!({ "user_id": user_id }))
        }
        BotEvent::NotificationDispatched { user_id, job } => envelope(
            "notification_dispatched",
            serde_json::json!({ "user_id": user_id, "job": job.as_str() }),
        ),
        BotEvent::NotificationFailed {
            user_id,
            job,
            error,
        } => envelope(
            "notification_failed",
            serde_json::json!({ "user_id": user_id, "job": job.as_str(), "error": error }),
        ),
        BotEvent::CycleCompleted(report) => envelope(
            "cycle_completed",
            serde_json::to_value(&report).unwrap_or(serde_json::Value::Null),
        ),
        BotEvent::OperatorMessage {
            user_id,
            content,
            delivered,
        } => envelope(
            "operator_message",
            serde_json::json!({ "user_id": user_id, "content": content, "delivered": delivered }),
        ),
    }
}

fn envelope(event_type: &str, payload: serde_json::Value) -> ApiEventEnvelope {
    ApiEventEnvelope {
        event_id: uuid::Uuid::new_v4().to_string(),
        event_type: event_type.to_string(),
        emitted_at: Utc::now(),
        payload,
    }
}

impl DashboardAuthConfig {
    pub fn from_config(config: &DashboardConfig) -> Result<Self> {
        let mode = parse_auth_mode(Some(config.auth_mode.clone()))?;
        let token = config
            .token
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);

        if mode == AuthMode::Required && token.is_none() {
            return Err(anyhow!(
                "COMPANION_DASHBOARD_TOKEN is required when auth mode is 'required'"
            ));
        }
        if mode == AuthMode::Disabled {
            tracing::warn!("Dashboard auth mode is disabled; all API routes are unauthenticated");
        }

        Ok(Self { mode, token })
    }
}

/// Resolved listener address and auth, checked before anything is spawned.
#[derive(Debug, Clone)]
pub struct DashboardBinding {
    pub bind_addr: SocketAddr,
    pub auth: DashboardAuthConfig,
}

impl DashboardBinding {
    pub fn from_config(config: &DashboardConfig) -> Result<Self> {
        let bind_addr = config
            .bind
            .trim()
            .parse::<SocketAddr>()
            .with_context(|| {
                format!(
                    "Invalid dashboard bind address '{}' (expected host:port)",
                    config.bind
                )
            })?;
        Ok(Self {
            bind_addr,
            auth: DashboardAuthConfig::from_config(config)?,
        })
    }
}

fn parse_auth_mode(raw: Option<String>) -> Result<AuthMode> {
    let normalized = raw
        .unwrap_or_else(|| "required".to_string())
        .trim()
        .to_ascii_lowercase();
    match normalized.as_str() {
        "" | "required" | "on" | "enabled" | "true" => Ok(AuthMode::Required),
        "disabled" | "off" | "false" => Ok(AuthMode::Disabled),
        other => Err(anyhow!(
            "Invalid COMPANION_DASHBOARD_AUTH_MODE '{}'. Expected 'required' or 'disabled'",
            other
        )),
    }
}

async fn auth_middleware(
    State(state): State<Arc<DashboardState>>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, StatusCode> {
    authorize(&headers, &state.auth)?;
    Ok(next.run(request).await)
}

fn authorize(headers: &HeaderMap, auth: &DashboardAuthConfig) -> Result<(), StatusCode> {
    if auth.mode == AuthMode::Disabled {
        return Ok(());
    }
    let Some(token) = auth.token.as_deref() else {
        return Err(StatusCode::UNAUTHORIZED);
    };

    let Some(raw_header) = headers.get(header::AUTHORIZATION) else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let Ok(auth_value) = raw_header.to_str() else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let expected = format!("Bearer {}", token);
    if auth_value.trim() != expected {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn get_stats(
    State(state): State<Arc<DashboardState>>,
) -> Result<Json<StatsResponse>, (StatusCode, String)> {
    let store = state.sessions.store();
    let day_ago = Utc::now() - chrono::Duration::hours(24);
    Ok(Json(StatsResponse {
        total_sessions: store.count_sessions().map_err(internal_error)?,
        active_last_24h: store.count_seen_since(day_ago).map_err(internal_error)?,
        notified_last_24h: store.count_notified_since(day_ago).map_err(internal_error)?,
        neutral_sessions: store.count_in_mood(Mood::Neutral).map_err(internal_error)?,
        warm_sessions: store.count_in_mood(Mood::Warm).map_err(internal_error)?,
        angry_sessions: store.count_in_mood(Mood::Angry).map_err(internal_error)?,
        credential_pool_size: state.credentials.len(),
        active_credential: state.credentials.active_index(),
    }))
}

async fn list_sessions(
    State(state): State<Arc<DashboardState>>,
    Query(query): Query<PageQuery>,
) -> Result<Json<SessionsPage>, (StatusCode, String)> {
    let limit = clamp_limit(query.limit, 50, 1, 500);
    let page = query.page.unwrap_or(0);
    let store = state.sessions.store();
    let total = store.count_sessions().map_err(internal_error)?;
    let sessions = store
        .list_sessions(page.saturating_mul(limit), limit)
        .map_err(internal_error)?;
    Ok(Json(SessionsPage {
        page,
        limit,
        total,
        sessions: sessions.iter().map(SessionSummary::from).collect(),
    }))
}

async fn get_session(
    State(state): State<Arc<DashboardState>>,
    Path(user_id): Path<i64>,
) -> Result<Json<SessionDetail>, (StatusCode, String)> {
    let session = require_session(&state, user_id)?;
    Ok(Json(SessionDetail {
        summary: SessionSummary::from(&session),
        recent_history: session.history,
    }))
}

async fn get_history(
    State(state): State<Arc<DashboardState>>,
    Path(user_id): Path<i64>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Vec<StoredTurn>>, (StatusCode, String)> {
    require_session(&state, user_id)?;
    let limit = clamp_limit(query.limit, 50, 1, 500);
    let page = query.page.unwrap_or(0);
    state
        .sessions
        .store()
        .history_page(user_id, page.saturating_mul(limit), limit)
        .map(Json)
        .map_err(internal_error)
}

async fn send_operator_message(
    State(state): State<Arc<DashboardState>>,
    Path(user_id): Path<i64>,
    Json(body): Json<SendMessageRequest>,
) -> Result<Json<SendMessageResponse>, (StatusCode, String)> {
    require_session(&state, user_id)?;

    let content = body.content.trim();
    if content.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "content cannot be empty".to_string(),
        ));
    }

    let turn = state
        .sessions
        .inject_operator_message(user_id, content)
        .map_err(internal_error)?;

    let delivered = match state.transport.send_text(user_id, &turn.content).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("Operator message for user {} stored but not delivered: {:#}", user_id, e);
            false
        }
    };
    state.events.emit(BotEvent::OperatorMessage {
        user_id,
        content: turn.content.clone(),
        delivered,
    });

    Ok(Json(SendMessageResponse {
        status: if delivered { "delivered" } else { "stored" },
        turn,
    }))
}

async fn ws_events_route(
    State(state): State<Arc<DashboardState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_events_socket(state, socket))
}

async fn handle_events_socket(state: Arc<DashboardState>, mut socket: WebSocket) {
    let mut rx = state.ws_events.subscribe();

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        let payload = match serde_json::to_string(&event) {
                            Ok(serialized) => serialized,
                            Err(error) => {
                                tracing::warn!("Failed to serialize websocket event: {}", error);
                                continue;
                            }
                        };
                        if socket.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}

fn require_session(
    state: &DashboardState,
    user_id: i64,
) -> Result<UserSession, (StatusCode, String)> {
    state
        .sessions
        .find(user_id)
        .map_err(internal_error)?
        .ok_or_else(|| not_found(format!("session {} not found", user_id)))
}

fn clamp_limit(value: Option<usize>, default: usize, min: usize, max: usize) -> usize {
    value.unwrap_or(default).clamp(min, max)
}

fn not_found(message: String) -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, message)
}

fn internal_error(error: anyhow::Error) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
}
