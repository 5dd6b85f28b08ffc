//! Axum-based HTTP gateway: card auth endpoints and the realtime upgrade.
//!
//! - Request body size limits (64KB max)
//! - Request timeouts (30s) to prevent slow-loris attacks
//! - Per-client sliding-window rate limit on register/login
//! - `/ws` authenticates before upgrading; failures never reach the socket

use crate::auth::{AuthResult, AuthSuccess, CardLifecycle, Registration, UserProfile};
use crate::config::Config;
use crate::error::{data, ApiError};
use crate::realtime::{ConnectionActor, Hub, MessageRouter};
use crate::store::SqliteStore;
use anyhow::{Context, Result};
use axum::{
    extract::{
        rejection::JsonRejection,
        ws::{rejection::WebSocketUpgradeRejection, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Maximum request body size (64KB)
pub const MAX_BODY_SIZE: usize = 65_536;
/// Request timeout (30s)
pub const REQUEST_TIMEOUT_SECS: u64 = 30;
/// Sliding window used by gateway rate limiting.
pub const RATE_LIMIT_WINDOW_SECS: u64 = 60;

/// How often the rate limiter sweeps stale client entries from its map.
const RATE_LIMITER_SWEEP_INTERVAL_SECS: u64 = 300; // 5 minutes

#[derive(Debug)]
pub struct SlidingWindowRateLimiter {
    limit_per_window: u32,
    window: Duration,
    requests: Mutex<(HashMap<String, Vec<Instant>>, Instant)>,
}

impl SlidingWindowRateLimiter {
    pub fn new(limit_per_window: u32, window: Duration) -> Self {
        Self {
            limit_per_window,
            window,
            requests: Mutex::new((HashMap::new(), Instant::now())),
        }
    }

    pub fn allow(&self, key: &str) -> bool {
        if self.limit_per_window == 0 {
            return true;
        }

        let now = Instant::now();
        let cutoff = now.checked_sub(self.window).unwrap_or_else(Instant::now);

        let mut guard = self.requests.lock();
        let (requests, last_sweep) = &mut *guard;

        // Periodic sweep: remove clients with no recent requests
        if last_sweep.elapsed() >= Duration::from_secs(RATE_LIMITER_SWEEP_INTERVAL_SECS) {
            requests.retain(|_, timestamps| {
                timestamps.retain(|t| *t > cutoff);
                !timestamps.is_empty()
            });
            *last_sweep = now;
        }

        let entry = requests.entry(key.to_owned()).or_default();
        entry.retain(|instant| *instant > cutoff);

        if entry.len() >= self.limit_per_window as usize {
            return false;
        }

        entry.push(now);
        true
    }
}

fn client_key_from_headers(headers: &HeaderMap) -> String {
    for header_name in ["X-Forwarded-For", "X-Real-IP"] {
        if let Some(value) = headers.get(header_name).and_then(|v| v.to_str().ok()) {
            let first = value.split(',').next().unwrap_or("").trim();
            if !first.is_empty() {
                return first.to_owned();
            }
        }
    }
    "unknown".into()
}

/// Shared state for all axum handlers
#[derive(Clone)]
pub struct AppState {
    pub lifecycle: Arc<CardLifecycle<SqliteStore>>,
    pub hub: Hub,
    pub actor: Arc<ConnectionActor>,
    pub auth_limiter: Arc<SlidingWindowRateLimiter>,
}

impl AppState {
    /// Wire the realtime side around an existing lifecycle and store.
    /// Spawns the hub actor, so call it inside the runtime.
    pub fn new(
        lifecycle: Arc<CardLifecycle<SqliteStore>>,
        config: &Config,
    ) -> Self {
        let store = Arc::clone(lifecycle.store());
        let hub = Hub::spawn();
        let router = Arc::new(MessageRouter::new(
            hub.clone(),
            store.clone(),
            store.clone(),
            store,
        ));
        let actor = Arc::new(ConnectionActor::new(
            hub.clone(),
            router,
            config.connection_settings(),
        ));
        Self {
            lifecycle,
            hub,
            actor,
            auth_limiter: Arc::new(SlidingWindowRateLimiter::new(
                config.rate_limit.auth_per_minute,
                Duration::from_secs(RATE_LIMIT_WINDOW_SECS),
            )),
        }
    }
}

/// Build the router with middleware.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/api/cards", get(handle_list_cards))
        .route(
            "/api/cards/{id}",
            get(handle_check_card).delete(handle_revoke_card),
        )
        .route("/api/auth/register", post(handle_register))
        .route("/api/auth/login", post(handle_login))
        .route("/api/auth/login/backup", post(handle_backup_login))
        .route("/api/auth/logout", post(handle_logout))
        .route("/ws", get(handle_ws))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(REQUEST_TIMEOUT_SECS),
        ))
}

/// Run the HTTP gateway until ctrl-c.
pub async fn run_gateway(config: Config, lifecycle: Arc<CardLifecycle<SqliteStore>>) -> Result<()> {
    let bind = config.bind_addr();
    let state = AppState::new(Arc::clone(&lifecycle), &config);
    let app = router(state);

    let sweep_every = config.sweep_interval();
    let sweeper = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_every);
        loop {
            ticker.tick().await;
            if let Err(e) = lifecycle.sweep() {
                tracing::warn!(error = %e, "Sweep failed");
            }
        }
    });

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {bind}"))?;
    tracing::info!("Gateway listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Received shutdown signal");
        })
        .await?;

    sweeper.abort();
    Ok(())
}

// ══════════════════════════════════════════════════════════════════════════════
// AXUM HANDLERS
// ══════════════════════════════════════════════════════════════════════════════

type ApiResult = std::result::Result<Json<serde_json::Value>, ApiError>;

/// Run a lifecycle call off the async workers; password hashing is slow.
async fn blocking<T, F>(state: &AppState, f: F) -> std::result::Result<T, ApiError>
where
    F: FnOnce(&CardLifecycle<SqliteStore>) -> AuthResult<T> + Send + 'static,
    T: Send + 'static,
{
    let lifecycle = Arc::clone(&state.lifecycle);
    tokio::task::spawn_blocking(move || f(&lifecycle))
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Blocking task failed");
            ApiError::internal()
        })?
        .map_err(ApiError::from)
}

fn check_rate_limit(state: &AppState, headers: &HeaderMap) -> std::result::Result<(), ApiError> {
    let key = client_key_from_headers(headers);
    if state.auth_limiter.allow(&key) {
        Ok(())
    } else {
        tracing::warn!(client = %key, "Auth rate limit exceeded");
        Err(ApiError::rate_limited())
    }
}

fn parse_body<T>(body: std::result::Result<Json<T>, JsonRejection>) -> std::result::Result<T, ApiError> {
    body.map(|Json(b)| b)
        .map_err(|e| ApiError::validation(format!("Invalid request: {}", e.body_text())))
}

/// Extract bearer token from Authorization header.
fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Validate the bearer credential and return `(user_id, credential)`.
fn require_session<'h>(
    state: &AppState,
    headers: &'h HeaderMap,
) -> std::result::Result<(String, &'h str), ApiError> {
    let token = extract_bearer_token(headers)
        .ok_or_else(|| ApiError::unauthorized("Missing Authorization header"))?;
    let user_id = state.lifecycle.authenticate(token)?;
    Ok((user_id, token))
}

#[derive(Serialize)]
struct SessionBody {
    token: String,
    expires_at: i64,
    user: UserProfile,
    #[serde(skip_serializing_if = "Option::is_none")]
    revoked_primary: Option<String>,
}

impl From<AuthSuccess> for SessionBody {
    fn from(auth: AuthSuccess) -> Self {
        Self {
            token: auth.credential.token,
            expires_at: auth.credential.expires_at,
            user: auth.user,
            revoked_primary: None,
        }
    }
}

/// GET /health: always public
async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "connections": state.hub.online_count(),
    }))
}

/// GET /api/cards/{token}: classify a scanned card.
async fn handle_check_card(State(state): State<AppState>, Path(token): Path<String>) -> ApiResult {
    let check = state.lifecycle.check_card(&token)?;
    Ok(data(check))
}

#[derive(Debug, Deserialize)]
struct RegisterBody {
    primary_token: String,
    #[serde(default)]
    backup_token: Option<String>,
    password: String,
    nickname: String,
    public_key: String,
}

/// POST /api/auth/register
async fn handle_register(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: std::result::Result<Json<RegisterBody>, JsonRejection>,
) -> ApiResult {
    check_rate_limit(&state, &headers)?;
    let body = parse_body(body)?;
    let input = Registration {
        primary_token: body.primary_token,
        backup_token: body.backup_token,
        password: body.password,
        nickname: body.nickname,
        public_key: body.public_key,
    };
    let auth = blocking(&state, move |lc| lc.register(input)).await?;
    Ok(data(SessionBody::from(auth)))
}

#[derive(Debug, Deserialize)]
struct LoginBody {
    card_token: String,
    password: String,
}

/// POST /api/auth/login: primary card login.
async fn handle_login(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: std::result::Result<Json<LoginBody>, JsonRejection>,
) -> ApiResult {
    check_rate_limit(&state, &headers)?;
    let body = parse_body(body)?;
    let auth = blocking(&state, move |lc| lc.login(&body.card_token, &body.password)).await?;
    Ok(data(SessionBody::from(auth)))
}

#[derive(Debug, Deserialize)]
struct BackupLoginBody {
    card_token: String,
    password: String,
    #[serde(default)]
    confirm: bool,
}

/// POST /api/auth/login/backup: revokes the primary card and all sessions.
async fn handle_backup_login(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: std::result::Result<Json<BackupLoginBody>, JsonRejection>,
) -> ApiResult {
    check_rate_limit(&state, &headers)?;
    let body = parse_body(body)?;
    let outcome = blocking(&state, move |lc| {
        lc.login_with_backup_card(&body.card_token, &body.password, body.confirm)
    })
    .await?;
    let mut session = SessionBody::from(outcome.auth);
    session.revoked_primary = outcome.revoked_primary;
    Ok(data(session))
}

/// POST /api/auth/logout
async fn handle_logout(State(state): State<AppState>, headers: HeaderMap) -> ApiResult {
    let (_, token) = require_session(&state, &headers)?;
    state.lifecycle.logout(token)?;
    Ok(data(serde_json::json!({ "logged_out": true })))
}

/// GET /api/cards: the caller's cards, newest first.
async fn handle_list_cards(State(state): State<AppState>, headers: HeaderMap) -> ApiResult {
    let (user_id, _) = require_session(&state, &headers)?;
    let cards = state.lifecycle.list_cards(&user_id)?;
    Ok(data(cards))
}

/// DELETE /api/cards/{card_id}: owner revokes one of their cards.
async fn handle_revoke_card(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(card_id): Path<String>,
) -> ApiResult {
    let (user_id, _) = require_session(&state, &headers)?;
    state.lifecycle.revoke_card(&user_id, &card_id)?;
    Ok(data(serde_json::json!({ "revoked": card_id })))
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

/// GET /ws: realtime upgrade. Credential from `?token=` or the bearer header.
async fn handle_ws(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: std::result::Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let token = query
        .token
        .as_deref()
        .filter(|t| !t.is_empty())
        .or_else(|| extract_bearer_token(&headers));
    let Some(token) = token else {
        return ApiError::unauthorized("Missing credential").into_response();
    };
    let user_id = match state.lifecycle.authenticate(token) {
        Ok(id) => id,
        Err(e) => {
            tracing::debug!(error = %e, "WebSocket auth failed");
            return ApiError::from(e).into_response();
        }
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let actor = Arc::clone(&state.actor);
    ws.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        actor.run(user_id, sink, stream).await;
    })
}
