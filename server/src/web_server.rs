//! Axum HTTP + WebSocket server: WS at /ws for terminal attach, session
//! registry API (/api/sessions), schedule API (/api/sessions/{id}/schedule),
//! and raw history range reads (/sessions/{id}/history/raw). Optionally
//! serves a prebuilt dashboard SPA when a dist path is given.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, delete, get, post};
use axum::{Json, Router};
use futures_util::stream::StreamExt;
use futures_util::SinkExt;
use tower_http::services::ServeDir;

use common::client::ClientConn;
use common::config::Config;
use common::error::CoreError;
use common::input::{InputRouter, InputSource};
use common::protocol::{ClientMsg, ServerMsg};
use common::registry::Registry;
use common::sched::NewRule;
use common::session::{Session, SessionInfo, SessionSpec, Visibility};
use common::user::User;

/// Shared app state, injected into every handler.
#[derive(Clone)]
struct AppState {
    registry: Arc<Registry>,
    router: Arc<InputRouter>,
    dist: Option<PathBuf>,
}

/// Query params carrying the auth token (browsers cannot set headers on WS).
#[derive(serde::Deserialize)]
struct TokenQuery {
    #[serde(default)]
    token: Option<String>,
}

/// POST /api/sessions body: a fully resolved spec.
#[derive(serde::Deserialize)]
struct CreateSessionBody {
    argv: Vec<String>,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    env: Option<HashMap<String, String>>,
    #[serde(default)]
    cols: Option<u16>,
    #[serde(default)]
    rows: Option<u16>,
    #[serde(default = "default_true")]
    interactive: bool,
    #[serde(default = "default_true")]
    load_history: bool,
    #[serde(default = "default_true")]
    save_history: bool,
    #[serde(default)]
    visibility: Visibility,
    #[serde(default)]
    alias: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Run the server until shutdown. Binds to 127.0.0.1 (localhost only); put a
/// reverse proxy in front for anything else.
pub async fn run_web_server(config: Arc<Config>, dist: Option<PathBuf>) -> anyhow::Result<()> {
    let registry = Registry::new(Arc::clone(&config));
    tokio::spawn(Arc::clone(&registry).run_cleanup());

    let state = AppState { registry: Arc::clone(&registry), router: registry.router(), dist: dist.clone() };

    let mut app = Router::new()
        .route("/api/info", get(info_handler))
        .route("/api/sessions", get(list_sessions_handler).post(create_session_handler))
        .route("/api/sessions/{id}", get(session_detail_handler).delete(delete_session_handler))
        .route("/api/sessions/{id}/tail", get(session_tail_handler))
        .route("/api/sessions/{id}/schedule", get(list_rules_handler).post(create_rule_handler))
        .route("/api/sessions/{id}/schedule/{rule_id}", delete(delete_rule_handler))
        .route("/api/sessions/{id}/schedule/{rule_id}/pause", post(pause_rule_handler))
        .route("/api/sessions/{id}/schedule/{rule_id}/resume", post(resume_rule_handler))
        .route("/sessions/{id}/history/raw", get(history_raw_handler))
        .route("/ws", get(ws_handler));

    if let Some(dist_path) = dist {
        let assets = dist_path.join("assets");
        app = app
            .nest_service("/assets", ServeDir::new(assets))
            .fallback(any(spa_fallback_handler));
        tracing::info!(dist = %dist_path.display(), "serving dashboard");
    }
    let app = app.with_state(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(registry))
        .await?;
    Ok(())
}

async fn shutdown_signal(registry: Arc<Registry>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "signal listener failed");
        return;
    }
    tracing::info!("shutdown requested");
    registry.shutdown().await;
}

async fn spa_fallback_handler(State(state): State<AppState>) -> Response {
    let Some(dist) = state.dist else {
        return (StatusCode::NOT_FOUND, "not found").into_response();
    };
    match tokio::fs::read_to_string(dist.join("index.html")).await {
        Ok(content) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
            .body(Body::from(content))
            .unwrap(),
        Err(e) => {
            tracing::warn!(error = %e, "index.html read failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to load index.html").into_response()
        }
    }
}

// ---- auth ----

/// Token → user. No configured tokens means single-user mode: everyone is
/// the admin user `local`.
fn authenticate(
    config: &Config,
    headers: &HeaderMap,
    token: Option<&str>,
) -> Result<User, CoreError> {
    if config.auth_tokens.is_empty() {
        return Ok(User::new("local", true));
    }
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let presented = token.or(bearer).ok_or(CoreError::Unauthenticated)?;
    config
        .auth_tokens
        .iter()
        .find(|t| t.token == presented)
        .map(|t| User::new(t.user.clone(), t.admin))
        .ok_or(CoreError::Unauthenticated)
}

/// Map a core error onto an HTTP response with the stable code in the body.
fn error_response(err: CoreError) -> Response {
    let status = match &err {
        CoreError::Unauthenticated => StatusCode::UNAUTHORIZED,
        CoreError::Forbidden => StatusCode::FORBIDDEN,
        CoreError::SessionNotFound | CoreError::RuleNotFound => StatusCode::NOT_FOUND,
        CoreError::InvalidParams(_) | CoreError::ConfigMissing(_) => StatusCode::BAD_REQUEST,
        CoreError::AliasInUse
        | CoreError::NotAttached
        | CoreError::NotInteractive
        | CoreError::AlreadyTerminated => StatusCode::CONFLICT,
        CoreError::SessionLimitExceeded
        | CoreError::ScheduleCapExceeded(_)
        | CoreError::PendingQueueOverflow => StatusCode::TOO_MANY_REQUESTS,
        CoreError::PtyBusy
        | CoreError::PtyClosed
        | CoreError::PtyWriteFailed(_)
        | CoreError::HistoryReadFailed(_)
        | CoreError::SpawnFailed(_)
        | CoreError::DurableLogFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    let body = serde_json::json!({ "error": err.to_string(), "code": err.code() });
    (status, Json(body)).into_response()
}

fn auth_or_response(
    state: &AppState,
    headers: &HeaderMap,
    query: &TokenQuery,
) -> Result<User, Response> {
    authenticate(&state.registry.config, headers, query.token.as_deref()).map_err(error_response)
}

fn session_or_response(state: &AppState, key: &str) -> Result<Arc<Session>, Response> {
    state.registry.get(key).ok_or_else(|| error_response(CoreError::SessionNotFound))
}

/// Lookup with the visibility rule for read access: private sessions are
/// invisible to strangers (404, not 403, so existence is not leaked).
fn visible_session_or_response(
    state: &AppState,
    key: &str,
    user: &User,
) -> Result<Arc<Session>, Response> {
    let session = session_or_response(state, key)?;
    if session.spec.visibility == Visibility::Private && !session.can_manage(user) {
        return Err(error_response(CoreError::SessionNotFound));
    }
    Ok(session)
}

// ---- REST handlers ----

async fn info_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let (running, terminated) = state.registry.counts();
    Json(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "started_at": state.registry.started_at.to_rfc3339(),
        "sessions": { "running": running, "terminated": terminated },
        "connected_clients": state.registry.conn_count(),
    }))
}

async fn list_sessions_handler(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Result<Json<Vec<SessionInfo>>, Response> {
    let user = auth_or_response(&state, &headers, &query)?;
    Ok(Json(state.registry.list(&user)))
}

async fn create_session_handler(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    Json(body): Json<CreateSessionBody>,
) -> Result<Json<SessionInfo>, Response> {
    let user = auth_or_response(&state, &headers, &query)?;
    let mut env: Vec<(String, String)> =
        body.env.unwrap_or_default().into_iter().collect();
    env.sort();
    let spec = SessionSpec {
        argv: body.argv,
        cwd: body.cwd.map(PathBuf::from),
        env,
        cols: body.cols.unwrap_or(80),
        rows: body.rows.unwrap_or(24),
        interactive: body.interactive,
        load_history: body.load_history,
        save_history: body.save_history,
        visibility: body.visibility,
        created_by: user.name.clone(),
        alias: body.alias,
    };
    let session = state.registry.create_session(spec).map_err(error_response)?;
    Ok(Json(session.info()))
}

async fn session_detail_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Result<Json<SessionInfo>, Response> {
    let user = auth_or_response(&state, &headers, &query)?;
    let session = visible_session_or_response(&state, &id, &user)?;
    Ok(Json(session.info()))
}

async fn delete_session_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Result<StatusCode, Response> {
    let user = auth_or_response(&state, &headers, &query)?;
    state.registry.terminate_session(&id, &user).map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/sessions/{id}/tail: bounded in-memory tail, admin only.
async fn session_tail_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Result<Response, Response> {
    let user = auth_or_response(&state, &headers, &query)?;
    if !user.is_admin() {
        return Err(error_response(CoreError::Forbidden));
    }
    let session = session_or_response(&state, &id)?;
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .body(Body::from(session.log.tail()))
        .unwrap())
}

// ---- schedule handlers ----

async fn list_rules_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Result<Json<Vec<common::sched::ScheduledRule>>, Response> {
    let user = auth_or_response(&state, &headers, &query)?;
    let session = visible_session_or_response(&state, &id, &user)?;
    if !session.can_manage(&user) {
        return Err(error_response(CoreError::Forbidden));
    }
    Ok(Json(session.schedule.list()))
}

async fn create_rule_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    Json(body): Json<NewRule>,
) -> Result<Json<common::sched::ScheduledRule>, Response> {
    let user = auth_or_response(&state, &headers, &query)?;
    let session = visible_session_or_response(&state, &id, &user)?;
    if !session.can_manage(&user) {
        return Err(error_response(CoreError::Forbidden));
    }
    if session.is_terminated() {
        return Err(error_response(CoreError::AlreadyTerminated));
    }
    let rule = session
        .schedule
        .add(session.id, &state.registry.config.limits, body)
        .map_err(error_response)?;
    session.schedule.snapshot(&session.store);
    Ok(Json(rule))
}

async fn delete_rule_handler(
    State(state): State<AppState>,
    Path((id, rule_id)): Path<(String, common::sched::RuleId)>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Result<StatusCode, Response> {
    let user = auth_or_response(&state, &headers, &query)?;
    let session = visible_session_or_response(&state, &id, &user)?;
    if !session.can_manage(&user) {
        return Err(error_response(CoreError::Forbidden));
    }
    session.schedule.remove(rule_id).map_err(error_response)?;
    session.schedule.snapshot(&session.store);
    Ok(StatusCode::NO_CONTENT)
}

async fn pause_rule_handler(
    state: State<AppState>,
    path: Path<(String, common::sched::RuleId)>,
    query: Query<TokenQuery>,
    headers: HeaderMap,
) -> Result<Json<common::sched::ScheduledRule>, Response> {
    set_rule_paused(state, path, query, headers, true).await
}

async fn resume_rule_handler(
    state: State<AppState>,
    path: Path<(String, common::sched::RuleId)>,
    query: Query<TokenQuery>,
    headers: HeaderMap,
) -> Result<Json<common::sched::ScheduledRule>, Response> {
    set_rule_paused(state, path, query, headers, false).await
}

async fn set_rule_paused(
    State(state): State<AppState>,
    Path((id, rule_id)): Path<(String, common::sched::RuleId)>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    paused: bool,
) -> Result<Json<common::sched::ScheduledRule>, Response> {
    let user = auth_or_response(&state, &headers, &query)?;
    let session = visible_session_or_response(&state, &id, &user)?;
    if !session.can_manage(&user) {
        return Err(error_response(CoreError::Forbidden));
    }
    let rule = session.schedule.set_paused(rule_id, paused).map_err(error_response)?;
    session.schedule.snapshot(&session.store);
    Ok(Json(rule))
}

// ---- history range reads ----

/// Inclusive byte range from a `Range: bytes=a-b` header. `bytes=a-` means
/// "to the end". The end is signed so a client that computed `0-(M-1)` with
/// `M == 0` (an empty stream) still parses and gets an empty partial.
fn parse_range(header: &str) -> Option<(u64, Option<i64>)> {
    let spec = header.trim().strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    let end = end.trim();
    if end.is_empty() {
        return Some((start, None));
    }
    Some((start, Some(end.parse().ok()?)))
}

/// GET /sessions/{id}/history/raw: serves exact bytes of the session
/// stream; the attach protocol fetches `bytes=0-(M-1)`.
async fn history_raw_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Result<Response, Response> {
    let user = auth_or_response(&state, &headers, &query)?;
    let session = visible_session_or_response(&state, &id, &user)?;
    if !session.can_attach(&user) {
        return Err(error_response(CoreError::Forbidden));
    }
    let seq = session.log.snapshot_seq();

    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(|v| parse_range(v).ok_or(()))
        .transpose()
        .map_err(|()| {
            error_response(CoreError::InvalidParams("malformed Range header".into()))
        })?;

    let octet = |status: StatusCode, content_range: Option<String>, body: Vec<u8>| {
        let mut builder = Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .header(header::ACCEPT_RANGES, "bytes");
        if let Some(cr) = content_range {
            builder = builder.header(header::CONTENT_RANGE, cr);
        }
        builder.body(Body::from(body)).unwrap()
    };

    match range {
        None => {
            let body = session.log.read_range(0, seq.saturating_sub(1)).map_err(error_response)?;
            Ok(octet(StatusCode::OK, None, body))
        }
        Some((start, end)) => {
            if end.is_some_and(|e| e < 0) {
                // computed empty range: bytes=0-(-1) against an empty stream
                return Ok(octet(
                    StatusCode::PARTIAL_CONTENT,
                    Some(format!("bytes */{seq}")),
                    Vec::new(),
                ));
            }
            if seq == 0 {
                if start == 0 {
                    return Ok(octet(StatusCode::PARTIAL_CONTENT, Some("bytes */0".into()), Vec::new()));
                }
                return Ok(octet(StatusCode::RANGE_NOT_SATISFIABLE, Some("bytes */0".into()), Vec::new()));
            }
            if start >= seq {
                return Ok(octet(
                    StatusCode::RANGE_NOT_SATISFIABLE,
                    Some(format!("bytes */{seq}")),
                    Vec::new(),
                ));
            }
            let end = end.map(|e| e as u64).unwrap_or(seq - 1).min(seq - 1);
            if end < start {
                return Ok(octet(
                    StatusCode::RANGE_NOT_SATISFIABLE,
                    Some(format!("bytes */{seq}")),
                    Vec::new(),
                ));
            }
            let body = session.log.read_range(start, end).map_err(error_response)?;
            Ok(octet(
                StatusCode::PARTIAL_CONTENT,
                Some(format!("bytes {start}-{end}/{seq}")),
                body,
            ))
        }
    }
}

// ---- WebSocket ----

async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let user = match authenticate(&state.registry.config, &headers, query.token.as_deref()) {
        Ok(user) => user,
        Err(e) => return error_response(e),
    };
    ws.on_upgrade(move |socket| handle_socket(socket, user, state))
}

async fn handle_socket(socket: WebSocket, user: User, state: AppState) {
    let conn = Arc::new(ClientConn::new(user, &state.registry.config.limits));
    let conn_id = conn.conn_id;
    state.registry.register_conn(Arc::clone(&conn));
    tracing::debug!(conn = %conn_id, user = %conn.user.name, "ws connected");

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer task: drains the conn's send queue to the wire. Ends when the
    // conn is closed and drained; a wire error closes the conn instead.
    let writer_conn = Arc::clone(&conn);
    let writer = tokio::spawn(async move {
        while let Some(msg) = writer_conn.next_msg().await {
            let Ok(json) = serde_json::to_string(&msg) else { continue };
            if ws_tx.send(Message::Text(json.into())).await.is_err() {
                writer_conn.close();
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    // Reader loop: one JSON text frame per message.
    while let Some(Ok(msg)) = ws_rx.next().await {
        let Message::Text(text) = msg else { continue };
        match serde_json::from_str::<ClientMsg>(&text) {
            Ok(msg) => handle_client_msg(&state, &conn, msg).await,
            Err(e) => {
                conn.send(ServerMsg::Error {
                    message: format!("malformed message: {e}"),
                    code: Some("invalid_params"),
                });
            }
        }
        if conn.is_closing() {
            break;
        }
    }

    state.registry.remove_conn(conn_id);
    let _ = writer.await;
    tracing::debug!(conn = %conn_id, "ws disconnected");
}

async fn handle_client_msg(state: &AppState, conn: &Arc<ClientConn>, msg: ClientMsg) {
    match msg {
        ClientMsg::Attach { session_id } => match state.registry.get(&session_id) {
            Some(session) => {
                if let Err(e) = session.attach(conn) {
                    conn.send(ServerMsg::error(&e));
                }
            }
            None => conn.send_not_found(),
        },
        ClientMsg::Detach { session_id } => {
            if let Some(session) = state.registry.get(&session_id) {
                // detaching while not attached is a no-op, not an error
                session.detach(conn);
            }
        }
        ClientMsg::DetachClient { session_id, target_conn_id } => {
            match state.registry.get(&session_id) {
                Some(session) => {
                    if let Err(e) =
                        state.registry.detach_client(&session, &conn.user, target_conn_id)
                    {
                        conn.send(ServerMsg::error(&e));
                    }
                }
                None => conn.send_not_found(),
            }
        }
        ClientMsg::HistoryLoaded { session_id } => match state.registry.get(&session_id) {
            Some(session) => {
                if let Err(e) = session.mark_history_loaded(conn.conn_id) {
                    conn.send(ServerMsg::error(&e));
                }
            }
            None => conn.send_not_found(),
        },
        ClientMsg::Stdin { session_id, data } => match state.registry.get(&session_id) {
            Some(session) => {
                if let Err(e) = state
                    .router
                    .handle_stdin(&session, &InputSource::Conn(conn), data.as_bytes())
                    .await
                {
                    conn.send(ServerMsg::error(&e));
                }
            }
            None => conn.send_not_found(),
        },
        ClientMsg::Resize { session_id, cols, rows } => {
            // resize races detach and termination; unknown sessions are ignored
            if let Some(session) = state.registry.get(&session_id) {
                if let Err(e) = state.router.handle_resize(&session, conn, cols, rows).await {
                    conn.send(ServerMsg::error(&e));
                }
            }
        }
        ClientMsg::Ping { timestamp } => {
            conn.send(ServerMsg::Pong { timestamp });
        }
    }
}

/// Small helper so "unknown session" rejections are uniform.
trait NotFoundExt {
    fn send_not_found(&self);
}

impl NotFoundExt for Arc<ClientConn> {
    fn send_not_found(&self) {
        self.send(ServerMsg::error(&CoreError::SessionNotFound));
    }
}
