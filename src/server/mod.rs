use crate::catalog::{self, PackageInspector, PopulationOptions};
use crate::channels::{self, ChannelContext, ChannelError, ChannelIo};
use crate::discovery::{self, DiscoveryOptions};
use crate::executor::Action;
use crate::transcription::{TranscriptOutcome, Transcriber};
use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tokio::sync::watch;

pub struct AppState {
    pub channels: ChannelContext,
    pub token: Option<String>,
    pub discovery: DiscoveryOptions,
    pub inspector: Arc<dyn PackageInspector>,
    pub transcriber: Arc<dyn Transcriber>,
    pub population: PopulationOptions,
    pub shutdown: watch::Receiver<bool>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/devices/list", get(list_devices))
        .route("/devices/connect", get(connect_device))
        .route("/devices/disconnect", post(disconnect_device))
        .route("/session", get(session_snapshot))
        .route("/apps/third-party", get(third_party_apps))
        .route("/open-app/:app_id", get(open_app))
        .route("/voice/transcribe", post(transcribe))
        .route("/ws", get(raw_ws_handler))
        .route("/voice/ws", get(text_ws_handler))
        .with_state(state)
}

pub async fn start(
    addr: SocketAddr,
    state: Arc<AppState>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let app = router(state);

    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "http server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.wait_for(|stop| *stop).await;
        })
        .await?;

    Ok(())
}

fn error_response(status: StatusCode, detail: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "detail": detail.into() }))).into_response()
}

fn authorized(state: &AppState, headers: &HeaderMap, query: &HashMap<String, String>) -> bool {
    match state.token.as_deref() {
        None | Some("") => true,
        Some(token) => is_token_valid(headers, query, token),
    }
}

fn is_token_valid(headers: &HeaderMap, query: &HashMap<String, String>, token: &str) -> bool {
    if let Some(provided) = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
    {
        return provided == token;
    }
    query.get("token").is_some_and(|t| t == token)
}

async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "healthy",
            "timestamp": std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs()
        })),
    )
}

async fn list_devices(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if !authorized(&state, &headers, &query) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match discovery::probe(&state.discovery).await {
        Ok(devices) => Json(serde_json::json!({ "devices": devices })).into_response(),
        Err(err) => {
            tracing::warn!(error = %err, "discovery failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

async fn connect_device(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if !authorized(&state, &headers, &query) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let Some(address) = query.get("device_ip").map(|a| a.trim()).filter(|a| !a.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "device_ip is required");
    };

    let outcome = state.channels.session.connect(address).await;
    if outcome.is_connected() {
        let started = catalog::spawn_population(
            Arc::clone(&state.channels.catalog),
            Arc::clone(&state.inspector),
            state.population.clone(),
            state.shutdown.clone(),
        );
        tracing::debug!(address, started, "catalog population trigger");
    }

    let status =
        StatusCode::from_u16(outcome.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(outcome.to_response())).into_response()
}

async fn disconnect_device(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if !authorized(&state, &headers, &query) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let disconnected = state.channels.session.disconnect().await;
    Json(serde_json::json!({
        "disconnected": disconnected,
        "session": state.channels.session.snapshot(),
    }))
    .into_response()
}

async fn session_snapshot(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if !authorized(&state, &headers, &query) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(state.channels.session.snapshot()).into_response()
}

async fn third_party_apps(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if !authorized(&state, &headers, &query) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let catalog = &state.channels.catalog;
    if !catalog.is_loaded() {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, channels::CATALOG_BUILDING);
    }
    let packages = match state.inspector.list_packages(true).await {
        Ok(packages) => packages,
        Err(err) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    };
    let apps: Vec<_> = packages.iter().filter_map(|id| catalog.get(id)).collect();
    Json(serde_json::json!({
        "status": 200,
        "message": "Filtered third-party apps successfully.",
        "filtered_count": apps.len(),
        "apps": apps,
    }))
    .into_response()
}

async fn open_app(
    State(state): State<Arc<AppState>>,
    Path(app_id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if !authorized(&state, &headers, &query) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match state.channels.dispatch(&Action::LaunchApp(app_id)).await {
        Ok(message) => Json(serde_json::json!({
            "status": 200,
            "connection": "app open successfully",
            "message": message,
        }))
        .into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn transcribe(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    if !authorized(&state, &headers, &query) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if body.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "No audio provided.");
    }
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("application/octet-stream");
    let outcome: TranscriptOutcome = state
        .transcriber
        .transcribe(body.to_vec(), content_type)
        .await
        .into();
    Json(outcome).into_response()
}

struct SocketChannel(WebSocket);

#[async_trait]
impl ChannelIo for SocketChannel {
    async fn recv(&mut self) -> Option<Result<String, ChannelError>> {
        loop {
            match self.0.recv().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(bytes)) => {
                    return Some(Ok(String::from_utf8_lossy(&bytes).into_owned()))
                }
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(err) => return Some(Err(ChannelError::Transport(err.to_string()))),
            }
        }
    }

    async fn send(&mut self, frame: String) -> Result<(), ChannelError> {
        self.0
            .send(Message::Text(frame))
            .await
            .map_err(|err| ChannelError::Transport(err.to_string()))
    }
}

async fn raw_ws_handler(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if !authorized(&state, &headers, &query) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let ctx = state.channels.clone();
    ws.on_upgrade(move |socket| async move {
        let mut io = SocketChannel(socket);
        channels::run_raw_command_channel(&mut io, &ctx).await;
    })
}

async fn text_ws_handler(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if !authorized(&state, &headers, &query) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let ctx = state.channels.clone();
    ws.on_upgrade(move |socket| async move {
        let mut io = SocketChannel(socket);
        channels::run_text_channel(&mut io, &ctx).await;
    })
}
