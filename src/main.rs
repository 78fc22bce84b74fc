//! codraw-sync - real-time sync server for shared documents and boards
//!
//! A collaboration gateway using:
//! - Automerge CRDTs for live document state, flushed when the last viewer leaves
//! - Sled embedded database for document and board persistence
//! - Axum with WebSocket for the JSON event protocol
//! - JWT bearer credentials for connection identity

use anyhow::Context;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{HeaderMap, Method, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::oneshot;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

mod auth;
mod config;
mod storage;
mod sync;

use auth::{AuthError, Authenticator, Handshake, Identity, JwtAuthenticator};
use config::ServerConfig;
use storage::{PersistenceStore, StorageError};
use sync::{
    protocol::{ErrorCode, EventCodec, ServerEvent, MAX_MESSAGE_SIZE},
    server::Flow,
    Gateway, GatewayConfig, SyncError,
};

// ============================================================================
// APPLICATION STATE
// ============================================================================

/// Shared application state
pub struct AppState {
    /// Connection and room gateway
    gateway: Arc<Gateway>,
    /// Durable documents and boards
    store: Arc<dyn PersistenceStore>,
    /// Handshake credential validation
    authenticator: Arc<dyn Authenticator>,
}

// ============================================================================
// API TYPES
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: String,
    version: String,
    uptime_seconds: u64,
    connections: usize,
    rooms: usize,
    live_documents: usize,
}

#[derive(Debug, Default, Deserialize)]
struct CreateDocumentRequest {
    id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CreateBoardRequest {
    id: Option<String>,
    content: Option<Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreatedResponse {
    id: String,
    ws_url: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SaveResponse {
    document_id: String,
    saved: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PresenceResponse {
    resource_id: String,
    user_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

type ApiError = (StatusCode, String);

fn storage_error(err: StorageError) -> ApiError {
    match err {
        StorageError::AlreadyExists(id) => (StatusCode::CONFLICT, format!("{} already exists", id)),
        StorageError::NotFound(id) => (StatusCode::NOT_FOUND, format!("{} not found", id)),
        other => {
            error!("Storage error: {}", other);
            (StatusCode::INTERNAL_SERVER_ERROR, other.to_string())
        }
    }
}

fn sync_error(err: SyncError) -> ApiError {
    let status = match err {
        SyncError::ResourceNotFound(_) => StatusCode::NOT_FOUND,
        SyncError::PersistenceFailure { .. } | SyncError::Store(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        _ => StatusCode::BAD_REQUEST,
    };
    (status, err.to_string())
}

fn new_resource_id(requested: Option<String>) -> String {
    requested
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

// ============================================================================
// HTTP HANDLERS
// ============================================================================

/// Health check endpoint
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.gateway.stats();

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: stats.uptime_seconds,
        connections: stats.connections,
        rooms: stats.rooms,
        live_documents: stats.live_documents,
    })
}

/// Register a new, empty document
async fn create_document(
    State(state): State<Arc<AppState>>,
    payload: Option<Json<CreateDocumentRequest>>,
) -> Result<(StatusCode, Json<CreatedResponse>), ApiError> {
    let payload = payload.map(|Json(p)| p).unwrap_or_default();
    let id = new_resource_id(payload.id);

    state
        .store
        .create_document(&id, &[])
        .await
        .map_err(storage_error)?;
    info!("Created document {}", id);

    Ok((
        StatusCode::CREATED,
        Json(CreatedResponse {
            id,
            ws_url: "/ws".to_string(),
        }),
    ))
}

/// Persist a live document without waiting for the last viewer to leave
async fn save_document(
    State(state): State<Arc<AppState>>,
    Path(document_id): Path<String>,
) -> Result<Json<SaveResponse>, ApiError> {
    let saved = state
        .gateway
        .registry()
        .checkpoint(&document_id)
        .await
        .map_err(sync_error)?;

    Ok(Json(SaveResponse { document_id, saved }))
}

/// Register a new board
async fn create_board(
    State(state): State<Arc<AppState>>,
    payload: Option<Json<CreateBoardRequest>>,
) -> Result<(StatusCode, Json<CreatedResponse>), ApiError> {
    let payload = payload.map(|Json(p)| p).unwrap_or_default();
    let id = new_resource_id(payload.id);
    let content = payload.content.unwrap_or_else(|| json!({ "objects": [] }));

    state
        .store
        .create_board(&id, &content)
        .await
        .map_err(storage_error)?;
    info!("Created board {}", id);

    Ok((
        StatusCode::CREATED,
        Json(CreatedResponse {
            id,
            ws_url: "/ws".to_string(),
        }),
    ))
}

/// Last saved board content
async fn get_board(
    State(state): State<Arc<AppState>>,
    Path(board_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state
        .store
        .load_board(&board_id)
        .await
        .map_err(storage_error)?
        .map(Json)
        .ok_or((StatusCode::NOT_FOUND, format!("Board {} not found", board_id)))
}

/// Explicit board save
async fn save_board(
    State(state): State<Arc<AppState>>,
    Path(board_id): Path<String>,
    Json(content): Json<Value>,
) -> Result<StatusCode, ApiError> {
    state
        .gateway
        .boards()
        .save(&board_id, &content)
        .await
        .map_err(sync_error)?;
    debug!("Saved board {}", board_id);
    Ok(StatusCode::NO_CONTENT)
}

/// Who is online on a resource
async fn get_presence(
    State(state): State<Arc<AppState>>,
    Path(resource_id): Path<String>,
) -> Result<Json<PresenceResponse>, ApiError> {
    let user_ids = state
        .gateway
        .online_users(&resource_id)
        .await
        .map_err(sync_error)?;

    Ok(Json(PresenceResponse {
        resource_id,
        user_ids,
    }))
}

// ============================================================================
// WEBSOCKET HANDLER
// ============================================================================

/// WebSocket upgrade handler
async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let handshake = Handshake::from_headers(&headers, query.token);
    let auth = state.authenticator.authenticate(&handshake).await;

    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_websocket(socket, auth, state))
}

/// Handle WebSocket connection
async fn handle_websocket(
    socket: WebSocket,
    auth: Result<Identity, AuthError>,
    state: Arc<AppState>,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let identity = match auth {
        Ok(identity) => identity,
        Err(e) => {
            warn!("Rejecting WebSocket connection: {}", e);
            let event = EventCodec::error_response(ErrorCode::Unauthorized, e.to_string(), None);
            if let Err(e) = send_event(&mut ws_sender, &event).await {
                debug!("Failed to send auth error: {}", e);
            }
            let _ = ws_sender.send(Message::Close(None)).await;
            return;
        }
    };

    let gateway = state.gateway.clone();
    let (connection_id, mut rx) = gateway.connect(identity);

    // Task to forward events from the channel to the WebSocket
    let conn_send = connection_id.clone();
    let mut send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Err(e) = send_event(&mut ws_sender, &event).await {
                debug!("Send to {} failed: {}", conn_send, e);
                break;
            }
        }
        debug!("Send task ended for {}", conn_send);
    });

    // Task to handle incoming frames, one at a time. It is never aborted:
    // a stop request only takes effect between events.
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let conn_recv = connection_id.clone();
    let gateway_recv = gateway.clone();
    let mut recv_task = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                frame = ws_receiver.next() => frame,
                _ = &mut stop_rx => break,
            };
            let Some(Ok(msg)) = frame else {
                break;
            };

            match msg {
                Message::Text(text) => match EventCodec::decode_client(&text) {
                    Ok(event) => {
                        if gateway_recv.dispatch(&conn_recv, event).await == Flow::Close {
                            break;
                        }
                    }
                    Err(e) => {
                        gateway_recv.report(&conn_recv, &SyncError::InvalidMessage(e.to_string()));
                    }
                },
                Message::Binary(_) => {
                    gateway_recv.report(
                        &conn_recv,
                        &SyncError::InvalidMessage("binary frames are not supported".to_string()),
                    );
                }
                Message::Close(_) => {
                    info!("WebSocket closed by client: {}", conn_recv);
                    break;
                }
                // Ping/pong is handled by axum
                _ => {}
            }
        }
        debug!("Receive task ended for {}", conn_recv);
    });

    let send_finished = tokio::select! {
        _ = &mut send_task => true,
        _ = &mut recv_task => false,
    };
    if send_finished {
        let _ = stop_tx.send(());
        if let Err(e) = recv_task.await {
            error!("Receive task for {} failed: {}", connection_id, e);
        }
    }

    // Cleanup; detaching closes the channel so queued events still drain
    gateway.disconnect(&connection_id).await;
}

/// Send a server event as a text frame
async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &ServerEvent,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let text = EventCodec::encode_server(event)?;
    sender.send(Message::Text(text)).await?;
    Ok(())
}

// ============================================================================
// MAIN ENTRY POINT
// ============================================================================

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "codraw_sync=info,tower_http=info".into()),
        )
        .init();

    let config = ServerConfig::from_env().context("Invalid configuration")?;

    info!(
        "Initializing {:?} storage at: {}",
        config.storage.backend, config.storage.path
    );
    let store = storage::open(&config.storage).context("Failed to open storage")?;
    info!("Storage initialized successfully");

    let gateway = Arc::new(Gateway::with_store(
        store.clone(),
        GatewayConfig {
            max_rooms_per_connection: config.max_rooms_per_connection,
            checkpoint_interval: config.checkpoint_interval,
        },
    ));

    // Start background tasks
    let checkpoint_task = gateway.clone().start_background_tasks();

    let state = Arc::new(AppState {
        gateway: gateway.clone(),
        store,
        authenticator: Arc::new(JwtAuthenticator::new(&config.jwt_secret)),
    });

    // Set up CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers(Any);

    // Build router
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/api/documents", post(create_document))
        .route("/api/documents/:document_id/save", post(save_document))
        .route("/api/boards", post(create_board))
        .route("/api/boards/:board_id", get(get_board))
        .route("/api/boards/:board_id/content", put(save_board))
        .route("/api/resources/:resource_id/presence", get(get_presence))
        .route("/ws", get(ws_handler))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        );

    let addr = config.bind_addr()?;

    info!("codraw-sync v{} starting", env!("CARGO_PKG_VERSION"));
    info!("   Listening on: http://{}", addr);
    info!("   WebSocket: ws://{}/ws", addr);
    info!("   Health check: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    let flushed = gateway.shutdown().await;
    if let Some(task) = checkpoint_task {
        let _ = task.await;
    }
    info!("Server stopped, {} documents flushed", flushed);

    Ok(())
}
