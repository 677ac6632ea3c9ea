// 🌐 HTTP surface - axum routes over the Mutation Gateway
//
// Handlers hold no queue logic. They translate JSON and headers into gateway
// calls and gateway outcomes into status codes:
//   validation -> 400, full / already queued -> 409, unauthorized -> 401,
//   not configured -> 503.

use crate::api::{
    ClearAllResponse, ClearCallsignRequest, ClearCallsignResponse, DeleteResponse, ErrorKind,
    ErrorResponse, ReconcilerToggleResponse, SubmitRequest, SubmitResponse, UpdateHeaderRequest,
};
use crate::db;
use crate::gateway::{Actor, GatewayError, MutationGateway};
use axum::{
    extract::{
        rejection::JsonRejection,
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use rusqlite::Connection;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<MutationGateway>,
    pub db: Arc<Mutex<Connection>>,
    /// Cancelled on server shutdown; closes open push sockets
    pub shutdown: CancellationToken,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: T,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}

fn status_code(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::Full | ErrorKind::AlreadyQueued => StatusCode::CONFLICT,
        ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorKind::NotConfigured => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        (status_code(kind), Json(ErrorResponse::new(kind, self.to_string()))).into_response()
    }
}

fn actor(headers: &HeaderMap) -> Actor {
    Actor::from_authorization(headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()))
}

fn bad_body(rejection: JsonRejection) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse::new(ErrorKind::Validation, rejection.body_text())),
    )
        .into_response()
}

// ============================================================================
// Public Handlers
// ============================================================================

/// GET /status
async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.gateway.status())
}

/// GET /config
async fn get_config(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.gateway.station())
}

/// GET /api/entries
async fn get_entries(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.gateway.entries())
}

/// POST /api/submit_callsign
async fn submit_callsign(
    State(state): State<AppState>,
    body: Result<Json<SubmitRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_body(rejection),
    };

    match state.gateway.submit(
        &request.callsign,
        request.location.as_deref(),
        request.comment.as_deref(),
    ) {
        Ok(entry) => Json(SubmitResponse::accepted(
            entry.position,
            entry.callsign.to_string(),
        ))
        .into_response(),
        Err(e) => {
            let kind = e.kind();
            (status_code(kind), Json(SubmitResponse::rejected(kind, e.to_string()))).into_response()
        }
    }
}

/// POST /api/clear_callsign - called by the logging script
async fn clear_callsign(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ClearCallsignRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_body(rejection),
    };

    let actor = match request.api_key {
        Some(key) => Actor::Presenting(key),
        None => actor(&headers),
    };

    match state.gateway.remove_callsign(&request.callsign, &actor) {
        Ok(removal) => Json(ClearCallsignResponse {
            success: removal.position.is_some(),
            callsign: removal.callsign.to_string(),
            position: removal.position,
        })
        .into_response(),
        Err(e) => e.into_response(),
    }
}

// ============================================================================
// Admin Handlers
// ============================================================================

/// POST /api/admin/delete/:position
async fn admin_delete(
    State(state): State<AppState>,
    Path(position): Path<usize>,
    headers: HeaderMap,
) -> Result<Json<DeleteResponse>, GatewayError> {
    let outcome = state.gateway.admin_delete(position, &actor(&headers))?;

    Ok(Json(DeleteResponse {
        success: true,
        position: outcome.position,
        removed: outcome.removed,
    }))
}

/// POST /api/admin/clear_all
async fn admin_clear_all(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ClearAllResponse>, GatewayError> {
    let count = state.gateway.admin_clear_all(&actor(&headers))?;
    Ok(Json(ClearAllResponse {
        success: true,
        count,
    }))
}

/// POST /api/admin/update_header
async fn admin_update_header(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<UpdateHeaderRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_body(rejection),
    };

    let updated = match state.gateway.update_station(
        &actor(&headers),
        &request.operator_name,
        &request.frequency,
    ) {
        Ok(updated) => updated,
        Err(e) => return e.into_response(),
    };

    let saved = {
        let conn = state.db.lock().expect("database lock poisoned");
        db::save_station_config(&conn, &updated)
    };
    if let Err(e) = saved {
        // The in-memory header is already updated; only the restart value is stale
        tracing::error!(error = %format!("{:#}", e), "failed to persist station header");
    }

    Json(ApiResponse::ok(updated)).into_response()
}

/// GET /api/admin/reconciler_status
async fn admin_reconciler_status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, GatewayError> {
    let status = state.gateway.reconciler_status(&actor(&headers))?;
    Ok(Json(ApiResponse::ok(status)))
}

/// POST /api/admin/reconciler_start
async fn admin_reconciler_start(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ReconcilerToggleResponse>, GatewayError> {
    let changed = state.gateway.start_reconciler(&actor(&headers)).await?;
    Ok(Json(ReconcilerToggleResponse {
        success: true,
        changed,
    }))
}

/// POST /api/admin/reconciler_stop
async fn admin_reconciler_stop(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ReconcilerToggleResponse>, GatewayError> {
    let changed = state.gateway.stop_reconciler(&actor(&headers)).await?;
    Ok(Json(ReconcilerToggleResponse {
        success: true,
        changed,
    }))
}

// ============================================================================
// Push Channel
// ============================================================================

/// GET /ws - one JSON text message per change event
async fn push_socket(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| push_changes(socket, state))
}

async fn push_changes(mut socket: WebSocket, state: AppState) {
    let notifier = Arc::clone(state.gateway.registry().notifier());
    let mut subscription = notifier.subscribe();
    tracing::debug!(subscription = %subscription.id(), "push client connected");

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            event = subscription.recv() => {
                let Some(event) = event else { break };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to encode change event");
                        continue;
                    }
                };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    notifier.unsubscribe(subscription.id());
    tracing::debug!(subscription = %subscription.id(), "push client disconnected");
}

// ============================================================================
// Router
// ============================================================================

pub fn router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/entries", get(get_entries))
        .route("/submit_callsign", post(submit_callsign))
        .route("/clear_callsign", post(clear_callsign))
        .route("/admin/delete/:position", post(admin_delete))
        .route("/admin/clear_all", post(admin_clear_all))
        .route("/admin/update_header", post(admin_update_header))
        .route("/admin/reconciler_status", get(admin_reconciler_status))
        .route("/admin/reconciler_start", post(admin_reconciler_start))
        .route("/admin/reconciler_stop", post(admin_reconciler_stop));

    Router::new()
        .route("/status", get(get_status))
        .route("/config", get(get_config))
        .route("/ws", get(push_socket))
        .nest("/api", api_routes)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
