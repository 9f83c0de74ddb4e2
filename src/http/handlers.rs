use super::state::AppState;
use crate::protocol::SyncRequest;
use crate::sync::{RecordingState, StateRecord, SyncError};
use crate::transport::{AppLifecycle, ConnectionState};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct RecordingStateRequest {
    pub state: RecordingState,
}

#[derive(Debug, Deserialize)]
pub struct LifecycleRequest {
    pub lifecycle: AppLifecycle,
}

#[derive(Debug, Serialize)]
pub struct LifecycleResponse {
    pub lifecycle: AppLifecycle,
    pub connection: ConnectionState,
}

#[derive(Debug, Deserialize)]
pub struct StartSyncRequest {
    /// WAV recording on this device
    pub path: String,
}

#[derive(Debug, Serialize)]
pub struct StartSyncResponse {
    pub recording_id: String,
    pub status: String,
    pub request: SyncRequest,
}

#[derive(Debug, Serialize)]
pub struct CancelSyncResponse {
    pub recording_id: String,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, error: String) -> Response {
    (status, Json(ErrorResponse { error })).into_response()
}

fn sync_error_response(e: SyncError) -> Response {
    let status = match &e {
        SyncError::AlreadyInFlight(_) => StatusCode::CONFLICT,
        SyncError::UnknownRecording(_) => StatusCode::NOT_FOUND,
        SyncError::ServiceStopped => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, e.to_string())
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /link/status
/// Connectivity, recording states and in-flight transfers
pub async fn link_status(State(state): State<AppState>) -> impl IntoResponse {
    match state.sync.snapshot().await {
        Ok(snapshot) => (StatusCode::OK, Json(snapshot)).into_response(),
        Err(e) => sync_error_response(e),
    }
}

/// POST /link/recording-state
/// Report a local recording state change; broadcast to the peer
pub async fn set_recording_state(
    State(state): State<AppState>,
    Json(req): Json<RecordingStateRequest>,
) -> impl IntoResponse {
    info!("Local recording state reported: {}", req.state);

    match state.sync.set_local_state(req.state).await {
        Ok(record) => (StatusCode::OK, Json::<StateRecord>(record)).into_response(),
        Err(e) => sync_error_response(e),
    }
}

/// POST /link/lifecycle
/// Report the host app's lifecycle phase
pub async fn set_lifecycle(
    State(state): State<AppState>,
    Json(req): Json<LifecycleRequest>,
) -> impl IntoResponse {
    info!("App lifecycle reported: {:?}", req.lifecycle);

    match state.sync.set_lifecycle(req.lifecycle).await {
        Ok(connection) => (
            StatusCode::OK,
            Json(LifecycleResponse {
                lifecycle: req.lifecycle,
                connection,
            }),
        )
            .into_response(),
        Err(e) => sync_error_response(e),
    }
}

/// POST /link/sync
/// Offer a recording on disk to the peer
pub async fn start_sync(
    State(state): State<AppState>,
    Json(req): Json<StartSyncRequest>,
) -> impl IntoResponse {
    info!("Sync requested for {}", req.path);

    match state.sync.sync_file(&req.path).await {
        Ok(request) => (
            StatusCode::ACCEPTED,
            Json(StartSyncResponse {
                recording_id: request.recording_id.clone(),
                status: "queued".to_string(),
                request,
            }),
        )
            .into_response(),
        Err(e) => match e.downcast::<SyncError>() {
            Ok(sync_error) => sync_error_response(sync_error),
            Err(e) => {
                error!("Failed to start sync of {}: {:#}", req.path, e);
                error_response(
                    StatusCode::BAD_REQUEST,
                    format!("Failed to read recording {}: {:#}", req.path, e),
                )
            }
        },
    }
}

/// POST /link/sync/:recording_id/cancel
/// Cancel an in-flight transfer
pub async fn cancel_sync(
    State(state): State<AppState>,
    Path(recording_id): Path<String>,
) -> impl IntoResponse {
    info!("Cancelling sync of {}", recording_id);

    match state.sync.cancel(&recording_id).await {
        Ok(()) => (
            StatusCode::OK,
            Json(CancelSyncResponse {
                recording_id,
                status: "cancelled".to_string(),
            }),
        )
            .into_response(),
        Err(e) => sync_error_response(e),
    }
}

/// GET /health
/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
