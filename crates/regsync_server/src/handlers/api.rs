use crate::sync::SyncState;
use axum::{
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
};
use regsync_core::{RegsyncError, RevisionSummary};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;

/// Shared state for API handlers
#[derive(Clone)]
pub struct ApiState {
    pub sync_state: Arc<SyncState>,
}

/// Server status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
    pub version: String,
    pub active_connections: usize,
    pub active_rooms: usize,
    pub snapshot_interval: u64,
}

/// Channel info response
#[derive(Debug, Serialize)]
pub struct ChannelResponse {
    pub channel: String,
    pub head: u64,
    pub latest_snapshot: u64,
    pub connections: usize,
}

/// One history entry
#[derive(Debug, Serialize)]
pub struct HistoryEntry {
    #[serde(flatten)]
    pub summary: RevisionSummary,
    /// RFC 3339 rendering of the stored timestamp
    pub created_at: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

/// Revision store error rendered as an HTTP response
pub struct ApiError(RegsyncError);

impl From<RegsyncError> for ApiError {
    fn from(err: RegsyncError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RegsyncError::RevisionNotFound { .. } => StatusCode::NOT_FOUND,
            err => {
                error!("API request failed: {}", err);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(self.0.to_serializable())).into_response()
    }
}

/// Create API routes
pub fn api_routes(state: ApiState) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/channels", get(list_channels))
        .route("/channels/{channel}", get(get_channel))
        .route(
            "/channels/{channel}/revisions/{revision}",
            get(get_revision),
        )
        .route("/channels/{channel}/history", get(get_history))
        .with_state(state)
}

/// GET /api/status - Get server status
async fn get_status(State(state): State<ApiState>) -> impl IntoResponse {
    let stats = state.sync_state.get_stats().await;

    Json(StatusResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_connections: stats.active_connections,
        active_rooms: stats.active_rooms,
        snapshot_interval: state.sync_state.store().snapshot_interval(),
    })
}

/// GET /api/channels - List channels with history
async fn list_channels(State(state): State<ApiState>) -> Result<Json<Vec<String>>, ApiError> {
    Ok(Json(state.sync_state.store().channels()?))
}

/// GET /api/channels/{channel} - Head and latest snapshot of a channel
async fn get_channel(
    State(state): State<ApiState>,
    Path(channel): Path<String>,
) -> Result<Json<ChannelResponse>, ApiError> {
    let store = state.sync_state.store();
    let head = store.head(&channel)?;
    let latest_snapshot = store.latest_snapshot_at_or_before(&channel, head)?;
    let connections = match state.sync_state.get_room(&channel).await {
        Some(room) => room.connection_count(),
        None => 0,
    };

    Ok(Json(ChannelResponse {
        channel,
        head,
        latest_snapshot,
        connections,
    }))
}

/// GET /api/channels/{channel}/revisions/{revision} - Snapshot at a revision
async fn get_revision(
    State(state): State<ApiState>,
    Path((channel, revision)): Path<(String, u64)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let snapshot = state.sync_state.store().checkout(&channel, revision)?;
    Ok(Json(snapshot.to_value()))
}

/// GET /api/channels/{channel}/history?limit=N - Revisions, newest first
async fn get_history(
    State(state): State<ApiState>,
    Path(channel): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<HistoryEntry>>, ApiError> {
    let entries = state
        .sync_state
        .store()
        .history(&channel, query.limit)?
        .into_iter()
        .map(|summary| HistoryEntry {
            created_at: chrono::DateTime::from_timestamp_millis(summary.timestamp)
                .map(|t| t.to_rfc3339()),
            summary,
        })
        .collect();

    Ok(Json(entries))
}
