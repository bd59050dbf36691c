//! Regsync Sync Server
//!
//! Relays registry patches between the participants of named channels and
//! keeps each channel's revision history in SQLite.
//!
//! ## Protocol
//!
//! Clients connect to `/sync` over WebSocket and exchange JSON text frames
//! (see [`regsync_core::protocol`]). The first frame must be a `join`; the
//! server answers with the channel's snapshot at head.
//!
//! ## Environment Variables
//!
//! - `HOST`: Server host (default: 0.0.0.0)
//! - `PORT`: Server port (default: 3030)
//! - `DATABASE_PATH`: Path to the SQLite revision log (default: ./regsync.db)
//! - `SNAPSHOT_INTERVAL`: Revisions between forced snapshots (default: 20)
//! - `BROADCAST_CAPACITY`: Per-channel broadcast buffer (default: 1024)
//! - `CORS_ORIGINS`: Comma-separated list of allowed origins

pub mod config;
pub mod handlers;
pub mod sync;

use axum::{
    Router,
    http::{HeaderValue, Method, header},
    routing::get,
};
use handlers::{api::ApiState, api_routes, ws::WsState, ws_handler};
use std::sync::Arc;
use sync::SyncState;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::warn;

pub use config::Config;

/// Build the HTTP router: health checks, the `/sync` socket and `/api`.
pub fn router(sync_state: Arc<SyncState>, cors_origins: &[String]) -> Router {
    let api_state = ApiState {
        sync_state: sync_state.clone(),
    };
    let ws_state = WsState { sync_state };

    Router::new()
        // Health check
        .route("/", get(|| async { "Regsync Sync Server" }))
        .route("/health", get(|| async { "OK" }))
        // WebSocket sync endpoint
        .route("/sync", get(ws_handler).with_state(ws_state))
        // API routes
        .nest("/api", api_routes(api_state))
        .layer(cors_layer(cors_origins))
        .layer(TraceLayer::new_for_http())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    if origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin: {}", origin);
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}
