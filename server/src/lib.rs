//! livesync server - reference backend for live collection sync.
//!
//! Serves collection queries over REST and change feeds over a multiplexed
//! WebSocket. Data lives in memory and may be seeded from a JSON file at
//! start-up.

pub mod config;
pub mod error;
pub mod routes;
pub mod seed;
pub mod websocket;

use std::sync::Arc;

use axum::Router;
use livesync_client::MemorySource;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::websocket::ConnectionManager;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<MemorySource>,
    pub config: Arc<Config>,
    pub conn_manager: Arc<ConnectionManager>,
}

impl AppState {
    /// State over an empty store.
    pub fn new(config: Config) -> Self {
        Self {
            store: Arc::new(MemorySource::new()),
            config: Arc::new(config),
            conn_manager: ConnectionManager::new_shared(),
        }
    }
}

/// Build the application router.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(routes::create_routes())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
