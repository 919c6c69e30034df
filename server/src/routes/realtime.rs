//! Realtime WebSocket endpoint.

use axum::{
    extract::{State, WebSocketUpgrade},
    response::Response,
    routing::get,
    Router,
};

use crate::websocket::handle_websocket_connection;
use crate::AppState;

/// Create realtime routes.
pub fn routes() -> Router<AppState> {
    Router::new().route("/realtime", get(realtime_handler))
}

/// GET /realtime - Upgrade to a change-feed socket.
async fn realtime_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| {
        handle_websocket_connection(socket, state.store, state.conn_manager)
    })
}
