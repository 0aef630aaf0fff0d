//! Observer websocket endpoint.

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    response::IntoResponse,
};

use super::AppState;
use crate::hub::serve_socket;

/// Upgrade to a websocket and attach it to the notification hub.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| serve_socket(socket, hub))
}
