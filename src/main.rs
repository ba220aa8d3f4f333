mod backend;
mod bridge;
mod client;
mod config;
mod error;
mod handoff;
mod invite;
mod presence;
mod store;
mod types;

#[cfg(test)]
mod testutil;

use std::collections::HashMap;
use std::sync::Arc;

use askama::Template;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tower_http::services::ServeDir;

use crate::backend::Backend;
use crate::client::LobbyCommand;
use crate::error::LobbyError;
use crate::store::MatchStore;
use crate::types::*;

#[derive(Clone)]
struct AppState {
    backend: Arc<Backend>,
}

// ─── Templates ────────────────────────────────────────────────────

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    online: usize,
    expiry_secs: u64,
}

// ─── Routes ───────────────────────────────────────────────────────

async fn index_page(State(state): State<AppState>) -> impl IntoResponse {
    let page = IndexTemplate {
        online: state.backend.presence.online_count(),
        expiry_secs: state.backend.config.invite_expiry_secs,
    };
    match page.render() {
        Ok(html) => Html(html).into_response(),
        Err(e) => {
            tracing::error!("Failed to render index: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Marks a match finished so a late acceptance event can't start it again.
async fn finish_match(State(state): State<AppState>, Path(match_id): Path<String>) -> impl IntoResponse {
    match state.backend.store.finish_match(&match_id).await {
        Ok(invite) => (StatusCode::OK, Json(invite)).into_response(),
        Err(LobbyError::NotFound(_)) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            tracing::warn!("Failed to finish match {}: {}", match_id, e);
            StatusCode::CONFLICT.into_response()
        }
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(user_id) = params.get("userId").filter(|id| !id.is_empty()).cloned() else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    let identity = PlayerIdentity {
        username: params.get("username").cloned().unwrap_or_else(|| "Unknown".to_string()),
        avatar_ref: params.get("avatar").cloned(),
        vip_display: VipDisplay::default(),
        language: params.get("language").cloned(),
        user_id,
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, identity))
        .into_response()
}

async fn handle_socket(socket: WebSocket, state: AppState, identity: PlayerIdentity) {
    let (mut sender, mut receiver) = socket.split();

    let socket_id = uuid::Uuid::new_v4().to_string();
    tracing::info!("WebSocket connected: {} user: {}", socket_id, identity.user_id);

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerMsg>();
    let handle = client::spawn_client(&state.backend, identity, out_tx);

    // Forward everything the lobby client emits to this socket
    let event_task = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if !send_msg(&mut sender, &msg).await {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        let Message::Text(text) = msg else { continue };

        let client_msg: ClientMsg = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("Invalid message: {}", e);
                continue;
            }
        };

        if handle.cmd_tx.send(LobbyCommand::from(client_msg)).await.is_err() {
            break;
        }
    }

    // Dropping the handle ends the client task, which leaves presence
    tracing::info!("WebSocket disconnected: {} user: {}", socket_id, handle.user_id);
    drop(handle);
    event_task.abort();
}

async fn send_msg(sender: &mut SplitSink<WebSocket, Message>, msg: &ServerMsg) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => sender.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            tracing::warn!("Failed to encode message: {}", e);
            true
        }
    }
}

// ─── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    config::init().expect("Failed to initialise config directory");
    let lobby_config = config::load().expect("Invalid lobby config");

    let port: u16 = std::env::var("PORT")
        .unwrap_or_else(|_| "3000".to_string())
        .parse()
        .expect("Invalid PORT");

    let backend = Backend::new(lobby_config);
    backend.spawn_expiry_sweep();

    let state = AppState { backend };

    let app = Router::new()
        .route("/", get(index_page))
        .route("/ws", get(ws_handler))
        .route("/api/matches/{match_id}/finish", post(finish_match))
        .nest_service("/static", ServeDir::new("static"))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .expect("Failed to bind");

    tracing::info!("Lobby server running on port {}", port);

    axum::serve(listener, app).await.unwrap();
}
