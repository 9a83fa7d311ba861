//! Lobby WebSocket: one writer task draining the connection's queue, one
//! reader task watching for `leave` and liveness.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use lieability_protocol::ClientMessage;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::coordinator::{Coordinator, LobbyConnection};
use crate::error::LobbyError;
use crate::hub::{Outbound, Role, CLOSE_NOT_FOUND, CLOSE_UNAUTHORIZED};
use crate::routes::AppState;

#[derive(Debug, Deserialize)]
pub struct WsParams {
    token: Option<String>,
}

/// Credentials are checked before the upgrade so a bad token gets a plain
/// 401/404 instead of a socket.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(code): Path<String>,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> Result<Response, LobbyError> {
    let role = state
        .coordinator
        .authorize_connection(&code, params.token.as_deref())?;
    let coordinator = state.coordinator.clone();
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, coordinator, code, role)))
}

async fn handle_socket(
    mut socket: WebSocket,
    coordinator: Coordinator,
    code: String,
    role: Role,
) {
    let (conn, rx) = match coordinator.attach(&code, role) {
        Ok(attached) => attached,
        Err(err) => {
            // lobby or player vanished between authorization and upgrade
            let close_code = match err {
                LobbyError::NotFound => CLOSE_NOT_FOUND,
                _ => CLOSE_UNAUTHORIZED,
            };
            let frame = CloseFrame {
                code: close_code,
                reason: err.to_string().into(),
            };
            let _ = socket.send(Message::Close(Some(frame))).await;
            return;
        }
    };
    tracing::debug!(%code, conn = %conn.id, ?role, "socket attached");

    let config = coordinator.config();
    let heartbeat = config.heartbeat_interval;
    let client_timeout = config.client_timeout;
    let conn = Arc::new(conn);
    let (ws_tx, ws_rx) = socket.split();

    let mut writer = tokio::spawn(write_loop(ws_tx, rx, heartbeat));
    let mut reader = tokio::spawn(read_loop(ws_rx, Arc::clone(&conn), client_timeout));

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    conn.detach();
    tracing::debug!(%code, conn = %conn.id, "socket detached");
}

async fn write_loop(
    mut ws_tx: futures::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
    heartbeat: Duration,
) {
    let mut ping_interval = tokio::time::interval(heartbeat);
    ping_interval.tick().await; // first tick is immediate

    loop {
        tokio::select! {
            out = rx.recv() => match out {
                Some(Outbound::Frame(text)) => {
                    if ws_tx.send(Message::Text(text.to_string())).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Close { code, reason }) => {
                    let frame = CloseFrame {
                        code,
                        reason: reason.into(),
                    };
                    let _ = ws_tx.send(Message::Close(Some(frame))).await;
                    break;
                }
                // hub dropped this connection (slow consumer or detached)
                None => break,
            },
            _ = ping_interval.tick() => {
                if ws_tx.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn read_loop(
    mut ws_rx: futures::stream::SplitStream<WebSocket>,
    conn: Arc<LobbyConnection>,
    client_timeout: Duration,
) {
    loop {
        let msg = match tokio::time::timeout(client_timeout, ws_rx.next()).await {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(err))) => {
                tracing::debug!(conn = %conn.id, error = %err, "socket read failed");
                break;
            }
            Ok(None) => break,
            Err(_) => {
                tracing::debug!(conn = %conn.id, "client went quiet, closing");
                break;
            }
        };
        match msg {
            Message::Text(text) => {
                if let Ok(ClientMessage::Leave) = serde_json::from_str(&text) {
                    // the hub answers with a close frame through the writer
                    if let Err(err) = conn.leave() {
                        tracing::debug!(conn = %conn.id, error = %err, "leave refused");
                    }
                }
            }
            Message::Close(_) => break,
            // pings are answered by the transport; pongs only count as liveness
            _ => {}
        }
    }
}
