//! WebSocket bridge between one browser tab and one session

use super::AppState;
use crate::protocol::{dispatch, ClientMessage, ServerEvent};
use crate::session::{ConnectRequest, Connection};
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsQuery {
    pub session: Option<String>,
    pub path: Option<String>,
    #[serde(default)]
    pub start_claude: bool,
}

impl From<WsQuery> for ConnectRequest {
    fn from(query: WsQuery) -> Self {
        ConnectRequest {
            session_id: query.session.filter(|s| !s.is_empty()),
            project_path: query.path.filter(|p| !p.is_empty()).map(PathBuf::from),
            start_cli: query.start_claude,
        }
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.into()))
}

async fn handle_socket(socket: WebSocket, state: AppState, request: ConnectRequest) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let Connection {
        session_id,
        client_id,
        mut events,
        ..
    } = match state.registry.connect(request).await {
        Ok(connection) => connection,
        Err(e) => {
            tracing::warn!("WebSocket connect failed: {}", e);
            let _ = ws_tx
                .send(Message::Text(ServerEvent::from(e).to_json()))
                .await;
            let _ = ws_tx
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::ERROR,
                    reason: "session unavailable".into(),
                })))
                .await;
            return;
        }
    };

    loop {
        tokio::select! {
            // Session events -> WebSocket
            event = events.recv() => {
                match event {
                    Some(event) => {
                        if ws_tx.send(Message::Text(event.to_json())).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        // Unbound by the session: killed, exited or replaced
                        tracing::debug!("Session {}: client {} released", session_id, client_id);
                        let _ = ws_tx
                            .send(Message::Close(Some(CloseFrame {
                                code: close_code::NORMAL,
                                reason: "session closed".into(),
                            })))
                            .await;
                        break;
                    }
                }
            }

            // WebSocket -> session
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let reply = match ClientMessage::parse(&text) {
                            Ok(message) => {
                                match dispatch(&state.registry, &session_id, message).await {
                                    Ok(reply) => reply,
                                    Err(e) => Some(ServerEvent::from(e)),
                                }
                            }
                            Err(e) => {
                                tracing::debug!("Session {}: malformed message: {}", session_id, e);
                                Some(ServerEvent::error(format!("Invalid message: {}", e)))
                            }
                        };
                        if let Some(reply) = reply {
                            if ws_tx.send(Message::Text(reply.to_json())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue, // Ping/Pong handled automatically
                    Some(Err(e)) => {
                        tracing::debug!("Session {}: socket error: {}", session_id, e);
                        break;
                    }
                }
            }
        }
    }

    state.registry.detach(&session_id, client_id).await;
}
