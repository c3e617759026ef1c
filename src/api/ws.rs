//! WebSocket viewer connections
//!
//! Every socket is one viewer of a shared session: it receives the full
//! tree on connect, then the session's fan-out, and may drive the run
//! loop with directed messages, interrupts, and input answers.

use super::types::ClientMessage;
use super::AppState;
use crate::runloop::RedirectMessage;
use crate::session::{Session, ViewerEvent};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;

pub async fn session_socket(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let session = state
        .registry
        .get_or_create(&session_id, &state.default_spec)
        .await;
    ws.on_upgrade(move |socket| handle_socket(socket, session))
}

async fn handle_socket(socket: WebSocket, session: Arc<Session>) {
    let (mut sink, mut stream) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel();
    // Late joiners see the whole tree before the live fan-out.
    let _ = tx.send(ViewerEvent::TreeUpdate {
        snapshot: session.snapshot(),
    });
    let connection = session.attach(tx.clone());

    let forward = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let Ok(text) = serde_json::to_string(&event) else {
                continue;
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = stream.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::UserDirectedMessage {
                content,
                target_agent,
                trim_count,
            }) => {
                session
                    .send_directed(RedirectMessage {
                        content,
                        target: target_agent,
                        trim_count,
                    })
                    .await;
            }
            Ok(ClientMessage::UserInterrupt {}) => {
                session.interrupt();
            }
            Ok(ClientMessage::AgentInputResponse {
                request_id,
                user_input,
            }) => {
                if !session.resolve_input(&request_id, &user_input) {
                    // Stale answer; only this viewer needs to know.
                    let _ = tx.send(ViewerEvent::Error {
                        message: format!("input request {request_id} is no longer pending"),
                    });
                }
            }
            Err(e) => {
                tracing::debug!(session_id = %session.id, error = %e, "unparseable client message");
                let _ = tx.send(ViewerEvent::Error {
                    message: format!("malformed message: {e}"),
                });
            }
        }
    }

    session.detach(connection);
    forward.abort();
    tracing::debug!(session_id = %session.id, "viewer socket closed");
}
