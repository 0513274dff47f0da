//! WebSocket plumbing for the base station.
//!
//! Role is fixed by the connect path (`/driver` or `/rover`); everything
//! after the upgrade is the auth gate followed by a single per-connection
//! loop, so inbound messages are processed strictly in arrival order.

use super::{AuthOutcome, Station, CLOSE_INTERNAL, CLOSE_POLICY_VIOLATION};
use crate::protocol::{self, Role};
use axum::{
    extract::{
        ws::{CloseFrame, Message as WsMessage, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;

pub fn create_router(station: Arc<Station>) -> Router {
    Router::new()
        .route("/driver", get(ws_driver))
        .route("/rover", get(ws_rover))
        .with_state(station)
}

async fn ws_driver(
    ws: WebSocketUpgrade,
    State(station): State<Arc<Station>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, station, Role::Driver, addr.to_string()))
}

async fn ws_rover(
    ws: WebSocketUpgrade,
    State(station): State<Arc<Station>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, station, Role::Rover, addr.to_string()))
}

async fn handle_socket(mut socket: WebSocket, station: Arc<Station>, role: Role, addr: String) {
    // Auth gate: the first frame must decode to auth{token}.
    let first = loop {
        match socket.recv().await {
            Some(Ok(WsMessage::Text(text))) => break protocol::decode(text.as_str()),
            Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => continue,
            // Binary frames are not part of this protocol.
            Some(Ok(WsMessage::Binary(_))) => break protocol::decode(""),
            Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => return,
        }
    };

    let (id, mut outbox) = match station.authenticate(role, &addr, first).await {
        AuthOutcome::Accepted { id, outbox } => (id, outbox),
        AuthOutcome::Rejected {
            response,
            close_code,
        } => {
            if let Some(msg) = response {
                send_frame(&mut socket, &msg).await;
            }
            let _ = socket
                .send(WsMessage::Close(Some(CloseFrame {
                    code: close_code,
                    reason: "authentication required".into(),
                })))
                .await;
            return;
        }
    };

    loop {
        tokio::select! {
            out = outbox.recv() => match out {
                Some(msg) => {
                    if !send_frame(&mut socket, &msg).await {
                        break;
                    }
                }
                None => break,
            },
            frame = socket.recv() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    let msg = match station.decode_or_report(id, text.as_str()).await {
                        Some(msg) => msg,
                        None => continue,
                    };
                    // A second auth on a live connection is a policy violation.
                    if matches!(msg, protocol::Message::Auth { .. }) {
                        let _ = socket
                            .send(WsMessage::Close(Some(CloseFrame {
                                code: CLOSE_POLICY_VIOLATION,
                                reason: "already authenticated".into(),
                            })))
                            .await;
                        break;
                    }
                    if !station.handle_message(id, msg).await {
                        let _ = socket
                            .send(WsMessage::Close(Some(CloseFrame {
                                code: CLOSE_INTERNAL,
                                reason: "sender not registered".into(),
                            })))
                            .await;
                        break;
                    }
                }
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    station.handle_disconnect(id).await;
}

/// Encodes and writes one frame. Returns false when the socket is gone.
async fn send_frame(socket: &mut WebSocket, msg: &protocol::Message) -> bool {
    match protocol::encode(msg) {
        Ok(frame) => socket.send(WsMessage::Text(frame.into())).await.is_ok(),
        Err(e) => {
            tracing::error!(error = %e, tag = msg.tag(), "Failed to encode outbound message");
            true
        }
    }
}
