pub mod handlers;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{sink::SinkExt, stream::StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

use crate::protocol::{ClientMessage, ServerMessage};
use crate::state::AppState;

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    tracing::info!("WebSocket connection request");
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn encode(msg: &ServerMessage) -> Option<Message> {
    match serde_json::to_string(msg) {
        Ok(json) => Some(Message::Text(json.into())),
        Err(e) => {
            tracing::error!("Failed to serialize server message: {}", e);
            None
        }
    }
}

/// Handle individual WebSocket connection.
///
/// All writes to the socket happen in this task, so concurrent broker
/// deliveries are serialized through the broadcast channel.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    // Subscribe before the snapshot so no update falls in between
    let mut broadcast_rx = state.broadcast.subscribe();

    let welcome = ServerMessage::Welcome {
        profile: state.bindings.profile,
        client_id: state.bindings.client_id.clone(),
        orders: state.all_orders().await,
    };
    if let Some(msg) = encode(&welcome) {
        if sender.send(msg).await.is_err() {
            tracing::error!("Failed to send welcome message");
            return;
        }
    }

    tracing::info!("WebSocket connected");

    loop {
        tokio::select! {
            broadcast_msg = broadcast_rx.recv() => {
                let outgoing = match broadcast_msg {
                    Ok(msg) => msg,
                    Err(RecvError::Lagged(skipped)) => {
                        // Stock ticks are gone, but the order book can be re-sent whole
                        tracing::warn!("WebSocket lagged, skipped {} message(s)", skipped);
                        ServerMessage::Orders {
                            orders: state.all_orders().await,
                        }
                    }
                    Err(RecvError::Closed) => break,
                };
                if let Some(msg) = encode(&outgoing) {
                    if sender.send(msg).await.is_err() {
                        break;
                    }
                }
            }

            ws_msg = receiver.next() => {
                match ws_msg {
                    Some(Ok(Message::Text(text))) => {
                        tracing::debug!("Received message: {}", text);

                        let response = match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(client_msg) => handlers::handle_message(client_msg, &state).await,
                            Err(e) => {
                                tracing::warn!("Failed to parse client message: {}", e);
                                Some(ServerMessage::error(
                                    "PARSE_ERROR",
                                    format!("Invalid message format: {}", e),
                                ))
                            }
                        };

                        if let Some(msg) = response.as_ref().and_then(encode) {
                            if sender.send(msg).await.is_err() {
                                tracing::error!("Failed to send response");
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        tracing::info!("WebSocket closed");
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!("WebSocket error: {}", e);
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    tracing::info!("WebSocket connection closed");
}
