use crate::sync::{ClientConnection, SyncState, invalid_message};
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use regsync_core::{ClientMessage, ServerMessage};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Shared state for WebSocket handler
#[derive(Clone)]
pub struct WsState {
    pub sync_state: Arc<SyncState>,
}

/// WebSocket upgrade handler
pub async fn ws_handler(State(state): State<WsState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle an established WebSocket connection
async fn handle_socket(socket: WebSocket, state: WsState) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // The first text frame must be a join
    let (channel, participant) = match read_join(&mut ws_rx).await {
        Ok(Some(join)) => join,
        Ok(None) => {
            debug!("Connection closed before join");
            return;
        }
        Err(reply) => {
            let _ = send(&mut ws_tx, &reply).await;
            let _ = ws_tx.send(Message::Close(None)).await;
            return;
        }
    };

    let room = match state.sync_state.get_or_create_room(&channel).await {
        Ok(room) => room,
        Err(e) => {
            error!("Failed to open channel {}: {}", channel, e);
            let _ = send(&mut ws_tx, &ServerMessage::error(&e)).await;
            return;
        }
    };

    let mut connection = ClientConnection::new(participant.clone(), room.clone());

    info!(
        "WebSocket joined: participant={}, channel={}, connections={}",
        participant,
        channel,
        room.connection_count()
    );

    // Send initial sync (full state at head)
    if !send(&mut ws_tx, &connection.initial_sync()).await {
        drop(connection);
        state.sync_state.maybe_remove_room(&channel).await;
        return;
    }

    loop {
        tokio::select! {
            // Handle incoming messages from client
            Some(msg) = ws_rx.next() => {
                match msg {
                    Ok(Message::Text(text)) => {
                        let reply = match ClientMessage::from_json(text.as_str()) {
                            Ok(msg) => connection.handle_message(msg).await,
                            Err(e) => {
                                warn!("Unparseable message from {}: {}", participant, e);
                                invalid_message(e.to_string())
                            }
                        };
                        if !send(&mut ws_tx, &reply).await {
                            break;
                        }
                    }
                    Ok(Message::Ping(data)) => {
                        if let Err(e) = ws_tx.send(Message::Pong(data)).await {
                            error!("Failed to send pong: {}", e);
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => {
                        debug!("Client requested close");
                        break;
                    }
                    Err(e) => {
                        error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            // Handle broadcast messages caused by other participants
            Some(broadcast_msg) = connection.recv_broadcast() => {
                if !send(&mut ws_tx, &broadcast_msg).await {
                    break;
                }
            }

            else => break,
        }
    }

    info!(
        "WebSocket disconnected: participant={}, channel={}",
        participant, channel
    );

    // Unsubscribe before checking whether the room is idle
    drop(connection);
    state.sync_state.maybe_remove_room(&channel).await;
}

/// Wait for the join frame. `Ok(None)` means the socket closed first.
async fn read_join(
    ws_rx: &mut SplitStream<WebSocket>,
) -> Result<Option<(String, String)>, ServerMessage> {
    while let Some(msg) = ws_rx.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => return Ok(None),
            _ => continue,
        };

        return match ClientMessage::from_json(text.as_str()) {
            Ok(ClientMessage::Join {
                channel,
                participant,
            }) if !channel.is_empty() => Ok(Some((channel, participant))),
            Ok(ClientMessage::Join { .. }) => {
                Err(invalid_message("channel name must not be empty".to_string()))
            }
            Ok(_) => Err(invalid_message(
                "the first message must be a join".to_string(),
            )),
            Err(e) => Err(invalid_message(e.to_string())),
        };
    }
    Ok(None)
}

/// Send a server message as a text frame. Returns false once the socket is gone.
async fn send(ws_tx: &mut SplitSink<WebSocket, Message>, msg: &ServerMessage) -> bool {
    let text = match msg.to_json() {
        Ok(text) => text,
        Err(e) => {
            error!("Failed to encode message: {}", e);
            return true;
        }
    };
    if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
        error!("Failed to send message: {}", e);
        return false;
    }
    true
}
