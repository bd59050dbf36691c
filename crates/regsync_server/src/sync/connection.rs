use super::{RoomEvent, SyncRoom};
use regsync_core::{ClientMessage, ServerMessage};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

/// Represents a joined participant
pub struct ClientConnection {
    pub id: Uuid,
    pub participant: String,
    room: Arc<SyncRoom>,
    broadcast_rx: broadcast::Receiver<RoomEvent>,
}

impl ClientConnection {
    /// Subscribe `participant` to `room` and announce them to the others
    pub fn new(participant: String, room: Arc<SyncRoom>) -> Self {
        let broadcast_rx = room.subscribe();
        let id = Uuid::new_v4();

        room.broadcast(
            id,
            ServerMessage::PeerJoined {
                participant: participant.clone(),
                peer_count: room.connection_count(),
            },
        );

        Self {
            id,
            participant,
            room,
            broadcast_rx,
        }
    }

    /// Get the initial sync message (full state at head)
    pub fn initial_sync(&self) -> ServerMessage {
        self.room
            .head_snapshot()
            .unwrap_or_else(|err| ServerMessage::error(&err))
    }

    /// Handle an incoming message from the client
    pub async fn handle_message(&self, msg: ClientMessage) -> ServerMessage {
        self.room.handle_message(self.id, msg).await
    }

    /// Receive the next broadcast caused by another connection
    pub async fn recv_broadcast(&mut self) -> Option<ServerMessage> {
        loop {
            match self.broadcast_rx.recv().await {
                Ok((sender, _)) if sender == self.id => continue,
                Ok((_, msg)) => return Some(msg),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(
                        "Participant {} lagged {} messages, sending full state",
                        self.participant, n
                    );
                    return Some(self.initial_sync());
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        self.room.unsubscribe();
        self.room.broadcast(
            self.id,
            ServerMessage::PeerLeft {
                participant: self.participant.clone(),
                peer_count: self.room.connection_count(),
            },
        );
        debug!(
            "Participant disconnected: participant={}, channel={}",
            self.participant,
            self.room.channel()
        );
    }
}
