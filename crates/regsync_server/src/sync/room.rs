use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use regsync_core::{
    ClientMessage, CommitSerializer, Patch, RegsyncError, RevisionStore, SerializableError,
    ServerMessage,
};
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A message fanned out to a room, tagged with the connection that caused it
pub type RoomEvent = (Uuid, ServerMessage);

/// Statistics about the sync state
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    pub active_connections: usize,
    pub active_rooms: usize,
}

/// Global sync state managing all rooms
pub struct SyncState {
    /// Map of channel name to SyncRoom
    rooms: RwLock<HashMap<String, Arc<SyncRoom>>>,
    /// Revision history shared by every channel
    store: RevisionStore,
    /// Per-channel commit locks
    commits: Arc<CommitSerializer>,
    /// Buffer size of each room's broadcast channel
    broadcast_capacity: usize,
}

impl SyncState {
    pub fn new(store: RevisionStore, broadcast_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            store,
            commits: Arc::new(CommitSerializer::new()),
            broadcast_capacity: broadcast_capacity.max(1),
        }
    }

    pub fn store(&self) -> &RevisionStore {
        &self.store
    }

    /// Get or create the room for a channel, bootstrapping its history
    pub async fn get_or_create_room(&self, channel: &str) -> Result<Arc<SyncRoom>, RegsyncError> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(channel) {
                return Ok(room.clone());
            }
        }

        let mut rooms = self.rooms.write().await;

        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(channel) {
            return Ok(room.clone());
        }

        let room = Arc::new(SyncRoom::new(
            channel,
            self.store.clone(),
            self.commits.clone(),
            self.broadcast_capacity,
        )?);
        rooms.insert(channel.to_string(), room.clone());
        info!("Created sync room for channel: {}", channel);

        Ok(room)
    }

    /// Get an existing room (does not create if not found)
    pub async fn get_room(&self, channel: &str) -> Option<Arc<SyncRoom>> {
        let rooms = self.rooms.read().await;
        rooms.get(channel).cloned()
    }

    /// Remove a room if it has no active connections
    pub async fn maybe_remove_room(&self, channel: &str) {
        let mut rooms = self.rooms.write().await;

        if let Some(room) = rooms.get(channel)
            && room.connection_count() == 0
        {
            rooms.remove(channel);
            self.commits.prune();
            info!("Removed idle sync room: {}", channel);
        }
    }

    pub async fn get_stats(&self) -> SyncStats {
        let rooms = self.rooms.read().await;
        SyncStats {
            active_connections: rooms.values().map(|r| r.connection_count()).sum(),
            active_rooms: rooms.len(),
        }
    }
}

/// Coordinator for a single channel.
///
/// Reads (checkout, update) go straight to the revision store; commits and
/// resets run under the channel's commit lock so they are totally ordered
/// together with the broadcasts they produce.
pub struct SyncRoom {
    channel: String,
    store: RevisionStore,
    commits: Arc<CommitSerializer>,
    broadcast_tx: broadcast::Sender<RoomEvent>,
    connection_count: AtomicUsize,
}

impl SyncRoom {
    pub fn new(
        channel: &str,
        store: RevisionStore,
        commits: Arc<CommitSerializer>,
        broadcast_capacity: usize,
    ) -> Result<Self, RegsyncError> {
        let head = store.ensure_channel(channel)?;
        debug!("Channel {} opened at revision {}", channel, head);

        let (broadcast_tx, _) = broadcast::channel(broadcast_capacity);

        Ok(Self {
            channel: channel.to_string(),
            store,
            commits,
            broadcast_tx,
            connection_count: AtomicUsize::new(0),
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Subscribe to room broadcasts
    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.connection_count.fetch_add(1, Ordering::SeqCst);
        self.broadcast_tx.subscribe()
    }

    /// Unsubscribe from room broadcasts
    pub fn unsubscribe(&self) {
        self.connection_count.fetch_sub(1, Ordering::SeqCst);
    }

    /// Get the number of active connections
    pub fn connection_count(&self) -> usize {
        self.connection_count.load(Ordering::SeqCst)
    }

    /// Send `msg` to every subscriber except `sender`.
    pub fn broadcast(&self, sender: Uuid, msg: ServerMessage) {
        // No receivers is not an error here.
        let _ = self.broadcast_tx.send((sender, msg));
    }

    /// Full state at head.
    pub fn head_snapshot(&self) -> Result<ServerMessage, RegsyncError> {
        let head = self.store.head(&self.channel)?;
        let snapshot = self.store.checkout(&self.channel, head)?;
        Ok(ServerMessage::snapshot(head, &snapshot))
    }

    /// Handle a message from connection `sender` and return the reply
    pub async fn handle_message(&self, sender: Uuid, msg: ClientMessage) -> ServerMessage {
        let result = match msg {
            ClientMessage::Checkout { revision } => self.checkout(revision),
            ClientMessage::Update { from_revision } => self.update(from_revision),
            ClientMessage::Commit {
                base_revision,
                patch,
            } => self.commit(sender, base_revision, &patch).await,
            ClientMessage::Reset { channel } => {
                if channel != self.channel {
                    return invalid_message(format!(
                        "cannot reset channel '{}' from channel '{}'",
                        channel, self.channel
                    ));
                }
                self.reset(sender).await
            }
            ClientMessage::Join { .. } => {
                return invalid_message(format!("already joined channel '{}'", self.channel));
            }
        };

        result.unwrap_or_else(|err| {
            warn!("Channel {}: {}", self.channel, err);
            ServerMessage::error(&err)
        })
    }

    fn checkout(&self, revision: u64) -> Result<ServerMessage, RegsyncError> {
        let snapshot = self.store.checkout(&self.channel, revision)?;
        Ok(ServerMessage::snapshot(revision, &snapshot))
    }

    /// Bring a participant at `from` up to head.
    ///
    /// A participant more than one snapshot interval behind (or with no
    /// state at all) gets the full snapshot instead of a long diff chain.
    fn update(&self, from: Option<u64>) -> Result<ServerMessage, RegsyncError> {
        let head = self.store.head(&self.channel)?;
        match from {
            Some(from) if from == head => Ok(ServerMessage::patch(head, head, &Patch::new())),
            Some(from)
                if from >= 1 && from < head && head - from <= self.store.snapshot_interval() =>
            {
                let diff = self.store.diff(&self.channel, from, head)?;
                Ok(ServerMessage::patch(from, head, &Patch::from_diff(&diff)))
            }
            _ => self.head_snapshot(),
        }
    }

    async fn commit(
        &self,
        sender: Uuid,
        base: u64,
        patch: &serde_json::Value,
    ) -> Result<ServerMessage, RegsyncError> {
        let patch = Patch::from_value(patch)?;
        let _guard = self.commits.acquire(&self.channel).await;

        let revision = self.store.commit(&self.channel, base, &patch)?;
        info!(
            "Channel {}: revision {} committed ({} entries)",
            self.channel,
            revision,
            patch.len()
        );
        self.broadcast(sender, ServerMessage::patch(base, revision, &patch));

        Ok(ServerMessage::Committed { revision })
    }

    async fn reset(&self, sender: Uuid) -> Result<ServerMessage, RegsyncError> {
        let _guard = self.commits.acquire(&self.channel).await;

        self.store.reset(&self.channel)?;
        let snapshot = self.head_snapshot()?;
        self.broadcast(sender, snapshot.clone());

        Ok(snapshot)
    }
}

/// Error reply for a frame that is not a valid request in its context.
pub(crate) fn invalid_message(message: String) -> ServerMessage {
    SerializableError {
        kind: "InvalidMessage".to_string(),
        message,
        path: None,
    }
    .into()
}
