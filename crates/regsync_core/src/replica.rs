//! Participant-side state of one channel.
//!
//! A [`Replica`] is transport-agnostic: feed it every [`ServerMessage`] the
//! channel receives and send back whatever [`ClientMessage`] it returns.

use crate::apply::Applier;
use crate::error::{RegsyncError, Result};
use crate::identity;
use crate::patch::Patch;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::registry::Snapshot;

/// Local copy of a channel at a known revision.
///
/// Revision 0 means nothing has been received yet.
#[derive(Clone)]
pub struct Replica {
    channel: String,
    participant: String,
    snapshot: Snapshot,
    revision: u64,
    /// State submitted in a commit that the server has not acknowledged yet
    pending: Option<Snapshot>,
    applier: Applier,
}

impl Replica {
    pub fn new(channel: impl Into<String>, participant: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            participant: participant.into(),
            snapshot: Snapshot::empty(),
            revision: 0,
            pending: None,
            applier: Applier::new(),
        }
    }

    /// Use `applier` (and its hooks) for incoming patches.
    pub fn with_applier(mut self, applier: Applier) -> Self {
        self.applier = applier;
        self
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn has_pending_commit(&self) -> bool {
        self.pending.is_some()
    }

    pub fn join_message(&self) -> ClientMessage {
        ClientMessage::Join {
            channel: self.channel.clone(),
            participant: self.participant.clone(),
        }
    }

    /// Ask for whatever brings this replica up to head.
    pub fn update_request(&self) -> ClientMessage {
        ClientMessage::Update {
            from_revision: (self.revision > 0).then_some(self.revision),
        }
    }

    /// Propose `next` as the channel's new state.
    ///
    /// Returns `None` when nothing changed or a commit is already awaiting
    /// acknowledgement.
    pub fn commit(&mut self, next: Snapshot) -> Option<ClientMessage> {
        if self.pending.is_some() {
            log::debug!("{}: commit already in flight", self.channel);
            return None;
        }
        let diff = identity::diff(&self.snapshot, &next);
        if diff.is_empty() {
            return None;
        }
        let patch = Patch::from_diff(&diff);
        self.pending = Some(next);
        Some(ClientMessage::commit(self.revision, &patch))
    }

    /// Process a message from the server, returning the follow-up request
    /// if one is needed.
    pub fn handle(&mut self, message: ServerMessage) -> Result<Option<ClientMessage>> {
        match message {
            ServerMessage::Snapshot { revision, data } => {
                self.snapshot = Snapshot::from_value(data)?;
                self.revision = revision;
                Ok(None)
            }
            ServerMessage::Patch {
                base_revision,
                revision,
                data,
            } => {
                if revision <= self.revision {
                    return Ok(None);
                }
                if base_revision != self.revision {
                    log::debug!(
                        "{}: patch {}->{} does not follow revision {}",
                        self.channel,
                        base_revision,
                        revision,
                        self.revision
                    );
                    return Ok(Some(self.update_request()));
                }
                match self.apply_patch_value(&data) {
                    Ok(next) => {
                        self.snapshot = next;
                        self.revision = revision;
                        Ok(None)
                    }
                    Err(err) => {
                        log::warn!("{}: discarding local state: {}", self.channel, err);
                        Ok(Some(ClientMessage::Update {
                            from_revision: None,
                        }))
                    }
                }
            }
            ServerMessage::Committed { revision } => {
                if let Some(next) = self.pending.take() {
                    self.snapshot = next;
                    self.revision = revision;
                }
                Ok(None)
            }
            ServerMessage::Error { kind, message, .. } => {
                log::warn!("{}: server error {}: {}", self.channel, kind, message);
                self.pending = None;
                Ok(Some(self.update_request()))
            }
            ServerMessage::PeerJoined { .. } | ServerMessage::PeerLeft { .. } => Ok(None),
        }
    }

    fn apply_patch_value(&self, data: &serde_json::Value) -> Result<Snapshot> {
        let patch = Patch::from_value(data)?;
        let next = self.applier.apply_patch(&patch, &self.snapshot)?;
        if !next.registry().orphans().is_empty() {
            return Err(RegsyncError::UnresolvedPath(
                next.registry().orphans().join(", "),
            ));
        }
        Ok(next)
    }
}
