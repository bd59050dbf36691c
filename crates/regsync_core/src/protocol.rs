//! Wire messages exchanged over a channel subscription.
//!
//! Messages are JSON text frames tagged by `type`:
//!
//! ```json
//! {"type":"commit","base_revision":4,"patch":{"r":{"x":[400]}}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use ts_rs::TS;

use crate::error::{RegsyncError, Result, SerializableError};
use crate::patch::Patch;
use crate::registry::Snapshot;

/// Messages sent by a participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(tag = "type", rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum ClientMessage {
    /// Subscribe to a channel. Must be the first message of a session.
    Join { channel: String, participant: String },

    /// Request the full snapshot at a revision.
    Checkout { revision: u64 },

    /// Request whatever brings a replica at `from_revision` up to head.
    Update {
        #[serde(default)]
        from_revision: Option<u64>,
    },

    /// Submit a patch made against `base_revision`.
    Commit { base_revision: u64, patch: Value },

    /// Truncate the channel's history to revision 1.
    Reset { channel: String },
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(tag = "type", rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum ServerMessage {
    /// Full state at `revision`.
    Snapshot { revision: u64, data: Value },

    /// Patch taking a replica from `base_revision` to `revision`.
    Patch {
        base_revision: u64,
        revision: u64,
        data: Value,
    },

    /// The submitter's commit was stored as `revision`.
    Committed { revision: u64 },

    Error {
        kind: String,
        message: String,
        path: Option<String>,
    },

    PeerJoined { participant: String, peer_count: usize },

    PeerLeft { participant: String, peer_count: usize },
}

impl ClientMessage {
    pub fn commit(base_revision: u64, patch: &Patch) -> Self {
        ClientMessage::Commit {
            base_revision,
            patch: patch.to_value(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

impl ServerMessage {
    pub fn snapshot(revision: u64, snapshot: &Snapshot) -> Self {
        ServerMessage::Snapshot {
            revision,
            data: snapshot.to_value(),
        }
    }

    pub fn patch(base_revision: u64, revision: u64, patch: &Patch) -> Self {
        ServerMessage::Patch {
            base_revision,
            revision,
            data: patch.to_value(),
        }
    }

    pub fn error(err: &RegsyncError) -> Self {
        err.to_serializable().into()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

impl From<SerializableError> for ServerMessage {
    fn from(err: SerializableError) -> Self {
        ServerMessage::Error {
            kind: err.kind,
            message: err.message,
            path: err.path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_messages_are_tagged() {
        let join = ClientMessage::Join {
            channel: "scene".to_string(),
            participant: "ana".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&join).unwrap(),
            json!({ "type": "join", "channel": "scene", "participant": "ana" })
        );

        let update = ClientMessage::from_json(r#"{"type":"update"}"#).unwrap();
        assert_eq!(update, ClientMessage::Update { from_revision: None });
    }

    #[test]
    fn test_commit_carries_patch_wire_form() {
        let patch = Patch::from_value(&json!({ "r": [0, 0] })).unwrap();
        let text = ClientMessage::commit(4, &patch).to_json().unwrap();
        assert_eq!(
            serde_json::from_str::<Value>(&text).unwrap(),
            json!({ "type": "commit", "base_revision": 4, "patch": { "r": [0, 0] } })
        );
    }

    #[test]
    fn test_stale_commit_error_message() {
        let msg = ServerMessage::error(&RegsyncError::StaleCommit { base: 1, head: 3 });
        let ServerMessage::Error { kind, message, path } = &msg else {
            panic!("expected error message");
        };
        assert_eq!(kind, "StaleCommit");
        assert!(message.contains("resync"));
        assert!(path.is_none());

        let text = msg.to_json().unwrap();
        assert!(text.contains(r#""type":"error""#));
    }

    #[test]
    fn test_peer_messages_use_snake_case() {
        let msg = ServerMessage::PeerJoined {
            participant: "bo".to_string(),
            peer_count: 2,
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({ "type": "peer_joined", "participant": "bo", "peer_count": 2 })
        );
    }
}
