#![doc = include_str!(concat!(env!("OUT_DIR"), "/README.md"))]

/// Replaying diffs against a registry
pub mod apply;

/// Per-channel commit serialization
pub mod commit_lock;

/// Structural differ and diff wire encoding
pub mod delta;

/// Error (common error types)
pub mod error;

/// Revision history (storage backends and the revision store)
pub mod history;

/// Move/copy detection
pub mod identity;

pub mod patch;

/// Wire messages
pub mod protocol;

/// Registry model and snapshots
pub mod registry;

pub mod replica;

/// Live-object boundary
pub mod serializer;

pub use apply::{Applier, PatchHooks};
pub use commit_lock::{CommitGuard, CommitSerializer};
pub use delta::{Delta, Diff, Instruction};
pub use error::{PathFailure, RegsyncError, Result, SerializableError};
pub use history::{RevisionKind, RevisionLog, RevisionStore, RevisionSummary};
pub use identity::{Move, diff};
pub use patch::{Patch, PatchNode};
pub use protocol::{ClientMessage, ServerMessage};
pub use registry::{Registry, Snapshot};
pub use replica::Replica;
pub use serializer::{JsonTreeSerializer, SnapshotSerializer};
