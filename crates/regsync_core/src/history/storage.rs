//! Storage abstraction for revision history.
//!
//! This module defines the [`RevisionLog`] trait which abstracts over the
//! backends (SQLite, in-memory) persisting each channel's revisions.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::RegsyncError;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, RegsyncError>;

/// Whether a stored revision holds a full snapshot or a diff against the
/// previous revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export, export_to = "bindings/")]
pub enum RevisionKind {
    Snapshot,
    Diff,
}

impl std::fmt::Display for RevisionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RevisionKind::Snapshot => write!(f, "snapshot"),
            RevisionKind::Diff => write!(f, "diff"),
        }
    }
}

impl std::str::FromStr for RevisionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "snapshot" => Ok(RevisionKind::Snapshot),
            "diff" => Ok(RevisionKind::Diff),
            _ => Err(format!("Unknown revision kind: {}", s)),
        }
    }
}

/// One persisted row of a channel's history.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRevision {
    pub channel: String,
    pub revision: u64,
    pub kind: RevisionKind,
    /// JSON text of the snapshot or diff
    pub data: String,
    /// Unix timestamp (milliseconds)
    pub timestamp: i64,
}

/// Append-only, per-channel revision log.
///
/// Rows are keyed by `(channel, revision)`. Revision 1 of every channel is
/// a snapshot; later rows are only ever appended at `head + 1`, except for
/// [`RevisionLog::truncate_after`].
pub trait RevisionLog: Send + Sync {
    /// Append a row. Fails if the revision already exists.
    fn append(
        &self,
        channel: &str,
        revision: u64,
        kind: RevisionKind,
        data: &str,
    ) -> StorageResult<()>;

    /// Store `data` as revision 1 of `channel` unless the channel exists.
    ///
    /// Returns whether a row was written.
    fn bootstrap(&self, channel: &str, data: &str) -> StorageResult<bool>;

    /// Highest stored revision, or `None` for an unknown channel.
    fn latest_revision(&self, channel: &str) -> StorageResult<Option<u64>>;

    /// Newest snapshot row at or before `revision`.
    fn latest_snapshot_at_or_before(
        &self,
        channel: &str,
        revision: u64,
    ) -> StorageResult<Option<u64>>;

    /// Rows with `from <= revision <= to`, ascending.
    fn load_range(&self, channel: &str, from: u64, to: u64) -> StorageResult<Vec<StoredRevision>>;

    /// A single row.
    fn load(&self, channel: &str, revision: u64) -> StorageResult<Option<StoredRevision>> {
        Ok(self.load_range(channel, revision, revision)?.into_iter().next())
    }

    /// Delete every row after `revision`. Returns the number removed.
    fn truncate_after(&self, channel: &str, revision: u64) -> StorageResult<usize>;

    /// All channels with at least one row, sorted.
    fn list_channels(&self) -> StorageResult<Vec<String>>;
}
