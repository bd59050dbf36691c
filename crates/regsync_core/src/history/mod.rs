//! Per-channel revision history.
//!
//! Every channel is an append-only sequence of revisions starting at 1.
//! Each revision stores either a full snapshot or the structural diff from
//! the previous revision. A snapshot is forced whenever the head is
//! `snapshot_interval` revisions past the last one, so [`RevisionStore::checkout`]
//! replays at most that many diffs.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use regsync_core::history::{MemoryRevisionLog, RevisionStore};
//! use regsync_core::Patch;
//! use serde_json::json;
//!
//! let store = RevisionStore::new(Arc::new(MemoryRevisionLog::new()));
//! let head = store.ensure_channel("scene").unwrap();
//! assert_eq!(head, 1);
//!
//! let patch = Patch::from_value(&json!({ "x": [{ "id": "x", "v": 1 }] })).unwrap();
//! let next = store.commit("scene", head, &patch).unwrap();
//! assert_eq!(next, 2);
//! assert_eq!(
//!     store.checkout("scene", 2).unwrap().registry().get("x"),
//!     Some(&json!({ "id": "x", "v": 1 }))
//! );
//! ```

mod memory_storage;
#[cfg(all(not(target_arch = "wasm32"), feature = "sqlite"))]
mod sqlite_storage;
mod storage;

pub use memory_storage::MemoryRevisionLog;
#[cfg(all(not(target_arch = "wasm32"), feature = "sqlite"))]
pub use sqlite_storage::SqliteRevisionLog;
pub use storage::{RevisionKind, RevisionLog, StorageResult, StoredRevision};

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use ts_rs::TS;

use crate::apply::Applier;
use crate::delta::{Delta, Diff, diff_values, patch};
use crate::error::{RegsyncError, Result};
use crate::identity::structural_diff;
use crate::patch::Patch;
use crate::registry::Snapshot;

/// Default number of revisions between forced snapshots.
pub const DEFAULT_SNAPSHOT_INTERVAL: u64 = 20;

/// Summary of one revision for history listings.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct RevisionSummary {
    /// Revision number
    #[ts(type = "number")]
    pub revision: u64,

    /// Whether the row is a full snapshot or a diff
    pub kind: RevisionKind,

    /// Unix timestamp (milliseconds)
    #[ts(type = "number")]
    pub timestamp: i64,

    /// Size of the stored JSON text in bytes
    #[ts(type = "number")]
    pub size: usize,
}

/// Revision history over a [`RevisionLog`].
///
/// Callers must serialize [`RevisionStore::commit`] and
/// [`RevisionStore::reset`] per channel (see
/// [`CommitSerializer`](crate::CommitSerializer)); reads need no lock.
#[derive(Clone)]
pub struct RevisionStore {
    log: Arc<dyn RevisionLog>,
    snapshot_interval: u64,
}

impl RevisionStore {
    pub fn new(log: Arc<dyn RevisionLog>) -> Self {
        Self::with_snapshot_interval(log, DEFAULT_SNAPSHOT_INTERVAL)
    }

    /// Create a store forcing a snapshot every `interval` revisions (at least 1).
    pub fn with_snapshot_interval(log: Arc<dyn RevisionLog>, interval: u64) -> Self {
        Self {
            log,
            snapshot_interval: interval.max(1),
        }
    }

    pub fn snapshot_interval(&self) -> u64 {
        self.snapshot_interval
    }

    /// Create revision 1 (an empty snapshot) if the channel is new.
    ///
    /// Returns the channel's head.
    pub fn ensure_channel(&self, channel: &str) -> Result<u64> {
        if self
            .log
            .bootstrap(channel, &Snapshot::empty().to_json_string()?)?
        {
            log::info!("bootstrapped channel {}", channel);
        }
        self.head(channel)
    }

    /// Highest committed revision of `channel`.
    pub fn head(&self, channel: &str) -> Result<u64> {
        self.log
            .latest_revision(channel)?
            .ok_or_else(|| RegsyncError::RevisionNotFound {
                channel: channel.to_string(),
                revision: 1,
            })
    }

    /// Newest snapshot revision at or before `revision`.
    pub fn latest_snapshot_at_or_before(&self, channel: &str, revision: u64) -> Result<u64> {
        self.log
            .latest_snapshot_at_or_before(channel, revision)?
            .ok_or_else(|| RegsyncError::CorruptHistory {
                channel: channel.to_string(),
                reason: format!("no snapshot at or before revision {}", revision),
            })
    }

    /// Reconstruct the state at `revision`.
    pub fn checkout(&self, channel: &str, revision: u64) -> Result<Snapshot> {
        let head = self.head(channel)?;
        if revision == 0 || revision > head {
            return Err(RegsyncError::RevisionNotFound {
                channel: channel.to_string(),
                revision,
            });
        }

        let base = self.latest_snapshot_at_or_before(channel, revision)?;
        let rows = self.log.load_range(channel, base, revision)?;
        let corrupt = |reason: String| RegsyncError::CorruptHistory {
            channel: channel.to_string(),
            reason,
        };

        if rows.len() as u64 != revision - base + 1 {
            return Err(corrupt(format!(
                "expected {} rows from revision {} to {}, found {}",
                revision - base + 1,
                base,
                revision,
                rows.len()
            )));
        }

        let mut rows = rows.into_iter();
        let mut value: Value = match rows.next() {
            Some(first) if first.kind == RevisionKind::Snapshot && first.revision == base => {
                serde_json::from_str(&first.data)?
            }
            _ => return Err(corrupt(format!("revision {} is not a snapshot", base))),
        };

        for (expected, row) in (base + 1..).zip(rows) {
            if row.revision != expected || row.kind != RevisionKind::Diff {
                return Err(corrupt(format!(
                    "expected diff at revision {}, found {} at {}",
                    expected, row.kind, row.revision
                )));
            }
            let delta = Delta::from_value("", &serde_json::from_str(&row.data)?)?;
            patch(&mut value, &delta)
                .map_err(|err| corrupt(format!("replaying revision {}: {}", expected, err)))?;
        }

        Snapshot::from_value(value)
    }

    /// Structural diff between two revisions.
    pub fn diff(&self, channel: &str, from: u64, to: u64) -> Result<Diff> {
        if from == to {
            return Ok(Diff::new());
        }

        if to == from + 1 {
            let row = self
                .log
                .load(channel, to)?
                .ok_or_else(|| RegsyncError::RevisionNotFound {
                    channel: channel.to_string(),
                    revision: to,
                })?;
            if row.kind == RevisionKind::Diff {
                let delta = Delta::from_value("", &serde_json::from_str(&row.data)?)?;
                return Diff::from_root_delta(Some(delta));
            }
            let old = self.checkout(channel, from)?;
            let new = Snapshot::from_json_str(&row.data)?;
            return Ok(structural_diff(old.registry(), new.registry()));
        }

        let old = self.checkout(channel, from)?;
        let new = self.checkout(channel, to)?;
        Ok(structural_diff(old.registry(), new.registry()))
    }

    /// Append `patch` as revision `base + 1`.
    ///
    /// Fails with [`RegsyncError::StaleCommit`] unless `base` is the current
    /// head. Returns the new head.
    pub fn commit(&self, channel: &str, base: u64, patch: &Patch) -> Result<u64> {
        let head = self.head(channel)?;
        if base != head {
            return Err(RegsyncError::StaleCommit { base, head });
        }

        let current = self.checkout(channel, head)?;
        let next = Applier::new().apply_patch(patch, &current)?;
        let revision = head + 1;

        let latest_snapshot = self.latest_snapshot_at_or_before(channel, head)?;
        if head - latest_snapshot >= self.snapshot_interval {
            log::debug!("channel {}: storing snapshot at revision {}", channel, revision);
            self.log.append(
                channel,
                revision,
                RevisionKind::Snapshot,
                &next.to_json_string()?,
            )?;
        } else {
            let delta = diff_values(&current.to_value(), &next.to_value())
                .map(|d| d.to_value())
                .unwrap_or_else(|| Value::Object(Map::new()));
            self.log.append(
                channel,
                revision,
                RevisionKind::Diff,
                &serde_json::to_string(&delta)?,
            )?;
        }

        Ok(revision)
    }

    /// Truncate `channel` back to revision 1.
    pub fn reset(&self, channel: &str) -> Result<usize> {
        let removed = self.log.truncate_after(channel, 1)?;
        log::info!("channel {}: reset, {} revision(s) removed", channel, removed);
        Ok(removed)
    }

    /// Revisions of `channel`, newest first.
    pub fn history(&self, channel: &str, limit: Option<usize>) -> Result<Vec<RevisionSummary>> {
        let head = self.head(channel)?;
        let rows = self.log.load_range(channel, 1, head)?;
        Ok(rows
            .into_iter()
            .rev()
            .take(limit.unwrap_or(usize::MAX))
            .map(|row| RevisionSummary {
                revision: row.revision,
                kind: row.kind,
                timestamp: row.timestamp,
                size: row.data.len(),
            })
            .collect())
    }

    /// Channels with stored history.
    pub fn channels(&self) -> Result<Vec<String>> {
        self.log.list_channels()
    }
}

impl std::fmt::Debug for RevisionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevisionStore")
            .field("snapshot_interval", &self.snapshot_interval)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store(interval: u64) -> RevisionStore {
        RevisionStore::with_snapshot_interval(Arc::new(MemoryRevisionLog::new()), interval)
    }

    fn put(id: &str, value: Value) -> Patch {
        let mut map = Map::new();
        map.insert(id.to_string(), json!([value]));
        Patch::from_value(&Value::Object(map)).unwrap()
    }

    #[test]
    fn test_ensure_channel_bootstraps_once() {
        let store = store(20);
        assert_eq!(store.ensure_channel("c").unwrap(), 1);
        assert_eq!(store.ensure_channel("c").unwrap(), 1);
        assert!(store.checkout("c", 1).unwrap().registry().is_empty());
    }

    #[test]
    fn test_commit_and_checkout_each_revision() {
        let store = store(20);
        store.ensure_channel("c").unwrap();
        for v in 1..=5 {
            store.commit("c", v, &put("x", json!({ "v": v }))).unwrap();
        }

        assert_eq!(store.head("c").unwrap(), 6);
        for rev in 2..=6 {
            let snap = store.checkout("c", rev).unwrap();
            assert_eq!(snap.registry().get("x"), Some(&json!({ "v": rev - 1 })));
        }
    }

    #[test]
    fn test_stale_commit_is_rejected() {
        let store = store(20);
        store.ensure_channel("c").unwrap();
        store.commit("c", 1, &put("x", json!({}))).unwrap();

        let err = store.commit("c", 1, &put("y", json!({}))).unwrap_err();
        assert!(matches!(err, RegsyncError::StaleCommit { base: 1, head: 2 }));
        assert_eq!(store.head("c").unwrap(), 2);
    }

    #[test]
    fn test_snapshot_forcing_bounds_replay() {
        let store = store(3);
        store.ensure_channel("c").unwrap();
        for v in 1..=10u64 {
            let head = store.head("c").unwrap();
            store.commit("c", head, &put("x", json!({ "v": v }))).unwrap();
        }

        for rev in 1..=11 {
            let base = store.latest_snapshot_at_or_before("c", rev).unwrap();
            assert!(rev - base <= 3, "revision {} replays {} diffs", rev, rev - base);
        }
        assert_eq!(store.latest_snapshot_at_or_before("c", 11).unwrap(), 9);
        assert_eq!(
            store.checkout("c", 11).unwrap().registry().get("x"),
            Some(&json!({ "v": 10 }))
        );
    }

    #[test]
    fn test_diff_between_revisions() {
        let store = store(2);
        store.ensure_channel("c").unwrap();
        for v in 1..=4 {
            let head = store.head("c").unwrap();
            store.commit("c", head, &put("x", json!({ "v": v }))).unwrap();
        }

        // Adjacent diff row.
        let step = store.diff("c", 2, 3).unwrap();
        assert_eq!(step.to_value(), json!({ "x": { "v": [1, 2] } }));

        // Adjacent, but the later row is a forced snapshot.
        assert_eq!(store.latest_snapshot_at_or_before("c", 4).unwrap(), 4);
        let across = store.diff("c", 3, 4).unwrap();
        assert_eq!(across.to_value(), json!({ "x": { "v": [2, 3] } }));

        let long = store.diff("c", 1, 5).unwrap();
        assert_eq!(long.to_value(), json!({ "x": [{ "v": 4 }] }));
    }

    #[test]
    fn test_commit_with_sequence_gap_is_refused() {
        let store = store(20);
        store.ensure_channel("c").unwrap();
        store.commit("c", 1, &put("list", json!([1]))).unwrap();

        let patch = Patch::from_json_str(r#"{"list":{"18446744073709551615":[7]}}"#).unwrap();
        let err = store.commit("c", 2, &patch).unwrap_err();
        assert!(matches!(err, RegsyncError::MalformedPatch { .. }));
        assert_eq!(store.head("c").unwrap(), 2);
        assert_eq!(
            store.checkout("c", 2).unwrap().registry().get("list"),
            Some(&json!([1]))
        );
    }

    #[test]
    fn test_reset_truncates_to_first_revision() {
        let store = store(20);
        store.ensure_channel("c").unwrap();
        store.commit("c", 1, &put("x", json!({}))).unwrap();
        store.commit("c", 2, &put("y", json!({}))).unwrap();

        assert_eq!(store.reset("c").unwrap(), 2);
        assert_eq!(store.head("c").unwrap(), 1);
        assert!(store.checkout("c", 2).is_err());
    }

    #[test]
    fn test_history_is_newest_first() {
        let store = store(20);
        store.ensure_channel("c").unwrap();
        store.commit("c", 1, &put("x", json!({}))).unwrap();

        let history = store.history("c", None).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].revision, 2);
        assert_eq!(history[0].kind, RevisionKind::Diff);
        assert_eq!(history[1].kind, RevisionKind::Snapshot);
        assert_eq!(store.history("c", Some(1)).unwrap().len(), 1);
    }

    #[test]
    fn test_checkout_detects_gaps() {
        let log = Arc::new(MemoryRevisionLog::new());
        let store = RevisionStore::new(log.clone());
        store.ensure_channel("c").unwrap();
        log.append("c", 3, RevisionKind::Diff, "{}").unwrap();

        let err = store.checkout("c", 3).unwrap_err();
        assert!(matches!(err, RegsyncError::CorruptHistory { .. }));
    }

    #[test]
    fn test_unknown_channel() {
        let store = store(20);
        assert!(matches!(
            store.head("nope").unwrap_err(),
            RegsyncError::RevisionNotFound { .. }
        ));
    }
}
