//! In-memory revision log for tests and ephemeral servers.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use super::storage::{RevisionKind, RevisionLog, StorageResult, StoredRevision};
use crate::error::RegsyncError;

/// In-memory revision log.
///
/// Thread-safe via `RwLock`; data is lost when dropped.
#[derive(Debug, Default, Clone)]
pub struct MemoryRevisionLog {
    /// channel -> revision -> row
    channels: Arc<RwLock<BTreeMap<String, BTreeMap<u64, StoredRevision>>>>,
}

impl MemoryRevisionLog {
    /// Create a new empty log.
    pub fn new() -> Self {
        Self::default()
    }
}

impl RevisionLog for MemoryRevisionLog {
    fn append(
        &self,
        channel: &str,
        revision: u64,
        kind: RevisionKind,
        data: &str,
    ) -> StorageResult<()> {
        let mut channels = self.channels.write().unwrap();
        let rows = channels.entry(channel.to_string()).or_default();
        if rows.contains_key(&revision) {
            return Err(RegsyncError::CorruptHistory {
                channel: channel.to_string(),
                reason: format!("revision {} already exists", revision),
            });
        }
        rows.insert(
            revision,
            StoredRevision {
                channel: channel.to_string(),
                revision,
                kind,
                data: data.to_string(),
                timestamp: chrono::Utc::now().timestamp_millis(),
            },
        );
        Ok(())
    }

    fn bootstrap(&self, channel: &str, data: &str) -> StorageResult<bool> {
        {
            let channels = self.channels.read().unwrap();
            if channels.get(channel).is_some_and(|rows| !rows.is_empty()) {
                return Ok(false);
            }
        }
        self.append(channel, 1, RevisionKind::Snapshot, data)?;
        Ok(true)
    }

    fn latest_revision(&self, channel: &str) -> StorageResult<Option<u64>> {
        let channels = self.channels.read().unwrap();
        Ok(channels
            .get(channel)
            .and_then(|rows| rows.keys().next_back().copied()))
    }

    fn latest_snapshot_at_or_before(
        &self,
        channel: &str,
        revision: u64,
    ) -> StorageResult<Option<u64>> {
        let channels = self.channels.read().unwrap();
        Ok(channels.get(channel).and_then(|rows| {
            rows.range(..=revision)
                .rev()
                .find(|(_, row)| row.kind == RevisionKind::Snapshot)
                .map(|(revision, _)| *revision)
        }))
    }

    fn load_range(&self, channel: &str, from: u64, to: u64) -> StorageResult<Vec<StoredRevision>> {
        if from > to {
            return Ok(Vec::new());
        }
        let channels = self.channels.read().unwrap();
        Ok(channels
            .get(channel)
            .map(|rows| rows.range(from..=to).map(|(_, row)| row.clone()).collect())
            .unwrap_or_default())
    }

    fn truncate_after(&self, channel: &str, revision: u64) -> StorageResult<usize> {
        let mut channels = self.channels.write().unwrap();
        let Some(rows) = channels.get_mut(channel) else {
            return Ok(0);
        };
        let removed = rows.split_off(&(revision + 1));
        Ok(removed.len())
    }

    fn list_channels(&self) -> StorageResult<Vec<String>> {
        let channels = self.channels.read().unwrap();
        Ok(channels
            .iter()
            .filter(|(_, rows)| !rows.is_empty())
            .map(|(name, _)| name.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_is_idempotent() {
        let log = MemoryRevisionLog::new();
        assert!(log.bootstrap("main", "{}").unwrap());
        assert!(!log.bootstrap("main", r#"{"a":{}}"#).unwrap());

        let row = log.load("main", 1).unwrap().unwrap();
        assert_eq!(row.kind, RevisionKind::Snapshot);
        assert_eq!(row.data, "{}");
    }

    #[test]
    fn test_append_rejects_existing_revision() {
        let log = MemoryRevisionLog::new();
        log.bootstrap("main", "{}").unwrap();
        let err = log.append("main", 1, RevisionKind::Diff, "{}").unwrap_err();
        assert!(matches!(err, RegsyncError::CorruptHistory { .. }));
    }

    #[test]
    fn test_latest_snapshot_and_range() {
        let log = MemoryRevisionLog::new();
        log.bootstrap("main", "{}").unwrap();
        log.append("main", 2, RevisionKind::Diff, "{}").unwrap();
        log.append("main", 3, RevisionKind::Snapshot, "{}").unwrap();
        log.append("main", 4, RevisionKind::Diff, "{}").unwrap();

        assert_eq!(log.latest_revision("main").unwrap(), Some(4));
        assert_eq!(log.latest_snapshot_at_or_before("main", 2).unwrap(), Some(1));
        assert_eq!(log.latest_snapshot_at_or_before("main", 4).unwrap(), Some(3));

        let rows = log.load_range("main", 2, 3).unwrap();
        assert_eq!(rows.iter().map(|r| r.revision).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn test_truncate_after() {
        let log = MemoryRevisionLog::new();
        log.bootstrap("main", "{}").unwrap();
        log.append("main", 2, RevisionKind::Diff, "{}").unwrap();
        log.append("main", 3, RevisionKind::Diff, "{}").unwrap();

        assert_eq!(log.truncate_after("main", 1).unwrap(), 2);
        assert_eq!(log.latest_revision("main").unwrap(), Some(1));
        assert_eq!(log.truncate_after("other", 1).unwrap(), 0);
    }

    #[test]
    fn test_list_channels() {
        let log = MemoryRevisionLog::new();
        log.bootstrap("beta", "{}").unwrap();
        log.bootstrap("alpha", "{}").unwrap();
        assert_eq!(log.list_channels().unwrap(), vec!["alpha", "beta"]);
    }
}
