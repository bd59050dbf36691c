//! SQLite-backed revision log.
//!
//! One `revisions` table keyed by `(channel, revision)` holds every channel's
//! history. The database is only ever used as an append-only keyed log.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};

use super::storage::{RevisionKind, RevisionLog, StorageResult, StoredRevision};
use crate::error::RegsyncError;

/// Raw row as read from the database, before the kind is parsed.
type RevisionRow = (String, i64, String, String, i64);

/// SQLite-backed revision log.
///
/// # Thread Safety
///
/// The connection is wrapped in a `Mutex` for thread-safe access.
pub struct SqliteRevisionLog {
    conn: Mutex<Connection>,
}

impl SqliteRevisionLog {
    /// Open or create a SQLite database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or if schema
    /// initialization fails.
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let conn = Connection::open(path)?;
        let log = Self {
            conn: Mutex::new(conn),
        };
        log.init_schema()?;
        Ok(log)
    }

    /// Create an in-memory SQLite database for testing.
    pub fn in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        let log = Self {
            conn: Mutex::new(conn),
        };
        log.init_schema()?;
        Ok(log)
    }

    fn init_schema(&self) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS revisions (
                channel TEXT NOT NULL,
                revision INTEGER NOT NULL,
                kind TEXT NOT NULL,
                data TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                PRIMARY KEY (channel, revision)
            );

            -- Nearest-snapshot lookups
            CREATE INDEX IF NOT EXISTS idx_revisions_kind ON revisions(channel, kind, revision);
            "#,
        )?;
        Ok(())
    }
}

fn to_stored(row: RevisionRow) -> StorageResult<StoredRevision> {
    let (channel, revision, kind, data, timestamp) = row;
    let kind = kind
        .parse::<RevisionKind>()
        .map_err(|reason| RegsyncError::CorruptHistory {
            channel: channel.clone(),
            reason,
        })?;
    Ok(StoredRevision {
        channel,
        revision: revision as u64,
        kind,
        data,
        timestamp,
    })
}

impl std::fmt::Debug for SqliteRevisionLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteRevisionLog").finish_non_exhaustive()
    }
}

impl RevisionLog for SqliteRevisionLog {
    fn append(
        &self,
        channel: &str,
        revision: u64,
        kind: RevisionKind,
        data: &str,
    ) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        let now = chrono::Utc::now().timestamp_millis();
        conn.execute(
            "INSERT INTO revisions (channel, revision, kind, data, timestamp) VALUES (?, ?, ?, ?, ?)",
            params![channel, revision as i64, kind.to_string(), data, now],
        )?;
        Ok(())
    }

    fn bootstrap(&self, channel: &str, data: &str) -> StorageResult<bool> {
        let conn = self.conn.lock().unwrap();
        let now = chrono::Utc::now().timestamp_millis();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO revisions (channel, revision, kind, data, timestamp)
             VALUES (?, 1, ?, ?, ?)",
            params![channel, RevisionKind::Snapshot.to_string(), data, now],
        )?;
        Ok(inserted > 0)
    }

    fn latest_revision(&self, channel: &str) -> StorageResult<Option<u64>> {
        let conn = self.conn.lock().unwrap();
        let latest: Option<i64> = conn.query_row(
            "SELECT MAX(revision) FROM revisions WHERE channel = ?",
            params![channel],
            |row| row.get(0),
        )?;
        Ok(latest.map(|r| r as u64))
    }

    fn latest_snapshot_at_or_before(
        &self,
        channel: &str,
        revision: u64,
    ) -> StorageResult<Option<u64>> {
        let conn = self.conn.lock().unwrap();
        let latest: Option<i64> = conn
            .query_row(
                "SELECT revision FROM revisions
                 WHERE channel = ? AND kind = ? AND revision <= ?
                 ORDER BY revision DESC LIMIT 1",
                params![channel, RevisionKind::Snapshot.to_string(), revision as i64],
                |row| row.get(0),
            )
            .optional()?;
        Ok(latest.map(|r| r as u64))
    }

    fn load_range(&self, channel: &str, from: u64, to: u64) -> StorageResult<Vec<StoredRevision>> {
        let rows: Vec<RevisionRow> = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn.prepare(
                "SELECT channel, revision, kind, data, timestamp FROM revisions
                 WHERE channel = ? AND revision >= ? AND revision <= ?
                 ORDER BY revision ASC",
            )?;
            let rows = stmt
                .query_map(params![channel, from as i64, to as i64], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                })?
                .collect::<Result<Vec<RevisionRow>, _>>()?;
            rows
        };
        rows.into_iter().map(to_stored).collect()
    }

    fn truncate_after(&self, channel: &str, revision: u64) -> StorageResult<usize> {
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute(
            "DELETE FROM revisions WHERE channel = ? AND revision > ?",
            params![channel, revision as i64],
        )?;
        Ok(removed)
    }

    fn list_channels(&self) -> StorageResult<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT DISTINCT channel FROM revisions ORDER BY channel")?;
        let channels = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(channels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlite_bootstrap_and_append() {
        let log = SqliteRevisionLog::in_memory().unwrap();

        assert_eq!(log.latest_revision("main").unwrap(), None);
        assert!(log.bootstrap("main", "{}").unwrap());
        assert!(!log.bootstrap("main", "{}").unwrap());

        log.append("main", 2, RevisionKind::Diff, r#"{"a":[{}]}"#).unwrap();
        assert_eq!(log.latest_revision("main").unwrap(), Some(2));

        let row = log.load("main", 2).unwrap().unwrap();
        assert_eq!(row.kind, RevisionKind::Diff);
        assert_eq!(row.data, r#"{"a":[{}]}"#);
        assert!(row.timestamp > 0);
    }

    #[test]
    fn test_sqlite_duplicate_revision_fails() {
        let log = SqliteRevisionLog::in_memory().unwrap();
        log.bootstrap("main", "{}").unwrap();
        assert!(log.append("main", 1, RevisionKind::Diff, "{}").is_err());
    }

    #[test]
    fn test_sqlite_latest_snapshot() {
        let log = SqliteRevisionLog::in_memory().unwrap();
        log.bootstrap("main", "{}").unwrap();
        log.append("main", 2, RevisionKind::Diff, "{}").unwrap();
        log.append("main", 3, RevisionKind::Snapshot, "{}").unwrap();

        assert_eq!(log.latest_snapshot_at_or_before("main", 2).unwrap(), Some(1));
        assert_eq!(log.latest_snapshot_at_or_before("main", 3).unwrap(), Some(3));
        assert_eq!(log.latest_snapshot_at_or_before("other", 3).unwrap(), None);
    }

    #[test]
    fn test_sqlite_truncate_and_list() {
        let log = SqliteRevisionLog::in_memory().unwrap();
        log.bootstrap("b", "{}").unwrap();
        log.bootstrap("a", "{}").unwrap();
        log.append("a", 2, RevisionKind::Diff, "{}").unwrap();

        assert_eq!(log.truncate_after("a", 1).unwrap(), 1);
        assert_eq!(log.load_range("a", 1, 10).unwrap().len(), 1);
        assert_eq!(log.list_channels().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_sqlite_persists_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("revisions.db");

        {
            let log = SqliteRevisionLog::open(&path).unwrap();
            log.bootstrap("main", r#"{"":{}}"#).unwrap();
        }

        let log = SqliteRevisionLog::open(&path).unwrap();
        assert_eq!(log.latest_revision("main").unwrap(), Some(1));
        assert_eq!(log.load("main", 1).unwrap().unwrap().data, r#"{"":{}}"#);
    }
}
