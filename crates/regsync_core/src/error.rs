use serde::Serialize;
use thiserror::Error;

/// A single failure recorded while applying a diff.
///
/// Application continues past a failing subtree, so one apply can report
/// several of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PathFailure {
    /// Registry id (plus `/`-joined positions inside the record) that failed
    pub path: String,
    /// What went wrong at that path
    pub reason: String,
}

impl std::fmt::Display for PathFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.reason)
    }
}

/// Unified error type for regsync operations
#[derive(Debug, Error)]
pub enum RegsyncError {
    // Patch errors
    #[error("Malformed patch at '{path}': {reason}")]
    MalformedPatch { path: String, reason: String },

    #[error("No record at path '{0}'")]
    UnresolvedPath(String),

    #[error("Failed to apply {} position(s): {}", .0.len(), format_failures(.0))]
    ApplyFailed(Vec<PathFailure>),

    // Commit errors
    #[error("Commit based on revision {base} but head is {head}; resync required")]
    StaleCommit { base: u64, head: u64 },

    // History errors
    #[error("Revision {revision} not found in channel '{channel}'")]
    RevisionNotFound { channel: String, revision: u64 },

    #[error("Corrupt history for channel '{channel}': {reason}")]
    CorruptHistory { channel: String, reason: String },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Storage errors
    #[cfg(all(not(target_arch = "wasm32"), feature = "sqlite"))]
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn format_failures(failures: &[PathFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl RegsyncError {
    pub(crate) fn malformed(path: impl Into<String>, reason: impl Into<String>) -> Self {
        RegsyncError::MalformedPatch {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Whether the caller should discard local state and fetch a full snapshot.
    pub fn needs_resync(&self) -> bool {
        matches!(
            self,
            RegsyncError::StaleCommit { .. }
                | RegsyncError::ApplyFailed(_)
                | RegsyncError::MalformedPatch { .. }
                | RegsyncError::UnresolvedPath(_)
        )
    }

    /// Convert to a serializable representation for the wire
    pub fn to_serializable(&self) -> SerializableError {
        SerializableError::from(self)
    }
}

/// Result type alias for regsync operations
pub type Result<T> = std::result::Result<T, RegsyncError>;

/// A serializable representation of RegsyncError sent to clients
#[derive(Debug, Clone, Serialize)]
pub struct SerializableError {
    /// Error kind/variant name
    pub kind: String,
    /// Human-readable error message
    pub message: String,
    /// Associated registry path (if applicable)
    pub path: Option<String>,
}

impl From<&RegsyncError> for SerializableError {
    fn from(err: &RegsyncError) -> Self {
        let kind = match err {
            RegsyncError::MalformedPatch { .. } => "MalformedPatch",
            RegsyncError::UnresolvedPath(_) => "UnresolvedPath",
            RegsyncError::ApplyFailed(_) => "ApplyFailed",
            RegsyncError::StaleCommit { .. } => "StaleCommit",
            RegsyncError::RevisionNotFound { .. } => "RevisionNotFound",
            RegsyncError::CorruptHistory { .. } => "CorruptHistory",
            RegsyncError::Json(_) => "Json",
            #[cfg(all(not(target_arch = "wasm32"), feature = "sqlite"))]
            RegsyncError::Database(_) => "StorageFailure",
            RegsyncError::Io(_) => "StorageFailure",
        }
        .to_string();

        let path = match err {
            RegsyncError::MalformedPatch { path, .. } => Some(path.clone()),
            RegsyncError::UnresolvedPath(path) => Some(path.clone()),
            RegsyncError::ApplyFailed(failures) => failures.first().map(|f| f.path.clone()),
            _ => None,
        };

        Self {
            kind,
            message: err.to_string(),
            path,
        }
    }
}

impl From<RegsyncError> for SerializableError {
    fn from(err: RegsyncError) -> Self {
        SerializableError::from(&err)
    }
}
