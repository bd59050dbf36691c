//! Boundary between live objects and snapshots.

use serde_json::Value;

use crate::error::{RegsyncError, Result};
use crate::registry::{Registry, Snapshot};

/// Converts a domain's live objects to and from snapshots.
pub trait SnapshotSerializer {
    type Objects;

    fn objects_to_snapshot(&self, objects: &Self::Objects) -> Result<Snapshot>;

    fn snapshot_to_objects(&self, snapshot: &Snapshot) -> Result<Self::Objects>;
}

/// Treats a plain JSON tree as the live object graph.
///
/// Nested containers become records owned through implicit references;
/// existing reference markers pass through untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonTreeSerializer;

impl SnapshotSerializer for JsonTreeSerializer {
    type Objects = Value;

    fn objects_to_snapshot(&self, objects: &Value) -> Result<Snapshot> {
        if !(objects.is_object() || objects.is_array()) {
            return Err(RegsyncError::malformed(
                "",
                "the root of a tree must be an object or a sequence",
            ));
        }
        Ok(Snapshot::new(Registry::flatten(objects)))
    }

    fn snapshot_to_objects(&self, snapshot: &Snapshot) -> Result<Value> {
        let orphans = snapshot.registry().orphans();
        if let Some(first) = orphans.first() {
            return Err(RegsyncError::UnresolvedPath(first.clone()));
        }
        Ok(snapshot.registry().unflatten())
    }
}
