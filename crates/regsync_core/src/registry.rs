//! Registry model: a tree of records flattened into a path-indexed map.
//!
//! Every record lives at a hierarchical id formed by joining its ancestors'
//! keys with `/`. A parent does not embed its child records; it holds a
//! reference marker (`{"isRef": true, "id": "<child id>"}`) instead. A marker
//! whose target is the position it sits at (`join(parent, key)`) is an
//! *implicit* reference and expresses ownership. Any other marker is an
//! explicit, lookup-only reference to data owned elsewhere.
//!
//! # Example
//!
//! ```
//! use regsync_core::registry::{Registry, make_ref};
//! use serde_json::json;
//!
//! let registry = Registry::flatten(&json!({
//!     "shape": { "extent": { "x": 100, "y": 20 } }
//! }));
//!
//! assert_eq!(registry.get("shape/extent"), Some(&json!({ "x": 100, "y": 20 })));
//! assert_eq!(registry.get("shape"), Some(&json!({ "extent": make_ref("shape/extent") })));
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{RegsyncError, Result};

/// Id of the root record.
pub const ROOT_ID: &str = "";

/// Field flagging a reference marker.
pub const REF_FLAG: &str = "isRef";

/// Field holding a reference marker's target id, and a record's identity tag.
pub const ID_FIELD: &str = "id";

/// Join a parent id and a key into a child id.
///
/// Children of the root have no leading separator.
pub fn join(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{}/{}", parent, key)
    }
}

/// Parent id of `id`, or `None` for the root itself.
pub fn parent_of(id: &str) -> Option<&str> {
    if id.is_empty() {
        return None;
    }
    Some(id.rfind('/').map(|i| &id[..i]).unwrap_or(ROOT_ID))
}

/// Last path segment of `id`.
pub fn key_of(id: &str) -> &str {
    id.rfind('/').map(|i| &id[i + 1..]).unwrap_or(id)
}

/// Whether `id` is `root` or one of its descendants.
pub fn is_within(id: &str, root: &str) -> bool {
    root.is_empty()
        || id == root
        || (id.len() > root.len() && id.starts_with(root) && id.as_bytes()[root.len()] == b'/')
}

/// Re-root `id` from the subtree at `from` to the subtree at `to`.
pub fn rebase(id: &str, from: &str, to: &str) -> Option<String> {
    if !is_within(id, from) {
        return None;
    }
    let rest = id[from.len()..].trim_start_matches('/');
    Some(if rest.is_empty() {
        to.to_string()
    } else {
        join(to, rest)
    })
}

/// Build a reference marker pointing at `id`.
pub fn make_ref(id: &str) -> Value {
    let mut map = Map::new();
    map.insert(REF_FLAG.to_string(), Value::Bool(true));
    map.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
    Value::Object(map)
}

/// Target id of a reference marker, or `None` if `value` is not one.
pub fn ref_target(value: &Value) -> Option<&str> {
    let map = value.as_object()?;
    if map.get(REF_FLAG) != Some(&Value::Bool(true)) {
        return None;
    }
    map.get(ID_FIELD)?.as_str()
}

/// Whether `value` is a reference marker.
pub fn is_ref(value: &Value) -> bool {
    ref_target(value).is_some()
}

/// Whether the marker at position `key` of record `record_id` is the owning
/// reference of the child record at that position.
pub fn is_implicit_ref(value: &Value, record_id: &str, key: &str) -> bool {
    ref_target(value).is_some_and(|target| target == join(record_id, key))
}

/// Whether `value` can be stored as a record (object or array, not a marker).
pub fn is_record(value: &Value) -> bool {
    value.is_array() || (value.is_object() && !is_ref(value))
}

/// Flat map from path id to record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Registry {
    records: BTreeMap<String, Value>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&Value> {
        self.records.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Value> {
        self.records.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    /// Insert or replace the record at `id`, returning the previous one.
    pub fn insert(&mut self, id: impl Into<String>, record: Value) -> Option<Value> {
        self.records.insert(id.into(), record)
    }

    pub fn remove(&mut self, id: &str) -> Option<Value> {
        self.records.remove(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Ids in sorted order (a parent always precedes its descendants).
    pub fn ids(&self) -> impl Iterator<Item = &String> {
        self.records.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.records.iter()
    }

    /// The identity tag (`id` field) of the record at `id`, if any.
    pub fn identity_tag(&self, id: &str) -> Option<&Value> {
        self.records
            .get(id)?
            .as_object()?
            .get(ID_FIELD)
            .filter(|tag| !tag.is_null())
    }

    /// Ids of `root` and all its descendants, in sorted order.
    pub fn subtree_ids(&self, root: &str) -> Vec<String> {
        if root.is_empty() {
            return self.records.keys().cloned().collect();
        }

        let prefix = format!("{}/", root);
        let mut ids = Vec::new();
        if self.records.contains_key(root) {
            ids.push(root.to_string());
        }
        ids.extend(
            self.records
                .range(prefix.clone()..)
                .map(|(id, _)| id)
                .take_while(|id| id.starts_with(&prefix))
                .cloned(),
        );
        ids
    }

    /// Remove `root` and all its descendants, returning them in sorted order.
    pub fn remove_subtree(&mut self, root: &str) -> Vec<(String, Value)> {
        self.subtree_ids(root)
            .into_iter()
            .filter_map(|id| self.records.remove(&id).map(|record| (id, record)))
            .collect()
    }

    /// Records whose parent record exists but does not own them through an
    /// implicit reference. A well-formed registry has none.
    pub fn orphans(&self) -> Vec<String> {
        self.records
            .keys()
            .filter(|id| {
                let Some(parent) = parent_of(id) else {
                    return false;
                };
                let Some(parent_record) = self.records.get(parent) else {
                    return false;
                };
                let key = key_of(id);
                let slot = match parent_record {
                    Value::Object(map) => map.get(key),
                    Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
                    _ => None,
                };
                !slot.is_some_and(|v| is_implicit_ref(v, parent, key))
            })
            .cloned()
            .collect()
    }

    /// Flatten a nested JSON tree into a registry rooted at [`ROOT_ID`].
    ///
    /// Every nested object or array becomes its own record and its parent
    /// holds an implicit reference in its place. Existing reference markers
    /// and primitives stay inline. A non-container tree yields an empty
    /// registry.
    pub fn flatten(tree: &Value) -> Self {
        let mut registry = Registry::new();
        if is_record(tree) {
            let root = registry.flatten_record(ROOT_ID, tree);
            registry.insert(ROOT_ID, root);
        }
        registry
    }

    fn flatten_record(&mut self, id: &str, value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, child)| (key.clone(), self.flatten_child(&join(id, key), child)))
                    .collect(),
            ),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, child)| self.flatten_child(&join(id, &i.to_string()), child))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn flatten_child(&mut self, child_id: &str, value: &Value) -> Value {
        if is_record(value) {
            let record = self.flatten_record(child_id, value);
            self.insert(child_id, record);
            make_ref(child_id)
        } else {
            value.clone()
        }
    }

    /// Rebuild the nested tree, resolving implicit references.
    ///
    /// Explicit references are left as markers. Without a root record the
    /// top-level records are returned keyed by id.
    pub fn unflatten(&self) -> Value {
        if self.contains(ROOT_ID) {
            return self.resolve(ROOT_ID);
        }
        Value::Object(
            self.records
                .keys()
                .filter(|id| parent_of(id) == Some(ROOT_ID))
                .map(|id| (id.clone(), self.resolve(id)))
                .collect(),
        )
    }

    fn resolve(&self, id: &str) -> Value {
        let Some(record) = self.records.get(id) else {
            return Value::Null;
        };
        let resolve_slot = |key: &str, value: &Value| {
            if is_implicit_ref(value, id, key) && self.contains(&join(id, key)) {
                self.resolve(&join(id, key))
            } else {
                value.clone()
            }
        };
        match record {
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, value)| (key.clone(), resolve_slot(key, value)))
                    .collect(),
            ),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, value)| resolve_slot(&i.to_string(), value))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// The registry as a JSON object keyed by id.
    pub fn to_value(&self) -> Value {
        Value::Object(
            self.records
                .iter()
                .map(|(id, record)| (id.clone(), record.clone()))
                .collect(),
        )
    }

    /// Parse a registry from a JSON object keyed by id.
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(map) = value else {
            return Err(RegsyncError::malformed(
                ROOT_ID,
                "registry must be a JSON object",
            ));
        };
        let mut registry = Registry::new();
        for (id, record) in map {
            if !is_record(&record) {
                return Err(RegsyncError::malformed(
                    id,
                    "record must be an object or an array",
                ));
            }
            registry.insert(id, record);
        }
        Ok(registry)
    }
}

impl FromIterator<(String, Value)> for Registry {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            records: iter.into_iter().collect(),
        }
    }
}

/// The full state of a registry at one point in time.
///
/// Snapshots are not mutated after construction; applying a diff produces a
/// new snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot {
    registry: Registry,
}

impl Snapshot {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    /// A snapshot of the empty registry.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn into_registry(self) -> Registry {
        self.registry
    }

    pub fn to_value(&self) -> Value {
        self.registry.to_value()
    }

    pub fn from_value(value: Value) -> Result<Self> {
        Ok(Self::new(Registry::from_value(value)?))
    }

    /// Canonical JSON text form.
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.registry)?)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        Self::from_value(serde_json::from_str(text)?)
    }
}

impl From<Registry> for Snapshot {
    fn from(registry: Registry) -> Self {
        Self::new(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_path_helpers() {
        assert_eq!(join("", "x"), "x");
        assert_eq!(join("a/b", "c"), "a/b/c");
        assert_eq!(parent_of("a/b/c"), Some("a/b"));
        assert_eq!(parent_of("a"), Some(""));
        assert_eq!(parent_of(""), None);
        assert_eq!(key_of("a/b/c"), "c");
        assert_eq!(key_of("a"), "a");
    }

    #[test]
    fn test_is_within() {
        assert!(is_within("a/b", "a"));
        assert!(is_within("a", "a"));
        assert!(is_within("anything", ""));
        assert!(!is_within("ab", "a"));
        assert!(!is_within("a", "a/b"));
    }

    #[test]
    fn test_rebase() {
        assert_eq!(rebase("a/b/c", "a/b", "x"), Some("x/c".to_string()));
        assert_eq!(rebase("a/b", "a/b", "x/y"), Some("x/y".to_string()));
        assert_eq!(rebase("a/bc", "a/b", "x"), None);
    }

    #[test]
    fn test_ref_markers() {
        let marker = make_ref("a/b");
        assert_eq!(marker, json!({ "isRef": true, "id": "a/b" }));
        assert_eq!(ref_target(&marker), Some("a/b"));
        assert!(is_implicit_ref(&marker, "a", "b"));
        assert!(!is_implicit_ref(&marker, "c", "b"));
        assert!(!is_ref(&json!({ "id": "a/b" })));
        assert!(!is_record(&marker));
    }

    #[test]
    fn test_subtree_ids_skip_sibling_prefixes() {
        let registry: Registry = [
            ("a".to_string(), json!({})),
            ("a!x".to_string(), json!({})),
            ("a/b".to_string(), json!({})),
            ("a/b/c".to_string(), json!([])),
            ("ab".to_string(), json!({})),
        ]
        .into_iter()
        .collect();

        assert_eq!(registry.subtree_ids("a"), vec!["a", "a/b", "a/b/c"]);
        assert_eq!(registry.subtree_ids("").len(), 5);
    }

    #[test]
    fn test_flatten_and_unflatten() {
        let tree = json!({
            "name": "scene",
            "shapes": [{ "id": "s1", "extent": { "x": 1 } }],
            "link": { "isRef": true, "id": "elsewhere" }
        });
        let registry = Registry::flatten(&tree);

        assert_eq!(
            registry.get(""),
            Some(&json!({
                "name": "scene",
                "shapes": make_ref("shapes"),
                "link": { "isRef": true, "id": "elsewhere" }
            }))
        );
        assert_eq!(registry.get("shapes"), Some(&json!([make_ref("shapes/0")])));
        assert_eq!(registry.identity_tag("shapes/0"), Some(&json!("s1")));
        assert_eq!(registry.get("shapes/0/extent"), Some(&json!({ "x": 1 })));
        assert!(registry.orphans().is_empty());

        assert_eq!(registry.unflatten(), tree);
    }

    #[test]
    fn test_orphans() {
        let registry: Registry = [
            ("a".to_string(), json!({ "b": make_ref("a/b") })),
            ("a/b".to_string(), json!({})),
            ("a/c".to_string(), json!({})),
        ]
        .into_iter()
        .collect();

        assert_eq!(registry.orphans(), vec!["a/c"]);
    }

    #[test]
    fn test_snapshot_json_round_trip() {
        let snapshot = Snapshot::new(Registry::flatten(&json!({ "a": { "b": [1, 2] } })));
        let text = snapshot.to_json_string().unwrap();
        assert_eq!(Snapshot::from_json_str(&text).unwrap(), snapshot);
    }

    #[test]
    fn test_snapshot_rejects_primitive_record() {
        let err = Snapshot::from_value(json!({ "a": 1 })).unwrap_err();
        assert!(matches!(err, RegsyncError::MalformedPatch { path, .. } if path == "a"));
    }
}
