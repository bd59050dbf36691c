//! Compact, forward-only form of a [`Diff`].
//!
//! A [`Patch`] keeps only what a receiver holding the base snapshot needs:
//! new values, deletions aggregated to their outermost prefix, and moves.
//! Owning references to records that the same patch adds or moves are
//! stripped because [`Patch::expand`] re-derives them.
//!
//! Encoding: `[new]` puts a value, `[0, 0]` removes, `[0, from, nested, 0]`
//! moves. Child maps are plain objects; sequence children are keyed by
//! index without a type tag.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::delta::{Delta, Diff, Instruction, is_zero, zero};
use crate::error::{RegsyncError, Result};
use crate::identity::{Move, relocate};
use crate::registry::{
    Registry, Snapshot, is_implicit_ref, is_ref, is_within, join, key_of, make_ref, parent_of,
};

#[derive(Debug, Clone, PartialEq)]
pub enum PatchNode {
    Put(Value),
    Remove,
    Move {
        from: String,
        nested: Option<Box<PatchNode>>,
    },
    Children(BTreeMap<String, PatchNode>),
}

impl PatchNode {
    pub fn to_value(&self) -> Value {
        match self {
            PatchNode::Put(new) => Value::Array(vec![new.clone()]),
            PatchNode::Remove => Value::Array(vec![zero(), zero()]),
            PatchNode::Move { from, nested } => Value::Array(vec![
                zero(),
                Value::String(from.clone()),
                nested
                    .as_ref()
                    .map(|n| n.to_value())
                    .unwrap_or_else(|| Value::Object(Map::new())),
                zero(),
            ]),
            PatchNode::Children(children) => Value::Object(
                children
                    .iter()
                    .map(|(key, child)| (key.clone(), child.to_value()))
                    .collect(),
            ),
        }
    }

    pub fn from_value(path: &str, value: &Value) -> Result<Self> {
        match value {
            Value::Array(items) => match items.as_slice() {
                [new] => Ok(PatchNode::Put(new.clone())),
                [a, b] if is_zero(a) && is_zero(b) => Ok(PatchNode::Remove),
                [a, Value::String(from), nested, b] if is_zero(a) && is_zero(b) => {
                    let nested = match nested {
                        Value::Object(map) if map.is_empty() => None,
                        Value::Object(_) => Some(Box::new(PatchNode::from_value(path, nested)?)),
                        _ => {
                            return Err(RegsyncError::malformed(
                                path,
                                "move instruction must carry an object patch",
                            ));
                        }
                    };
                    Ok(PatchNode::Move {
                        from: from.clone(),
                        nested,
                    })
                }
                _ => Err(RegsyncError::malformed(
                    path,
                    format!("unrecognized patch instruction of length {}", items.len()),
                )),
            },
            Value::Object(map) => {
                let mut children = BTreeMap::new();
                for (key, child) in map {
                    children.insert(
                        key.clone(),
                        PatchNode::from_value(&join(path, key), child)?,
                    );
                }
                Ok(PatchNode::Children(children))
            }
            _ => Err(RegsyncError::malformed(
                path,
                "expected a patch instruction or an object",
            )),
        }
    }
}

/// Compacted, directional diff keyed by registry id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Patch {
    entries: BTreeMap<String, PatchNode>,
}

/// Ids that a diff adds or moves into place.
fn placed_ids(diff: &Diff) -> BTreeSet<&str> {
    diff.iter()
        .filter(|(_, delta)| {
            matches!(
                delta,
                Delta::Op(Instruction::Add(_)) | Delta::Op(Instruction::Move { .. })
            )
        })
        .map(|(id, _)| id.as_str())
        .collect()
}

/// Whether the subtree at `deeper` must survive a removal of `prefix`
/// because a move destination sits between them.
fn shielded(deeper: &str, prefix: &str, destinations: &[&str]) -> bool {
    destinations
        .iter()
        .any(|to| *to != prefix && is_within(to, prefix) && is_within(deeper, to))
}

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, id: &str) -> Option<&PatchNode> {
        self.entries.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PatchNode)> {
        self.entries.iter()
    }

    /// Compact a diff (`toPatch`).
    pub fn from_diff(diff: &Diff) -> Self {
        let placed = placed_ids(diff);
        let destinations: Vec<&str> = diff.moves().map(|(to, _)| to).collect();

        // Deletions, plus targets whose owning reference disappeared.
        let mut deleted: BTreeSet<String> = BTreeSet::new();
        for (id, delta) in diff.iter() {
            match delta {
                Delta::Op(Instruction::Delete(_)) => {
                    deleted.insert(id.clone());
                }
                Delta::Op(Instruction::Set { old, new }) => {
                    collect_dropped_owners(id, old, Some(new), &mut deleted);
                }
                Delta::Object(children) => {
                    for (key, child) in children {
                        dropped_owner(id, key, child, &mut deleted);
                    }
                }
                Delta::Array(children) => {
                    for (index, child) in children {
                        dropped_owner(id, &index.to_string(), child, &mut deleted);
                    }
                }
                _ => {}
            }
        }
        deleted.retain(|target| match diff.get(target) {
            None | Some(Delta::Op(Instruction::Delete(_))) => true,
            Some(_) => false,
        });

        let mut cover: Vec<String> = Vec::new();
        for id in deleted {
            let subsumed = cover
                .iter()
                .any(|prefix| is_within(&id, prefix) && !shielded(&id, prefix, &destinations));
            if subsumed {
                log::debug!("deletion of {} subsumed by an ancestor", id);
            } else {
                cover.push(id);
            }
        }

        let mut entries: BTreeMap<String, PatchNode> = cover
            .into_iter()
            .map(|id| (id, PatchNode::Remove))
            .collect();

        for (id, delta) in diff.iter() {
            let node = match delta {
                Delta::Op(Instruction::Delete(_)) => continue,
                Delta::Op(Instruction::Add(new)) | Delta::Op(Instruction::Set { new, .. }) => {
                    Some(PatchNode::Put(strip_owned_refs(id, new, &placed)))
                }
                Delta::Op(Instruction::Move { from, nested }) => Some(PatchNode::Move {
                    from: from.clone(),
                    nested: nested
                        .as_deref()
                        .and_then(|n| coalesce(n, id, true, &placed))
                        .map(Box::new),
                }),
                _ => coalesce(delta, id, true, &placed),
            };
            if let Some(node) = node {
                entries.insert(id.clone(), node);
            }
        }

        Patch { entries }
    }

    /// Rebuild the full diff this patch was compacted from, using the base
    /// snapshot it applies to.
    pub fn expand(&self, base: &Snapshot) -> Result<Diff> {
        let moves: Vec<Move> = self
            .entries
            .iter()
            .filter_map(|(to, node)| match node {
                PatchNode::Move { from, .. } => Some(Move::new(from.clone(), to.clone())),
                _ => None,
            })
            .collect();
        let destinations: Vec<&str> = moves.iter().map(|mv| mv.to.as_str()).collect();

        let mut relocated = base.registry().clone();
        if !moves.is_empty() {
            relocate(&mut relocated, &moves)?;
        }

        let mut diff = Diff::new();
        for (id, node) in &self.entries {
            match node {
                PatchNode::Remove => {
                    if let Some(old) = relocated.get(id) {
                        diff.insert(id.clone(), Delta::Op(Instruction::Delete(old.clone())));
                    }
                }
                PatchNode::Move { from, nested } => {
                    let nested = match nested {
                        Some(node) => {
                            expand_node(node, relocated.get(id), id)?.map(Box::new)
                        }
                        None => None,
                    };
                    diff.insert(
                        id.clone(),
                        Delta::Op(Instruction::Move {
                            from: from.clone(),
                            nested,
                        }),
                    );
                }
                PatchNode::Put(_) | PatchNode::Children(_) => {
                    if let Some(delta) = expand_node(node, relocated.get(id), id)? {
                        diff.insert(id.clone(), delta);
                    }
                }
            }
        }

        // Records under a removed prefix that the patch does not mention.
        for (prefix, node) in &self.entries {
            if !matches!(node, PatchNode::Remove) {
                continue;
            }
            for id in relocated.subtree_ids(prefix) {
                if self.entries.contains_key(&id) || shielded(&id, prefix, &destinations) {
                    continue;
                }
                if let Some(old) = relocated.get(&id) {
                    diff.insert(id, Delta::Op(Instruction::Delete(old.clone())));
                }
            }
        }

        rederive_owner_refs(&mut diff, &relocated);
        for (id, delta) in diff.iter() {
            if let Some(value) = relocated.get(id) {
                check_appends(delta, value, id)?;
            }
        }
        Ok(diff)
    }

    pub fn to_value(&self) -> Value {
        Value::Object(
            self.entries
                .iter()
                .map(|(id, node)| (id.clone(), node.to_value()))
                .collect(),
        )
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        let Value::Object(map) = value else {
            return Err(RegsyncError::malformed("", "patch must be a JSON object"));
        };
        let mut entries = BTreeMap::new();
        for (id, node) in map {
            let node = PatchNode::from_value(id, node)?;
            if matches!(node, PatchNode::Move { .. }) && id.is_empty() {
                return Err(RegsyncError::malformed(id, "the root record cannot be moved"));
            }
            entries.insert(id.clone(), node);
        }
        Ok(Patch { entries })
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.to_value())?)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        Self::from_value(&serde_json::from_str(text)?)
    }
}

impl From<&Diff> for Patch {
    fn from(diff: &Diff) -> Self {
        Patch::from_diff(diff)
    }
}

impl Serialize for Patch {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Patch {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Patch::from_value(&value).map_err(serde::de::Error::custom)
    }
}

/// Record the child owned through `(record_id, key)` if `delta` drops that
/// owning reference.
fn dropped_owner(record_id: &str, key: &str, delta: &Delta, deleted: &mut BTreeSet<String>) {
    let old = match delta {
        Delta::Op(Instruction::Delete(old)) | Delta::Op(Instruction::Set { old, .. }) => old,
        _ => return,
    };
    if is_implicit_ref(old, record_id, key) {
        deleted.insert(join(record_id, key));
    }
}

/// Owning references held by a replaced record that its replacement lacks.
fn collect_dropped_owners(
    record_id: &str,
    old: &Value,
    new: Option<&Value>,
    deleted: &mut BTreeSet<String>,
) {
    let slots: Vec<(String, &Value)> = match old {
        Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v)).collect(),
        Value::Array(items) => items.iter().enumerate().map(|(i, v)| (i.to_string(), v)).collect(),
        _ => return,
    };
    for (key, value) in slots {
        if !is_implicit_ref(value, record_id, &key) {
            continue;
        }
        let kept = new.is_some_and(|n| match n {
            Value::Object(map) => map.get(&key) == Some(value),
            Value::Array(items) => key
                .parse::<usize>()
                .ok()
                .and_then(|i| items.get(i))
                == Some(value),
            _ => false,
        });
        if !kept {
            deleted.insert(join(record_id, &key));
        }
    }
}

/// Remove owning references to placed records from an object record value.
fn strip_owned_refs(record_id: &str, value: &Value, placed: &BTreeSet<&str>) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, v)| {
                    !(is_implicit_ref(v, record_id, key)
                        && placed.contains(join(record_id, key).as_str()))
                })
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Strip old values, array tags and re-derivable owning references.
fn coalesce(
    delta: &Delta,
    path: &str,
    record_level: bool,
    placed: &BTreeSet<&str>,
) -> Option<PatchNode> {
    let children: Vec<(String, &Delta)> = match delta {
        Delta::Op(Instruction::Add(new)) | Delta::Op(Instruction::Set { new, .. }) => {
            return Some(PatchNode::Put(new.clone()));
        }
        Delta::Op(Instruction::Delete(_)) => return Some(PatchNode::Remove),
        Delta::Op(Instruction::Move { from, nested }) => {
            return Some(PatchNode::Move {
                from: from.clone(),
                nested: nested
                    .as_deref()
                    .and_then(|n| coalesce(n, path, true, placed))
                    .map(Box::new),
            });
        }
        Delta::Object(children) => children.iter().map(|(k, d)| (k.clone(), d)).collect(),
        Delta::Array(children) => children.iter().map(|(i, d)| (i.to_string(), d)).collect(),
    };

    let mut out = BTreeMap::new();
    for (key, child) in children {
        if record_level {
            if let Some(new) = match child {
                Delta::Op(instruction) => instruction.new_value(),
                _ => None,
            } {
                let target = join(path, &key);
                if is_implicit_ref(new, path, &key) && placed.contains(target.as_str()) {
                    continue;
                }
            }
        }
        if let Some(node) = coalesce(child, &join(path, &key), false, placed) {
            out.insert(key, node);
        }
    }
    (!out.is_empty()).then_some(PatchNode::Children(out))
}

/// Expand one patch node against the value it replaces.
fn expand_node(node: &PatchNode, base: Option<&Value>, path: &str) -> Result<Option<Delta>> {
    match node {
        PatchNode::Put(new) => Ok(Some(match base {
            Some(old) if old == new => return Ok(None),
            Some(old) => Delta::Op(Instruction::Set {
                old: old.clone(),
                new: new.clone(),
            }),
            None => Delta::Op(Instruction::Add(new.clone())),
        })),
        PatchNode::Remove => Ok(base.map(|old| Delta::Op(Instruction::Delete(old.clone())))),
        PatchNode::Move { .. } => Err(RegsyncError::malformed(
            path,
            "move instructions are only valid for whole records",
        )),
        PatchNode::Children(children) => match base {
            Some(old) if is_ref(old) => Ok(Some(Delta::Op(Instruction::Set {
                old: old.clone(),
                new: synthesize(children),
            }))),
            Some(Value::Object(map)) => {
                let mut out = BTreeMap::new();
                for (key, child) in children {
                    if let Some(delta) = expand_node(child, map.get(key), &join(path, key))? {
                        out.insert(key.clone(), delta);
                    }
                }
                Ok((!out.is_empty()).then_some(Delta::Object(out)))
            }
            Some(Value::Array(items)) => {
                let mut out = BTreeMap::new();
                for (key, child) in children {
                    let index = key.parse::<usize>().map_err(|_| {
                        RegsyncError::malformed(join(path, key), "sequence patch key is not an index")
                    })?;
                    if let Some(delta) = expand_node(child, items.get(index), &join(path, key))? {
                        out.insert(index, delta);
                    }
                }
                Ok((!out.is_empty()).then_some(Delta::Array(out)))
            }
            Some(_) => Err(RegsyncError::malformed(
                path,
                "child patch targets a primitive value",
            )),
            None => Err(RegsyncError::malformed(path, "child patch targets nothing")),
        },
    }
}

/// Reject sequence additions that would leave a hole past the end of `value`.
///
/// Additions beyond the current length must be contiguous once stripped
/// owner references are restored.
fn check_appends(delta: &Delta, value: &Value, path: &str) -> Result<()> {
    match (delta, value) {
        (Delta::Array(children), Value::Array(items)) => {
            let mut next_free = items.len();
            for (index, child) in children {
                let child_path = join(path, &index.to_string());
                match items.get(*index) {
                    Some(item) => check_appends(child, item, &child_path)?,
                    None if *index != next_free => {
                        return Err(RegsyncError::malformed(
                            child_path,
                            format!("sequence gap: index {} past length {}", index, next_free),
                        ));
                    }
                    None => next_free += 1,
                }
            }
            Ok(())
        }
        (Delta::Object(children), Value::Object(map)) => {
            for (key, child) in children {
                if let Some(slot) = map.get(key) {
                    check_appends(child, slot, &join(path, key))?;
                }
            }
            Ok(())
        }
        (Delta::Op(Instruction::Move { nested: Some(nested), .. }), _) => {
            check_appends(nested, value, path)
        }
        _ => Ok(()),
    }
}

/// Build a plain value from a child patch that replaces a reference marker.
fn synthesize(children: &BTreeMap<String, PatchNode>) -> Value {
    Value::Object(
        children
            .iter()
            .filter_map(|(key, child)| match child {
                PatchNode::Put(new) => Some((key.clone(), new.clone())),
                PatchNode::Children(grand) => Some((key.clone(), synthesize(grand))),
                PatchNode::Remove | PatchNode::Move { .. } => None,
            })
            .collect(),
    )
}

/// Insert `value` at `key` of a record-level delta unless the delta already
/// mentions that position.
fn set_slot(delta: &mut Delta, key: &str, old: Option<&Value>, value: Value) {
    let instruction = match old {
        Some(old) => Delta::Op(Instruction::Set {
            old: old.clone(),
            new: value,
        }),
        None => Delta::Op(Instruction::Add(value)),
    };
    match delta {
        Delta::Object(children) => {
            children.entry(key.to_string()).or_insert(instruction);
        }
        Delta::Array(children) => {
            if let Ok(index) = key.parse::<usize>() {
                children.entry(index).or_insert(instruction);
            }
        }
        Delta::Op(_) => {}
    }
}

fn slot<'a>(record: &'a Value, key: &str) -> Option<&'a Value> {
    match record {
        Value::Object(map) => map.get(key),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    }
}

fn empty_delta_for(record: &Value) -> Delta {
    if record.is_array() {
        Delta::Array(BTreeMap::new())
    } else {
        Delta::Object(BTreeMap::new())
    }
}

/// Restore owning references that compaction stripped for added or moved
/// records.
fn rederive_owner_refs(diff: &mut Diff, base: &Registry) {
    let placed: Vec<String> = diff
        .iter()
        .filter(|(_, delta)| {
            matches!(
                delta,
                Delta::Op(Instruction::Add(_)) | Delta::Op(Instruction::Move { .. })
            )
        })
        .map(|(id, _)| id.clone())
        .collect();

    for target in placed {
        let Some(parent) = parent_of(&target) else {
            continue;
        };
        let key = key_of(&target);
        let marker = make_ref(&target);
        let base_record = base.get(parent);

        match diff.remove(parent) {
            Some(Delta::Op(Instruction::Add(mut value))) => {
                insert_marker(&mut value, key, marker);
                diff.insert(parent, Delta::Op(Instruction::Add(value)));
            }
            Some(Delta::Op(Instruction::Set { old, mut new })) => {
                insert_marker(&mut new, key, marker);
                diff.insert(parent, Delta::Op(Instruction::Set { old, new }));
            }
            Some(Delta::Op(Instruction::Move { from, nested })) => {
                let mut nested = nested;
                if let Some(record) = base_record {
                    let current = slot(record, key);
                    if current != Some(&marker) {
                        let mut delta = nested.map(|n| *n).unwrap_or_else(|| empty_delta_for(record));
                        set_slot(&mut delta, key, current, marker);
                        nested = Some(Box::new(delta));
                    }
                }
                diff.insert(parent, Delta::Op(Instruction::Move { from, nested }));
            }
            Some(mut delta @ (Delta::Object(_) | Delta::Array(_))) => {
                if let Some(record) = base_record {
                    let current = slot(record, key);
                    if current != Some(&marker) {
                        set_slot(&mut delta, key, current, marker);
                    }
                }
                diff.insert(parent, delta);
            }
            Some(other) => {
                diff.insert(parent, other);
            }
            None => {
                if let Some(record) = base_record {
                    let current = slot(record, key);
                    if current != Some(&marker) {
                        let mut delta = empty_delta_for(record);
                        set_slot(&mut delta, key, current, marker);
                        diff.insert(parent, delta);
                    }
                }
            }
        }
    }
}

fn insert_marker(record: &mut Value, key: &str, marker: Value) {
    match record {
        Value::Object(map) => {
            map.entry(key.to_string()).or_insert(marker);
        }
        Value::Array(items) => {
            if key.parse::<usize>().ok() == Some(items.len()) {
                items.push(marker);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity;
    use serde_json::json;

    fn snapshot(value: Value) -> Snapshot {
        Snapshot::from_value(value).unwrap()
    }

    #[test]
    fn test_add_is_kept_unchanged() {
        let diff = identity::diff(&snapshot(json!({})), &snapshot(json!({ "x": { "id": "x", "v": 1 } })));
        assert_eq!(diff.to_value(), json!({ "x": [{ "id": "x", "v": 1 }] }));
        assert_eq!(
            Patch::from_diff(&diff).to_value(),
            json!({ "x": [{ "id": "x", "v": 1 }] })
        );
    }

    #[test]
    fn test_delete_drops_old_value() {
        let diff = identity::diff(&snapshot(json!({ "r": { "v": 1 } })), &snapshot(json!({})));
        assert_eq!(diff.to_value(), json!({ "r": [{ "v": 1 }, 0, 0] }));
        assert_eq!(Patch::from_diff(&diff).to_value(), json!({ "r": [0, 0] }));
    }

    #[test]
    fn test_set_keeps_only_new_value() {
        let diff = identity::diff(
            &snapshot(json!({ "r/shape/extent": { "x": 100, "y": 20 } })),
            &snapshot(json!({ "r/shape/extent": { "x": 400, "y": 20 } })),
        );
        assert_eq!(diff.to_value(), json!({ "r/shape/extent": { "x": [100, 400] } }));
        assert_eq!(
            Patch::from_diff(&diff).to_value(),
            json!({ "r/shape/extent": { "x": [400] } })
        );
    }

    #[test]
    fn test_nested_deletions_collapse_to_prefix() {
        let base = snapshot(json!({
            "": { "a": make_ref("a") },
            "a": { "b": make_ref("a/b") },
            "a/b": { "c": make_ref("a/b/c") },
            "a/b/c": { "v": 1 }
        }));
        let next = snapshot(json!({ "": {} }));

        let diff = identity::diff(&base, &next);
        let patch = Patch::from_diff(&diff);
        assert_eq!(patch.to_value(), json!({ "": { "a": [0, 0] }, "a": [0, 0] }));

        let expanded = patch.expand(&base).unwrap();
        assert_eq!(expanded.len(), 4);
        assert!(matches!(expanded.get("a/b/c"), Some(Delta::Op(Instruction::Delete(_)))));
    }

    #[test]
    fn test_owning_refs_to_added_records_are_stripped() {
        let base = snapshot(json!({ "": {} }));
        let next = snapshot(json!({
            "": { "a": make_ref("a") },
            "a": { "id": "A", "b": make_ref("a/b") },
            "a/b": { "v": 1 }
        }));

        let patch = Patch::from_diff(&identity::diff(&base, &next));
        assert_eq!(
            patch.to_value(),
            json!({ "a": [{ "id": "A" }], "a/b": [{ "v": 1 }] })
        );

        let expanded = patch.expand(&base).unwrap();
        assert_eq!(
            expanded.get(""),
            Some(&Delta::Object(BTreeMap::from([(
                "a".to_string(),
                Delta::Op(Instruction::Add(make_ref("a")))
            )])))
        );
        assert_eq!(
            expanded.get("a"),
            Some(&Delta::Op(Instruction::Add(json!({ "id": "A", "b": make_ref("a/b") }))))
        );
    }

    #[test]
    fn test_children_over_marker_become_set() {
        let base = snapshot(json!({ "r": { "link": make_ref("elsewhere") } }));
        let patch = Patch::from_value(&json!({ "r": { "link": { "x": [1] } } })).unwrap();
        let expanded = patch.expand(&base).unwrap();
        assert_eq!(
            expanded.to_value(),
            json!({ "r": { "link": [make_ref("elsewhere"), { "x": 1 }] } })
        );
    }

    #[test]
    fn test_children_over_missing_record_is_malformed() {
        let patch = Patch::from_value(&json!({ "missing": { "x": [1] } })).unwrap();
        let err = patch.expand(&Snapshot::empty()).unwrap_err();
        assert!(matches!(err, RegsyncError::MalformedPatch { path, .. } if path == "missing"));
    }

    #[test]
    fn test_sequence_gap_is_malformed() {
        let base = snapshot(json!({ "list": [1] }));
        let patch = Patch::from_json_str(r#"{"list":{"18446744073709551615":[7]}}"#).unwrap();

        let err = patch.expand(&base).unwrap_err();
        assert!(matches!(
            err,
            RegsyncError::MalformedPatch { path, .. } if path == "list/18446744073709551615"
        ));
    }

    #[test]
    fn test_append_after_stripped_owner_ref() {
        let base = snapshot(json!({ "": { "list": make_ref("list") }, "list": [1] }));
        let next = snapshot(json!({
            "": { "list": make_ref("list") },
            "list": [1, make_ref("list/1"), 5],
            "list/1": { "v": 1 }
        }));

        let patch = Patch::from_diff(&identity::diff(&base, &next));
        let applied = crate::apply::Applier::new().apply_patch(&patch, &base).unwrap();
        assert_eq!(applied, next);
    }

    #[test]
    fn test_rejects_unknown_instruction() {
        let err = Patch::from_json_str(r#"{"r":[1,2]}"#).unwrap_err();
        assert!(matches!(err, RegsyncError::MalformedPatch { .. }));
    }

    #[test]
    fn test_json_text_round_trip() {
        let text = r#"{"a":[0,0],"b":[{"v":1}],"c/d":[0,"a/b",{"field":[2]},0],"e":{"0":[3]}}"#;
        let patch = Patch::from_json_str(text).unwrap();
        assert_eq!(patch.len(), 4);
        assert_eq!(Patch::from_json_str(&patch.to_json_string().unwrap()).unwrap(), patch);
    }
}
