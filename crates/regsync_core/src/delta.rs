//! Structural differences between JSON values.
//!
//! A [`Delta`] mirrors the shape of the value it describes: containers hold
//! per-key (or per-index) sub-deltas and leaves hold an [`Instruction`]. A
//! [`Diff`] is a delta per registry id.
//!
//! The tagged types are used everywhere inside the crate. The
//! length-overloaded array encoding only exists at the wire/storage
//! boundary (`to_value` / `from_value`):
//!
//! | Instruction | Encoding               |
//! |-------------|------------------------|
//! | add         | `[new]`                |
//! | set         | `[old, new]`           |
//! | delete      | `[old, 0, 0]`          |
//! | move/copy   | `[0, from, nested, 0]` |
//!
//! Sequence sub-deltas carry `"_t": "a"` so they are applied index-wise.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::{PathFailure, RegsyncError, Result};
use crate::apply::PatchHooks;
use crate::registry::{is_ref, join};

/// Key marking a sequence sub-delta.
pub const ARRAY_TAG_KEY: &str = "_t";

/// Value of [`ARRAY_TAG_KEY`] for sequence sub-deltas.
pub const ARRAY_TAG: &str = "a";

/// A leaf change.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Add(Value),
    Set { old: Value, new: Value },
    Delete(Value),
    /// Relocate the record at `from` to this position, then apply `nested`.
    Move {
        from: String,
        nested: Option<Box<Delta>>,
    },
}

impl Instruction {
    /// The value this instruction leaves behind, if it assigns one.
    pub fn new_value(&self) -> Option<&Value> {
        match self {
            Instruction::Add(new) | Instruction::Set { new, .. } => Some(new),
            _ => None,
        }
    }

    /// The value this instruction replaces or removes, if known.
    pub fn old_value(&self) -> Option<&Value> {
        match self {
            Instruction::Set { old, .. } | Instruction::Delete(old) => Some(old),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Instruction::Add(new) => Value::Array(vec![new.clone()]),
            Instruction::Set { old, new } => Value::Array(vec![old.clone(), new.clone()]),
            Instruction::Delete(old) => Value::Array(vec![old.clone(), zero(), zero()]),
            Instruction::Move { from, nested } => Value::Array(vec![
                zero(),
                Value::String(from.clone()),
                nested
                    .as_ref()
                    .map(|n| n.to_value())
                    .unwrap_or_else(|| Value::Object(Map::new())),
                zero(),
            ]),
        }
    }

    fn from_items(path: &str, items: &[Value]) -> Result<Self> {
        match items {
            [new] => Ok(Instruction::Add(new.clone())),
            [old, new] => Ok(Instruction::Set {
                old: old.clone(),
                new: new.clone(),
            }),
            [old, a, b] if is_zero(a) && is_zero(b) => Ok(Instruction::Delete(old.clone())),
            [a, Value::String(from), nested, b] if is_zero(a) && is_zero(b) => {
                let nested = match nested {
                    Value::Object(map) if map.is_empty() => None,
                    Value::Object(_) => Some(Box::new(Delta::from_value(path, nested)?)),
                    _ => {
                        return Err(RegsyncError::malformed(
                            path,
                            "move instruction must carry an object diff",
                        ));
                    }
                };
                Ok(Instruction::Move {
                    from: from.clone(),
                    nested,
                })
            }
            _ => Err(RegsyncError::malformed(
                path,
                format!("unrecognized instruction of length {}", items.len()),
            )),
        }
    }
}

pub(crate) fn zero() -> Value {
    Value::from(0)
}

pub(crate) fn is_zero(value: &Value) -> bool {
    value.as_f64() == Some(0.0)
}

/// A structural difference, shaped like the value it describes.
#[derive(Debug, Clone, PartialEq)]
pub enum Delta {
    Op(Instruction),
    Object(BTreeMap<String, Delta>),
    Array(BTreeMap<usize, Delta>),
}

impl Delta {
    pub fn to_value(&self) -> Value {
        match self {
            Delta::Op(instruction) => instruction.to_value(),
            Delta::Object(children) => Value::Object(
                children
                    .iter()
                    .map(|(key, child)| (key.clone(), child.to_value()))
                    .collect(),
            ),
            Delta::Array(children) => {
                let mut map: Map<String, Value> = children
                    .iter()
                    .map(|(index, child)| (index.to_string(), child.to_value()))
                    .collect();
                map.insert(ARRAY_TAG_KEY.to_string(), Value::String(ARRAY_TAG.to_string()));
                Value::Object(map)
            }
        }
    }

    /// Decode the wire form found at `path`.
    pub fn from_value(path: &str, value: &Value) -> Result<Self> {
        match value {
            Value::Array(items) => Ok(Delta::Op(Instruction::from_items(path, items)?)),
            Value::Object(map) if is_array_tagged(map) => {
                let mut children = BTreeMap::new();
                for (key, child) in map.iter().filter(|(k, _)| *k != ARRAY_TAG_KEY) {
                    let index = key.parse::<usize>().map_err(|_| {
                        RegsyncError::malformed(join(path, key), "sequence diff key is not an index")
                    })?;
                    children.insert(index, Delta::from_value(&join(path, key), child)?);
                }
                Ok(Delta::Array(children))
            }
            Value::Object(map) => {
                let mut children = BTreeMap::new();
                for (key, child) in map {
                    children.insert(key.clone(), Delta::from_value(&join(path, key), child)?);
                }
                Ok(Delta::Object(children))
            }
            _ => Err(RegsyncError::malformed(
                path,
                "expected an instruction array or a diff object",
            )),
        }
    }

    /// The delta that undoes this one.
    ///
    /// Moves cannot be reversed without the registry they were computed on.
    pub fn reversed(&self) -> Result<Delta> {
        Ok(match self {
            Delta::Op(Instruction::Add(new)) => Delta::Op(Instruction::Delete(new.clone())),
            Delta::Op(Instruction::Delete(old)) => Delta::Op(Instruction::Add(old.clone())),
            Delta::Op(Instruction::Set { old, new }) => Delta::Op(Instruction::Set {
                old: new.clone(),
                new: old.clone(),
            }),
            Delta::Op(Instruction::Move { from, .. }) => {
                return Err(RegsyncError::malformed(
                    from.clone(),
                    "move instructions cannot be reversed",
                ));
            }
            Delta::Object(children) => Delta::Object(
                children
                    .iter()
                    .map(|(key, child)| Ok((key.clone(), child.reversed()?)))
                    .collect::<Result<_>>()?,
            ),
            Delta::Array(children) => Delta::Array(
                children
                    .iter()
                    .map(|(index, child)| Ok((*index, child.reversed()?)))
                    .collect::<Result<_>>()?,
            ),
        })
    }
}

pub(crate) fn is_array_tagged(map: &Map<String, Value>) -> bool {
    map.get(ARRAY_TAG_KEY).and_then(Value::as_str) == Some(ARRAY_TAG)
}

/// Compute the structural difference between two values.
///
/// Returns `None` when they are equal. Reference markers are compared as
/// atoms: a changed marker is a `Set`, never a sub-delta.
pub fn diff_values(old: &Value, new: &Value) -> Option<Delta> {
    if old == new {
        return None;
    }

    match (old, new) {
        (Value::Object(a), Value::Object(b)) if !is_ref(old) && !is_ref(new) => {
            let keys: BTreeSet<&String> = a.keys().chain(b.keys()).collect();
            let children: BTreeMap<String, Delta> = keys
                .into_iter()
                .filter_map(|key| {
                    diff_slots(a.get(key), b.get(key)).map(|child| (key.clone(), child))
                })
                .collect();
            (!children.is_empty()).then_some(Delta::Object(children))
        }
        (Value::Array(a), Value::Array(b)) => {
            let children: BTreeMap<usize, Delta> = (0..a.len().max(b.len()))
                .filter_map(|i| diff_slots(a.get(i), b.get(i)).map(|child| (i, child)))
                .collect();
            (!children.is_empty()).then_some(Delta::Array(children))
        }
        _ => Some(Delta::Op(Instruction::Set {
            old: old.clone(),
            new: new.clone(),
        })),
    }
}

/// Difference between two optional positions.
pub fn diff_slots(old: Option<&Value>, new: Option<&Value>) -> Option<Delta> {
    match (old, new) {
        (None, None) => None,
        (None, Some(new)) => Some(Delta::Op(Instruction::Add(new.clone()))),
        (Some(old), None) => Some(Delta::Op(Instruction::Delete(old.clone()))),
        (Some(old), Some(new)) => diff_values(old, new),
    }
}

/// Apply a delta to a plain value, without identity tracking.
///
/// Every applicable position is applied; failing subtrees are reported
/// together in [`RegsyncError::ApplyFailed`].
pub fn patch(value: &mut Value, delta: &Delta) -> Result<()> {
    let mut failures = Vec::new();
    match delta {
        Delta::Op(Instruction::Add(new)) | Delta::Op(Instruction::Set { new, .. }) => {
            *value = new.clone()
        }
        Delta::Op(Instruction::Delete(_)) => *value = Value::Null,
        Delta::Op(Instruction::Move { from, .. }) => failures.push(PathFailure {
            path: String::new(),
            reason: format!("move from '{}' requires a registry", from),
        }),
        _ => apply_delta(value, delta, "", None, &mut failures),
    }
    if failures.is_empty() {
        Ok(())
    } else {
        Err(RegsyncError::ApplyFailed(failures))
    }
}

/// Undo a delta previously applied with [`patch`].
pub fn unpatch(value: &mut Value, delta: &Delta) -> Result<()> {
    patch(value, &delta.reversed()?)
}

/// Hook context for the first level of a record.
pub(crate) struct RecordHook<'a> {
    pub hooks: &'a dyn PatchHooks,
    pub record_id: &'a str,
}

/// Walk a container delta against `target`, mutating it in place.
///
/// Failures are pushed and the walk continues with the next sibling.
pub(crate) fn apply_delta(
    target: &mut Value,
    delta: &Delta,
    path: &str,
    hook: Option<&RecordHook<'_>>,
    failures: &mut Vec<PathFailure>,
) {
    match (delta, target) {
        (Delta::Object(children), Value::Object(map)) => {
            for (key, child) in children {
                let child_path = join(path, key);
                match child {
                    Delta::Op(Instruction::Add(new)) | Delta::Op(Instruction::Set { new, .. }) => {
                        let handled = hook.is_some_and(|h| {
                            h.hooks.set_field(h.record_id, map, key, new)
                        });
                        if !handled {
                            map.insert(key.clone(), new.clone());
                        }
                    }
                    Delta::Op(Instruction::Delete(_)) => {
                        if map.remove(key).is_none() {
                            log::debug!("delete of absent position {}", child_path);
                        }
                    }
                    Delta::Op(Instruction::Move { from, .. }) => failures.push(PathFailure {
                        path: child_path,
                        reason: format!("move from '{}' is only valid for a record", from),
                    }),
                    Delta::Object(_) | Delta::Array(_) => match map.get_mut(key) {
                        Some(slot) => apply_delta(slot, child, &child_path, None, failures),
                        None => failures.push(PathFailure {
                            path: child_path,
                            reason: "no value to patch".to_string(),
                        }),
                    },
                }
            }
        }
        (Delta::Array(children), Value::Array(items)) => {
            for (index, child) in children {
                let child_path = join(path, &index.to_string());
                match child {
                    Delta::Op(Instruction::Add(new)) | Delta::Op(Instruction::Set { new, .. }) => {
                        if *index < items.len() {
                            items[*index] = new.clone();
                        } else if *index == items.len() {
                            items.push(new.clone());
                        } else {
                            failures.push(PathFailure {
                                path: child_path,
                                reason: format!(
                                    "sequence gap: index {} past length {}",
                                    index,
                                    items.len()
                                ),
                            });
                        }
                    }
                    Delta::Op(Instruction::Delete(_)) => {}
                    Delta::Op(Instruction::Move { from, .. }) => failures.push(PathFailure {
                        path: child_path,
                        reason: format!("move from '{}' is only valid for a record", from),
                    }),
                    Delta::Object(_) | Delta::Array(_) => match items.get_mut(*index) {
                        Some(slot) => apply_delta(slot, child, &child_path, None, failures),
                        None => failures.push(PathFailure {
                            path: child_path,
                            reason: "no value to patch".to_string(),
                        }),
                    },
                }
            }
            // Deletions last, highest index first, so earlier indices stay valid.
            for (index, child) in children.iter().rev() {
                if matches!(child, Delta::Op(Instruction::Delete(_))) && *index < items.len() {
                    items.remove(*index);
                }
            }
        }
        (Delta::Array(_), _) => failures.push(PathFailure {
            path: path.to_string(),
            reason: "sequence diff targets a non-sequence value".to_string(),
        }),
        (Delta::Object(_), Value::Array(_)) => failures.push(PathFailure {
            path: path.to_string(),
            reason: "object diff targets a sequence value".to_string(),
        }),
        (Delta::Object(_), _) => failures.push(PathFailure {
            path: path.to_string(),
            reason: "object diff targets a primitive value".to_string(),
        }),
        (Delta::Op(_), _) => failures.push(PathFailure {
            path: path.to_string(),
            reason: "instruction found where a container diff was expected".to_string(),
        }),
    }
}

/// Per-id deltas between two registries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Diff {
    entries: BTreeMap<String, Delta>,
}

impl Diff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, id: &str) -> Option<&Delta> {
        self.entries.get(id)
    }

    pub fn insert(&mut self, id: impl Into<String>, delta: Delta) -> Option<Delta> {
        self.entries.insert(id.into(), delta)
    }

    pub fn remove(&mut self, id: &str) -> Option<Delta> {
        self.entries.remove(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Delta)> {
        self.entries.iter()
    }

    /// Move instructions as `(destination, source)` pairs.
    pub fn moves(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().filter_map(|(to, delta)| match delta {
            Delta::Op(Instruction::Move { from, .. }) => Some((to.as_str(), from.as_str())),
            _ => None,
        })
    }

    /// Build a diff from the delta between two whole registry values.
    pub fn from_root_delta(delta: Option<Delta>) -> Result<Self> {
        match delta {
            None => Ok(Diff::new()),
            Some(Delta::Object(entries)) => Ok(Diff { entries }),
            Some(_) => Err(RegsyncError::malformed(
                "",
                "registry diff must be keyed by record id",
            )),
        }
    }

    /// The diff as a single delta over the registry value.
    pub fn into_root_delta(self) -> Option<Delta> {
        (!self.entries.is_empty()).then_some(Delta::Object(self.entries))
    }

    pub fn to_value(&self) -> Value {
        Value::Object(
            self.entries
                .iter()
                .map(|(id, delta)| (id.clone(), delta.to_value()))
                .collect(),
        )
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        let Value::Object(map) = value else {
            return Err(RegsyncError::malformed("", "diff must be a JSON object"));
        };
        let mut entries = BTreeMap::new();
        for (id, delta) in map {
            entries.insert(id.clone(), Delta::from_value(id, delta)?);
        }
        Ok(Diff { entries })
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.to_value())?)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        Self::from_value(&serde_json::from_str(text)?)
    }
}

impl FromIterator<(String, Delta)> for Diff {
    fn from_iter<I: IntoIterator<Item = (String, Delta)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl Serialize for Diff {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Diff {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Diff::from_value(&value).map_err(serde::de::Error::custom)
    }
}
