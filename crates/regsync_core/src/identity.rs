//! Identity-aware differencing.
//!
//! Records carrying an identity tag (their `id` field) can change path
//! between snapshots. [`detect_moves`] pairs the old and new positions of
//! such records, [`relocate`] replays those relocations on a registry and
//! [`diff`] folds each relocation into a single move instruction that
//! carries the record's own changes.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde_json::Value;

use crate::delta::{Delta, Diff, Instruction, diff_slots};
use crate::error::{RegsyncError, Result};
use crate::registry::{
    Registry, Snapshot, is_within, key_of, make_ref, parent_of, rebase, ref_target,
};

/// A record relocated from `from` to `to`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Move {
    pub from: String,
    pub to: String,
}

impl Move {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

fn tag_key(tag: &Value) -> String {
    tag.to_string()
}

/// Find records whose identity tag moved to another path.
///
/// A record is a candidate when its tag is absent from, or different at,
/// the same id in `new`. Every id in `new` holding the tag that did not
/// already hold it in `old` is a destination, so a record copied to two
/// places yields two moves. Relocations implied by an ancestor's move are
/// dropped.
pub fn detect_moves(old: &Registry, new: &Registry) -> Vec<Move> {
    let mut targets: BTreeMap<String, Vec<&String>> = BTreeMap::new();
    for id in new.ids() {
        if let Some(tag) = new.identity_tag(id) {
            targets.entry(tag_key(tag)).or_default().push(id);
        }
    }

    let mut claimed = HashSet::new();
    let mut detected = Vec::new();
    for id in old.ids() {
        if id.is_empty() {
            continue;
        }
        let Some(tag) = old.identity_tag(id) else {
            continue;
        };
        if new.identity_tag(id) == Some(tag) {
            continue;
        }
        let key = tag_key(tag);
        let Some(candidates) = targets.get(&key) else {
            continue;
        };
        if !claimed.insert(key) {
            log::debug!("identity tag {} already moved, ignoring source {}", tag, id);
            continue;
        }

        let old_is_array = old.get(id).is_some_and(Value::is_array);
        let destinations = candidates.iter().filter(|to| {
            !to.is_empty()
                && old.identity_tag(to) != Some(tag)
                && new.get(to).is_some_and(|r| r.is_array() == old_is_array)
        });
        for to in destinations {
            detected.push(Move::new(id.clone(), (*to).clone()));
        }
    }

    detected.sort();
    let mut kept: Vec<Move> = Vec::new();
    for mv in detected {
        let ancestors: Vec<&Move> = kept
            .iter()
            .filter(|a| a.from != mv.from && is_within(&mv.from, &a.from))
            .collect();
        let nearest = ancestors.iter().map(|a| a.from.len()).max();
        // Only drop the nested move when its nearest ancestor carries it to the same place.
        let implied = ancestors
            .iter()
            .filter(|a| Some(a.from.len()) == nearest)
            .any(|a| rebase(&mv.from, &a.from, &a.to).as_deref() == Some(mv.to.as_str()));
        if implied {
            log::debug!("move {} -> {} implied by ancestor", mv.from, mv.to);
            continue;
        }
        kept.push(mv);
    }
    kept
}

/// Rewrite reference markers pointing into `from` so they point into `to`.
pub(crate) fn rewrite_refs(value: &mut Value, from: &str, to: &str) {
    if let Some(target) = ref_target(value) {
        if let Some(rebased) = rebase(target, from, to) {
            *value = make_ref(&rebased);
        }
        return;
    }
    match value {
        Value::Object(map) => map.values_mut().for_each(|v| rewrite_refs(v, from, to)),
        Value::Array(items) => items.iter_mut().for_each(|v| rewrite_refs(v, from, to)),
        _ => {}
    }
}

/// Drop the owning reference to `id` from its parent record.
fn detach(registry: &mut Registry, id: &str) {
    let Some(parent) = parent_of(id) else {
        return;
    };
    match registry.get_mut(parent) {
        Some(Value::Object(map)) => {
            if map.get(key_of(id)).and_then(ref_target) == Some(id) {
                map.remove(key_of(id));
            }
        }
        Some(Value::Array(items)) => {
            if let Some(pos) = items.iter().position(|v| ref_target(v) == Some(id)) {
                items.remove(pos);
            }
        }
        _ => {}
    }
}

/// Point the parent record of `id` at it, if that parent exists.
fn attach(registry: &mut Registry, id: &str) {
    let Some(parent) = parent_of(id) else {
        return;
    };
    let key = key_of(id);
    match registry.get_mut(parent) {
        Some(Value::Object(map)) => {
            map.insert(key.to_string(), make_ref(id));
        }
        Some(Value::Array(items)) => match key.parse::<usize>() {
            Ok(index) if index < items.len() => items[index] = make_ref(id),
            Ok(_) => items.push(make_ref(id)),
            Err(_) => log::warn!("cannot attach {} to sequence record {}", id, parent),
        },
        _ => {}
    }
}

/// Relocate every move's subtree inside `registry`.
///
/// All sources are captured before anything is removed, so moves may swap
/// or nest. Fails without touching the registry when a source is missing.
pub fn relocate(registry: &mut Registry, moves: &[Move]) -> Result<()> {
    let mut sources = Vec::with_capacity(moves.len());
    for mv in moves {
        if mv.from.is_empty() || mv.to.is_empty() {
            return Err(RegsyncError::malformed(
                mv.to.clone(),
                "the root record cannot be moved",
            ));
        }
        let subtree: Vec<(String, Value)> = registry
            .subtree_ids(&mv.from)
            .into_iter()
            .filter_map(|id| registry.get(&id).cloned().map(|record| (id, record)))
            .collect();
        if !registry.contains(&mv.from) {
            return Err(RegsyncError::UnresolvedPath(mv.from.clone()));
        }
        sources.push((mv, subtree));
    }

    for mv in moves {
        registry.remove_subtree(&mv.from);
        detach(registry, &mv.from);
    }

    // Outer destinations first so inner ones overwrite what they carried.
    sources.sort_by_key(|(mv, _)| mv.to.len());
    for (mv, subtree) in sources {
        registry.remove_subtree(&mv.to);
        for (id, mut record) in subtree {
            rewrite_refs(&mut record, &mv.from, &mv.to);
            let id = rebase(&id, &mv.from, &mv.to).unwrap_or(id);
            registry.insert(id, record);
        }
        attach(registry, &mv.to);
    }
    Ok(())
}

/// Per-id structural diff, without move detection.
pub fn structural_diff(old: &Registry, new: &Registry) -> Diff {
    let ids: BTreeSet<&String> = old.ids().chain(new.ids()).collect();
    ids.into_iter()
        .filter_map(|id| diff_slots(old.get(id), new.get(id)).map(|delta| (id.clone(), delta)))
        .collect()
}

/// Diff two snapshots, folding identity-preserving relocations into moves.
pub fn diff(old: &Snapshot, new: &Snapshot) -> Diff {
    diff_registries(old.registry(), new.registry())
}

pub fn diff_registries(old: &Registry, new: &Registry) -> Diff {
    let moves = detect_moves(old, new);
    if moves.is_empty() {
        return structural_diff(old, new);
    }

    let mut relocated = old.clone();
    if let Err(err) = relocate(&mut relocated, &moves) {
        log::warn!("relocation failed, diffing without moves: {}", err);
        return structural_diff(old, new);
    }

    let mut result = structural_diff(&relocated, new);
    for mv in &moves {
        let nested = match result.remove(&mv.to) {
            None => None,
            Some(delta @ (Delta::Object(_) | Delta::Array(_))) => Some(Box::new(delta)),
            Some(_) => {
                log::warn!("record at {} changed kind after move, diffing without moves", mv.to);
                return structural_diff(old, new);
            }
        };
        result.insert(
            mv.to.clone(),
            Delta::Op(Instruction::Move {
                from: mv.from.clone(),
                nested,
            }),
        );
    }
    result
}
