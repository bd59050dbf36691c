//! Replaying diffs against a registry.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::delta::{Delta, Diff, Instruction, RecordHook, apply_delta};
use crate::error::{PathFailure, RegsyncError, Result};
use crate::identity::{Move, relocate, rewrite_refs};
use crate::patch::Patch;
use crate::registry::{Registry, Snapshot, is_implicit_ref, is_record, join, rebase, ref_target};

/// Injection points for the layer that owns the live objects.
pub trait PatchHooks: Send + Sync {
    /// Assign `value` to `key` of the record at `record_id`.
    ///
    /// Return `true` if the assignment was handled; the default plain
    /// insert is skipped in that case.
    fn set_field(
        &self,
        _record_id: &str,
        _record: &mut Map<String, Value>,
        _key: &str,
        _value: &Value,
    ) -> bool {
        false
    }

    /// Called after every apply that completed without failures.
    fn after_apply(&self, _registry: &Registry, _diff: &Diff) {}
}

/// Applies diffs in two phases: relocations first, then structural changes.
#[derive(Clone, Default)]
pub struct Applier {
    hooks: Option<Arc<dyn PatchHooks>>,
}

impl Applier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hooks(hooks: Arc<dyn PatchHooks>) -> Self {
        Self { hooks: Some(hooks) }
    }

    /// Apply `diff` to `registry` in place.
    ///
    /// A failing record or position does not stop the rest of the diff from
    /// being applied; all failures are returned together.
    pub fn apply(&self, diff: &Diff, registry: &mut Registry) -> Result<()> {
        let mut failures = Vec::new();

        let moves: Vec<Move> = diff.moves().map(|(to, from)| Move::new(from, to)).collect();
        if !moves.is_empty() {
            match relocate(registry, &moves) {
                Ok(()) => {}
                Err(RegsyncError::UnresolvedPath(path)) => failures.push(PathFailure {
                    path,
                    reason: "move source does not exist".to_string(),
                }),
                Err(RegsyncError::MalformedPatch { path, reason }) => {
                    failures.push(PathFailure { path, reason })
                }
                Err(err) => return Err(err),
            }
        }

        let mut removed = BTreeSet::new();
        for (id, delta) in diff.iter() {
            match delta {
                Delta::Op(Instruction::Add(new)) | Delta::Op(Instruction::Set { new, .. }) => {
                    if is_record(new) {
                        registry.insert(id.clone(), new.clone());
                    } else {
                        failures.push(PathFailure {
                            path: id.clone(),
                            reason: "a record must be an object or a sequence".to_string(),
                        });
                    }
                }
                Delta::Op(Instruction::Delete(_)) => {
                    if registry.remove(id).is_some() {
                        removed.insert(id.clone());
                    } else {
                        log::debug!("delete of absent record {}", id);
                    }
                }
                Delta::Op(Instruction::Move { nested, .. }) => {
                    if let Some(nested) = nested {
                        self.apply_record(registry, id, nested, &mut failures);
                    }
                }
                Delta::Object(_) | Delta::Array(_) => {
                    self.apply_record(registry, id, delta, &mut failures);
                }
            }
        }

        removed.retain(|id| !registry.contains(id));
        if !removed.is_empty() {
            invalidate_refs(registry, &removed);
        }

        if !failures.is_empty() {
            return Err(RegsyncError::ApplyFailed(failures));
        }
        if let Some(hooks) = &self.hooks {
            hooks.after_apply(registry, diff);
        }
        Ok(())
    }

    /// Apply `diff` to a copy of `snapshot`.
    pub fn apply_to(&self, diff: &Diff, snapshot: &Snapshot) -> Result<Snapshot> {
        let mut registry = snapshot.registry().clone();
        self.apply(diff, &mut registry)?;
        Ok(Snapshot::new(registry))
    }

    /// Expand `patch` against `base` and apply it to a copy.
    pub fn apply_patch(&self, patch: &Patch, base: &Snapshot) -> Result<Snapshot> {
        let diff = patch.expand(base)?;
        self.apply_to(&diff, base)
    }

    fn apply_record(
        &self,
        registry: &mut Registry,
        id: &str,
        delta: &Delta,
        failures: &mut Vec<PathFailure>,
    ) {
        let Some(record) = registry.get_mut(id) else {
            failures.push(PathFailure {
                path: id.to_string(),
                reason: "no record at path".to_string(),
            });
            return;
        };
        let hook = self.hooks.as_deref().map(|hooks| RecordHook {
            hooks,
            record_id: id,
        });
        apply_delta(record, delta, id, hook.as_ref(), failures);
    }
}

/// Drop record-level references to records that no longer exist.
///
/// Dropping a sequence slot shifts the slots after it, so child records
/// owned through those slots are renamed to their new index.
fn invalidate_refs(registry: &mut Registry, removed: &BTreeSet<String>) {
    let dangling = |value: &Value| ref_target(value).is_some_and(|t| removed.contains(t));
    let mut shifts: Vec<(String, String)> = Vec::new();
    let ids: Vec<String> = registry.ids().cloned().collect();
    for id in ids {
        let Some(record) = registry.get_mut(&id) else {
            continue;
        };
        match record {
            Value::Object(map) => map.retain(|key, value| {
                let keep = !dangling(value);
                if !keep {
                    log::debug!("dropping dangling reference {}/{}", id, key);
                }
                keep
            }),
            Value::Array(items) => {
                let mut kept = Vec::with_capacity(items.len());
                for (index, value) in std::mem::take(items).into_iter().enumerate() {
                    if dangling(&value) {
                        log::debug!("dropping dangling reference {}/{}", id, index);
                        continue;
                    }
                    let key = index.to_string();
                    if kept.len() != index && is_implicit_ref(&value, &id, &key) {
                        shifts.push((join(&id, &key), join(&id, &kept.len().to_string())));
                    }
                    kept.push(value);
                }
                *items = kept;
            }
            _ => {}
        }
    }

    // Deepest first; siblings keep ascending order so each target is free.
    shifts.sort_by_key(|(from, _)| std::cmp::Reverse(from.split('/').count()));
    for (from, to) in shifts {
        shift_subtree(registry, &from, &to);
    }
}

/// Rename the subtree at `from` to `to` and retarget every reference into it.
fn shift_subtree(registry: &mut Registry, from: &str, to: &str) {
    log::debug!("shifting {} to {}", from, to);
    for (id, record) in registry.remove_subtree(from) {
        let id = rebase(&id, from, to).unwrap_or(id);
        registry.insert(id, record);
    }
    let ids: Vec<String> = registry.ids().cloned().collect();
    for id in ids {
        if let Some(record) = registry.get_mut(&id) {
            rewrite_refs(record, from, to);
        }
    }
}
