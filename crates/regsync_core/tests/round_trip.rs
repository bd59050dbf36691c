//! End-to-end properties of the diff -> patch -> expand -> apply pipeline.

use regsync_core::delta::{self, Delta, Instruction, diff_values};
use regsync_core::{
    Applier, Diff, JsonTreeSerializer, Patch, Snapshot, SnapshotSerializer, diff,
};
use serde_json::{Value, json};

fn tree(value: Value) -> Snapshot {
    JsonTreeSerializer.objects_to_snapshot(&value).unwrap()
}

fn registry(value: Value) -> Snapshot {
    Snapshot::from_value(value).unwrap()
}

/// Diff, compact, send as text, expand against the base and apply.
fn replay(a: &Snapshot, b: &Snapshot) -> Snapshot {
    let patch = Patch::from_diff(&diff(a, b));
    let wire = patch.to_json_string().unwrap();
    let received = Patch::from_json_str(&wire).unwrap();
    let expanded = received.expand(a).unwrap();
    Applier::new().apply_to(&expanded, a).unwrap()
}

fn assert_round_trip(a: &Snapshot, b: &Snapshot) {
    assert_eq!(&replay(a, b), b, "forward replay");
    assert_eq!(&replay(b, a), a, "backward replay");
}

fn pairs() -> Vec<(Snapshot, Snapshot)> {
    vec![
        // field changes, additions and deletions
        (
            tree(json!({
                "title": "s",
                "shapes": [{ "id": "s1", "w": 1 }, { "id": "s2", "w": 2 }],
                "meta": { "k": 1 }
            })),
            tree(json!({
                "title": "t",
                "shapes": [{ "id": "s1", "w": 5 }],
                "extra": { "n": [1, 2] }
            })),
        ),
        // relocation with a nested change
        (
            tree(json!({
                "left": { "box": { "id": "B", "w": 1, "inner": { "z": 1 } } },
                "right": {}
            })),
            tree(json!({
                "left": {},
                "right": { "box2": { "id": "B", "w": 2, "inner": { "z": 1 } } }
            })),
        ),
        // copy over a replaced source
        (
            tree(json!({ "slot": { "id": "A", "v": 1 }, "dest": {} })),
            tree(json!({ "slot": { "id": "C", "v": 9 }, "dest": { "x": { "id": "A", "v": 1 } } })),
        ),
        // swap
        (
            tree(json!({ "a": { "id": "X", "v": 1 }, "b": { "id": "Y", "v": 2 } })),
            tree(json!({ "a": { "id": "Y", "v": 2 }, "b": { "id": "X", "v": 1 } })),
        ),
        // copy to two destinations
        (
            tree(json!({ "a": { "id": "X", "v": 1 } })),
            tree(json!({ "b": { "id": "X", "v": 1 }, "c": { "id": "X", "v": 1 } })),
        ),
        // move under a new parent
        (
            tree(json!({ "a": { "id": "X", "v": 1 } })),
            tree(json!({ "n": { "m": { "id": "X", "v": 1 } } })),
        ),
        // move out of a deleted parent
        (
            tree(json!({ "old": { "keep": { "id": "K", "v": 1 }, "junk": { "v": 0 } } })),
            tree(json!({ "new": { "id": "K", "v": 1 } })),
        ),
        // sequences of primitives and records
        (
            tree(json!({ "list": [1, 2, 3] })),
            tree(json!({ "list": [1, { "id": "n" }, 3, 4] })),
        ),
        // deep deletion with an aliasing reference
        (
            tree(json!({
                "r": { "shape": { "extent": { "x": 100 } } },
                "q": { "link": { "isRef": true, "id": "r/shape" } }
            })),
            tree(json!({ "q": {} })),
        ),
        // type changes
        (
            tree(json!({ "v": { "a": 1 }, "w": [1], "d": "2024-01-01T00:00:00Z" })),
            tree(json!({ "v": [1], "w": "text", "d": "2024-06-01T00:00:00Z" })),
        ),
        (Snapshot::empty(), tree(json!({ "a": { "b": { "c": [true, null] } } }))),
    ]
}

#[test]
fn test_identical_snapshots_have_empty_diff() {
    for (a, b) in pairs() {
        assert!(diff(&a, &a.clone()).is_empty());
        assert!(diff(&b, &b.clone()).is_empty());
    }
}

#[test]
fn test_patch_replay_reproduces_target() {
    for (a, b) in pairs() {
        assert_round_trip(&a, &b);
    }
}

#[test]
fn test_plain_unpatch_is_inverse() {
    let values = [
        json!({ "a": 1, "b": [1, 2, { "c": null }], "d": { "e": "x" } }),
        json!({ "a": 2, "b": [1], "f": true }),
        json!([1, [2, 3], { "k": [] }]),
        json!([]),
        json!({ "b": [{ "c": 1 }, 5, 6, 7], "d": { "e": "y", "g": [0] } }),
    ];

    for old in &values {
        for new in &values {
            let Some(d) = diff_values(old, new) else {
                assert_eq!(old, new);
                continue;
            };
            let mut value = old.clone();
            delta::patch(&mut value, &d).unwrap();
            assert_eq!(&value, new);
            delta::unpatch(&mut value, &d).unwrap();
            assert_eq!(&value, old);
        }
    }
}

#[test]
fn test_move_detection_yields_single_instruction() {
    let a = tree(json!({ "p1": { "rec": { "id": "R", "v": 1 } }, "p2": {} }));
    let b = tree(json!({ "p1": {}, "p2": { "rec": { "id": "R", "v": 1 } } }));

    let d = diff(&a, &b);
    let moves: Vec<(&str, &str)> = d.moves().collect();
    assert_eq!(moves, vec![("p2/rec", "p1/rec")]);
    assert_eq!(d.len(), 1);
    assert!(d.get("p1/rec").is_none());
}

#[test]
fn test_copy_to_two_destinations_keeps_identity() {
    let a = tree(json!({ "a": { "id": "X", "v": 1 } }));
    let b = tree(json!({ "b": { "id": "X", "v": 1 }, "c": { "id": "X", "v": 2 } }));

    let d = diff(&a, &b);
    let moves: Vec<(&str, &str)> = d.moves().collect();
    assert_eq!(moves, vec![("b", "a"), ("c", "a")]);
    assert!(d.get("a").is_none());
    assert_eq!(
        d.get("c"),
        Some(&Delta::Op(Instruction::Move {
            from: "a".to_string(),
            nested: Some(Box::new(Delta::from_value("c", &json!({ "v": [1, 2] })).unwrap())),
        }))
    );
    assert_round_trip(&a, &b);
}

#[test]
fn test_deleted_record_and_its_references_are_removed() {
    let a = tree(json!({
        "r": { "v": 1 },
        "q": { "link": { "isRef": true, "id": "r" } }
    }));
    let b = tree(json!({ "q": {} }));

    let patch = Patch::from_diff(&diff(&a, &b));
    assert_eq!(
        patch.to_value(),
        json!({ "": { "r": [0, 0] }, "q": { "link": [0, 0] }, "r": [0, 0] })
    );
}

#[test]
fn test_removed_prefix_invalidates_references_below_it() {
    let a = tree(json!({
        "r": { "shape": { "extent": { "x": 100 } } },
        "q": { "link": { "isRef": true, "id": "r/shape" } }
    }));
    let patch = Patch::from_value(&json!({ "": { "r": [0, 0] }, "r": [0, 0] })).unwrap();

    let expanded = patch.expand(&a).unwrap();
    assert!(matches!(
        expanded.get("r/shape"),
        Some(Delta::Op(Instruction::Delete(_)))
    ));
    assert!(matches!(
        expanded.get("r/shape/extent"),
        Some(Delta::Op(Instruction::Delete(_)))
    ));

    let result = Applier::new().apply_to(&expanded, &a).unwrap();
    assert_eq!(result.registry().get("q"), Some(&json!({})));
    assert!(!result.registry().contains("r/shape"));
}

#[test]
fn test_receiver_invalidates_dangling_references() {
    let a = tree(json!({
        "r": { "v": 1 },
        "q": { "link": { "isRef": true, "id": "r" } }
    }));
    let patch = Patch::from_value(&json!({ "r": [0, 0], "": { "r": [0, 0] } })).unwrap();

    let result = Applier::new().apply_patch(&patch, &a).unwrap();
    assert_eq!(result.registry().get("q"), Some(&json!({})));
}

#[test]
fn test_scenario_add() {
    let a = registry(json!({}));
    let b = registry(json!({ "x": { "id": "x", "v": 1 } }));

    let d = diff(&a, &b);
    assert_eq!(d.to_value(), json!({ "x": [{ "id": "x", "v": 1 }] }));
    assert_eq!(
        Patch::from_diff(&d).to_value(),
        json!({ "x": [{ "id": "x", "v": 1 }] })
    );
    assert_round_trip(&a, &b);
}

#[test]
fn test_scenario_set() {
    let a = registry(json!({ "r/shape/extent": { "x": 100, "y": 20 } }));
    let b = registry(json!({ "r/shape/extent": { "x": 400, "y": 20 } }));

    let d = diff(&a, &b);
    assert_eq!(d.to_value(), json!({ "r/shape/extent": { "x": [100, 400] } }));
    assert_round_trip(&a, &b);
}

#[test]
fn test_scenario_delete() {
    let a = registry(json!({ "r": { "v": 1 } }));
    let b = registry(json!({}));

    let d = diff(&a, &b);
    assert_eq!(d.to_value(), json!({ "r": [{ "v": 1 }, 0, 0] }));
    assert_eq!(Patch::from_diff(&d).to_value(), json!({ "r": [0, 0] }));
    assert_round_trip(&a, &b);
}

#[test]
fn test_scenario_copy_with_change() {
    let a = registry(json!({ "a/b": { "id": "n", "field": "old" } }));
    let b = registry(json!({ "c/d": { "id": "n", "field": "new" } }));

    let d = diff(&a, &b);
    assert_eq!(
        d.to_value(),
        json!({ "c/d": [0, "a/b", { "field": ["old", "new"] }, 0] })
    );
    assert_eq!(
        d.get("c/d"),
        Some(&Delta::Op(Instruction::Move {
            from: "a/b".to_string(),
            nested: Some(Box::new(
                Delta::from_value("c/d", &json!({ "field": ["old", "new"] })).unwrap()
            )),
        }))
    );
    assert_round_trip(&a, &b);
}

#[test]
fn test_diff_wire_form_round_trips() {
    for (a, b) in pairs() {
        let d = diff(&a, &b);
        let parsed = Diff::from_json_str(&d.to_json_string().unwrap()).unwrap();
        assert_eq!(parsed, d);
    }
}
