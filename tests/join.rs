//! §4.4 Join operator, exercised end to end through the graph the way the
//! teacher's own `tests/join.rs` drives `differential_dataflow`'s join
//! operator, rather than through a single in-module unit test.

use std::cell::RefCell;
use std::rc::Rc;

use serde_json::json;

use ivm_core::graph::Graph;
use ivm_core::key::Key;
use ivm_core::multiset::{Multiplicity, Multiset};
use ivm_core::operators::join::{join, JoinConfig, JoinKind};
use ivm_core::operators::output::output;
use ivm_core::operators::Item;
use ivm_core::value::Value;

fn cfg(kind: JoinKind) -> JoinConfig {
    JoinConfig {
        kind,
        left_join_key: Box::new(|v| v.get_path(&["userId".into()])),
        right_join_key: Box::new(|v| v.get_path(&["id".into()])),
        combine: Box::new(|l, r| {
            Value(json!({
                "issue": l.map(|v| v.0.clone()),
                "user": r.map(|v| v.0.clone()),
            }))
        }),
        on_right_needed: None,
        on_left_needed: None,
    }
}

#[test]
fn inner_join_emits_matched_product() {
    let mut g = Graph::new();
    let left = g.add_input::<Item>();
    let right = g.add_input::<Item>();
    let out = join(&mut g, left.stream_id(), right.stream_id(), cfg(JoinKind::Inner));
    let seen = Rc::new(RefCell::new(Vec::new()));
    let seen_clone = seen.clone();
    output(&mut g, out, move |b| seen_clone.borrow_mut().extend(b.inner().to_vec()));

    left.send_data(&g, Multiset::singleton((Key::from(1i64), Value(json!({"userId": 7}))), Multiplicity::ONE));
    right.send_data(&g, Multiset::singleton((Key::from(7i64), Value(json!({"id": 7}))), Multiplicity::ONE));
    g.run().unwrap();
    assert_eq!(seen.borrow().len(), 1);
    assert_eq!(seen.borrow()[0].1, Multiplicity::ONE);
}

#[test]
fn left_join_emits_null_padded_row_when_unmatched() {
    let mut g = Graph::new();
    let left = g.add_input::<Item>();
    let right = g.add_input::<Item>();
    let out = join(&mut g, left.stream_id(), right.stream_id(), cfg(JoinKind::Left));
    let seen = Rc::new(RefCell::new(Vec::new()));
    let seen_clone = seen.clone();
    output(&mut g, out, move |b| seen_clone.borrow_mut().extend(b.inner().to_vec()));

    left.send_data(&g, Multiset::singleton((Key::from(1i64), Value(json!({"userId": 9}))), Multiplicity::ONE));
    g.run().unwrap();
    assert_eq!(seen.borrow().len(), 1);
    let (item, m) = &seen.borrow()[0];
    assert_eq!(*m, Multiplicity::ONE);
    assert_eq!(item.1 .0["user"], serde_json::Value::Null);
}

#[test]
fn same_run_delta_on_both_sides_produces_cross_product() {
    let mut g = Graph::new();
    let left = g.add_input::<Item>();
    let right = g.add_input::<Item>();
    let out = join(&mut g, left.stream_id(), right.stream_id(), cfg(JoinKind::Inner));
    let seen = Rc::new(RefCell::new(Vec::new()));
    let seen_clone = seen.clone();
    output(&mut g, out, move |b| seen_clone.borrow_mut().extend(b.inner().to_vec()));

    left.send_data(&g, Multiset::singleton((Key::from(1i64), Value(json!({"userId": 7}))), Multiplicity::ONE));
    right.send_data(&g, Multiset::singleton((Key::from(7i64), Value(json!({"id": 7}))), Multiplicity::ONE));
    g.run().unwrap();
    assert_eq!(seen.borrow().len(), 1);
}

/// Regression for the bucket-vs-row presence bug: a *second* left row
/// sharing an already-unmatched join key must still get its own
/// null-padded row — the bucket was already non-empty (from the first
/// row) before this row arrived, so a bucket-level 0<->1 transition check
/// alone would never fire for it.
#[test]
fn left_join_second_row_sharing_unmatched_key_still_gets_null_row() {
    let mut g = Graph::new();
    let left = g.add_input::<Item>();
    let right = g.add_input::<Item>();
    let out = join(&mut g, left.stream_id(), right.stream_id(), cfg(JoinKind::Left));
    let seen = Rc::new(RefCell::new(Vec::new()));
    let seen_clone = seen.clone();
    output(&mut g, out, move |b| seen_clone.borrow_mut().extend(b.inner().to_vec()));

    left.send_data(&g, Multiset::singleton((Key::from(1i64), Value(json!({"userId": 9}))), Multiplicity::ONE));
    g.run().unwrap();
    seen.borrow_mut().clear();

    // Second left row at the same (still unmatched) join key 9.
    left.send_data(&g, Multiset::singleton((Key::from(2i64), Value(json!({"userId": 9}))), Multiplicity::ONE));
    g.run().unwrap();

    let batch = seen.borrow();
    assert_eq!(batch.len(), 1, "the second unmatched left row must still emit its own null-padded row");
    assert_eq!(batch[0].1, Multiplicity::ONE);
    assert_eq!(batch[0].0 .1 .0["user"], serde_json::Value::Null);
}

/// Regression: once a join key that previously had only null-padded left
/// rows gains a right match, every null-padded row at that key must be
/// retracted (not left to coexist alongside the newly matched row).
#[test]
fn left_join_retracts_null_row_when_match_later_appears() {
    let mut g = Graph::new();
    let left = g.add_input::<Item>();
    let right = g.add_input::<Item>();
    let out = join(&mut g, left.stream_id(), right.stream_id(), cfg(JoinKind::Left));
    let seen = Rc::new(RefCell::new(Vec::new()));
    let seen_clone = seen.clone();
    output(&mut g, out, move |b| seen_clone.borrow_mut().extend(b.inner().to_vec()));

    left.send_data(&g, Multiset::singleton((Key::from(1i64), Value(json!({"userId": 9}))), Multiplicity::ONE));
    left.send_data(&g, Multiset::singleton((Key::from(2i64), Value(json!({"userId": 9}))), Multiplicity::ONE));
    g.run().unwrap();
    seen.borrow_mut().clear();

    // The join key 9 now gains its first right-side match.
    right.send_data(&g, Multiset::singleton((Key::from(9i64), Value(json!({"id": 9}))), Multiplicity::ONE));
    g.run().unwrap();

    let batch = seen.borrow();
    // Both previously null-padded left rows must be retracted (-1 each)
    // and re-emitted matched against the new right row (+1 each) — no
    // null-padded row may survive alongside the match.
    let null_retractions = batch.iter().filter(|(i, m)| i.1 .0["user"].is_null() && *m == Multiplicity::NEG_ONE).count();
    let matched_inserts = batch.iter().filter(|(i, m)| !i.1 .0["user"].is_null() && *m == Multiplicity::ONE).count();
    assert_eq!(null_retractions, 2, "both previously null-padded rows must be retracted");
    assert_eq!(matched_inserts, 2, "both left rows must now be emitted matched");
}

/// Symmetric regression on the right side for a full outer join: a right
/// row's null padding must also be tracked per row, and retracted once the
/// left side gains a match.
#[test]
fn full_join_right_side_null_row_retracted_on_later_left_match() {
    let mut g = Graph::new();
    let left = g.add_input::<Item>();
    let right = g.add_input::<Item>();
    let out = join(&mut g, left.stream_id(), right.stream_id(), cfg(JoinKind::Full));
    let seen = Rc::new(RefCell::new(Vec::new()));
    let seen_clone = seen.clone();
    output(&mut g, out, move |b| seen_clone.borrow_mut().extend(b.inner().to_vec()));

    right.send_data(&g, Multiset::singleton((Key::from(9i64), Value(json!({"id": 9}))), Multiplicity::ONE));
    g.run().unwrap();
    seen.borrow_mut().clear();

    left.send_data(&g, Multiset::singleton((Key::from(1i64), Value(json!({"userId": 9}))), Multiplicity::ONE));
    g.run().unwrap();

    let batch = seen.borrow();
    let null_retractions = batch.iter().filter(|(i, m)| i.1 .0["issue"].is_null() && *m == Multiplicity::NEG_ONE).count();
    let matched_inserts = batch.iter().filter(|(i, m)| !i.1 .0["issue"].is_null() && !i.1 .0["user"].is_null() && *m == Multiplicity::ONE).count();
    assert_eq!(null_retractions, 1, "the right row's null-padded row must be retracted once the left match appears");
    assert_eq!(matched_inserts, 1);
}
