//! §4.5 Reduce / GroupBy operator, exercised end to end through the graph
//! per the teacher's `tests/` convention rather than an in-module unit test.

use std::rc::Rc;

use serde_json::json;

use ivm_core::expr::Expr;
use ivm_core::graph::Graph;
use ivm_core::key::Key;
use ivm_core::multiset::{Multiplicity, Multiset};
use ivm_core::operators::output::output;
use ivm_core::operators::reduce::{reduce, AggregateKind, AggregateSpec, ReduceConfig};
use ivm_core::operators::Item;
use ivm_core::value::Value;

fn cfg() -> ReduceConfig {
    ReduceConfig {
        group_by: vec![("cat".into(), Expr::ref_path(["cat"]))],
        aggregates: vec![
            AggregateSpec { output_name: "total".into(), kind: AggregateKind::Sum(Expr::ref_path(["amt"])) },
            AggregateSpec { output_name: "count".into(), kind: AggregateKind::Count { distinct: false } },
        ],
    }
}

fn row(cat: &str, amt: i64) -> Item {
    rowk(cat, amt, &format!("{cat}-{amt}"))
}

fn rowk(cat: &str, amt: i64, id: &str) -> Item {
    (Key::Str(id.to_string()), Value(json!({"cat": cat, "amt": amt})))
}

#[test]
fn scenario_a_groupby_incremental_update() {
    let mut g = Graph::new();
    let input = g.add_input::<Item>();
    let out = reduce(&mut g, input.stream_id(), cfg());
    let seen: Rc<std::cell::RefCell<Vec<(Item, Multiplicity)>>> = Rc::new(std::cell::RefCell::new(Vec::new()));
    let seen_clone = seen.clone();
    output(&mut g, out, move |b| seen_clone.borrow_mut().extend(b.inner().to_vec()));

    input.send_data(
        &g,
        Multiset::from_pairs(vec![
            (row("A", 10), Multiplicity::ONE),
            (row("A", 20), Multiplicity::ONE),
            (row("B", 30), Multiplicity::ONE),
        ]),
    );
    g.run().unwrap();
    seen.borrow_mut().clear();

    input.send_data(&g, Multiset::singleton(row("A", 15), Multiplicity::ONE));
    g.run().unwrap();
    let batch = seen.borrow().clone();
    assert_eq!(batch.len(), 2);
    assert_eq!(batch[0].1, Multiplicity::NEG_ONE);
    assert_eq!(batch[1].1, Multiplicity::ONE);
    assert_eq!(batch[1].0 .1 .0["total"], json!(45.0));
    assert_eq!(batch[1].0 .1 .0["count"], json!(3));
}

#[test]
fn scenario_e_complete_group_removal_emits_only_delete() {
    let mut g = Graph::new();
    let input = g.add_input::<Item>();
    let out = reduce(&mut g, input.stream_id(), cfg());
    let seen: Rc<std::cell::RefCell<Vec<(Item, Multiplicity)>>> = Rc::new(std::cell::RefCell::new(Vec::new()));
    let seen_clone = seen.clone();
    output(&mut g, out, move |b| seen_clone.borrow_mut().extend(b.inner().to_vec()));

    input.send_data(
        &g,
        Multiset::from_pairs(vec![(row("A", 10), Multiplicity::ONE), (row("A", 20), Multiplicity::ONE)]),
    );
    g.run().unwrap();
    seen.borrow_mut().clear();

    input.send_data(
        &g,
        Multiset::from_pairs(vec![(row("A", 10), Multiplicity::NEG_ONE), (row("A", 20), Multiplicity::NEG_ONE)]),
    );
    g.run().unwrap();
    let batch = seen.borrow().clone();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].1, Multiplicity::NEG_ONE);
}

#[test]
fn net_zero_multiplicity_still_emits_paired_update() {
    let mut g = Graph::new();
    let input = g.add_input::<Item>();
    let out = reduce(&mut g, input.stream_id(), cfg());
    let seen: Rc<std::cell::RefCell<Vec<(Item, Multiplicity)>>> = Rc::new(std::cell::RefCell::new(Vec::new()));
    let seen_clone = seen.clone();
    output(&mut g, out, move |b| seen_clone.borrow_mut().extend(b.inner().to_vec()));

    input.send_data(&g, Multiset::singleton(row("A", 10), Multiplicity::ONE));
    g.run().unwrap();
    seen.borrow_mut().clear();

    // delete the 10-row and insert a 10-row under a different source key:
    // row count and total are unchanged, but membership changed.
    input.send_data(
        &g,
        Multiset::from_pairs(vec![(row("A", 10), Multiplicity::NEG_ONE), (row("A", 10), Multiplicity::ONE)]),
    );
    g.run().unwrap();
    let batch = seen.borrow().clone();
    assert_eq!(batch.len(), 2, "must emit paired delete+insert even though the aggregate value nets equal");
}
