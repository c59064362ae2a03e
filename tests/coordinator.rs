//! §4.10 Live-query coordinator, exercised end to end against the in-crate
//! reference `Collection` per the teacher's `tests/` convention rather than
//! in-module unit tests.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use serde_json::json;

use ivm_core::collection::Collection;
use ivm_core::coordinator::{Coordinator, SharedCollection};
use ivm_core::expr::Expr;
use ivm_core::index::{Direction, Nulls};
use ivm_core::key::Key;
use ivm_core::operators::orderby::{split_index, OrderByTerm};
use ivm_core::query::Query;
use ivm_core::value::Value;

fn coll() -> SharedCollection {
    Rc::new(RefCell::new(Collection::new(|v| Key::from(v.0["id"].as_i64().unwrap()))))
}

fn ready(c: &SharedCollection) {
    c.borrow_mut().start_loading();
    c.borrow_mut().begin_initial_commit();
    c.borrow_mut().mark_ready();
}

#[test]
fn plain_query_produces_ready_derived_collection_with_initial_rows() {
    let issues = coll();
    issues.borrow_mut().insert(Value(json!({"id": 1, "status": "open"})));
    issues.borrow_mut().insert(Value(json!({"id": 2, "status": "closed"})));
    ready(&issues);

    let query = Query::new("issues");
    let mut sources = HashMap::new();
    sources.insert("issues".to_string(), issues.clone());
    let coordinator = Coordinator::new(&query, sources).unwrap();

    let out = coordinator.output();
    assert_eq!(out.borrow().size(), 2);
    assert!(out.borrow().status().is_usable());
}

#[test]
fn incremental_insert_after_ready_flows_through() {
    let issues = coll();
    ready(&issues);
    let query = Query::new("issues");
    let mut sources = HashMap::new();
    sources.insert("issues".to_string(), issues.clone());
    let coordinator = Coordinator::new(&query, sources).unwrap();

    issues.borrow_mut().insert(Value(json!({"id": 1, "status": "open"})));
    assert_eq!(coordinator.output().borrow().size(), 1);
}

#[test]
fn transaction_coalesces_multiple_mutations_into_one_run() {
    let issues = coll();
    ready(&issues);
    let query = Query::new("issues");
    let mut sources = HashMap::new();
    sources.insert("issues".to_string(), issues.clone());
    let coordinator = Coordinator::new(&query, sources).unwrap();

    coordinator.begin_transaction();
    issues.borrow_mut().insert(Value(json!({"id": 1, "status": "open"})));
    issues.borrow_mut().insert(Value(json!({"id": 2, "status": "open"})));
    assert_eq!(coordinator.output().borrow().size(), 0, "no run until flush");
    coordinator.flush_transaction();
    assert_eq!(coordinator.output().borrow().size(), 2);
}

#[test]
fn unsubscribe_stops_further_updates() {
    let issues = coll();
    ready(&issues);
    let query = Query::new("issues");
    let mut sources = HashMap::new();
    sources.insert("issues".to_string(), issues.clone());
    let coordinator = Coordinator::new(&query, sources).unwrap();
    coordinator.unsubscribe();
    issues.borrow_mut().insert(Value(json!({"id": 1, "status": "open"})));
    assert_eq!(coordinator.output().borrow().size(), 0);
}

#[test]
fn optimizable_topk_seeds_window_from_sorted_index() {
    let people = coll();
    for (id, name) in [(1, "Charlie"), (2, "Alice"), (3, "Bob"), (4, "Dave")] {
        people.borrow_mut().insert(Value(json!({"id": id, "name": name})));
    }
    ready(&people);

    let query = Query::new("people")
        .order_by(vec![OrderByTerm {
            expr: Expr::ref_path(["people", "name"]),
            direction: Direction::Asc,
            nulls: Nulls::Last,
        }])
        .limit(2);
    let mut sources = HashMap::new();
    sources.insert("people".to_string(), people.clone());
    let coordinator = Coordinator::new(&query, sources).unwrap();
    let out = coordinator.output();
    assert_eq!(out.borrow().size(), 2);

    // The window must be the two alphabetically-first names (Alice,
    // Bob), not just any two rows — this is only true if the source's
    // sorted index was built on the unqualified `name` column rather
    // than the alias-qualified `people.name` the query spells it as.
    let names: std::collections::HashSet<String> = out
        .borrow()
        .values()
        .map(|v| split_index(v).0 .0["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, std::collections::HashSet::from(["Alice".to_string(), "Bob".to_string()]));
}
