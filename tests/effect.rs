//! §4.11 Effect driver, exercised end to end against the in-crate
//! reference `Collection` per the teacher's `tests/` convention rather than
//! in-module unit tests.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use serde_json::json;

use ivm_core::collection::Collection;
use ivm_core::coordinator::SharedCollection;
use ivm_core::effect::{Effect, EffectConfig, EffectEvent};
use ivm_core::key::Key;
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
fn enter_fires_for_new_rows() {
    let issues = coll();
    ready(&issues);
    let query = Query::new("issues");
    let mut sources = HashMap::new();
    sources.insert("issues".to_string(), issues.clone());

    let seen = Rc::new(RefCell::new(Vec::new()));
    let seen_clone = seen.clone();
    let config = EffectConfig {
        handler: Some(Box::new(move |event: &EffectEvent| {
            seen_clone.borrow_mut().push(event.clone());
            Ok(())
        })),
        ..Default::default()
    };
    let _effect = Effect::new(&query, sources, config).unwrap();

    issues.borrow_mut().insert(Value(json!({"id": 1, "status": "open"})));
    assert_eq!(seen.borrow().len(), 1);
    assert!(matches!(seen.borrow()[0], EffectEvent::Enter { .. }));
}

#[test]
fn scenario_d_transaction_emits_one_batch_with_three_enters() {
    let issues = coll();
    ready(&issues);
    let query = Query::new("issues");
    let mut sources = HashMap::new();
    sources.insert("issues".to_string(), issues.clone());

    let batches = Rc::new(RefCell::new(Vec::new()));
    let batches_clone = batches.clone();
    let config = EffectConfig {
        batch_handler: Some(Box::new(move |events: &[EffectEvent]| {
            batches_clone.borrow_mut().push(events.len());
        })),
        ..Default::default()
    };
    let effect = Effect::new(&query, sources, config).unwrap();

    effect.begin_transaction();
    issues.borrow_mut().insert(Value(json!({"id": 1})));
    issues.borrow_mut().insert(Value(json!({"id": 2})));
    issues.borrow_mut().insert(Value(json!({"id": 3})));
    effect.flush_transaction();

    assert_eq!(*batches.borrow(), vec![3]);
}

#[test]
fn skip_initial_suppresses_enter_for_preexisting_rows() {
    let issues = coll();
    issues.borrow_mut().insert(Value(json!({"id": 1, "status": "open"})));
    ready(&issues);
    let query = Query::new("issues");
    let mut sources = HashMap::new();
    sources.insert("issues".to_string(), issues.clone());

    let seen = Rc::new(RefCell::new(Vec::new()));
    let seen_clone = seen.clone();
    let config = EffectConfig {
        skip_initial: true,
        handler: Some(Box::new(move |event: &EffectEvent| {
            seen_clone.borrow_mut().push(event.clone());
            Ok(())
        })),
        ..Default::default()
    };
    let _effect = Effect::new(&query, sources, config).unwrap();
    assert!(seen.borrow().is_empty(), "preexisting row must not fire enter when skip_initial is set");
}

#[test]
fn dispose_is_idempotent_and_stops_delivery() {
    let issues = coll();
    ready(&issues);
    let query = Query::new("issues");
    let mut sources = HashMap::new();
    sources.insert("issues".to_string(), issues.clone());

    let seen = Rc::new(RefCell::new(Vec::new()));
    let seen_clone = seen.clone();
    let config = EffectConfig {
        handler: Some(Box::new(move |event: &EffectEvent| {
            seen_clone.borrow_mut().push(event.clone());
            Ok(())
        })),
        ..Default::default()
    };
    let mut effect = Effect::new(&query, sources, config).unwrap();
    let _ = effect.dispose();
    let _ = effect.dispose();
    assert!(effect.disposed());
    issues.borrow_mut().insert(Value(json!({"id": 1})));
    assert!(seen.borrow().is_empty());
}

#[test]
fn handler_error_routes_to_on_error_not_panic() {
    let issues = coll();
    ready(&issues);
    let query = Query::new("issues");
    let mut sources = HashMap::new();
    sources.insert("issues".to_string(), issues.clone());

    let errors = Rc::new(RefCell::new(Vec::new()));
    let errors_clone = errors.clone();
    let config = EffectConfig {
        handler: Some(Box::new(|_event: &EffectEvent| Err("boom".to_string()))),
        on_error: Some(Box::new(move |err: &str, _event| errors_clone.borrow_mut().push(err.to_string()))),
        ..Default::default()
    };
    let _effect = Effect::new(&query, sources, config).unwrap();
    issues.borrow_mut().insert(Value(json!({"id": 1})));
    assert_eq!(errors.borrow().len(), 1);
}
