//! §4.6 OrderBy and TopK.
//!
//! `orderby` attaches a fractional index string (§4.6, `fractional.rs`) to
//! each row so the derived collection's `compare` reproduces the query
//! order via plain string comparison. `topk` additionally windows the
//! stream to `[offset, offset+limit)` and exposes the `size`/`dataNeeded`
//! back-pressure callbacks §4.6 describes — the coordinator (§4.10) polls
//! these after every run to decide whether to pull more rows from the
//! source's sorted index (§4.7).

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::error::{IvmError, Result};
use crate::expr::Expr;
use crate::fractional;
use crate::graph::{downcast_batch, erase_batch, Graph, StreamId};
use crate::index::{Direction, Nulls};
use crate::key::Key;
use crate::multiset::{Multiplicity, Multiset};
use crate::operators::Item;
use crate::value::Value;

/// One `orderBy` clause term (§6 `{expression, direction, nulls}`).
#[derive(Debug, Clone)]
pub struct OrderByTerm {
    pub expr: Expr,
    pub direction: Direction,
    pub nulls: Nulls,
}

fn term_cmp(term: &OrderByTerm, a: &Value, b: &Value) -> Ordering {
    let av = term.expr.eval(a);
    let bv = term.expr.eval(b);
    let a_null = av.is_null();
    let b_null = bv.is_null();
    if a_null || b_null {
        if a_null && b_null {
            return Ordering::Equal;
        }
        let nulls_first = term.nulls == Nulls::First;
        return if a_null {
            if nulls_first { Ordering::Less } else { Ordering::Greater }
        } else if nulls_first {
            Ordering::Greater
        } else {
            Ordering::Less
        };
    }
    let natural = av.cmp(&bv);
    match term.direction {
        Direction::Asc => natural,
        Direction::Desc => natural.reverse(),
    }
}

/// Total order over rows under a (possibly multi-column) `orderBy` clause,
/// tie-broken by `key` for determinism.
fn row_cmp(terms: &[OrderByTerm], ak: &Key, a: &Value, bk: &Key, b: &Value) -> Ordering {
    for term in terms {
        let c = term_cmp(term, a, b);
        if c != Ordering::Equal {
            return c;
        }
    }
    ak.cmp(bk)
}

/// Output value shape: the original row payload plus the assigned
/// fractional index, packed as `{"__row": ..., "__order_index": "..."}` so
/// it still flows through the crate's single `(Key, Value)` stream element
/// type rather than requiring its own stream element type end-to-end.
fn with_index(row: &Value, index: &str) -> Value {
    Value(serde_json::json!({ "__row": row.0.clone(), "__order_index": index }))
}

/// Unpacks a value produced by [`with_index`] back into `(row, index)`.
pub fn split_index(value: &Value) -> (Value, String) {
    let row = Value(value.0.get("__row").cloned().unwrap_or(serde_json::Value::Null));
    let index = value.0.get("__order_index").and_then(|v| v.as_str()).unwrap_or("").to_string();
    (row, index)
}

/// The sorted core shared by `order_by` and `top_k`: a set of rows kept in
/// `row_cmp` order, each with a fractional index string assigned once at
/// insertion and never reassigned while the row survives unchanged — only
/// a genuinely new row gets a fresh [`fractional::between`] call, so
/// surviving neighbors never need to shift (§4.6's whole point).
struct OrderedRows {
    terms: Vec<OrderByTerm>,
    ordered: Vec<Key>,
    rows: std::collections::HashMap<Key, (Value, String)>,
}

impl OrderedRows {
    fn new(terms: Vec<OrderByTerm>) -> Self {
        OrderedRows { terms, ordered: Vec::new(), rows: std::collections::HashMap::new() }
    }

    fn len(&self) -> usize {
        self.ordered.len()
    }

    /// Removes `key`, returning its last known `(value, index)` if present.
    fn remove(&mut self, key: &Key) -> Option<(Value, String)> {
        let removed = self.rows.remove(key)?;
        if let Some(pos) = self.ordered.iter().position(|k| k == key) {
            self.ordered.remove(pos);
        }
        Some(removed)
    }

    /// Inserts a new `(key, value)`, assigning it a fresh fractional index
    /// between its in-order neighbors. Returns the assigned index.
    fn insert(&mut self, key: Key, value: Value) -> String {
        let terms = &self.terms;
        let rows = &self.rows;
        let pos = self.ordered.partition_point(|other_key| {
            let other_value = &rows[other_key].0;
            row_cmp(terms, other_key, other_value, &key, &value) != Ordering::Greater
        });
        let lo_index = pos.checked_sub(1).map(|i| self.rows[&self.ordered[i]].1.clone());
        let hi_index = self.ordered.get(pos).map(|k| self.rows[k].1.clone());
        let new_index = fractional::between(lo_index.as_deref(), hi_index.as_deref());
        self.ordered.insert(pos, key.clone());
        self.rows.insert(key, (value, new_index.clone()));
        new_index
    }

    /// Keys in rank order, `[offset, offset+n)`.
    fn window(&self, offset: usize, n: usize) -> &[Key] {
        let start = offset.min(self.ordered.len());
        let end = (offset + n).min(self.ordered.len());
        &self.ordered[start..end]
    }

    fn get(&self, key: &Key) -> Option<&(Value, String)> {
        self.rows.get(key)
    }
}

/// Attaches an unbounded `orderBy` operator (§4.6, no `limit`): every row
/// that reaches this operator gets a fractional index reflecting its rank
/// among everything this operator has ever seen.
pub fn order_by(graph: &mut Graph, input: StreamId, terms: Vec<OrderByTerm>) -> StreamId {
    let mut rows = OrderedRows::new(terms);

    graph.add_operator(
        "orderby",
        &[input],
        Box::new(move |pulled| -> Result<Vec<Rc<dyn std::any::Any>>> {
            let mut out = Multiset::new();
            for batch in &pulled[0] {
                for ((key, value), m) in downcast_batch::<Item>(batch).iter() {
                    match m.0 {
                        -1 => {
                            if let Some((old_value, old_index)) = rows.remove(key) {
                                out.push((key.clone(), with_index(&old_value, &old_index)), Multiplicity::NEG_ONE);
                            }
                        }
                        1 => {
                            let new_index = rows.insert(key.clone(), value.clone());
                            out.push((key.clone(), with_index(value, &new_index)), Multiplicity::ONE);
                        }
                        other => {
                            return Err(IvmError::OperatorInvariant(format!(
                                "orderby received multiplicity {other}, expected +-1"
                            )))
                        }
                    }
                }
            }
            Ok(vec![erase_batch(out)])
        }),
    )
}

/// Shared handle the coordinator polls for back-pressure (§4.6 `size()`/
/// `dataNeeded()`).
pub struct TopKHandle {
    state: Rc<std::cell::RefCell<TopKState>>,
}

impl TopKHandle {
    pub fn size(&self) -> usize {
        self.state.borrow().window.len()
    }

    /// Additional upstream rows required to fill `[offset, offset+limit)`.
    pub fn data_needed(&self) -> usize {
        let s = self.state.borrow();
        (s.offset + s.limit).saturating_sub(s.seen)
    }
}

struct TopKState {
    offset: usize,
    limit: usize,
    seen: usize,
    /// Last-emitted `(value, index)` snapshot for each key currently in the
    /// window, so a same-key value change (which keeps window membership
    /// but changes `rows.get(key)`) is still detected as a paired update.
    window: BTreeMap<Key, (Value, String)>,
}

/// Attaches a `orderBy + limit/offset` (topK) operator (§4.6). Maintains
/// the full set of rows it has received (bounded by what the coordinator
/// chooses to feed it) in the same stable [`OrderedRows`] structure
/// `order_by` uses, so a row already inside the window keeps the same
/// fractional index across runs even as other rows enter or leave —
/// displacement at the window's edge must never perturb the rows that
/// stay put (§8 Scenario B).
pub fn top_k(graph: &mut Graph, input: StreamId, terms: Vec<OrderByTerm>, offset: usize, limit: usize) -> (StreamId, TopKHandle) {
    let mut rows = OrderedRows::new(terms);
    let state = Rc::new(std::cell::RefCell::new(TopKState { offset, limit, seen: 0, window: BTreeMap::new() }));
    let state_for_op = state.clone();

    let output = graph.add_operator(
        "topk",
        &[input],
        Box::new(move |pulled| -> Result<Vec<Rc<dyn std::any::Any>>> {
            for batch in &pulled[0] {
                for ((key, value), m) in downcast_batch::<Item>(batch).iter() {
                    match m.0 {
                        -1 => {
                            rows.remove(key);
                        }
                        1 => {
                            rows.insert(key.clone(), value.clone());
                        }
                        other => {
                            return Err(IvmError::OperatorInvariant(format!(
                                "topk received multiplicity {other}, expected +-1"
                            )))
                        }
                    }
                }
            }

            let mut state = state_for_op.borrow_mut();
            state.seen = rows.len();
            let new_window: BTreeMap<Key, (Value, String)> = rows
                .window(state.offset, state.limit)
                .iter()
                .filter_map(|k| rows.get(k).map(|(v, i)| (k.clone(), (v.clone(), i.clone()))))
                .collect();

            let mut out = Multiset::new();
            for (k, (old_value, old_index)) in state.window.iter() {
                match new_window.get(k) {
                    None => out.push((k.clone(), with_index(old_value, old_index)), Multiplicity::NEG_ONE),
                    Some((new_value, new_index)) => {
                        if new_value != old_value || new_index != old_index {
                            out.push((k.clone(), with_index(old_value, old_index)), Multiplicity::NEG_ONE);
                            out.push((k.clone(), with_index(new_value, new_index)), Multiplicity::ONE);
                        }
                    }
                }
            }
            for (k, (new_value, new_index)) in new_window.iter() {
                if !state.window.contains_key(k) {
                    out.push((k.clone(), with_index(new_value, new_index)), Multiplicity::ONE);
                }
            }
            state.window = new_window;

            Ok(vec![erase_batch(out)])
        }),
    );
    (output, TopKHandle { state })
}

