//! §4.5 Reduce / GroupBy — keyed aggregation with paired delete+insert
//! emission.
//!
//! Every group's emitted value is recomputed from a small, reversible
//! per-aggregate accumulator (§4.5 "sufficient reversible state to allow
//! point insertion and deletion of source rows") rather than replayed from
//! scratch, so a single-row update touches only the groups it belongs to.
//! The paired-emission contract is absolute (§4.5): a group that existed
//! before and after a batch emits exactly one `(prior, -1)` + `(new, +1)`
//! pair, even when the two values happen to compare equal (boundary
//! behavior: "net-zero multiplicity but both inserts and deletes present").

use std::collections::BTreeMap;
use std::rc::Rc;

use serde_json::{Map, Value as Json};

use crate::error::{IvmError, Result};
use crate::expr::Expr;
use crate::graph::{downcast_batch, erase_batch, Graph, StreamId};
use crate::key::Key;
use crate::multiset::{Multiplicity, Multiset};
use crate::operators::Item;
use crate::value::Value;

/// One aggregate in a `groupBy { ... }` clause, matched to its accumulator.
#[derive(Debug, Clone)]
pub enum AggregateKind {
    /// `count()` — every row counts; `distinct` counts distinct whole-row
    /// values instead of raw row multiplicity.
    Count { distinct: bool },
    /// `count(expr)` — counts only rows where `expr` is non-null.
    CountExpr(Expr),
    Sum(Expr),
    Avg(Expr),
    Min(Expr),
    Max(Expr),
    Median(Expr),
    Mode(Expr),
}

/// An aggregate with its output column name.
#[derive(Debug, Clone)]
pub struct AggregateSpec {
    pub output_name: String,
    pub kind: AggregateKind,
}

enum Accumulator {
    Count { n: i64 },
    CountDistinct { values: BTreeMap<Value, i64> },
    CountExpr { n: i64 },
    Sum { sum: f64, n: i64 },
    Avg { sum: f64, n: i64 },
    MinMax { values: BTreeMap<Value, i64>, is_max: bool },
    Median { values: BTreeMap<Value, i64> },
    Mode { values: BTreeMap<Value, i64> },
}

impl Accumulator {
    fn new(kind: &AggregateKind) -> Accumulator {
        match kind {
            AggregateKind::Count { distinct: false } => Accumulator::Count { n: 0 },
            AggregateKind::Count { distinct: true } => Accumulator::CountDistinct { values: BTreeMap::new() },
            AggregateKind::CountExpr(_) => Accumulator::CountExpr { n: 0 },
            AggregateKind::Sum(_) => Accumulator::Sum { sum: 0.0, n: 0 },
            AggregateKind::Avg(_) => Accumulator::Avg { sum: 0.0, n: 0 },
            AggregateKind::Min(_) => Accumulator::MinMax { values: BTreeMap::new(), is_max: false },
            AggregateKind::Max(_) => Accumulator::MinMax { values: BTreeMap::new(), is_max: true },
            AggregateKind::Median(_) => Accumulator::Median { values: BTreeMap::new() },
            AggregateKind::Mode(_) => Accumulator::Mode { values: BTreeMap::new() },
        }
    }

    /// Folds one source-row delta into the accumulator. `arg` is the
    /// aggregate expression evaluated against the row (ignored by `Count`).
    fn apply(&mut self, arg: Value, whole_row: &Value, m: i64) {
        match self {
            Accumulator::Count { n } => *n += m,
            Accumulator::CountDistinct { values } => bump(values, whole_row.clone(), m),
            Accumulator::CountExpr { n } => {
                if !arg.is_null() {
                    *n += m;
                }
            }
            Accumulator::Sum { sum, n } => {
                if let Some(f) = arg.0.as_f64() {
                    *sum += f * m as f64;
                    *n += m;
                }
            }
            Accumulator::Avg { sum, n } => {
                if let Some(f) = arg.0.as_f64() {
                    *sum += f * m as f64;
                    *n += m;
                }
            }
            Accumulator::MinMax { values, .. } => {
                if !arg.is_null() {
                    bump(values, arg, m);
                }
            }
            Accumulator::Median { values } => {
                if !arg.is_null() {
                    bump(values, arg, m);
                }
            }
            Accumulator::Mode { values } => {
                if !arg.is_null() {
                    bump(values, arg, m);
                }
            }
        }
    }

    fn value(&self) -> Value {
        match self {
            Accumulator::Count { n } => Value::from(*n),
            Accumulator::CountDistinct { values } => Value::from(values.len() as i64),
            Accumulator::CountExpr { n } => Value::from(*n),
            Accumulator::Sum { sum, .. } => Value::from(*sum),
            Accumulator::Avg { sum, n } => {
                if *n == 0 {
                    Value::null()
                } else {
                    Value::from(*sum / *n as f64)
                }
            }
            Accumulator::MinMax { values, is_max } => {
                if *is_max {
                    values.keys().next_back().cloned().unwrap_or(Value::null())
                } else {
                    values.keys().next().cloned().unwrap_or(Value::null())
                }
            }
            Accumulator::Median { values } => median_of(values),
            Accumulator::Mode { values } => mode_of(values),
        }
    }
}

fn bump(values: &mut BTreeMap<Value, i64>, v: Value, m: i64) {
    let entry = values.entry(v.clone()).or_insert(0);
    *entry += m;
    if *entry <= 0 {
        values.remove(&v);
    }
}

fn median_of(values: &BTreeMap<Value, i64>) -> Value {
    let total: i64 = values.values().sum();
    if total == 0 {
        return Value::null();
    }
    let mid_lo = (total + 1) / 2;
    let mid_hi = total / 2 + 1;
    let mut seen = 0i64;
    let (mut lo, mut hi) = (None, None);
    for (v, count) in values.iter() {
        let before = seen;
        seen += count;
        if lo.is_none() && seen >= mid_lo {
            lo = Some(v.clone());
        }
        if hi.is_none() && seen >= mid_hi && before < mid_hi {
            hi = Some(v.clone());
        }
    }
    match (lo, hi) {
        (Some(a), Some(b)) => match (a.0.as_f64(), b.0.as_f64()) {
            (Some(x), Some(y)) => Value::from((x + y) / 2.0),
            _ => a,
        },
        (Some(a), None) => a,
        _ => Value::null(),
    }
}

fn mode_of(values: &BTreeMap<Value, i64>) -> Value {
    values.iter().max_by_key(|(_, count)| **count).map(|(v, _)| v.clone()).unwrap_or(Value::null())
}

struct GroupState {
    group_key_columns: Value,
    row_count: i64,
    accumulators: Vec<Accumulator>,
    last_emitted: Option<Value>,
}

/// A `groupBy` clause: the grouping columns (name -> extraction expr, order
/// preserved for deterministic output shape) and the aggregates to compute.
pub struct ReduceConfig {
    pub group_by: Vec<(String, Expr)>,
    pub aggregates: Vec<AggregateSpec>,
}

fn group_key_string(cols: &Value) -> String {
    serde_json::to_string(&cols.0).unwrap_or_default()
}

fn aggregate_arg(kind: &AggregateKind, row: &Value) -> Value {
    match kind {
        AggregateKind::Count { .. } => Value::null(),
        AggregateKind::CountExpr(e)
        | AggregateKind::Sum(e)
        | AggregateKind::Avg(e)
        | AggregateKind::Min(e)
        | AggregateKind::Max(e)
        | AggregateKind::Median(e)
        | AggregateKind::Mode(e) => e.eval(row),
    }
}

fn render_group_value(config: &ReduceConfig, state: &GroupState) -> Value {
    let mut out = Map::new();
    if let Json::Object(cols) = &state.group_key_columns.0 {
        for (k, v) in cols {
            out.insert(k.clone(), v.clone());
        }
    }
    for (spec, acc) in config.aggregates.iter().zip(state.accumulators.iter()) {
        out.insert(spec.output_name.clone(), acc.value().0);
    }
    Value(Json::Object(out))
}

/// Attaches a `groupBy { aggregates }` operator to `input`.
pub fn reduce(graph: &mut Graph, input: StreamId, config: ReduceConfig) -> StreamId {
    let mut groups: std::collections::HashMap<String, GroupState> = std::collections::HashMap::new();

    graph.add_operator(
        "reduce",
        &[input],
        Box::new(move |pulled| -> Result<Vec<Rc<dyn std::any::Any>>> {
            let mut touched: Vec<String> = Vec::new();
            for batch in &pulled[0] {
                for ((_key, value), m) in downcast_batch::<Item>(batch).iter() {
                    let mut cols = Map::new();
                    for (name, expr) in &config.group_by {
                        cols.insert(name.clone(), expr.eval(value).0);
                    }
                    let group_cols = Value(Json::Object(cols));
                    let gk = group_key_string(&group_cols);

                    let state = groups.entry(gk.clone()).or_insert_with(|| GroupState {
                        group_key_columns: group_cols.clone(),
                        row_count: 0,
                        accumulators: config.aggregates.iter().map(|a| Accumulator::new(&a.kind)).collect(),
                        last_emitted: None,
                    });
                    for (spec, acc) in config.aggregates.iter().zip(state.accumulators.iter_mut()) {
                        let arg = aggregate_arg(&spec.kind, value);
                        acc.apply(arg, value, m.0);
                    }
                    state.row_count += m.0;
                    if !touched.contains(&gk) {
                        touched.push(gk);
                    }
                }
            }

            let mut out = Multiset::new();
            for gk in touched {
                let had_prior = groups.get(&gk).map(|s| s.last_emitted.is_some()).unwrap_or(false);
                let row_count = groups.get(&gk).map(|s| s.row_count).unwrap_or(0);
                if row_count < 0 {
                    return Err(IvmError::OperatorInvariant(format!(
                        "group `{gk}` observed negative row count: delete for a group with no state"
                    )));
                }
                if row_count == 0 {
                    // Complete-removal rule: emit (prior, -1) only, never a
                    // zeroed-aggregate insert, then drop the group entirely.
                    if let Some(state) = groups.remove(&gk) {
                        if let Some(prior) = state.last_emitted {
                            out.push((Key::Str(gk.clone()), prior), Multiplicity::NEG_ONE);
                        }
                    }
                    continue;
                }
                let new_value = render_group_value(&config, groups.get(&gk).unwrap());
                let state = groups.get_mut(&gk).unwrap();
                if had_prior {
                    let prior = state.last_emitted.clone().unwrap();
                    out.push((Key::Str(gk.clone()), prior), Multiplicity::NEG_ONE);
                    out.push((Key::Str(gk.clone()), new_value.clone()), Multiplicity::ONE);
                } else {
                    out.push((Key::Str(gk.clone()), new_value.clone()), Multiplicity::ONE);
                }
                state.last_emitted = Some(new_value);
            }
            Ok(vec![erase_batch(out)])
        }),
    )
}
