//! §4.9 Query compiler — lowers a [`Query`] IR into a dataflow [`Graph`].
//!
//! Compilation is a pure function of the IR (`compile(&Query) ->
//! Result<CompiledQuery, CompileError>`) with no hidden global state, so a
//! coordinator compiles once per lifetime and caches the result (§4.10.1).
//! Clauses are lowered in the deterministic order the specification fixes:
//! `join, where, groupBy, having, select, orderBy, distinct, limit, offset`.
//!
//! Every alias beyond `from` joins the accumulated pipeline value as a new
//! key of a JSON object (`{alias: row}`, nested one level per join) — see
//! `query.rs`'s module doc for why column references are alias-qualified.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use serde_json::{json, Map, Value as Json};

use crate::error::CompileError;
use crate::expr::{is_pushable, Expr};
use crate::graph::{Graph, InputHandle, StreamId};
use crate::operators::distinct::distinct;
use crate::operators::filter::filter;
use crate::operators::join::{join, JoinConfig};
use crate::operators::map::map;
use crate::operators::orderby::{order_by, top_k, OrderByTerm, TopKHandle};
use crate::operators::project::project;
use crate::operators::reduce::{reduce, ReduceConfig};
use crate::operators::Item;
use crate::query::Query;
use crate::value::Value;

/// The `alias -> {offset, limit}` entry of §4.9's "optimizable-orderBy map",
/// present only when [`Query::order_by_is_optimizable`] holds. The
/// coordinator (§4.10 step 2) uses this to drive the source's sorted index
/// directly instead of materializing the whole collection.
#[derive(Debug, Clone)]
pub struct OptimizableOrderBy {
    pub alias: String,
    pub offset: usize,
    pub limit: usize,
    /// The query's single `orderBy` term, for building the source's
    /// `SortedIndex` (§4.7) the coordinator pulls windows from directly.
    pub term: OrderByTerm,
}

/// Per-lazy-alias handle letting the coordinator resolve the join's own
/// `loadKeys(keys)` requests (§4.4, §4.10 step 2) into actual rows, without
/// giving the join operator itself any access to the alias's source
/// collection.
pub struct LazyJoinProbe {
    /// The unqualified join-key expression (§6 doc: `right_key` is already
    /// evaluated against the lazy alias's own raw row) — the coordinator
    /// builds a `HashIndex` over the lazy alias's source with this same
    /// expression, so a join-key value can be resolved back to the rows
    /// that carry it.
    pub join_key_expr: Expr,
    /// Join-key values the compiled join has asked to have hydrated since
    /// this buffer was last drained. Filled by the `on_right_needed`
    /// callback wired into the join's `JoinConfig`, drained by the
    /// coordinator between graph runs — never accessed concurrently with
    /// itself, since a `Graph::run()` is never re-entered mid-pass.
    pub needed: Rc<RefCell<Vec<Value>>>,
}

/// The result of compiling a [`Query`]: a finalizable graph, one root input
/// per alias the query reads from, and the caches §4.9 names.
pub struct CompiledQuery {
    pub graph: Graph,
    /// `alias -> root input` the coordinator feeds translated `Change`
    /// deltas into (§4.10 step 3).
    pub inputs: HashMap<String, InputHandle<Item>>,
    pub output: StreamId,
    /// §4.9 "collection-where-clauses cache": `alias -> pushable
    /// predicate`, already stripped of its alias qualifier so it evaluates
    /// directly against that source's own (unqualified) rows.
    pub pushable_where: HashMap<String, Expr>,
    /// §4.9 "lazy-collections set".
    pub lazy_collections: HashSet<String>,
    /// `alias -> LazyJoinProbe` for every lazy join clause (§4.4, §4.10
    /// step 2's `loadKeys` path) — one entry per alias in `lazy_collections`.
    pub lazy_join_probes: HashMap<String, LazyJoinProbe>,
    pub optimizable_order_by: Option<OptimizableOrderBy>,
    /// Present iff the query has an `orderBy` + `limit`/`offset`; the
    /// coordinator polls `size()`/`data_needed()` on this after every run
    /// (§4.6 back-pressure).
    pub top_k_handle: Option<TopKHandle>,
}

fn wrap_alias(graph: &mut Graph, input: StreamId, alias: String) -> StreamId {
    map(graph, input, move |(k, v)| (k, Value(json!({ alias.clone(): v.0 }))))
}

/// Builds the `combine` function a join uses to fold a newly-joined alias's
/// raw row into the accumulated multi-alias object (§4.4 "combinedValue").
fn combine_for_alias(alias: String) -> Box<dyn Fn(Option<&Value>, Option<&Value>) -> Value> {
    Box::new(move |left, right| {
        let mut obj = match left {
            Some(v) => match &v.0 {
                Json::Object(m) => m.clone(),
                _ => Map::new(),
            },
            None => Map::new(),
        };
        obj.insert(alias.clone(), right.map(|v| v.0.clone()).unwrap_or(Json::Null));
        Value(Json::Object(obj))
    })
}

fn collect_aliases(expr: &Expr, out: &mut HashSet<String>) {
    match expr {
        Expr::Ref(path) => {
            if let Some(first) = path.first() {
                out.insert(first.clone());
            }
        }
        Expr::Val(_) => {}
        Expr::Func(_, args) => {
            for a in args {
                collect_aliases(a, out);
            }
        }
    }
}

/// Rewrites every `ref([alias, ...rest])` to `ref([...rest])`, leaving
/// other refs untouched. Used to turn a qualified pushable predicate into
/// one the named source's own (unqualified) rows can evaluate.
fn strip_alias(expr: &Expr, alias: &str) -> Expr {
    match expr {
        Expr::Ref(path) => {
            if path.first().map(String::as_str) == Some(alias) {
                Expr::Ref(path[1..].to_vec())
            } else {
                expr.clone()
            }
        }
        Expr::Val(_) => expr.clone(),
        Expr::Func(f, args) => Expr::Func(*f, args.iter().map(|a| strip_alias(a, alias)).collect()),
    }
}

/// Classifies one top-level `where` entry: pushable to a single alias's
/// source subscription, or not (§4.9 "pushable part... and a remaining
/// part"). `is_pushable` itself expects single-level refs (an unqualified
/// source's own column names), so the alias prefix must be stripped off
/// *before* testing pushability, not after — a query-level ref like
/// `ref(["issues", "status"])` always has `path.len() == 2` and would never
/// qualify otherwise. A predicate spanning more than one alias (e.g. a join
/// condition accidentally repeated in `where`) cannot be pushed to any
/// single source, so it falls back to the remaining/filter path too.
fn classify_pushable(expr: &Expr) -> Option<(String, Expr)> {
    let mut aliases = HashSet::new();
    collect_aliases(expr, &mut aliases);
    if aliases.len() != 1 {
        return None;
    }
    let alias = aliases.into_iter().next().unwrap();
    let stripped = strip_alias(expr, &alias);
    if is_pushable(&stripped) {
        Some((alias, stripped))
    } else {
        None
    }
}

fn truthy_filter(graph: &mut Graph, input: StreamId, expr: Expr) -> StreamId {
    filter(graph, input, move |(_, v)| matches!(expr.eval(v).0, Json::Bool(true)))
}

/// Lowers `query` into a [`CompiledQuery`]. Pure: no graph runs, no I/O.
pub fn compile(query: &Query) -> Result<CompiledQuery, CompileError> {
    let mut graph = Graph::new();
    let mut inputs: HashMap<String, InputHandle<Item>> = HashMap::new();
    let mut lazy_collections: HashSet<String> = HashSet::new();
    let mut lazy_join_probes: HashMap<String, LazyJoinProbe> = HashMap::new();

    let base_alias = query.from.alias.clone();
    let base_input = graph.add_input::<Item>();
    let mut current = wrap_alias(&mut graph, base_input.stream_id(), base_alias.clone());
    inputs.insert(base_alias.clone(), base_input);

    // -- join --
    for clause in &query.joins {
        if inputs.contains_key(&clause.alias) {
            return Err(CompileError::UnknownAlias(clause.alias.clone()));
        }
        let right_input = graph.add_input::<Item>();
        let right_stream = right_input.stream_id();
        inputs.insert(clause.alias.clone(), right_input);
        let left_key = clause.left_key.clone();
        let right_key = clause.right_key.clone();
        let mut cfg = JoinConfig {
            kind: clause.kind,
            left_join_key: Box::new(move |v| left_key.eval(v)),
            right_join_key: Box::new(move |v| right_key.eval(v)),
            combine: combine_for_alias(clause.alias.clone()),
            on_right_needed: None,
            on_left_needed: None,
        };
        if clause.lazy {
            lazy_collections.insert(clause.alias.clone());
            // Only the joined (right) alias can ever be marked lazy in this
            // IR (`query.rs`'s `JoinClause` has no `lazy` flag for `from`),
            // so only `on_right_needed` is ever wired here.
            let needed = Rc::new(RefCell::new(Vec::new()));
            let needed_for_cb = needed.clone();
            cfg.on_right_needed = Some(Rc::new(RefCell::new(move |keys: &[Value]| {
                needed_for_cb.borrow_mut().extend_from_slice(keys);
            })));
            lazy_join_probes.insert(clause.alias.clone(), LazyJoinProbe { join_key_expr: clause.right_key.clone(), needed });
        }
        current = join(&mut graph, current, right_stream, cfg);
    }

    // -- where: split pushable vs remaining --
    let mut pushable_where: HashMap<String, Expr> = HashMap::new();
    let mut remaining: Vec<Expr> = Vec::new();
    for clause in &query.where_clauses {
        match classify_pushable(clause) {
            Some((alias, stripped)) => {
                pushable_where
                    .entry(alias)
                    .and_modify(|existing| *existing = Expr::and(vec![existing.clone(), stripped.clone()]))
                    .or_insert(stripped);
            }
            None => remaining.push(clause.clone()),
        }
    }
    if !remaining.is_empty() {
        let combined = if remaining.len() == 1 { remaining.remove(0) } else { Expr::and(remaining) };
        current = truthy_filter(&mut graph, current, combined);
    }

    // -- groupBy --
    if let Some(gb) = &query.group_by {
        current = reduce(
            &mut graph,
            current,
            ReduceConfig { group_by: gb.columns.clone(), aggregates: gb.aggregates.clone() },
        );
    }

    // -- having --
    if let Some(having) = &query.having {
        current = truthy_filter(&mut graph, current, having.clone());
    }

    // -- select --
    if let Some(fields) = &query.select {
        current = project(&mut graph, current, fields.clone());
    }

    // -- orderBy (+ distinct, limit, offset) --
    let mut optimizable_order_by = None;
    let mut top_k_handle = None;
    if !query.order_by.is_empty() {
        if query.limit.is_some() || query.offset.is_some() {
            let offset = query.offset.unwrap_or(0);
            let limit = query
                .limit
                .ok_or_else(|| CompileError::UnresolvedOrderBy("offset given without a limit".into()))?;
            let (out, handle) = top_k(&mut graph, current, query.order_by.clone(), offset, limit);
            current = out;
            if query.order_by_is_optimizable() {
                // The query's term is alias-qualified (it's evaluated against
                // the graph's wrapped `{alias: row}` shape by the `top_k`
                // operator above), but the source's own `SortedIndex` is built
                // directly over raw, unwrapped rows — so the alias prefix
                // must come off before it's handed to `create_sorted_index`.
                let unqualified = query.order_by[0].clone();
                let stripped_term = OrderByTerm {
                    expr: strip_alias(&unqualified.expr, &base_alias),
                    direction: unqualified.direction,
                    nulls: unqualified.nulls,
                };
                optimizable_order_by = Some(OptimizableOrderBy {
                    alias: base_alias.clone(),
                    offset,
                    limit,
                    term: stripped_term,
                });
            }
            top_k_handle = Some(handle);
        } else {
            current = order_by(&mut graph, current, query.order_by.clone());
        }
    } else if query.limit.is_some() || query.offset.is_some() {
        return Err(CompileError::UnresolvedOrderBy("limit/offset specified without an orderBy clause".into()));
    }

    if query.distinct {
        current = distinct(&mut graph, current);
    }

    Ok(CompiledQuery {
        graph,
        inputs,
        output: current,
        pushable_where,
        lazy_collections,
        lazy_join_probes,
        optimizable_order_by,
        top_k_handle,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Key;
    use crate::multiset::{Multiplicity, Multiset};
    use crate::operators::join::JoinKind;
    use crate::operators::orderby::OrderByTerm;
    use crate::operators::output::output;
    use crate::operators::reduce::{AggregateKind, AggregateSpec};
    use crate::query::{GroupByClause, JoinClause, SourceRef};
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn single_source_where_is_fully_pushable() {
        let query = Query::new("issues").filter(Expr::eq(Expr::ref_path(["issues", "status"]), Expr::val("open")));
        let compiled = compile(&query).unwrap();
        assert_eq!(compiled.pushable_where.len(), 1);
        assert_eq!(
            compiled.pushable_where["issues"],
            Expr::eq(Expr::ref_path(["status"]), Expr::val("open"))
        );
    }

    #[test]
    fn not_predicate_is_not_pushed_down() {
        let query =
            Query::new("issues").filter(Expr::Func(crate::expr::Func::Not, vec![Expr::val(true)]));
        let compiled = compile(&query).unwrap();
        assert!(compiled.pushable_where.is_empty());
    }

    #[test]
    fn join_then_groupby_then_orderby_runs_end_to_end() {
        let query = Query {
            from: SourceRef { alias: "issues".into() },
            joins: vec![JoinClause {
                alias: "users".into(),
                kind: JoinKind::Left,
                left_key: Expr::ref_path(["issues", "userId"]),
                right_key: Expr::ref_path(["id"]),
                lazy: false,
            }],
            where_clauses: vec![],
            group_by: Some(GroupByClause {
                columns: vec![("userId".into(), Expr::ref_path(["issues", "userId"]))],
                aggregates: vec![AggregateSpec { output_name: "count".into(), kind: AggregateKind::Count { distinct: false } }],
            }),
            having: None,
            select: None,
            order_by: vec![OrderByTerm {
                expr: Expr::ref_path(["count"]),
                direction: crate::index::Direction::Asc,
                nulls: crate::index::Nulls::Last,
            }],
            limit: None,
            offset: None,
            distinct: false,
        };
        let mut compiled = compile(&query).unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_clone = seen.clone();
        output(&mut compiled.graph, compiled.output, move |b| seen_clone.borrow_mut().extend(b.inner().to_vec()));

        compiled.inputs["issues"].send_data(
            &compiled.graph,
            Multiset::singleton((Key::from(1i64), Value(json!({"userId": 7}))), Multiplicity::ONE),
        );
        compiled.inputs["users"].send_data(
            &compiled.graph,
            Multiset::singleton((Key::from(7i64), Value(json!({"id": 7, "name": "Amy"}))), Multiplicity::ONE),
        );
        compiled.graph.run().unwrap();
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn limit_without_orderby_is_a_compile_error() {
        let query = Query::new("issues").limit(5);
        assert!(compile(&query).is_err());
    }

    #[test]
    fn optimizable_order_by_term_is_alias_stripped_for_the_source_index() {
        let query = Query::new("people")
            .order_by(vec![OrderByTerm {
                expr: Expr::ref_path(["people", "name"]),
                direction: crate::index::Direction::Asc,
                nulls: crate::index::Nulls::Last,
            }])
            .limit(3);
        let compiled = compile(&query).unwrap();
        let opt = compiled.optimizable_order_by.expect("single-source orderBy+limit must be optimizable");
        assert_eq!(opt.term.expr, Expr::ref_path(["name"]));
    }
}
