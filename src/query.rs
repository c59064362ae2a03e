//! §6 Query IR — the compiled-graph input the query compiler (§4.9)
//! consumes. The textual/declarative query builder that produces this IR is
//! explicitly out of scope (§1); this module is the IR itself plus the
//! small constructors that make building one by hand (as every test in this
//! crate does) tolerable.
//!
//! **Alias-qualified column references.** Because a query may join several
//! source collections, every [`Expr::Ref`] this crate's compiler evaluates
//! downstream of `from`/`join` is alias-qualified: its first path segment
//! names the collection alias it resolves against (e.g. `ref(["issues",
//! "status"])`), and the compiler strips that prefix back off before
//! pushing a predicate down to the named source, whose own rows are of
//! course not alias-qualified. This is the compiler's resolution of §9's
//! "object-identity" note generalized to N-way joins — the spec does not
//! mandate a column-reference scheme for multi-source queries, so this
//! crate picks the one consistent, stable scheme throughout.

use crate::expr::Expr;
use crate::operators::join::JoinKind;
use crate::operators::orderby::OrderByTerm;
use crate::operators::project::ProjectionField;
use crate::operators::reduce::AggregateSpec;

/// `from: {alias: CollectionRef}` (§6). Subquery refs (`QueryRef`) are out
/// of scope for this crate's compiler — every `from`/`join` source is a
/// named collection alias the coordinator binds to a live [`crate::collection::Collection`].
#[derive(Debug, Clone)]
pub struct SourceRef {
    pub alias: String,
}

/// One `join[]` entry (§6, §4.4). `left_key` is evaluated against the
/// alias-qualified object accumulated by every join before this one;
/// `right_key` is evaluated against the *unqualified* raw row of the
/// newly-joined alias (the compiler wraps it under `alias` only in the
/// join's `combine` step, after the key has been computed).
#[derive(Debug, Clone)]
pub struct JoinClause {
    pub alias: String,
    pub kind: JoinKind,
    pub left_key: Expr,
    pub right_key: Expr,
    /// Marks this side for on-demand hydration (§4.10 step 2, §4.4
    /// "Lazy-load collaboration") instead of an eager `ready`+initial-state
    /// subscription.
    pub lazy: bool,
}

/// `groupBy { ... }` + its aggregate projections (§4.5, §6).
#[derive(Debug, Clone)]
pub struct GroupByClause {
    /// Grouping columns in output order: `(outputName, expr)`.
    pub columns: Vec<(String, Expr)>,
    pub aggregates: Vec<AggregateSpec>,
}

/// The compiled-graph input (§6 Query shape).
#[derive(Debug, Clone)]
pub struct Query {
    pub from: SourceRef,
    pub joins: Vec<JoinClause>,
    /// `where?: Expr[]` — an implicit AND of independently-classified
    /// clauses (§4.9 "separates each `where` into a pushable part... and a
    /// remaining part").
    pub where_clauses: Vec<Expr>,
    pub group_by: Option<GroupByClause>,
    /// `having` is evaluated against the `groupBy` operator's rendered
    /// `{...groupColumns, ...aggregates}` value, so its refs are
    /// unqualified column names, not alias-qualified.
    pub having: Option<Expr>,
    pub select: Option<Vec<ProjectionField>>,
    pub order_by: Vec<OrderByTerm>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub distinct: bool,
}

impl Query {
    pub fn new(alias: impl Into<String>) -> Self {
        Query {
            from: SourceRef { alias: alias.into() },
            joins: Vec::new(),
            where_clauses: Vec::new(),
            group_by: None,
            having: None,
            select: None,
            order_by: Vec::new(),
            limit: None,
            offset: None,
            distinct: false,
        }
    }

    pub fn join(mut self, clause: JoinClause) -> Self {
        self.joins.push(clause);
        self
    }

    pub fn filter(mut self, expr: Expr) -> Self {
        self.where_clauses.push(expr);
        self
    }

    pub fn group_by(mut self, clause: GroupByClause) -> Self {
        self.group_by = Some(clause);
        self
    }

    pub fn having(mut self, expr: Expr) -> Self {
        self.having = Some(expr);
        self
    }

    pub fn select(mut self, fields: Vec<ProjectionField>) -> Self {
        self.select = Some(fields);
        self
    }

    pub fn order_by(mut self, terms: Vec<OrderByTerm>) -> Self {
        self.order_by = terms;
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn offset(mut self, n: usize) -> Self {
        self.offset = Some(n);
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    /// Every alias this query's graph reads from: `from` plus every `join`.
    pub fn aliases(&self) -> Vec<String> {
        let mut out = vec![self.from.alias.clone()];
        out.extend(self.joins.iter().map(|j| j.alias.clone()));
        out
    }

    /// Whether the `orderBy` clause "projects entirely through a single
    /// source with no blocking operator in between" (§4.9) — the condition
    /// under which the coordinator may use the optimizable top-K path
    /// (§4.6, §4.10 step 2) instead of materializing the whole source.
    ///
    /// Restricted to a single `orderBy` term: the reference `SortedIndex`
    /// (§4.7) orders by one column, so a multi-term `orderBy` always falls
    /// back to materializing the whole source even when it would otherwise
    /// qualify.
    pub fn order_by_is_optimizable(&self) -> bool {
        self.order_by.len() == 1
            && self.limit.is_some()
            && self.joins.is_empty()
            && self.group_by.is_none()
            && self.having.is_none()
    }
}
