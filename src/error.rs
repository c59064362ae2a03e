//! Error taxonomy for the incremental-view-maintenance core.
//!
//! Three kinds matter to a caller: a query failed to compile (synchronous,
//! at `LiveQueryCollection::new` time), a source collection the query
//! depends on entered an error state, or an operator observed a change set
//! that violates its invariants (a bug, not a recoverable condition). Effect
//! handler errors are deliberately not part of this enum: they are routed to
//! `onError` (see `effect.rs`) and never reach the graph.

use crate::collection::CollectionStatus;
use thiserror::Error;

/// Errors raised while compiling a query into a dataflow graph.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CompileError {
    /// The query's `from` (or a join alias) names a collection the compiler
    /// was not given a binding for.
    #[error("unknown collection alias `{0}`")]
    UnknownAlias(String),

    /// The query IR contained a clause key the compiler does not recognize.
    #[error("unknown query clause `{0}`")]
    UnknownClause(String),

    /// A `where` expression was classified as pushable but could not
    /// actually be lowered to an index predicate. This indicates a bug in
    /// the pushability analysis, not a malformed query.
    #[error("expression claimed pushable but failed to compile: {0}")]
    PushabilityMismatch(String),

    /// `orderBy` referenced a column that does not resolve against any
    /// known alias's projection.
    #[error("orderBy expression does not resolve to a known column: {0}")]
    UnresolvedOrderBy(String),

    /// `groupBy`/`having`/`select` referenced an aggregate function that is
    /// not part of the closed aggregate set.
    #[error("unknown aggregate function `{0}`")]
    UnknownAggregate(String),
}

/// Top-level error type for the core. Mirrors the taxonomy in the
/// specification: configuration errors are raised synchronously at
/// construction time, source errors and operator invariants propagate
/// through a collection's status channel.
#[derive(Debug, Clone, Error)]
pub enum IvmError {
    /// A query failed to compile.
    #[error("query configuration error: {0}")]
    Config(#[from] CompileError),

    /// A source collection this query depends on is not usable.
    #[error("source collection `{alias}` is in status {status:?}")]
    Source {
        /// The alias of the offending source, as it appears in the query.
        alias: String,
        /// The status the source collection was observed in.
        status: CollectionStatus,
    },

    /// An operator observed an impossible change set (e.g. a `-1` for a key
    /// it holds no state for). Fatal: the graph is poisoned and the derived
    /// collection transitions to `error`.
    #[error("operator invariant violated: {0}")]
    OperatorInvariant(String),

    /// The dataflow graph's topology is not a DAG.
    #[error("dataflow graph contains a cycle")]
    CyclicGraph,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, IvmError>;
