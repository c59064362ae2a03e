//! Incremental view maintenance core for a client-side reactive database.
//!
//! This crate maintains live query results over one or more source
//! collections: given a declarative query (selection, projection, join,
//! group-by with aggregates, order-by with limit/offset), it produces a
//! continuously updated result derived from source deltas, doing only the
//! work proportional to the change.
//!
//! Three subsystems carry the discipline:
//!
//! - the multiset dataflow graph ([`graph`], [`multiset`], [`operators`]) —
//!   the substrate every incremental computation runs on;
//! - the live-query coordinator ([`coordinator`]) — compiles a query
//!   ([`query`], [`compiler`]) into a graph, subscribes it to source
//!   [`collection`]s, and translates graph output back into ordered
//!   `insert`/`update`/`delete` events;
//! - the top-K/order-by optimization path ([`operators::orderby`],
//!   [`index`]) — avoids materializing full source collections when a
//!   query has `order by ... limit k offset o`.
//!
//! Storage/persistence adapters, the declarative query-builder surface,
//! transaction/optimistic-mutation machinery, UI bindings, and wire
//! protocols to remote servers are out of scope: this crate is the
//! in-process core a host application embeds and drives.

pub mod change;
pub mod collection;
pub mod compiler;
pub mod coordinator;
pub mod effect;
pub mod error;
pub mod expr;
pub mod fractional;
pub mod graph;
pub mod index;
pub mod key;
pub mod multiset;
pub mod operators;
pub mod query;
pub mod value;

pub use change::Change;
pub use collection::{Collection, CollectionEvent, CollectionStatus};
pub use coordinator::{Coordinator, SharedCollection};
pub use effect::{Effect, EffectConfig, EffectEvent, EffectKind};
pub use error::{CompileError, IvmError, Result};
pub use expr::{Expr, Func};
pub use graph::Graph;
pub use key::Key;
pub use multiset::{Multiplicity, Multiset};
pub use query::Query;
pub use value::Value;
