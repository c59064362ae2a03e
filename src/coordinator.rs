//! §4.10 Live-query coordinator — ties a compiled graph to live source
//! subscriptions and produces a derived [`Collection`].
//!
//! One coordinator owns exactly one compiled graph (§5 "graphs... never
//! shared across coordinators"); it is `!Sync`/`!Send` by construction via
//! the `Rc<RefCell<...>>` state every subscription callback closes over.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::change::Change;
use crate::collection::{Collection, SnapshotOptions, SubscribeOptions};
use crate::compiler::{compile, CompiledQuery};
use crate::error::{IvmError, Result};
use crate::expr::Expr;
use crate::key::Key;
use crate::multiset::{Multiplicity, Multiset};
use crate::operators::output::output;
use crate::operators::Item;
use crate::query::Query;
use crate::value::Value;

/// A strong reference to a source collection. Every alias a query reads
/// from, and the collection a coordinator produces, are this type — the
/// in-crate stand-in for the "downward collaborator" interface (§6), since
/// storage adapters are out of scope and this crate ships one concrete
/// `Collection` implementation (§4.8 ADDED).
pub type SharedCollection = Rc<RefCell<Collection>>;

struct OptimizableState {
    alias: String,
    offset: usize,
    limit: usize,
    index_signature: String,
    taken: usize,
    sent: HashSet<Key>,
}

struct Agg {
    inserts: i64,
    deletes: i64,
    pos_value: Option<Value>,
    neg_value: Option<Value>,
}

struct CoordinatorState {
    compiled: CompiledQuery,
    sources: HashMap<String, SharedCollection>,
    output: SharedCollection,
    sub_ids: HashMap<String, u64>,
    output_buffer: Rc<RefCell<Vec<(Item, Multiplicity)>>>,
    /// Lazy aliases with no `LazyJoinProbe` (shouldn't occur given the
    /// current IR, but not assumed) that have already taken the whole-table
    /// `loadInitialState` fallback.
    lazy_hydrated: HashSet<String>,
    /// `alias -> hash-index signature` for every lazy alias with a
    /// `LazyJoinProbe`, built once against that alias's source at
    /// construction time (§4.10 step 2 `loadKeys`).
    lazy_hash_index_sigs: HashMap<String, String>,
    /// Join-key values already hydrated per lazy alias, so a key asked for
    /// more than once across runs is only loaded the first time.
    lazy_hydrated_keys: HashMap<String, HashSet<Value>>,
    optimizable: Option<OptimizableState>,
    in_transaction: bool,
    disposed: bool,
    began_initial_commit: bool,
    marked_ready: bool,
}

impl CoordinatorState {
    fn all_sources_usable(&self) -> bool {
        self.sources.values().all(|c| c.borrow().status().is_usable())
    }

    /// Whether the most recent graph run asked for any lazy join key that
    /// hasn't been hydrated yet (§4.4 `loadKeys`) — another run is needed
    /// once those rows are fed in.
    fn any_lazy_needed_pending(&self) -> bool {
        self.compiled.lazy_join_probes.values().any(|p| !p.needed.borrow().is_empty())
    }

    /// Step 3: translates one source's `Change` batch into a multiset delta
    /// and enqueues it on that alias's graph input.
    fn enqueue(&mut self, alias: &str, changes: &[Change]) {
        if self.disposed {
            return;
        }
        let mut delta = Multiset::new();
        for change in changes {
            delta = delta.concat(change.to_deltas());
        }
        if let Some(input) = self.compiled.inputs.get(alias) {
            input.send_data(&self.compiled.graph, delta);
        }
    }

    /// Step 2's `loadKeys(keys)` path for a lazy alias (§4.4 "Lazy-load
    /// collaboration"): drains whatever join-key values the compiled join
    /// asked to have resolved since the last run, looks each one up in a
    /// `HashIndex` built over that alias's source at construction time, and
    /// hydrates only the matching rows — never the whole table. Falls back
    /// to the whole-table `loadInitialState` behavior for a lazy alias that
    /// has no `LazyJoinProbe` (not reachable from the current IR, where
    /// every lazy alias is a join's right side, but not assumed blindly).
    fn hydrate_lazy_if_needed(&mut self) {
        let lazy_aliases: Vec<String> = self.compiled.lazy_collections.iter().cloned().collect();
        for alias in lazy_aliases {
            if let Some(sig) = self.lazy_hash_index_sigs.get(&alias).cloned() {
                self.hydrate_lazy_by_key(&alias, &sig);
            } else {
                self.hydrate_lazy_whole_table(&alias);
            }
        }
    }

    fn hydrate_lazy_by_key(&mut self, alias: &str, index_signature: &str) {
        let Some(source) = self.sources.get(alias).cloned() else { return };
        if !source.borrow().status().is_usable() {
            return;
        }
        let Some(probe) = self.compiled.lazy_join_probes.get(alias) else { return };
        let requested: Vec<Value> = probe.needed.borrow_mut().drain(..).collect();
        if requested.is_empty() {
            return;
        }
        let source_ref = source.borrow();
        let Some(index) = source_ref.hash_index(index_signature) else { return };
        let hydrated = self.lazy_hydrated_keys.entry(alias.to_string()).or_default();
        let mut changes = Vec::new();
        for key_value in requested {
            if !hydrated.insert(key_value.clone()) {
                continue;
            }
            for pk in index.lookup_eq(&key_value) {
                if let Some(value) = source_ref.get(&pk) {
                    changes.push(Change::Insert { key: pk, value: value.clone() });
                }
            }
        }
        drop(source_ref);
        if !changes.is_empty() {
            self.enqueue(alias, &changes);
        }
    }

    /// The whole-table fallback (spec's `loadInitialState`): hydrates the
    /// entire currently-matching subset once, the first time the source
    /// becomes usable.
    fn hydrate_lazy_whole_table(&mut self, alias: &str) {
        if self.lazy_hydrated.contains(alias) {
            return;
        }
        let Some(source) = self.sources.get(alias) else { return };
        if !source.borrow().status().is_usable() {
            return;
        }
        let where_expression = self.compiled.pushable_where.get(alias).cloned();
        let snapshot = source.borrow().current_state_as_changes(&SnapshotOptions { where_expression });
        self.lazy_hydrated.insert(alias.to_string());
        self.enqueue(alias, &snapshot);
    }

    /// Step 2's optimizable-orderBy path: seeds the window from the
    /// source's sorted index, then (after each run) tops it up by however
    /// much `dataNeeded()` still reports short.
    fn pull_optimizable_window(&mut self) {
        // Every field needed is copied out up front: `self.enqueue` below
        // needs `&mut self`, which a borrow held through `self.optimizable`
        // or `self.sources` would still conflict with.
        let (alias, index_signature, taken, offset, limit) = match &self.optimizable {
            Some(opt) => (opt.alias.clone(), opt.index_signature.clone(), opt.taken, opt.offset, opt.limit),
            None => return,
        };
        let Some(source) = self.sources.get(&alias).cloned() else { return };
        let source_ref = source.borrow();
        let Some(index) = source_ref.sorted_index(&index_signature) else { return };

        let needed = self
            .compiled
            .top_k_handle
            .as_ref()
            .map(|h| h.data_needed())
            .unwrap_or((offset + limit).saturating_sub(taken));
        if needed == 0 {
            return;
        }
        let window = index.window(taken, needed);
        if window.is_empty() {
            return;
        }

        let fresh: Vec<Key> = {
            let opt = self.optimizable.as_mut().expect("checked Some above");
            window.iter().filter(|k| opt.sent.insert((*k).clone())).cloned().collect()
        };
        let mut changes = Vec::new();
        for key in &fresh {
            if let Some(value) = source_ref.get(key) {
                changes.push(Change::Insert { key: key.clone(), value: value.clone() });
            }
        }
        if let Some(opt) = self.optimizable.as_mut() {
            opt.taken += window.len();
        }
        drop(source_ref);
        if !changes.is_empty() {
            self.enqueue(&alias, &changes);
        }
    }

    /// Step 4: runs the graph to a fixed point (if every source is usable),
    /// tops up the optimizable window or lazy hydration as needed, and
    /// classifies + applies the terminal batch (step 5).
    fn maybe_run(&mut self) {
        if self.disposed || self.in_transaction {
            return;
        }
        self.hydrate_lazy_if_needed();
        self.pull_optimizable_window();
        if !self.all_sources_usable() {
            return;
        }
        loop {
            if let Err(err) = self.compiled.graph.run() {
                self.output.borrow_mut().mark_error(err.to_string());
                return;
            }
            if let Err(err) = self.apply_terminal_batch() {
                self.output.borrow_mut().mark_error(err.to_string());
                return;
            }
            if !self.began_initial_commit {
                self.began_initial_commit = true;
                self.output.borrow_mut().begin_initial_commit();
            }
            let lazy_pending = self.any_lazy_needed_pending();
            let topk_caught_up = self.compiled.top_k_handle.as_ref().map(|h| h.data_needed() == 0).unwrap_or(true);
            if topk_caught_up && !lazy_pending {
                if !self.marked_ready {
                    self.marked_ready = true;
                    self.output.borrow_mut().mark_ready();
                }
                break;
            }
            let before = self.optimizable.as_ref().map(|o| o.taken).unwrap_or(0);
            self.hydrate_lazy_if_needed();
            self.pull_optimizable_window();
            let after = self.optimizable.as_ref().map(|o| o.taken).unwrap_or(0);
            if after == before && !lazy_pending {
                // Source exhausted and no lazy hydration pending: can't make
                // further progress this run.
                break;
            }
        }
    }

    /// Step 5: accumulates this run's terminal batch by key and classifies
    /// each into insert/update/delete, then applies the whole run's changes
    /// to the derived collection in a single `apply_batch` (so subscribers
    /// see one coherent notification per run, mirroring the graph's own
    /// single-pass-per-run discipline, §4.2).
    fn apply_terminal_batch(&mut self) -> Result<()> {
        let produced: Vec<(Item, Multiplicity)> = self.output_buffer.borrow_mut().drain(..).collect();
        if produced.is_empty() {
            return Ok(());
        }
        let mut agg: HashMap<Key, Agg> = HashMap::new();
        for ((key, value), m) in produced {
            let entry = agg.entry(key).or_insert(Agg { inserts: 0, deletes: 0, pos_value: None, neg_value: None });
            if m.0 > 0 {
                entry.inserts += m.0;
                entry.pos_value = Some(value);
            } else if m.0 < 0 {
                entry.deletes += -m.0;
                entry.neg_value = Some(value);
            }
        }

        let mut changes = Vec::with_capacity(agg.len());
        for (key, a) in agg {
            let has = self.output.borrow().has(&key);
            if a.inserts == 1 && a.deletes == 0 {
                changes.push(Change::Insert { key, value: a.pos_value.expect("insert must carry a value") });
            } else if a.inserts > a.deletes || (a.inserts == a.deletes && has) {
                let previous_value = a
                    .neg_value
                    .or_else(|| self.output.borrow().get(&key).cloned())
                    .unwrap_or(Value::null());
                let value = a.pos_value.unwrap_or_else(|| previous_value.clone());
                changes.push(Change::Update { key, previous_value, value });
            } else if a.deletes > 0 && a.inserts == 0 {
                changes.push(Change::Delete { key, value: a.neg_value.expect("delete must carry a value") });
            } else if a.inserts == a.deletes && !has {
                // A key that both appeared and was retracted within this one
                // run (e.g. the bilinear-join trick's outer-join null row:
                // synthesized when a left row lands unmatched, then
                // retracted later the same run once the matching right row
                // is indexed) and never existed in the output before nets to
                // nothing observable — no change to emit.
            } else {
                return Err(IvmError::OperatorInvariant(format!(
                    "terminal batch classification impossible for key `{key}`: {} inserts, {} deletes",
                    a.inserts, a.deletes
                )));
            }
        }
        self.output.borrow_mut().apply_batch(changes);
        Ok(())
    }
}

/// The live-query coordinator (§4.10). Owns the compiled graph and every
/// source subscription; produces and maintains `output()`, a derived
/// [`Collection`] consumers subscribe to exactly like any source.
pub struct Coordinator {
    state: Rc<RefCell<CoordinatorState>>,
}

impl Coordinator {
    /// Compiles `query` against `sources` (one entry per alias named by
    /// [`Query::aliases`]) and wires up every subscription per §4.10 step 2.
    pub fn new(query: &Query, sources: HashMap<String, SharedCollection>) -> std::result::Result<Coordinator, IvmError> {
        for alias in query.aliases() {
            if !sources.contains_key(&alias) {
                return Err(IvmError::Config(crate::error::CompileError::UnknownAlias(alias)));
            }
        }
        let mut compiled = compile(query).map_err(IvmError::Config)?;

        let output_buffer = Rc::new(RefCell::new(Vec::new()));
        let buf = output_buffer.clone();
        output(&mut compiled.graph, compiled.output, move |batch| {
            buf.borrow_mut().extend(batch.inner().to_vec());
        });

        let optimizable = if let Some(opt) = &compiled.optimizable_order_by {
            let source = sources.get(&opt.alias).expect("optimizable alias must be a known source");
            let sig = source.borrow_mut().create_sorted_index(&opt.term.expr, opt.term.direction, opt.term.nulls, "topk");
            Some(OptimizableState {
                alias: opt.alias.clone(),
                offset: opt.offset,
                limit: opt.limit,
                index_signature: sig,
                taken: 0,
                sent: HashSet::new(),
            })
        } else {
            None
        };

        // One `HashIndex` per lazy join alias, built over that alias's own
        // source now so `loadKeys` lookups later never scan the full table
        // (§4.4, §4.10 step 2).
        let mut lazy_hash_index_sigs = HashMap::new();
        for (alias, probe) in &compiled.lazy_join_probes {
            let source = sources.get(alias).expect("lazy join alias must be a known source");
            let sig = source.borrow_mut().create_hash_index(&probe.join_key_expr, "lazyjoin");
            lazy_hash_index_sigs.insert(alias.clone(), sig);
        }

        let output_collection = Rc::new(RefCell::new(Collection::new(|_| {
            panic!("derived collection keys always come from the graph, never derived from the row")
        })));
        output_collection.borrow_mut().start_loading();

        let state = Rc::new(RefCell::new(CoordinatorState {
            compiled,
            sources: sources.clone(),
            output: output_collection,
            sub_ids: HashMap::new(),
            output_buffer,
            lazy_hydrated: HashSet::new(),
            lazy_hash_index_sigs,
            lazy_hydrated_keys: HashMap::new(),
            optimizable,
            in_transaction: false,
            disposed: false,
            began_initial_commit: false,
            marked_ready: false,
        }));

        let is_optimizable = |alias: &str| state.borrow().optimizable.as_ref().map(|o| o.alias == alias).unwrap_or(false);
        let is_lazy = |alias: &str| state.borrow().compiled.lazy_collections.contains(alias);

        for (alias, source) in &sources {
            let pushable = state.borrow().compiled.pushable_where.get(alias).cloned();
            let include_initial_state = !is_optimizable(alias) && !is_lazy(alias);
            let opts = SubscribeOptions { include_initial_state, where_expression: pushable };
            let state_clone = state.clone();
            let alias_clone = alias.clone();
            let sub_id = source
                .borrow_mut()
                .subscribe_changes(opts, move |changes| {
                    state_clone.borrow_mut().enqueue(&alias_clone, changes);
                    state_clone.borrow_mut().maybe_run();
                });
            state.borrow_mut().sub_ids.insert(alias.clone(), sub_id);
        }

        state.borrow_mut().maybe_run();

        Ok(Coordinator { state })
    }

    /// The derived collection this coordinator maintains (§4.10, §6
    /// "derived collections compose").
    pub fn output(&self) -> SharedCollection {
        self.state.borrow().output.clone()
    }

    /// §4.10 ADDED — opens a transaction: subsequent source changes still
    /// enqueue onto graph inputs but no run happens until
    /// [`Coordinator::flush_transaction`] (§5 ordering guarantee, Scenario D).
    pub fn begin_transaction(&self) {
        self.state.borrow_mut().in_transaction = true;
    }

    /// Performs exactly one graph run covering every change enqueued since
    /// `begin_transaction`, then resumes normal per-change running.
    pub fn flush_transaction(&self) {
        let mut state = self.state.borrow_mut();
        state.in_transaction = false;
        drop(state);
        self.state.borrow_mut().maybe_run();
    }

    /// Step 7: drops every source subscription and discards the compiled
    /// graph. Idempotent; further source changes are silently ignored.
    pub fn unsubscribe(&self) {
        let mut state = self.state.borrow_mut();
        if state.disposed {
            return;
        }
        state.disposed = true;
        let sub_ids: Vec<(String, u64)> = state.sub_ids.drain().collect();
        for (alias, id) in sub_ids {
            if let Some(source) = state.sources.get(&alias) {
                source.borrow_mut().unsubscribe(id);
            }
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

