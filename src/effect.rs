//! §4.11 Effect driver — shares the coordinator's compilation and
//! subscription machinery (§4.10) but diverts the terminal stream into a
//! *delta event* emitter instead of a derived [`Collection`].
//!
//! An [`Effect`] is built directly on top of a [`Coordinator`]: the
//! coordinator already classifies each run's terminal batch into
//! insert/update/delete and applies it to its output collection in one
//! `apply_batch` call per run (§4.10 step 5) — which is exactly "one batch
//! per graph run" (§5 ordering guarantee). The effect driver subscribes to
//! that output collection and relabels the same three cases as
//! `enter`/`update`/`exit` (§4.11), rather than re-deriving batch-per-run
//! semantics from scratch.

use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::change::Change;
use crate::collection::SubscribeOptions;
use crate::coordinator::{Coordinator, SharedCollection};
use crate::error::IvmError;
use crate::key::Key;
use crate::query::Query;
use crate::value::Value;

/// One of the event kinds §4.11 names, used both to tag an emitted
/// [`EffectEvent`] and to filter which kinds a config subscribes to
/// (`on ∈ {enter, update, exit, delta} | subset[]`). `Delta` is not a kind
/// an event ever carries — it is shorthand in [`EffectConfig::on`] for
/// "all three".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EffectKind {
    Enter,
    Update,
    Exit,
    /// Config-only: expands to `{Enter, Update, Exit}` when building the
    /// subscribed-kinds set.
    Delta,
}

/// A single delta event delivered to a handler (§4.11).
#[derive(Debug, Clone, PartialEq)]
pub enum EffectEvent {
    /// First time this key appears in the query's results.
    Enter { key: Key, value: Value },
    /// The key persisted across this run and its value changed.
    Update { key: Key, value: Value, previous_value: Value },
    /// The key left the results.
    Exit { key: Key, value: Value },
}

impl EffectEvent {
    pub fn kind(&self) -> EffectKind {
        match self {
            EffectEvent::Enter { .. } => EffectKind::Enter,
            EffectEvent::Update { .. } => EffectKind::Update,
            EffectEvent::Exit { .. } => EffectKind::Exit,
        }
    }

    pub fn key(&self) -> &Key {
        match self {
            EffectEvent::Enter { key, .. } => key,
            EffectEvent::Update { key, .. } => key,
            EffectEvent::Exit { key, .. } => key,
        }
    }

    fn from_change(change: &Change) -> EffectEvent {
        match change {
            Change::Insert { key, value } => EffectEvent::Enter { key: key.clone(), value: value.clone() },
            Change::Update { key, previous_value, value } => {
                EffectEvent::Update { key: key.clone(), value: value.clone(), previous_value: previous_value.clone() }
            }
            Change::Delete { key, value } => EffectEvent::Exit { key: key.clone(), value: value.clone() },
        }
    }
}

/// Configuration for [`Effect::new`] (§4.11 "Config").
pub struct EffectConfig {
    /// Which event kinds this effect wants delivered. Empty means "all
    /// three" (the `delta` shorthand), matching the spec's `on ∈ {enter,
    /// update, exit, delta} | subset[]` — a caller that cares about every
    /// kind need not spell out `Delta` explicitly.
    pub on: Vec<EffectKind>,
    /// If true, the initial snapshot of matching rows (present at
    /// subscription time) does not fire `enter` events.
    pub skip_initial: bool,
    /// Invoked once per event, in the order the terminal batch produced
    /// them. A handler failure is routed to `on_error`, never to the graph.
    pub handler: Option<Box<dyn FnMut(&EffectEvent) -> std::result::Result<(), String>>>,
    /// Invoked once per graph run (§8 property 7 / Scenario D) with every
    /// event that run produced, in order.
    pub batch_handler: Option<Box<dyn FnMut(&[EffectEvent])>>,
    /// Receives handler errors. If absent, errors are logged via `tracing`
    /// and otherwise swallowed (§4.11 "if none configured, log").
    pub on_error: Option<Box<dyn FnMut(&str, &EffectEvent)>>,
}

impl Default for EffectConfig {
    fn default() -> Self {
        EffectConfig { on: Vec::new(), skip_initial: false, handler: None, batch_handler: None, on_error: None }
    }
}

fn wants(on: &[EffectKind], kind: EffectKind) -> bool {
    on.is_empty() || on.contains(&EffectKind::Delta) || on.contains(&kind)
}

struct EffectState {
    config: EffectConfig,
    cancelled: Arc<AtomicBool>,
}

/// A live effect subscription (§4.11). Shares a [`Coordinator`]'s compiled
/// graph and source subscriptions; its own subscription is to the
/// coordinator's derived collection, diverting `insert`/`update`/`delete`
/// changes into `enter`/`update`/`exit` events.
pub struct Effect {
    coordinator: Coordinator,
    output_sub_id: u64,
    state: Rc<RefCell<EffectState>>,
    cancelled: Arc<AtomicBool>,
    disposed: bool,
}

impl Effect {
    /// Compiles `query`, subscribes it to `sources` exactly as
    /// [`Coordinator::new`] would, and diverts the resulting derived
    /// collection's changes into effect events per `config`.
    pub fn new(
        query: &Query,
        sources: HashMap<String, SharedCollection>,
        config: EffectConfig,
    ) -> std::result::Result<Effect, IvmError> {
        let coordinator = Coordinator::new(query, sources)?;
        let output = coordinator.output();

        let cancelled = Arc::new(AtomicBool::new(false));
        let state = Rc::new(RefCell::new(EffectState { config, cancelled: cancelled.clone() }));

        // The coordinator has already run synchronously up to this point
        // (§4.10 step 4), so any initial matches are already applied to
        // `output`. Surface them now, honoring `skip_initial`, before
        // subscribing for the future changes a later run would produce.
        {
            let mut state_ref = state.borrow_mut();
            if !state_ref.config.skip_initial {
                let initial = output.borrow().current_state_as_changes(&Default::default());
                deliver(&mut state_ref, &initial.iter().map(EffectEvent::from_change).collect::<Vec<_>>());
            }
        }

        let state_for_sub = state.clone();
        let output_sub_id = output.borrow_mut().subscribe_changes(
            SubscribeOptions { include_initial_state: false, where_expression: None },
            move |changes| {
                if state_for_sub.borrow().cancelled.load(AtomicOrdering::SeqCst) {
                    return;
                }
                let events: Vec<EffectEvent> = changes.iter().map(EffectEvent::from_change).collect();
                deliver(&mut state_for_sub.borrow_mut(), &events);
            },
        );

        Ok(Effect { coordinator, output_sub_id, state, cancelled, disposed: false })
    }

    pub fn disposed(&self) -> bool {
        self.disposed
    }

    /// Begin/flush-transaction passthrough, so callers driving multiple
    /// source mutations inside one transaction get exactly one batch of
    /// effect events too (§5, Scenario D).
    pub fn begin_transaction(&self) {
        self.coordinator.begin_transaction();
    }

    pub fn flush_transaction(&self) {
        self.coordinator.flush_transaction();
    }

    /// Raises the effect's abort signal and unsubscribes from the derived
    /// collection (§4.11 "dispose()... is idempotent"). Because this
    /// crate's handlers are synchronous (§5 "Operators themselves never
    /// suspend"), there is nothing in-flight to await by the time this
    /// returns; the returned future resolves immediately. Subsequent
    /// events — including ones already enqueued before dispose was called
    /// — are not delivered, per §5's cancellation semantics.
    pub fn dispose(&mut self) -> DisposeFuture {
        if !self.disposed {
            self.disposed = true;
            self.cancelled.store(true, AtomicOrdering::SeqCst);
            self.coordinator.output().borrow_mut().unsubscribe(self.output_sub_id);
            self.coordinator.unsubscribe();
        }
        DisposeFuture { done: true }
    }
}

impl Drop for Effect {
    fn drop(&mut self) {
        if !self.disposed {
            let _ = self.dispose();
        }
    }
}

fn deliver(state: &mut EffectState, events: &[EffectEvent]) {
    if state.cancelled.load(AtomicOrdering::SeqCst) || events.is_empty() {
        return;
    }
    let wanted: Vec<EffectEvent> = events.iter().filter(|e| wants(&state.config.on, e.kind())).cloned().collect();
    if wanted.is_empty() {
        return;
    }
    if let Some(handler) = state.config.handler.as_mut() {
        for event in &wanted {
            if let Err(err) = handler(event) {
                match state.config.on_error.as_mut() {
                    Some(on_error) => on_error(&err, event),
                    None => tracing::error!(error = %err, ?event, "effect handler error"),
                }
            }
        }
    }
    if let Some(batch_handler) = state.config.batch_handler.as_mut() {
        batch_handler(&wanted);
    }
}

/// §4.11 ADDED — a minimal hand-rolled future for `dispose()`'s return
/// value (§9 redesign note "Async coordinator operations... a cooperative
/// task model suffices"). Since every handler in this crate is synchronous,
/// dispose has nothing left to await by construction and this future is
/// always immediately ready; a host embedding this crate alongside
/// genuinely asynchronous handlers can still `.await` it uniformly.
pub struct DisposeFuture {
    done: bool,
}

impl Future for DisposeFuture {
    type Output = ();
    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        if self.done {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

