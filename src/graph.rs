//! §4.2 Graph, Stream, Operator runtime.
//!
//! A [`Graph`] is a bipartite topology of streams and operators carrying
//! type-erased [`Multiset`] batches. Construction only ever references
//! already-created [`StreamId`]s, so the build-time topology is a DAG by
//! construction; [`Graph::finalize`] still computes an explicit topological
//! order and rejects cycles (§9 redesign note "Cyclic graphs during
//! compilation... Detect cycles at `finalize` and reject"), matching the
//! spec's lifecycle contract rather than relying on the builder alone.
//!
//! This is deliberately not a generalization of timely's multi-worker,
//! progress-tracking dataflow: the spec's graph is single-threaded,
//! run-to-completion, and acyclic (§4.2, §5), so there is no frontier or
//! capability machinery to carry over — only the unary/binary operator
//! shape and the sort-and-consolidate discipline the teacher uses
//! everywhere survive the port.

use std::any::Any;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::error::{IvmError, Result};
use crate::multiset::Multiset;

/// Opaque handle to a stream (edge) in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub(crate) usize);

struct StreamSlot {
    /// Batches appended since the last `run()` quiesced. Stored as `Rc<dyn
    /// Any>` rather than `Box` so multiple downstream operators (fan-out)
    /// can each hold a cheap clone of the pointer without requiring `T:
    /// Clone`.
    batches: RefCell<Vec<Rc<dyn Any>>>,
    /// Operator index that produces into this stream, or `None` for a root
    /// (input) stream fed directly by an [`InputHandle`].
    producer: Option<usize>,
}

type OperatorBody = Box<dyn FnMut(&[Vec<Rc<dyn Any>>]) -> Result<Vec<Rc<dyn Any>>>>;

struct OperatorEntry {
    name: String,
    inputs: Vec<StreamId>,
    output: Option<StreamId>,
    cursors: RefCell<Vec<usize>>,
    body: RefCell<OperatorBody>,
}

/// The multiset dataflow graph (§4.2).
///
/// Holds every stream and operator created by a query's compiled pipeline.
/// `!Sync`/`!Send` by construction (via `Rc`/`RefCell`) per §5's concurrency
/// model: graphs are owned by exactly one coordinator on one thread and are
/// never shared across coordinators.
pub struct Graph {
    streams: Vec<StreamSlot>,
    operators: Vec<OperatorEntry>,
    order: Vec<usize>,
    finalized: bool,
    poisoned: bool,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    pub fn new() -> Self {
        Graph {
            streams: Vec::new(),
            operators: Vec::new(),
            order: Vec::new(),
            finalized: false,
            poisoned: false,
        }
    }

    /// Creates a new root stream and returns a typed handle to push data
    /// into it (§4.2 `newInput<T>()`).
    pub fn add_input<T: 'static>(&mut self) -> InputHandle<T> {
        let id = StreamId(self.streams.len());
        self.streams.push(StreamSlot { batches: RefCell::new(Vec::new()), producer: None });
        InputHandle { id, _marker: std::marker::PhantomData }
    }

    /// Registers an operator with the given input streams and a body
    /// closure; returns the `StreamId` of its freshly created output
    /// stream. This is the crate-internal primitive every operator in
    /// `operators/` builds on (mirrors the teacher's `unary`/`binary`
    /// operator-construction style, minus capability/frontier plumbing).
    pub(crate) fn add_operator(
        &mut self,
        name: impl Into<String>,
        inputs: &[StreamId],
        body: OperatorBody,
    ) -> StreamId {
        let op_idx = self.operators.len();
        let output = StreamId(self.streams.len());
        self.streams.push(StreamSlot { batches: RefCell::new(Vec::new()), producer: Some(op_idx) });
        self.operators.push(OperatorEntry {
            name: name.into(),
            inputs: inputs.to_vec(),
            output: Some(output),
            cursors: RefCell::new(vec![0; inputs.len()]),
            body: RefCell::new(body),
        });
        self.finalized = false;
        output
    }

    /// Registers a terminal sink: an operator with no output stream (§4.3
    /// `output(fn)`). The body's return value is discarded.
    pub(crate) fn add_sink(&mut self, name: impl Into<String>, inputs: &[StreamId], body: OperatorBody) {
        let op_idx = self.operators.len();
        self.operators.push(OperatorEntry {
            name: name.into(),
            inputs: inputs.to_vec(),
            output: None,
            cursors: RefCell::new(vec![0; inputs.len()]),
            body: RefCell::new(body),
        });
        let _ = op_idx;
        self.finalized = false;
    }

    /// Pushes a batch directly onto a root stream. Used by `InputHandle`.
    pub(crate) fn push_root<T: 'static>(&self, id: StreamId, batch: Multiset<T>) {
        self.streams[id.0].batches.borrow_mut().push(Rc::new(batch));
    }

    /// Computes a topological order over operators and rejects cycles
    /// (§4.2 "finalize — topological order is computed; cyclic topology is
    /// rejected"). Construction can only reference existing streams, so a
    /// cycle can only arise from a malformed hand-built graph; we still
    /// validate explicitly rather than trust that invariant.
    pub fn finalize(&mut self) -> Result<()> {
        let n = self.operators.len();
        let mut indegree = vec![0usize; n];
        let mut consumers: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (idx, op) in self.operators.iter().enumerate() {
            for input in &op.inputs {
                if let Some(producer) = self.streams[input.0].producer {
                    consumers[producer].push(idx);
                    indegree[idx] += 1;
                }
            }
        }
        let mut queue: VecDeque<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(idx) = queue.pop_front() {
            order.push(idx);
            for &next in &consumers[idx] {
                indegree[next] -= 1;
                if indegree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }
        if order.len() != n {
            return Err(IvmError::CyclicGraph);
        }
        self.order = order;
        self.finalized = true;
        Ok(())
    }

    /// Drains all root streams and drives a single fixed-point pass (§4.2
    /// `run`). Because the topology is a DAG processed in topological
    /// order, one pass over the operators already reaches quiescence: by
    /// the time an operator runs, every stream it reads has received all
    /// the data its producers will emit this run.
    pub fn run(&mut self) -> Result<()> {
        if self.poisoned {
            return Err(IvmError::OperatorInvariant("graph is poisoned by a prior failed run".into()));
        }
        if !self.finalized {
            self.finalize()?;
        }
        let order = self.order.clone();
        for op_idx in order {
            let pulled = {
                let op = &self.operators[op_idx];
                let mut cursors = op.cursors.borrow_mut();
                let mut pulled = Vec::with_capacity(op.inputs.len());
                for (i, stream_id) in op.inputs.iter().enumerate() {
                    let slot = &self.streams[stream_id.0];
                    let batches = slot.batches.borrow();
                    let fresh = batches[cursors[i]..].to_vec();
                    cursors[i] = batches.len();
                    pulled.push(fresh);
                }
                pulled
            };
            let span = tracing::debug_span!("operator_invocation", name = %self.operators[op_idx].name, op_idx);
            let _enter = span.enter();
            let in_count: usize = pulled.iter().map(|v| v.len()).sum();
            let result = {
                let op = &self.operators[op_idx];
                let mut body = op.body.borrow_mut();
                (body)(&pulled)
            };
            match result {
                Ok(produced) => {
                    tracing::trace!(in_count, out_count = produced.len(), "operator ran");
                    if let Some(output) = self.operators[op_idx].output {
                        self.streams[output.0].batches.borrow_mut().extend(produced);
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "operator failed, poisoning graph");
                    self.poisoned = true;
                    return Err(err);
                }
            }
        }
        for slot in &self.streams {
            slot.batches.borrow_mut().clear();
        }
        for op in &self.operators {
            for cursor in op.cursors.borrow_mut().iter_mut() {
                *cursor = 0;
            }
        }
        Ok(())
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }
}

/// Typed handle returned by [`Graph::add_input`]; the only way to push data
/// into a root stream (§4.2 `sendData`).
pub struct InputHandle<T> {
    id: StreamId,
    _marker: std::marker::PhantomData<T>,
}

impl<T> InputHandle<T> {
    pub fn stream_id(&self) -> StreamId {
        self.id
    }
}

impl<T: 'static> InputHandle<T> {
    /// Enqueues a multiset batch on this root stream. Per §3 invariant 3,
    /// callers must enqueue exactly once per source `Change`.
    pub fn send_data(&self, graph: &Graph, batch: Multiset<T>) {
        if batch.is_empty() {
            return;
        }
        graph.push_root(self.id, batch);
    }
}

/// Downcasts a pulled batch to its concrete element type. Every operator
/// implementation in `operators/` calls this on each entry of the slices
/// `Graph::run` hands it; a mismatch is a programming error in the operator
/// wiring (the compiler is the only thing that connects streams), so it
/// panics rather than returning a recoverable error.
pub(crate) fn downcast_batch<T: 'static>(batch: &Rc<dyn Any>) -> &Multiset<T> {
    batch.downcast_ref::<Multiset<T>>().expect("stream element type mismatch: operator graph miswired")
}

pub(crate) fn erase_batch<T: 'static>(batch: Multiset<T>) -> Rc<dyn Any> {
    Rc::new(batch)
}
