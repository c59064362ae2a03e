//! `output(fn)` (§4.3) — terminal sink; invokes `fn(batch)` with each
//! produced multiset batch.

use crate::error::Result;
use crate::graph::{downcast_batch, Graph, StreamId};
use crate::multiset::Multiset;
use crate::operators::Item;

/// Attaches a terminal sink to `input`. `f` is called once per batch
/// pulled from `input` during a `run()`, i.e. at most once per run (batches
/// from the same run are concatenated before the sink sees them, so
/// downstream consumers always observe one coherent batch per run).
pub fn output(graph: &mut Graph, input: StreamId, mut f: impl FnMut(&Multiset<Item>) + 'static) {
    graph.add_sink(
        "output",
        &[input],
        Box::new(move |pulled| -> Result<Vec<std::rc::Rc<dyn std::any::Any>>> {
            let mut acc = Multiset::new();
            for batch in &pulled[0] {
                for (item, m) in downcast_batch::<Item>(batch).iter() {
                    acc.push(item.clone(), *m);
                }
            }
            if !acc.is_empty() {
                f(&acc);
            }
            Ok(vec![])
        }),
    );
}
