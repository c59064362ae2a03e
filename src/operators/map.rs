//! `map(f)` (§4.3) — stateless per-element transform, `f : (k,v) -> (k',v')`.

use std::rc::Rc;

use crate::error::Result;
use crate::graph::{downcast_batch, erase_batch, Graph, StreamId};
use crate::multiset::Multiset;
use crate::operators::Item;

/// Attaches a `map` operator to `input`, applying `f` to every element of
/// every batch. Multiplicities pass through unchanged (§4.3).
pub fn map(graph: &mut Graph, input: StreamId, mut f: impl FnMut(Item) -> Item + 'static) -> StreamId {
    graph.add_operator(
        "map",
        &[input],
        Box::new(move |pulled| -> Result<Vec<Rc<dyn std::any::Any>>> {
            let mut acc = Multiset::new();
            for batch in &pulled[0] {
                for (item, m) in downcast_batch::<Item>(batch).iter() {
                    acc.push(f(item.clone()), *m);
                }
            }
            Ok(vec![erase_batch(acc)])
        }),
    )
}
