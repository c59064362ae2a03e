//! `filter(p)` (§4.3) — drops elements with `p(v) = false`, multiplicity
//! unchanged otherwise.

use std::rc::Rc;

use crate::error::Result;
use crate::graph::{downcast_batch, erase_batch, Graph, StreamId};
use crate::multiset::Multiset;
use crate::operators::Item;

pub fn filter(graph: &mut Graph, input: StreamId, mut p: impl FnMut(&Item) -> bool + 'static) -> StreamId {
    graph.add_operator(
        "filter",
        &[input],
        Box::new(move |pulled| -> Result<Vec<Rc<dyn std::any::Any>>> {
            let mut acc = Multiset::new();
            for batch in &pulled[0] {
                for (item, m) in downcast_batch::<Item>(batch).iter() {
                    if p(item) {
                        acc.push(item.clone(), *m);
                    }
                }
            }
            Ok(vec![erase_batch(acc)])
        }),
    )
}
