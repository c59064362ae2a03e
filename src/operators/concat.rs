//! `concat` (§4.3) — merges two streams of the same element type at the
//! multiset level (plain union of the underlying pairs).

use std::rc::Rc;

use crate::error::Result;
use crate::graph::{downcast_batch, erase_batch, Graph, StreamId};
use crate::multiset::Multiset;
use crate::operators::Item;

pub fn concat(graph: &mut Graph, a: StreamId, b: StreamId) -> StreamId {
    graph.add_operator(
        "concat",
        &[a, b],
        Box::new(move |pulled| -> Result<Vec<Rc<dyn std::any::Any>>> {
            let mut acc = Multiset::new();
            for side in pulled {
                for batch in side {
                    for (item, m) in downcast_batch::<Item>(batch).iter() {
                        acc.push(item.clone(), *m);
                    }
                }
            }
            Ok(vec![erase_batch(acc)])
        }),
    )
}
