//! `negate` (§4.3) — flips the sign of every multiplicity. Used together
//! with `concat` to express "in one collection but not another".

use std::rc::Rc;

use crate::error::Result;
use crate::graph::{downcast_batch, erase_batch, Graph, StreamId};
use crate::multiset::Multiset;
use crate::operators::Item;

pub fn negate(graph: &mut Graph, input: StreamId) -> StreamId {
    graph.add_operator(
        "negate",
        &[input],
        Box::new(move |pulled| -> Result<Vec<Rc<dyn std::any::Any>>> {
            let mut acc = Multiset::new();
            for batch in &pulled[0] {
                for (item, m) in downcast_batch::<Item>(batch).iter() {
                    acc.push(item.clone(), -*m);
                }
            }
            Ok(vec![erase_batch(acc)])
        }),
    )
}
