//! `consolidate` (§4.3) — delays emission until run quiescence, then emits
//! the consolidated batch. Used to suppress transient cancellations (e.g. a
//! row that is deleted and reinserted with the same value within one run
//! nets to nothing and should not reach downstream consumers at all).
//!
//! Resolves the "Consolidation placement" Open Question (SPEC_FULL §9):
//! batches are already accumulated to end-of-run by `Graph::run`'s
//! topological pass, so this operator's job is purely the sort-and-sum
//! step, mirroring the teacher's `consolidation::consolidate_slice`.

use std::rc::Rc;

use crate::error::Result;
use crate::graph::{downcast_batch, erase_batch, Graph, StreamId};
use crate::multiset::Multiset;
use crate::operators::Item;

pub fn consolidate(graph: &mut Graph, input: StreamId) -> StreamId {
    graph.add_operator(
        "consolidate",
        &[input],
        Box::new(move |pulled| -> Result<Vec<Rc<dyn std::any::Any>>> {
            let mut acc = Multiset::new();
            for batch in &pulled[0] {
                for (item, m) in downcast_batch::<Item>(batch).iter() {
                    acc.push(item.clone(), *m);
                }
            }
            Ok(vec![erase_batch(acc.consolidate())])
        }),
    )
}
