//! `distinct` (§4.9 query clause) — collapses value-level duplicate rows.
//!
//! Not one of §4.2–§4.6's named operators, but the query compiler's clause
//! list (§4.9 "IR... optional... distinct") still needs a dataflow stage for
//! it. Modeled the same way `join` tracks per-joinKey presence (§4.4): a
//! row's canonical JSON becomes the dedup key, and a presence counter per
//! key emits a paired transition only when the count crosses `0`, never on
//! a duplicate arriving or leaving while at least one copy remains.

use std::collections::HashMap;
use std::rc::Rc;

use crate::error::{IvmError, Result};
use crate::graph::{downcast_batch, erase_batch, Graph, StreamId};
use crate::key::Key;
use crate::multiset::{Multiplicity, Multiset};
use crate::operators::Item;
use crate::value::Value;

struct Entry {
    value: Value,
    count: i64,
}

pub fn distinct(graph: &mut Graph, input: StreamId) -> StreamId {
    let mut rows: HashMap<String, Entry> = HashMap::new();

    graph.add_operator(
        "distinct",
        &[input],
        Box::new(move |pulled| -> Result<Vec<Rc<dyn std::any::Any>>> {
            let mut out = Multiset::new();
            for batch in &pulled[0] {
                for ((_key, value), m) in downcast_batch::<Item>(batch).iter() {
                    let rk = serde_json::to_string(&value.0).unwrap_or_default();
                    let entry = rows.entry(rk.clone()).or_insert_with(|| Entry { value: value.clone(), count: 0 });
                    let was_present = entry.count > 0;
                    entry.value = value.clone();
                    entry.count += m.0;
                    if entry.count < 0 {
                        return Err(IvmError::OperatorInvariant(format!(
                            "distinct observed negative occurrence count for row `{rk}`"
                        )));
                    }
                    let is_present = entry.count > 0;
                    if !was_present && is_present {
                        out.push((Key::Str(rk.clone()), entry.value.clone()), Multiplicity::ONE);
                    } else if was_present && !is_present {
                        out.push((Key::Str(rk.clone()), entry.value.clone()), Multiplicity::NEG_ONE);
                    }
                    if entry.count == 0 {
                        rows.remove(&rk);
                    }
                }
            }
            Ok(vec![erase_batch(out)])
        }),
    )
}
