//! §3 Change — the event a source collection emits, and its translation
//! into multiset deltas at a graph input (§4.10 step 3).

use crate::key::Key;
use crate::multiset::{Multiplicity, Multiset};
use crate::value::Value;

/// A single mutation delivered by a source collection to its subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Insert { key: Key, value: Value },
    Update { key: Key, previous_value: Value, value: Value },
    Delete { key: Key, value: Value },
}

impl Change {
    pub fn key(&self) -> &Key {
        match self {
            Change::Insert { key, .. } => key,
            Change::Update { key, .. } => key,
            Change::Delete { key, .. } => key,
        }
    }

    /// Lowers a `Change` into the multiset deltas described by §3:
    /// - `insert(k,v) -> [((k,v), +1)]`
    /// - `delete(k,v) -> [((k,v), -1)]`
    /// - `update(k,prev,v) -> [((k,prev), -1), ((k,v), +1)]`
    pub fn to_deltas(&self) -> Multiset<(Key, Value)> {
        match self {
            Change::Insert { key, value } => {
                Multiset::singleton((key.clone(), value.clone()), Multiplicity::ONE)
            }
            Change::Delete { key, value } => {
                Multiset::singleton((key.clone(), value.clone()), Multiplicity::NEG_ONE)
            }
            Change::Update { key, previous_value, value } => Multiset::from_pairs(vec![
                ((key.clone(), previous_value.clone()), Multiplicity::NEG_ONE),
                ((key.clone(), value.clone()), Multiplicity::ONE),
            ]),
        }
    }
}
