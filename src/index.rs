//! §4.7 Collection index — ordered/hash indexes over a source collection.
//!
//! Two concrete `structure` backings, selected by the query compiler (§4.9)
//! per index use: [`HashIndex`] for equality/`IN` pushable predicates and
//! [`SortedIndex`] for range predicates and the `take(n, after)` operation
//! the topK path (§4.6) needs. Both maintain their structure synchronously
//! on every `add`/`remove`/`update`, before any subscriber callback fires
//! (§5 "Indexes are maintained synchronously by the collection").

use std::collections::{BTreeSet, HashSet};

use fnv::FnvHashMap;

use crate::expr::{Expr, Func};
use crate::key::Key;
use crate::value::Value;

/// Sort direction for a [`SortedIndex`] (§4.6 orderBy `direction`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

/// Null placement for a [`SortedIndex`] (§4.6 orderBy `nulls`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Nulls {
    First,
    Last,
}

/// Derives a stable signature string for an index from its extraction path,
/// its ordering options (if any), and a caller-supplied resolver identity
/// (§4.7 "Indexes support a signature... so lifecycle events... carry a
/// serializable metadata blob"). Not cryptographic — just stable and
/// collision-resistant enough to key `index:added`/`index:removed` events.
pub fn signature(kind: &str, path: &[String], direction: Option<Direction>, resolver: &str) -> String {
    let dir = match direction {
        Some(Direction::Asc) => "asc",
        Some(Direction::Desc) => "desc",
        None => "-",
    };
    format!("{kind}:{}:{dir}:{resolver}", path.join("."))
}

/// Extracts the single-level column path an index is built over from an
/// [`Expr`]. Indexes in this crate are always single-column (§4.9's
/// pushable predicates are themselves restricted to single-level column
/// refs), so a non-ref expression is a caller error.
fn expr_path(extract: &Expr) -> Vec<String> {
    match extract {
        Expr::Ref(path) => path.clone(),
        other => panic!("collection index extract expression must be a column ref, got {other:?}"),
    }
}

/// Equality/`IN`-oriented index: `indexKey -> set of primary keys` (§4.7
/// "structure"). Backed by `fnv` hashing, matching the teacher's
/// `FnvHasher` use for small, frequently-hashed keys.
pub struct HashIndex {
    pub signature: String,
    path: Vec<String>,
    map: FnvHashMap<Value, HashSet<Key>>,
}

impl HashIndex {
    pub fn new(extract: &Expr, resolver: &str) -> Self {
        let path = expr_path(extract);
        HashIndex { signature: signature("hash", &path, None, resolver), path, map: FnvHashMap::default() }
    }

    fn extract(&self, row: &Value) -> Value {
        row.get_path(&self.path)
    }

    pub fn add(&mut self, pk: Key, row: &Value) {
        self.map.entry(self.extract(row)).or_default().insert(pk);
    }

    pub fn remove(&mut self, pk: &Key, row: &Value) {
        let key = self.extract(row);
        if let Some(set) = self.map.get_mut(&key) {
            set.remove(pk);
            if set.is_empty() {
                self.map.remove(&key);
            }
        }
    }

    pub fn update(&mut self, pk: Key, old_row: &Value, new_row: &Value) {
        self.remove(&pk, old_row);
        self.add(pk, new_row);
    }

    pub fn lookup_eq(&self, value: &Value) -> HashSet<Key> {
        self.map.get(value).cloned().unwrap_or_default()
    }

    pub fn lookup_in(&self, values: &[Value]) -> HashSet<Key> {
        let mut out = HashSet::new();
        for v in values {
            out.extend(self.lookup_eq(v));
        }
        out
    }
}

/// One entry in a [`SortedIndex`]'s ordered structure: the extracted sort
/// value paired with the owning primary key (tie-broken by key so the
/// total order is a genuine total order even over duplicate values).
#[derive(Debug, Clone)]
struct SortedEntry {
    value: Value,
    pk: Key,
    direction: Direction,
    nulls: Nulls,
}

impl PartialEq for SortedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value && self.pk == other.pk
    }
}
impl Eq for SortedEntry {}

impl SortedEntry {
    fn rank(&self, other: &Self) -> std::cmp::Ordering {
        use std::cmp::Ordering::*;
        let a_null = self.value.is_null();
        let b_null = other.value.is_null();
        let base = if a_null || b_null {
            if a_null && b_null {
                Equal
            } else {
                let nulls_first = self.nulls == Nulls::First;
                if a_null {
                    if nulls_first { Less } else { Greater }
                } else if nulls_first {
                    Greater
                } else {
                    Less
                }
            }
        } else {
            let natural = self.value.cmp(&other.value);
            match self.direction {
                Direction::Asc => natural,
                Direction::Desc => natural.reverse(),
            }
        };
        base.then_with(|| self.pk.cmp(&other.pk))
    }
}

impl PartialOrd for SortedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.rank(other))
    }
}
impl Ord for SortedEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank(other)
    }
}

/// Range/ordered index: maintains a sorted structure over a single column,
/// supporting comparison-predicate `rangeLookup` and the `take(n, after)`
/// operation the topK path pulls from directly (§4.6, §4.7).
pub struct SortedIndex {
    pub signature: String,
    path: Vec<String>,
    direction: Direction,
    nulls: Nulls,
    entries: BTreeSet<SortedEntry>,
}

impl SortedIndex {
    pub fn new(extract: &Expr, direction: Direction, nulls: Nulls, resolver: &str) -> Self {
        let path = expr_path(extract);
        SortedIndex {
            signature: signature("sorted", &path, Some(direction), resolver),
            path,
            direction,
            nulls,
            entries: BTreeSet::new(),
        }
    }

    fn extract(&self, row: &Value) -> Value {
        row.get_path(&self.path)
    }

    fn entry(&self, pk: Key, row: &Value) -> SortedEntry {
        SortedEntry { value: self.extract(row), pk, direction: self.direction, nulls: self.nulls }
    }

    pub fn add(&mut self, pk: Key, row: &Value) {
        self.entries.insert(self.entry(pk, row));
    }

    pub fn remove(&mut self, pk: Key, row: &Value) {
        self.entries.remove(&self.entry(pk, row));
    }

    pub fn update(&mut self, pk: Key, old_row: &Value, new_row: &Value) {
        self.remove(pk.clone(), old_row);
        self.add(pk, new_row);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `take(n, afterIndexKey?)` (§4.7): the next `n` primary keys strictly
    /// after `after` in this index's order, or from the start if `after`
    /// is absent.
    pub fn take(&self, n: usize, after: Option<&Key>) -> Vec<Key> {
        let mut found = after.is_none();
        self.entries
            .iter()
            .filter(|e| {
                if found {
                    return true;
                }
                if Some(&e.pk) == after {
                    found = true;
                }
                false
            })
            .take(n)
            .map(|e| e.pk.clone())
            .collect()
    }

    /// Returns up to `n` primary keys ranked `[offset, offset+n)` — the
    /// topK window read path (§4.6 "pulls only as many rows as the
    /// downstream needs").
    pub fn window(&self, offset: usize, n: usize) -> Vec<Key> {
        self.entries.iter().skip(offset).take(n).map(|e| e.pk.clone()).collect()
    }

    /// `rangeLookup` (§4.7) for the comparison operators a sorted index
    /// can evaluate: `gt`/`gte`/`lt`/`lte`. Equality/`in` are better served
    /// by a [`HashIndex`] but are supported here too for completeness.
    pub fn range_lookup(&self, func: Func, bound: &Value) -> Vec<Key> {
        use std::cmp::Ordering::*;
        self.entries
            .iter()
            .filter(|e| {
                if e.value.is_null() {
                    return false;
                }
                let cmp = e.value.cmp(bound);
                match func {
                    Func::Gt => cmp == Greater,
                    Func::Gte => cmp == Greater || cmp == Equal,
                    Func::Lt => cmp == Less,
                    Func::Lte => cmp == Less || cmp == Equal,
                    Func::Eq => cmp == Equal,
                    _ => false,
                }
            })
            .map(|e| e.pk.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(v: i64) -> Value {
        Value(json!({ "n": v }))
    }

    #[test]
    fn hash_index_groups_by_equal_value() {
        let mut idx = HashIndex::new(&Expr::ref_path(["n"]), "r1");
        idx.add(Key::from(1i64), &row(5));
        idx.add(Key::from(2i64), &row(5));
        idx.add(Key::from(3i64), &row(6));
        assert_eq!(idx.lookup_eq(&Value::from(5i64)).len(), 2);
        assert_eq!(idx.lookup_eq(&Value::from(6i64)).len(), 1);
        idx.remove(&Key::from(1i64), &row(5));
        assert_eq!(idx.lookup_eq(&Value::from(5i64)).len(), 1);
    }

    #[test]
    fn sorted_index_take_resumes_after_cursor() {
        let mut idx = SortedIndex::new(&Expr::ref_path(["n"]), Direction::Asc, Nulls::Last, "r1");
        for i in 0..5 {
            idx.add(Key::from(i), &row(i));
        }
        let first = idx.take(2, None);
        assert_eq!(first, vec![Key::from(0i64), Key::from(1i64)]);
        let next = idx.take(2, first.last());
        assert_eq!(next, vec![Key::from(2i64), Key::from(3i64)]);
    }

    #[test]
    fn sorted_index_descending_reverses_order() {
        let mut idx = SortedIndex::new(&Expr::ref_path(["n"]), Direction::Desc, Nulls::Last, "r1");
        for i in 0..3 {
            idx.add(Key::from(i), &row(i));
        }
        assert_eq!(idx.take(3, None), vec![Key::from(2i64), Key::from(1i64), Key::from(0i64)]);
    }

    #[test]
    fn nulls_first_orders_null_values_before_others() {
        let mut idx = SortedIndex::new(&Expr::ref_path(["n"]), Direction::Asc, Nulls::First, "r1");
        idx.add(Key::from(1i64), &Value(json!({})));
        idx.add(Key::from(2i64), &row(1));
        assert_eq!(idx.take(2, None), vec![Key::from(1i64), Key::from(2i64)]);
    }

    #[test]
    fn range_lookup_gte_filters_correctly() {
        let mut idx = SortedIndex::new(&Expr::ref_path(["n"]), Direction::Asc, Nulls::Last, "r1");
        for i in 0..5 {
            idx.add(Key::from(i), &row(i));
        }
        let mut got = idx.range_lookup(Func::Gte, &Value::from(3i64));
        got.sort();
        assert_eq!(got, vec![Key::from(3i64), Key::from(4i64)]);
    }
}
