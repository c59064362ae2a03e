//! §4.4 Join — incremental inner/left/right/full outer join with index
//! maintenance.
//!
//! Each side keeps a `joinKey -> (sourceKey -> (value, multiplicity))`
//! index (§4.4 "Internal state per side"). Deltas are applied side by side
//! within one run in a fixed order — left then right — and crucially the
//! *left* index is updated before the *right* side is probed. That
//! ordering is what makes a single run correctly account for a delta that
//! lands on both sides at once (the classic bilinear-join trick): the right
//! delta probes left state that already includes this run's left deltas,
//! so a left insert and a right insert for the same join key in the same
//! run still produce their cross product instead of being missed.
//!
//! Outer-join null-padding is tracked per *row*, not per join-key bucket:
//! each row's own matched/unmatched transition is decided from whether the
//! opposite side had a match at the moment that row's delta was processed,
//! independent of every other row sharing the join key. A bucket-level
//! 0<->1 presence flip (detected via `apply_delta`'s return value) only
//! drives retraction/synthesis of null rows for *other, already-indexed*
//! rows on the probing side — it never substitutes for a row's own check.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::error::Result;
use crate::graph::{downcast_batch, erase_batch, Graph, StreamId};
use crate::key::Key;
use crate::multiset::{Multiplicity, Multiset};
use crate::operators::Item;
use crate::value::Value;

/// Which rows a join operator must synthesize when one side has no match
/// (§4.4 "For outer joins... synthetic null-filled rows").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
    Right,
    Full,
}

/// Callback the coordinator installs to hydrate a lazy side of a join
/// on-demand (§4.4 "Lazy-load collaboration", §4.10 step 2 `loadKeys`).
/// Invoked with the *join-key values* a batch needs resolved on the other
/// side — not source primary keys, since a lazy side's own index is keyed
/// by the join expression, not by its rows' primary keys.
pub type LazyLoadCallback = Rc<RefCell<dyn FnMut(&[Value])>>;

/// A side's index: join key -> (source key -> (value, running multiplicity)).
type SideIndex = HashMap<Value, HashMap<Key, (Value, i64)>>;

/// Configuration for a `join` operator instance.
pub struct JoinConfig {
    pub kind: JoinKind,
    pub left_join_key: Box<dyn Fn(&Value) -> Value>,
    pub right_join_key: Box<dyn Fn(&Value) -> Value>,
    /// Merges a matched (or null-padded, for outer joins) pair of row
    /// values into the joined output value.
    pub combine: Box<dyn Fn(Option<&Value>, Option<&Value>) -> Value>,
    /// Set when the right side is a lazy collection (§4.10): invoked with
    /// the join-key values a left-side batch could not find a match for,
    /// so the coordinator can resolve and hydrate exactly those rows.
    pub on_right_needed: Option<LazyLoadCallback>,
    /// Set when the left side is a lazy collection; symmetric to the above.
    pub on_left_needed: Option<LazyLoadCallback>,
}

/// Applies one delta to a side's index (§4.4 step 1: "inserting with +1,
/// decrementing with -1, removing zeros"). Returns `(was_empty, is_empty_now)`
/// for the affected join key's *bucket*, so the caller can detect a 0<->1
/// presence transition for the join key as a whole — used only to decide
/// whether rows *already present on the opposite side* need their
/// null-padded output retracted or (re)synthesized. A single row's own
/// matched/unmatched transition is decided independently, from whether the
/// opposite side's bucket was non-empty at the time that row's own delta
/// was processed (see `join`'s per-row `matches.is_empty()` checks) — never
/// from this bucket-level transition, which only tells you the bucket's
/// occupancy changed, not which individual row(s) on the probing side are
/// affected.
fn apply_delta(index: &mut SideIndex, join_key: Value, source_key: Key, value: Value, m: i64) -> (bool, bool) {
    let bucket = index.entry(join_key.clone()).or_default();
    let was_empty = bucket.is_empty();
    let mult = {
        let entry = bucket.entry(source_key.clone()).or_insert((value.clone(), 0));
        entry.0 = value;
        entry.1 += m;
        entry.1
    };
    if mult == 0 {
        bucket.remove(&source_key);
    }
    let is_empty_now = bucket.is_empty();
    if is_empty_now {
        index.remove(&join_key);
    }
    (was_empty, is_empty_now)
}

fn probe(index: &SideIndex, join_key: &Value) -> Vec<(Key, Value, i64)> {
    match index.get(join_key) {
        Some(bucket) => bucket.iter().map(|(k, (v, m))| (k.clone(), v.clone(), *m)).collect(),
        None => Vec::new(),
    }
}

/// Attaches a join operator to `left` and `right`, returning the output
/// stream of `(compositeKey, combinedValue)` items.
pub fn join(graph: &mut Graph, left: StreamId, right: StreamId, config: JoinConfig) -> StreamId {
    let mut left_index: SideIndex = HashMap::new();
    let mut right_index: SideIndex = HashMap::new();
    let JoinConfig { kind, left_join_key, right_join_key, combine, on_right_needed, on_left_needed } = config;

    graph.add_operator(
        "join",
        &[left, right],
        Box::new(move |pulled| -> Result<Vec<Rc<dyn std::any::Any>>> {
            let mut out = Multiset::new();

            // --- left deltas: update left index, probe right (pre-update) ---
            let mut needed_right_keys = Vec::new();
            for batch in &pulled[0] {
                for ((src_key, value), m) in downcast_batch::<Item>(batch).iter() {
                    let jk = left_join_key(value);
                    let matches = probe(&right_index, &jk);
                    if matches.is_empty() && on_right_needed.is_some() {
                        needed_right_keys.push(jk.clone());
                    }
                    for (r_key, r_val, r_mult) in &matches {
                        let combined = combine(Some(value), Some(r_val));
                        out.push(
                            (Key::composite(src_key.clone(), r_key.clone()), combined),
                            Multiplicity(m.0 * r_mult),
                        );
                    }
                    // This row's own matched/unmatched transition (§4.4 step
                    // 4), decided from *this row's* join key alone — never
                    // from the bucket-level transition below, so a second
                    // left row sharing an already-unmatched join key still
                    // gets its own null-padded row.
                    if matches!(kind, JoinKind::Left | JoinKind::Full) && matches.is_empty() {
                        let combined = combine(Some(value), None);
                        out.push((Key::composite(src_key.clone(), Key::Str("__null__".into())), combined), *m);
                    }
                    let (was_empty, is_empty_now) = apply_delta(&mut left_index, jk.clone(), src_key.clone(), value.clone(), m.0);
                    // The left bucket at `jk` just flipped presence: every
                    // right row already indexed at this join key needs its
                    // null-padded row retracted (first left match just
                    // appeared) or (re)synthesized (last left match just
                    // disappeared) — this is independent of, and in addition
                    // to, each individual right row's own transition handled
                    // in the loop below.
                    if matches!(kind, JoinKind::Right | JoinKind::Full) {
                        if was_empty && !is_empty_now {
                            for (r_key, r_val, r_mult) in probe(&right_index, &jk) {
                                let combined = combine(None, Some(&r_val));
                                out.push((Key::composite(Key::Str("__null__".into()), r_key), combined), Multiplicity(-r_mult));
                            }
                        } else if !was_empty && is_empty_now {
                            for (r_key, r_val, r_mult) in probe(&right_index, &jk) {
                                let combined = combine(None, Some(&r_val));
                                out.push((Key::composite(Key::Str("__null__".into()), r_key), combined), Multiplicity(r_mult));
                            }
                        }
                    }
                }
            }
            if let (Some(cb), false) = (&on_right_needed, needed_right_keys.is_empty()) {
                (cb.borrow_mut())(&needed_right_keys);
            }

            // --- right deltas: update right index, probe left (post-update) ---
            let mut needed_left_keys = Vec::new();
            for batch in &pulled[1] {
                for ((src_key, value), m) in downcast_batch::<Item>(batch).iter() {
                    let jk = right_join_key(value);
                    let matches = probe(&left_index, &jk);
                    if matches.is_empty() && on_left_needed.is_some() {
                        needed_left_keys.push(jk.clone());
                    }
                    for (l_key, l_val, l_mult) in &matches {
                        let combined = combine(Some(l_val), Some(value));
                        out.push(
                            (Key::composite(l_key.clone(), src_key.clone()), combined),
                            Multiplicity(m.0 * l_mult),
                        );
                    }
                    // Symmetric to the left loop above: this row's own
                    // matched/unmatched transition, decided from this row's
                    // join key alone.
                    if matches!(kind, JoinKind::Right | JoinKind::Full) && matches.is_empty() {
                        let combined = combine(None, Some(value));
                        out.push((Key::composite(Key::Str("__null__".into()), src_key.clone()), combined), *m);
                    }
                    let (was_empty, is_empty_now) = apply_delta(&mut right_index, jk.clone(), src_key.clone(), value.clone(), m.0);
                    // Symmetric bucket-transition handling for every left row
                    // already indexed at this join key.
                    if matches!(kind, JoinKind::Left | JoinKind::Full) {
                        if was_empty && !is_empty_now {
                            for (l_key, l_val, l_mult) in probe(&left_index, &jk) {
                                let combined = combine(Some(&l_val), None);
                                out.push((Key::composite(l_key, Key::Str("__null__".into())), combined), Multiplicity(-l_mult));
                            }
                        } else if !was_empty && is_empty_now {
                            for (l_key, l_val, l_mult) in probe(&left_index, &jk) {
                                let combined = combine(Some(&l_val), None);
                                out.push((Key::composite(l_key, Key::Str("__null__".into())), combined), Multiplicity(l_mult));
                            }
                        }
                    }
                }
            }
            if let (Some(cb), false) = (&on_left_needed, needed_left_keys.is_empty()) {
                (cb.borrow_mut())(&needed_left_keys);
            }

            Ok(vec![erase_batch(out)])
        }),
    )
}
