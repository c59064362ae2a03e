//! Primary-key and canonical-value vocabulary shared across the crate.
//!
//! Row *keys* are, per the specification, "string or integer" upstream of
//! joins; downstream of a `groupBy` the key becomes a canonical string
//! encoding of the grouping columns (§3 Keyed item). We model both with a
//! single small enum rather than a generic `K: Hash + Eq + Ord` parameter
//! threaded through every operator: the spec never asks for a key type wider
//! than this, and a closed enum lets join/reduce construct composite keys
//! without a type-level escape hatch.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A source-collection primary key, or a derived composite/group key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Key {
    /// A source-assigned string key (e.g. a UUID primary key column).
    Str(String),
    /// A source-assigned integer key (e.g. an autoincrement primary key).
    Int(i64),
    /// A composite key produced by a join: `[leftKey, rightKey]`
    /// canonicalized (§4.4). Kept as a `Vec` rather than a fixed pair so
    /// chained joins can nest without a new variant per join depth.
    Composite(Vec<Key>),
}

impl Key {
    /// Renders the key as the canonical string form used for group keys and
    /// index signatures — stable across process restarts, unlike `Debug`.
    pub fn canonical_string(&self) -> String {
        match self {
            Key::Str(s) => format!("s:{s}"),
            Key::Int(i) => format!("i:{i}"),
            Key::Composite(parts) => {
                let mut out = String::from("c:[");
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&part.canonical_string());
                }
                out.push(']');
                out
            }
        }
    }

    /// Builds the composite key a join emits for a matched `(left, right)`
    /// pair of source keys (§4.4 "Composite output key").
    pub fn composite(left: Key, right: Key) -> Key {
        Key::Composite(vec![left, right])
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::Str(s)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::Str(s.to_string())
    }
}

impl From<i64> for Key {
    fn from(i: i64) -> Self {
        Key::Int(i)
    }
}

/// Total order over keys, needed wherever keys sit inside a `BTreeMap`
/// (sorted indexes, §4.7). Strings sort before integers before composites;
/// within a variant, component-wise comparison.
impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        use Key::*;
        match (self, other) {
            (Str(a), Str(b)) => a.cmp(b),
            (Int(a), Int(b)) => a.cmp(b),
            (Composite(a), Composite(b)) => a.cmp(b),
            (Str(_), _) => Ordering::Less,
            (_, Str(_)) => Ordering::Greater,
            (Int(_), _) => Ordering::Less,
            (_, Int(_)) => Ordering::Greater,
        }
    }
}
