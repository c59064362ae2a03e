//! Canonical row-value representation.
//!
//! The distilled spec leaves "value" abstract (§3). We represent row values
//! as [`serde_json::Value`]: it already has a stable, deep-equality-correct
//! `PartialEq`, and canonical-byte hashing (§4.1 "implementers must define a
//! stable hash") falls out of serializing to a canonical (key-sorted) JSON
//! string, which `serde_json` gives us for free because `serde_json::Map` is
//! backed by a `BTreeMap` in the default feature set this crate depends on.

use serde_json::Value as Json;
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

/// A row value. Newtype instead of a bare alias so we can implement `Hash`
/// and a total order on top of `serde_json::Value`, which provides neither.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Value(pub Json);

use serde::{Deserialize, Serialize};

impl Value {
    pub fn null() -> Self {
        Value(Json::Null)
    }

    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }

    /// Canonical byte representation used for hashing and equality-by-value
    /// (§4.1). `serde_json`'s default map type sorts keys, so two values
    /// that are deep-equal always serialize identically.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(&self.0).unwrap_or_default()
    }

    /// Reads a dotted/array-indexed path out of the value, for `Expr::Ref`
    /// evaluation (§6). Returns `Value::null()` for a missing path rather
    /// than erroring — the spec treats missing columns as nulls for
    /// aggregate purposes (§4.5 "Null handling").
    pub fn get_path(&self, path: &[String]) -> Value {
        let mut cur = &self.0;
        for segment in path {
            match cur.get(segment) {
                Some(v) => cur = v,
                None => return Value::null(),
            }
        }
        Value(cur.clone())
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical_bytes().hash(state);
    }
}

/// Total order over values used by `min`/`max`/`median`/`mode` accumulators
/// (§4.5) and by sorted indexes (§4.7) when the index key is a plain value.
/// Numbers order numerically, strings lexically, booleans false<true, null
/// first; cross-type comparisons fall back to a stable type-tag ordering so
/// the relation is total even over heterogeneous columns.
impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        fn rank(v: &Json) -> u8 {
            match v {
                Json::Null => 0,
                Json::Bool(_) => 1,
                Json::Number(_) => 2,
                Json::String(_) => 3,
                Json::Array(_) => 4,
                Json::Object(_) => 5,
            }
        }
        match (&self.0, &other.0) {
            (Json::Null, Json::Null) => Ordering::Equal,
            (Json::Bool(a), Json::Bool(b)) => a.cmp(b),
            (Json::Number(a), Json::Number(b)) => {
                let a = a.as_f64().unwrap_or(f64::NAN);
                let b = b.as_f64().unwrap_or(f64::NAN);
                a.partial_cmp(&b).unwrap_or(Ordering::Equal)
            }
            (Json::String(a), Json::String(b)) => a.cmp(b),
            (a, b) => {
                let (ra, rb) = (rank(a), rank(b));
                if ra != rb {
                    ra.cmp(&rb)
                } else {
                    self.canonical_bytes().cmp(&other.canonical_bytes())
                }
            }
        }
    }
}

impl From<Json> for Value {
    fn from(j: Json) -> Self {
        Value(j)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value(Json::String(s.to_string()))
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value(Json::Number(i.into()))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value(serde_json::Number::from_f64(f).map(Json::Number).unwrap_or(Json::Null))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value(Json::Bool(b))
    }
}
