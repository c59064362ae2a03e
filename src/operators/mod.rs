//! §4.3–§4.6 Operators over the keyed-item stream.
//!
//! Every operator in the live-query pipeline transports
//! `Multiset<(Key, Value)>` batches — the "keyed item" of §3. Stateless
//! operators (this module's direct children `map`, `filter`, `project`,
//! `negate`, `concat`, `consolidate`, `output`) hold no state across runs;
//! `join`, `reduce`, and `orderby` are split into their own modules because
//! they carry per-key state across graph runs (§3 "Operator state").

pub mod concat;
pub mod consolidate;
pub mod distinct;
pub mod filter;
pub mod join;
pub mod map;
pub mod negate;
pub mod orderby;
pub mod output;
pub mod project;
pub mod reduce;

use crate::key::Key;
use crate::value::Value;

/// The element type of every stream in the live-query pipeline (§3 "Keyed
/// item"): a source or group key paired with the row payload.
pub type Item = (Key, Value);
