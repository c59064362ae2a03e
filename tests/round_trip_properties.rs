//! Property-based tests for spec.md §8's round-trip laws and quantified
//! invariants 1–3, run against the multiset/graph layer directly (the
//! layer these laws are actually stated over) rather than through the
//! query compiler.

use proptest::prelude::*;

use ivm_core::key::Key;
use ivm_core::multiset::{Multiplicity, Multiset};
use ivm_core::operators::map::map;
use ivm_core::operators::output::output;
use ivm_core::value::Value;
use ivm_core::{Change, Graph};

fn arb_key() -> impl Strategy<Value = Key> {
    (0i64..50).prop_map(Key::from)
}

fn arb_value() -> impl Strategy<Value = Value> {
    (0i64..50).prop_map(Value::from)
}

proptest! {
    /// `(insert x; delete x)` yields no net change (§8 round-trip law).
    #[test]
    fn insert_then_delete_nets_to_nothing(key in arb_key(), value in arb_value()) {
        let insert = Change::Insert { key: key.clone(), value: value.clone() };
        let delete = Change::Delete { key, value };
        let combined = insert.to_deltas().concat(delete.to_deltas()).consolidate();
        prop_assert!(combined.is_empty());
    }

    /// `(insert x; update x->y; delete y)` yields no net change.
    #[test]
    fn insert_update_delete_nets_to_nothing(key in arb_key(), a in arb_value(), b in arb_value()) {
        let insert = Change::Insert { key: key.clone(), value: a.clone() };
        let update = Change::Update { key: key.clone(), previous_value: a, value: b.clone() };
        let delete = Change::Delete { key, value: b };
        let combined = insert
            .to_deltas()
            .concat(update.to_deltas())
            .concat(delete.to_deltas())
            .consolidate();
        prop_assert!(combined.is_empty());
    }

    /// Quantified invariant 1: after consolidation, every multiplicity is
    /// non-zero and summing duplicate keys never reintroduces a zero entry
    /// that wasn't dropped.
    #[test]
    fn consolidate_never_leaves_a_zero_multiplicity(
        pairs in prop::collection::vec((arb_key(), -3i64..=3i64), 0..30)
    ) {
        let ms: Multiset<Key> = Multiset::from_pairs(
            pairs.into_iter().map(|(k, m)| (k, Multiplicity(m))).collect()
        );
        let consolidated = ms.consolidate();
        for (_, m) in consolidated.inner() {
            prop_assert!(!m.is_zero());
        }
    }

    /// Consolidation is idempotent: consolidating an already-consolidated
    /// multiset changes nothing.
    #[test]
    fn consolidate_is_idempotent(
        pairs in prop::collection::vec((arb_key(), -3i64..=3i64), 0..30)
    ) {
        let ms: Multiset<Key> = Multiset::from_pairs(
            pairs.into_iter().map(|(k, m)| (k, Multiplicity(m))).collect()
        );
        let once = ms.consolidate();
        let twice = once.clone().consolidate();
        prop_assert_eq!(once.inner().to_vec(), twice.inner().to_vec());
    }

    /// Key stability (§8 property 3): a `map` over the key component alone
    /// (the "no select reshaping" case) leaves every value's key exactly
    /// the source key it derives from.
    #[test]
    fn map_preserving_key_keeps_key_stable(key in arb_key(), value in arb_value()) {
        let mut g = Graph::new();
        let input = g.add_input::<(Key, Value)>();
        let out = map(&mut g, input.stream_id(), |(k, v)| (k, v));
        let seen = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let seen_clone = seen.clone();
        output(&mut g, out, move |batch| seen_clone.borrow_mut().extend(batch.inner().to_vec()));

        input.send_data(&g, Multiset::singleton((key.clone(), value), Multiplicity::ONE));
        g.run().unwrap();

        prop_assert_eq!(seen.borrow()[0].0 .0.clone(), key);
    }
}
