//! Property-based tests for CDC merge: the table must converge to the
//! highest-sequence row per key no matter how events are batched or ordered.

use proptest::prelude::*;
use rustc_hash::FxHashMap;
use tidemill_core::Value;
use tidemill_runtime::{CurrentStateTable, Record, SharedRecord};

/// (key, sequence, payload) triples. Small key space forces collisions.
fn arb_events() -> impl Strategy<Value = Vec<(u8, i64, i64)>> {
    prop::collection::vec((0u8..8, 0i64..20, any::<i64>()), 0..64)
}

fn change(key: u8, seq: i64, payload: i64) -> SharedRecord {
    Record::new()
        .with_field("CustomerID", format!("c{key}"))
        .with_field("Sequence", seq)
        .with_field("Payload", payload)
        .into_shared()
}

fn table() -> CurrentStateTable {
    CurrentStateTable::new(vec!["CustomerID".into()], "Sequence")
}

/// Reference model: replay in arrival order, a row wins when its sequence
/// is >= the retained one (ties go to the later arrival).
fn expected(events: &[(u8, i64, i64)]) -> FxHashMap<u8, (i64, i64)> {
    let mut model: FxHashMap<u8, (i64, i64)> = FxHashMap::default();
    for &(key, seq, payload) in events {
        match model.get(&key) {
            Some(&(cur, _)) if seq < cur => {}
            _ => {
                model.insert(key, (seq, payload));
            }
        }
    }
    model
}

fn retained(table: &CurrentStateTable, key: u8) -> Option<(i64, i64)> {
    let row = table.lookup(&[Value::from(format!("c{key}"))])?;
    Some((
        row.get_int("Sequence").expect("sequence stored as int"),
        row.get_int("Payload").expect("payload stored as int"),
    ))
}

proptest! {
    /// Applying every event as its own batch converges to the model.
    #[test]
    fn prop_singleton_batches_match_model(events in arb_events()) {
        let table = table();
        for &(key, seq, payload) in &events {
            table.apply_changes(&[change(key, seq, payload)]);
        }

        let model = expected(&events);
        prop_assert_eq!(table.len(), model.len());
        for (&key, &(seq, payload)) in &model {
            prop_assert_eq!(retained(&table, key), Some((seq, payload)));
        }
    }

    /// One big batch converges to the same rows as singleton batches.
    #[test]
    fn prop_single_batch_matches_model(events in arb_events()) {
        let table = table();
        let batch: Vec<SharedRecord> = events
            .iter()
            .map(|&(key, seq, payload)| change(key, seq, payload))
            .collect();
        table.apply_changes(&batch);

        let model = expected(&events);
        prop_assert_eq!(table.len(), model.len());
        for (&key, &(seq, payload)) in &model {
            prop_assert_eq!(retained(&table, key), Some((seq, payload)));
        }
    }

    /// The retained sequence per key is the maximum seen, regardless of
    /// arrival order. (Payloads can differ when sequences tie, so only the
    /// sequence is order-independent.)
    #[test]
    fn prop_arrival_order_cannot_change_retained_sequence(events in arb_events()) {
        let forward = table();
        for &(key, seq, payload) in &events {
            forward.apply_changes(&[change(key, seq, payload)]);
        }

        let mut reversed_events = events.clone();
        reversed_events.reverse();
        let reversed = table();
        for &(key, seq, payload) in &reversed_events {
            reversed.apply_changes(&[change(key, seq, payload)]);
        }

        prop_assert_eq!(forward.len(), reversed.len());
        for &(key, _, _) in &events {
            let f = retained(&forward, key).map(|(seq, _)| seq);
            let r = retained(&reversed, key).map(|(seq, _)| seq);
            prop_assert_eq!(f, r);
        }
    }

    /// Re-applying any batch leaves the table untouched.
    #[test]
    fn prop_reapply_is_idempotent(events in arb_events()) {
        let table = table();
        let batch: Vec<SharedRecord> = events
            .iter()
            .map(|&(key, seq, payload)| change(key, seq, payload))
            .collect();
        table.apply_changes(&batch);
        let version = table.version();
        let rows = table.len();

        let report = table.apply_changes(&batch);
        prop_assert!(!report.changed());
        prop_assert_eq!(table.version(), version);
        prop_assert_eq!(table.len(), rows);
    }
}
