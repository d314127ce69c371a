//! Property-based tests for the log store and envelope codec
//!
//! Uses proptest to check the log invariants under arbitrary bodies and
//! arbitrary delivery orders.

use std::sync::Arc;

use proptest::prelude::*;
use quire_core::group::GroupKeys;
use quire_core::identity::Keypair;
use quire_core::log::{EntryBody, LogStore};
use quire_core::sync::Envelope;
use quire_core::SyncError;
use serde_json::{json, Value};

// ============================================================================
// Strategy Generators
// ============================================================================

/// JSON leaves: strings, numbers, booleans and null
fn leaf_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        prop::string::string_regex("[a-zA-Z0-9 éß✓]{0,40}")
            .expect("valid regex")
            .prop_map(Value::from),
    ]
}

/// Arbitrary JSON object bodies, nested a few levels deep
fn body_strategy() -> impl Strategy<Value = EntryBody> {
    let value = leaf_strategy().prop_recursive(3, 32, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..6).prop_map(Value::from),
            prop::collection::btree_map("[a-z]{1,8}", inner, 0..6)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    });
    prop::collection::btree_map("[a-z]{1,8}", value, 0..6)
        .prop_map(|m| EntryBody::new(Value::Object(m.into_iter().collect())).expect("object body"))
}

fn store(keys: &Arc<GroupKeys>) -> LogStore {
    LogStore::in_memory(keys.clone(), 64).unwrap()
}

/// A writer's log of `n` envelopes, built on a scratch store
fn authored_log(keys: &Arc<GroupKeys>, writer: &Keypair, n: usize) -> Vec<Envelope> {
    let scratch = store(keys);
    (0..n)
        .map(|i| {
            let body = EntryBody::new(json!({ "n": i })).unwrap();
            scratch.append(writer, &body).unwrap().envelope
        })
        .collect()
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    /// Any object body survives encrypt, sign, verify and decrypt unchanged
    #[test]
    fn envelope_preserves_body(body in body_strategy(), index in 0u64..1_000_000) {
        let keys = GroupKeys::generate();
        let writer = Keypair::generate();

        let envelope = Envelope::encode(&body, index, &writer, &keys).unwrap();
        let entry = Envelope::from_bytes(&envelope.to_bytes().unwrap())
            .unwrap()
            .decode(&keys)
            .unwrap();

        prop_assert_eq!(entry.index, index);
        prop_assert_eq!(entry.writer, writer.writer_key());
        prop_assert_eq!(entry.digest, body.digest().unwrap());
        prop_assert_eq!(entry.body, body);
    }

    /// Flipping any byte of the signed envelope makes it fail validation
    #[test]
    fn tampered_envelope_is_rejected(body in body_strategy(), position in any::<prop::sample::Index>()) {
        let keys = GroupKeys::generate();
        let writer = Keypair::generate();
        let mut bytes = Envelope::encode(&body, 0, &writer, &keys).unwrap().to_bytes().unwrap();

        let i = position.index(bytes.len());
        bytes[i] ^= 0x01;

        let decoded = Envelope::from_bytes(&bytes).and_then(|e| e.decode(&keys));
        prop_assert!(decoded.is_err());
    }

    /// Local appends produce indices 0..n with no gaps
    #[test]
    fn appends_are_gap_free(bodies in prop::collection::vec(body_strategy(), 1..20)) {
        let keys = Arc::new(GroupKeys::generate());
        let writer = Keypair::generate();
        let store = store(&keys);

        for (i, body) in bodies.iter().enumerate() {
            let entry = store.append(&writer, body).unwrap();
            prop_assert_eq!(entry.index, i as u64);
        }

        let w = writer.writer_key();
        prop_assert_eq!(store.head(&w).unwrap(), Some(bodies.len() as u64 - 1));
        let indices: Vec<u64> = store.entries(&w).unwrap().iter().map(|e| e.index).collect();
        prop_assert_eq!(indices, (0..bodies.len() as u64).collect::<Vec<_>>());
    }

    /// Whatever order envelopes arrive in, the stored log never has a gap
    /// and every stored entry can be found by its digest
    #[test]
    fn put_in_any_order_stays_gap_free(
        n in 1usize..12,
        order in prop::collection::vec(any::<prop::sample::Index>(), 1..40),
    ) {
        let keys = Arc::new(GroupKeys::generate());
        let writer = Keypair::generate();
        let log = authored_log(&keys, &writer, n);
        let target = store(&keys);
        let w = writer.writer_key();

        for pick in order {
            let envelope = log[pick.index(n)].clone();
            let index = envelope.index;
            let before = target.head(&w).unwrap();
            let expected = before.map_or(0, |h| h + 1);

            match target.put(envelope) {
                Ok(outcome) => {
                    if outcome.is_stored() {
                        prop_assert_eq!(index, expected);
                    } else {
                        prop_assert!(index < expected);
                    }
                }
                Err(SyncError::OutOfOrder { .. }) => prop_assert!(index > expected),
                Err(e) => prop_assert!(false, "unexpected error: {}", e),
            }

            let head = target.head(&w).unwrap();
            let stored = target.entries(&w).unwrap();
            prop_assert_eq!(stored.len() as u64, head.map_or(0, |h| h + 1));
            for entry in stored {
                let found = target.get_by_digest(&entry.digest).unwrap();
                prop_assert!(found.is_some());
            }
        }
    }

    /// Delivering the same envelope twice changes nothing
    #[test]
    fn put_is_idempotent(n in 1usize..8) {
        let keys = Arc::new(GroupKeys::generate());
        let writer = Keypair::generate();
        let log = authored_log(&keys, &writer, n);
        let target = store(&keys);
        let mut updates = target.subscribe();

        for envelope in &log {
            prop_assert!(target.put(envelope.clone()).unwrap().is_stored());
            prop_assert!(!target.put(envelope.clone()).unwrap().is_stored());
        }

        prop_assert_eq!(target.len().unwrap(), n as u64);
        let mut notified = 0;
        while updates.try_recv().is_ok() {
            notified += 1;
        }
        prop_assert_eq!(notified, n);
    }
}
