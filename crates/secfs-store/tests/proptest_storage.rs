//! Property-based tests for secfs-storage using proptest.
//!
//! Random operation sequences are replayed against the in-memory servers
//! and a trivial model, checking reference counting and the
//! compare-and-swap discipline of the version server.

use proptest::prelude::*;
use secfs_store::{BlockHash, BlockStore, MemoryBlockStore, MemoryVersionServer, StoreError, VersionServer};
use std::collections::HashMap;

#[derive(Clone, Debug)]
enum BlockOp {
    Store(u8),
    Free(u8),
}

fn any_block_op() -> impl Strategy<Value = BlockOp> {
    prop_oneof![
        (0u8..6).prop_map(BlockOp::Store),
        (0u8..6).prop_map(BlockOp::Free),
    ]
}

/// Small alphabet of payloads so that stores collide often.
fn payload(tag: u8) -> Vec<u8> {
    vec![tag; tag as usize * 3 + 1]
}

#[derive(Clone, Debug)]
struct Publish {
    user: u64,
    stale_by: u64,
}

fn any_publish() -> impl Strategy<Value = Publish> {
    (0u64..4, prop_oneof![3 => Just(0u64), 1 => 1u64..3])
        .prop_map(|(user, stale_by)| Publish { user, stale_by })
}

proptest! {
    #[test]
    fn prop_refcounts_match_model(ops in prop::collection::vec(any_block_op(), 1..64)) {
        let store = MemoryBlockStore::new();
        let mut model: HashMap<BlockHash, u64> = HashMap::new();

        for op in ops {
            match op {
                BlockOp::Store(tag) => {
                    let hash = store.store(&payload(tag)).unwrap();
                    prop_assert_eq!(hash, BlockHash::of(&payload(tag)));
                    *model.entry(hash).or_insert(0) += 1;
                }
                BlockOp::Free(tag) => {
                    let hash = BlockHash::of(&payload(tag));
                    store.free(&hash).unwrap();
                    if let Some(refs) = model.get_mut(&hash) {
                        *refs -= 1;
                        if *refs == 0 {
                            model.remove(&hash);
                        }
                    }
                }
            }
        }

        prop_assert_eq!(store.len(), model.len());
        for tag in 0u8..6 {
            let hash = BlockHash::of(&payload(tag));
            let expected = model.get(&hash).copied().unwrap_or(0);
            prop_assert_eq!(store.refcount(&hash), expected);
            match store.fetch_verified(&hash) {
                Ok(data) => {
                    prop_assert!(expected > 0);
                    prop_assert_eq!(data, payload(tag));
                }
                Err(StoreError::BlockNotFound { .. }) => prop_assert_eq!(expected, 0),
                Err(e) => prop_assert!(false, "unexpected error {}", e),
            }
        }
    }

    #[test]
    fn prop_stale_publishes_never_land(publishes in prop::collection::vec(any_publish(), 1..32)) {
        let server = MemoryVersionServer::new();
        let mut latest: HashMap<u64, Vec<u8>> = HashMap::new();

        for (n, p) in publishes.iter().enumerate() {
            let current = server.generation();
            let expected = current.saturating_sub(p.stale_by);
            let bytes = vec![n as u8];
            match server.publish(p.user, expected, bytes.clone()) {
                Ok(generation) => {
                    prop_assert_eq!(expected, current);
                    prop_assert_eq!(generation, current + 1);
                    latest.insert(p.user, bytes);
                }
                Err(StoreError::Conflict { user, .. }) => {
                    prop_assert_ne!(expected, current);
                    prop_assert_eq!(user, p.user);
                    prop_assert_eq!(server.generation(), current);
                }
                Err(e) => prop_assert!(false, "unexpected error {}", e),
            }
        }

        let snapshot = server.fetch_all().unwrap();
        prop_assert_eq!(snapshot.entries.len(), latest.len());
        for (user, bytes) in latest {
            prop_assert_eq!(snapshot.entries.get(&user), Some(&bytes));
        }
    }
}
