//! Property-based tests for the stream registry.

use chunkfs_datanode::{DataNodeError, SessionGuard, StreamId, StreamRegistry};
use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
enum Op {
    Register(StreamId),
    DropGuard(StreamId),
    Unregister(StreamId),
    Lookup(StreamId),
}

fn any_op() -> impl Strategy<Value = Op> {
    let id = 1u64..16;
    prop_oneof![
        id.clone().prop_map(Op::Register),
        id.clone().prop_map(Op::DropGuard),
        id.clone().prop_map(Op::Unregister),
        id.prop_map(Op::Lookup),
    ]
}

proptest! {
    /// The registry agrees with a plain map under any sequence of
    /// registrations, guard drops, explicit unregisters and lookups.
    #[test]
    fn test_registry_matches_model(ops in proptest::collection::vec(any_op(), 1..100)) {
        let registry: StreamRegistry<StreamId> = StreamRegistry::new("inbound");
        let mut guards: HashMap<StreamId, SessionGuard<'_, StreamId>> = HashMap::new();
        let mut live: HashMap<StreamId, StreamId> = HashMap::new();
        let mut generation = 0u64;

        for op in ops {
            match op {
                Op::Register(id) => {
                    generation += 1;
                    match registry.register(id, Arc::new(generation)) {
                        Ok(guard) => {
                            prop_assert!(!live.contains_key(&id));
                            live.insert(id, generation);
                            guards.insert(id, guard);
                        }
                        Err(DataNodeError::DuplicateStream { stream_id, .. }) => {
                            prop_assert_eq!(stream_id, id);
                            prop_assert!(live.contains_key(&id));
                        }
                        Err(e) => prop_assert!(false, "unexpected error {}", e),
                    }
                }
                Op::DropGuard(id) => {
                    // Dropping a guard whose entry was already removed is harmless.
                    if guards.remove(&id).is_some() {
                        live.remove(&id);
                    }
                }
                Op::Unregister(id) => {
                    let removed = registry.unregister(id).map(|s| *s);
                    prop_assert_eq!(removed, live.remove(&id));
                }
                Op::Lookup(id) => match registry.lookup(id) {
                    Ok(found) => prop_assert_eq!(Some(*found), live.get(&id).copied()),
                    Err(DataNodeError::UnknownStream { stream_id, .. }) => {
                        prop_assert_eq!(stream_id, id);
                        prop_assert!(!live.contains_key(&id));
                    }
                    Err(e) => prop_assert!(false, "unexpected error {}", e),
                },
            }
            prop_assert_eq!(registry.len(), live.len());
        }

        drop(guards);
        prop_assert!(registry.is_empty());
    }

    /// Allocated ids never repeat and never collide with registered ones.
    #[test]
    fn test_allocated_ids_are_fresh(explicit in proptest::collection::vec(1u64..1000, 0..20), n in 1usize..50) {
        let registry: StreamRegistry<()> = StreamRegistry::new("outbound");
        let mut guards = Vec::new();
        for id in explicit {
            if let Ok(guard) = registry.register(id, Arc::new(())) {
                guards.push(guard);
            }
        }

        let mut seen = std::collections::HashSet::new();
        for _ in 0..n {
            let id = registry.allocate_stream_id().unwrap();
            prop_assert!(!registry.contains(id));
            prop_assert!(seen.insert(id));
        }
    }
}
