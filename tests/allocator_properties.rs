//! Property tests: random insert/free/lock/unlock sequences on one slot

use proptest::prelude::*;
use slotheap::storage::slab::BlockId;
use slotheap::{AllocatorConfig, FreeOutcome, Insertion, ObjectMeta, SlotAllocator, SlotId};
use std::collections::HashSet;

const CAPACITY: usize = 512;
const SLOT: SlotId = SlotId(321);

#[derive(Debug, Clone)]
enum Op {
    Insert(usize, usize),
    Free(usize),
    Lock,
    Unlock,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (1usize..48, 0usize..160).prop_map(|(k, v)| Op::Insert(k, v)),
        4 => any::<usize>().prop_map(Op::Free),
        1 => Just(Op::Lock),
        1 => Just(Op::Unlock),
    ]
}

fn allocator() -> SlotAllocator {
    match SlotAllocator::new(AllocatorConfig::with_block_capacity(CAPACITY)) {
        Ok(alloc) => alloc,
        Err(e) => panic!("allocator config rejected: {}", e),
    }
}

fn insert(alloc: &mut SlotAllocator, serial: usize, klen: usize, vlen: usize) -> Insertion {
    let mut key = format!("{:08}", serial).into_bytes();
    key.resize(klen.max(8), b'k');
    let value = vec![(serial % 251) as u8; vlen];
    let mut km = ObjectMeta::string();
    let mut vm = ObjectMeta::string();
    match alloc.insert(SLOT, &key, &value, &mut km, &mut vm) {
        Ok(ins) => ins,
        Err(e) => panic!("insert of {}+{} bytes failed: {}", key.len(), vlen, e),
    }
}

fn walked_entries(alloc: &mut SlotAllocator) -> Result<usize, TestCaseError> {
    let mut cursor = alloc
        .cursor(SLOT)
        .map_err(|e| TestCaseError::fail(e.to_string()))?;
    let mut seen = HashSet::new();
    while let Some(entry) = cursor
        .next(alloc)
        .map_err(|e| TestCaseError::fail(e.to_string()))?
    {
        prop_assert!(seen.insert(entry.key_meta), "cursor yielded {} twice", entry.key_meta);
    }
    Ok(seen.len())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn random_operations_keep_slot_consistent(ops in prop::collection::vec(op_strategy(), 1..120)) {
        let mut alloc = allocator();
        let mut live: Vec<Insertion> = Vec::new();
        let mut pre_lock: Option<HashSet<BlockId>> = None;

        for (serial, op) in ops.into_iter().enumerate() {
            match op {
                Op::Insert(klen, vlen) => {
                    let ins = insert(&mut alloc, serial, klen, vlen);
                    if let Some(frozen) = &pre_lock {
                        prop_assert!(
                            !frozen.contains(&ins.segment.block),
                            "locked insert landed in pre-lock {}",
                            ins.segment.block
                        );
                    }
                    live.push(ins);
                }
                Op::Free(pick) => {
                    if live.is_empty() {
                        continue;
                    }
                    let ins = live.swap_remove(pick % live.len());
                    let outcome = alloc.free(SLOT, ins.key_meta)
                        .map_err(|e| TestCaseError::fail(e.to_string()))?;
                    prop_assert_ne!(outcome, FreeOutcome::AlreadyFree);
                    if pre_lock.is_some() {
                        prop_assert_eq!(outcome, FreeOutcome::Deferred);
                    }
                }
                Op::Lock => {
                    alloc.lock(SLOT).map_err(|e| TestCaseError::fail(e.to_string()))?;
                    let ids = alloc.block_ids(SLOT).map_err(|e| TestCaseError::fail(e.to_string()))?;
                    pre_lock = Some(ids.into_iter().collect());
                }
                Op::Unlock => {
                    alloc.unlock(SLOT).map_err(|e| TestCaseError::fail(e.to_string()))?;
                    pre_lock = None;
                }
            }

            alloc.check_slot(SLOT).map_err(|e| TestCaseError::fail(e.to_string()))?;
            let stats = alloc.stats(SLOT).map_err(|e| TestCaseError::fail(e.to_string()))?;
            prop_assert_eq!(stats.bytes_used + stats.bytes_free, stats.blocks * CAPACITY);
            prop_assert_eq!(stats.segments_used, live.len());
            if !stats.locked && stats.segments_used == 0 {
                prop_assert_eq!(stats.blocks, 0);
            }
            prop_assert_eq!(walked_entries(&mut alloc)?, live.len());
        }
    }

    #[test]
    fn insert_then_free_restores_free_bytes(
        warmup in prop::collection::vec((1usize..48, 0usize..160), 0..24),
        klen in 1usize..48,
        vlen in 0usize..160,
    ) {
        let mut alloc = allocator();
        for (serial, (k, v)) in warmup.into_iter().enumerate() {
            insert(&mut alloc, serial, k, v);
        }
        let before = alloc.stats(SLOT).map_err(|e| TestCaseError::fail(e.to_string()))?;

        let ins = insert(&mut alloc, usize::MAX / 2, klen, vlen);
        let outcome = alloc.free(SLOT, ins.key_meta).map_err(|e| TestCaseError::fail(e.to_string()))?;
        prop_assert!(matches!(outcome, FreeOutcome::Freed | FreeOutcome::BlockReleased));

        let after = alloc.stats(SLOT).map_err(|e| TestCaseError::fail(e.to_string()))?;
        prop_assert_eq!(after.blocks, before.blocks);
        prop_assert_eq!(after.bytes_free, before.bytes_free);
        prop_assert_eq!(after.segments_used, before.segments_used);
    }

    #[test]
    fn double_free_is_reported(klens in prop::collection::vec(1usize..48, 1..16)) {
        let mut alloc = allocator();
        let handles: Vec<Insertion> = klens
            .iter()
            .enumerate()
            .map(|(serial, k)| insert(&mut alloc, serial, *k, 8))
            .collect();
        // keep one entry so its block survives
        insert(&mut alloc, usize::MAX / 2, 8, 8);

        for ins in &handles {
            alloc.free(SLOT, ins.key_meta).map_err(|e| TestCaseError::fail(e.to_string()))?;
        }
        for ins in &handles {
            let again = alloc.free(SLOT, ins.key_meta);
            prop_assert!(
                matches!(again, Ok(FreeOutcome::AlreadyFree) | Err(slotheap::error::Error::InvalidHandle(_))),
                "unexpected outcome {:?}", again.map_err(|e| e.to_string())
            );
        }
        alloc.check_slot(SLOT).map_err(|e| TestCaseError::fail(e.to_string()))?;
    }
}
