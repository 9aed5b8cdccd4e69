//! Slot migration and dump/load across allocators

use slotheap::error::{Error, Result};
use slotheap::storage::{AllocatorSink, CollectSink};
use slotheap::{migrate_slot, AllocatorConfig, ObjectMeta, SlotAllocator, SlotId, SlotStore};
use std::collections::BTreeMap;

fn put(alloc: &mut SlotAllocator, slot: SlotId, key: &str, value: &str) -> Result<()> {
    let mut km = ObjectMeta::string();
    let mut vm = ObjectMeta::string();
    alloc.insert(slot, key.as_bytes(), value.as_bytes(), &mut km, &mut vm)?;
    Ok(())
}

fn contents(alloc: &mut SlotAllocator, slot: SlotId) -> Result<BTreeMap<Vec<u8>, Vec<u8>>> {
    let mut out = BTreeMap::new();
    let mut cursor = alloc.cursor(slot)?;
    while let Some(entry) = cursor.next(alloc)? {
        let view = alloc.entry(slot, entry.key_meta)?;
        out.insert(view.key.to_vec(), view.value.to_vec());
    }
    Ok(out)
}

fn populate(alloc: &mut SlotAllocator, slot: SlotId) -> Result<()> {
    for i in 0..60 {
        put(alloc, slot, &format!("user:{}", i), &"x".repeat(i % 17 + 1))?;
    }
    Ok(())
}

#[test]
fn test_migrate_then_dump_and_load() -> Result<()> {
    let config = AllocatorConfig::with_block_capacity(1024);
    let slot = SlotId(4242);

    let mut src: SlotAllocator = SlotAllocator::new(config.clone())?;
    populate(&mut src, slot)?;
    let expected = contents(&mut src, slot)?;

    let mut dst: SlotAllocator = SlotAllocator::new(config.clone())?;
    let report = {
        let mut sink = AllocatorSink::new(&mut dst);
        migrate_slot(&mut src, slot, &mut sink)?
    };
    assert_eq!(report.entries, 60);
    assert_eq!(src.stats(slot)?.blocks, 0);
    assert_eq!(contents(&mut dst, slot)?, expected);

    let mut bytes = Vec::new();
    let written = dst.dump(slot, &mut bytes)?;
    assert_eq!(written, bytes.len());
    let before = dst.stats(slot)?;

    let mut reloaded: SlotAllocator = SlotAllocator::new(config)?;
    reloaded.load(slot, bytes.as_slice())?;
    reloaded.check_slot(slot)?;

    let after = reloaded.stats(slot)?;
    assert_eq!(after.blocks, before.blocks);
    assert_eq!(after.bytes_used, before.bytes_used);
    assert_eq!(after.segments_used, before.segments_used);
    assert_eq!(contents(&mut reloaded, slot)?, expected);
    Ok(())
}

#[test]
fn test_load_rejects_truncated_dump() -> Result<()> {
    let config = AllocatorConfig::with_block_capacity(512);
    let slot = SlotId(3);
    let mut alloc: SlotAllocator = SlotAllocator::new(config.clone())?;
    populate(&mut alloc, slot)?;

    let mut bytes = Vec::new();
    alloc.dump(slot, &mut bytes)?;
    bytes.truncate(bytes.len() - 10);

    let mut target: SlotAllocator = SlotAllocator::new(config)?;
    let err = target.load(slot, bytes.as_slice());
    assert!(matches!(err, Err(Error::Corrupted(_))));
    assert_eq!(target.stats(slot)?.blocks, 0);
    Ok(())
}

#[test]
fn test_load_into_occupied_slot_fails() -> Result<()> {
    let config = AllocatorConfig::with_block_capacity(512);
    let slot = SlotId(5);
    let mut alloc: SlotAllocator = SlotAllocator::new(config)?;
    put(&mut alloc, slot, "a", "1")?;

    let mut bytes = Vec::new();
    alloc.dump(slot, &mut bytes)?;
    let err = alloc.load(slot, bytes.as_slice());
    assert!(matches!(err, Err(Error::SlotNotEmpty { .. })));
    Ok(())
}

#[test]
fn test_store_migration_empties_slot() -> Result<()> {
    let mut store = SlotStore::new(AllocatorConfig::with_block_capacity(2048))?;
    for i in 0..25 {
        store.set(format!("{{cart:7}}:{}", i).as_bytes(), b"item")?;
    }
    store.set(b"elsewhere", b"1")?;
    let slot = store.slot_for(b"{cart:7}:0");

    let mut sink = CollectSink::default();
    let report = store.migrate_slot(slot, &mut sink)?;
    assert_eq!(report.entries, 25);
    assert_eq!(sink.entries.len(), 25);
    assert!(sink.entries.iter().all(|(_, v)| v == b"item"));
    assert_eq!(store.stats(slot)?.blocks, 0);
    assert_eq!(store.len(), 1);
    Ok(())
}
