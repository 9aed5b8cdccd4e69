//! Slot migration boundary
//!
//! Moving a slot to another node is: lock the slot, drain every live entry
//! through a cursor, hand each one to a [`MigrationSink`], and destroy the
//! slot once the sink has confirmed with `finish`. The allocator knows
//! nothing about how the sink transports entries.

use super::slab::{
    EntryMeta, EntrySource, EntryView, Insertion, SlotAllocator, SlotCursor, SlotId,
};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Receiver of migrated entries
pub trait MigrationSink<M: EntryMeta> {
    /// Ship one entry
    fn send(&mut self, slot: SlotId, entry: &EntryView<'_, M>) -> Result<()>;

    /// Called once every entry of `slot` has been sent
    fn finish(&mut self, _slot: SlotId) -> Result<()> {
        Ok(())
    }
}

/// Outcome of a completed migration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationReport {
    pub slot: u16,
    pub entries: usize,
    /// Key plus value bytes shipped
    pub bytes: usize,
    /// Blocks released on the source
    pub blocks: usize,
}

/// Send every entry `source` yields, then finish the sink
///
/// Returns `(entries, bytes)` shipped.
pub fn ship_entries<M, S, K>(
    alloc: &mut SlotAllocator<M>,
    source: &mut S,
    slot: SlotId,
    sink: &mut K,
) -> Result<(usize, usize)>
where
    M: EntryMeta,
    S: EntrySource<M>,
    K: MigrationSink<M>,
{
    let mut entries = 0;
    let mut bytes = 0;
    while let Some(entry) = source.next_entry(alloc)? {
        let view = alloc.entry(slot, entry.key_meta)?;
        sink.send(slot, &view)?;
        entries += 1;
        bytes += view.len();
    }
    sink.finish(slot)?;
    Ok((entries, bytes))
}

/// Move every entry of `slot` into `sink` and destroy the slot
///
/// If shipping fails the slot is unlocked again, with its entries intact,
/// and the error is returned.
pub fn migrate_slot<M, K>(
    alloc: &mut SlotAllocator<M>,
    slot: SlotId,
    sink: &mut K,
) -> Result<MigrationReport>
where
    M: EntryMeta,
    K: MigrationSink<M>,
{
    alloc.lock(slot)?;
    let blocks = alloc.stats(slot)?.blocks;
    let mut cursor: SlotCursor = alloc.cursor(slot)?;

    match ship_entries(alloc, &mut cursor, slot, sink) {
        Ok((entries, bytes)) => {
            alloc.destroy_slot(slot)?;
            info!(%slot, entries, bytes, blocks, "Migrated slot");
            Ok(MigrationReport {
                slot: slot.0,
                entries,
                bytes,
                blocks,
            })
        }
        Err(e) => {
            warn!(%slot, error = %e, "Migration failed, unlocking slot");
            alloc.unlock(slot)?;
            Err(e)
        }
    }
}

/// Sink that re-inserts entries into another allocator
pub struct AllocatorSink<'a, M: EntryMeta> {
    dest: &'a mut SlotAllocator<M>,
    target: Option<SlotId>,
    inserted: Vec<(Vec<u8>, Insertion)>,
}

impl<'a, M: EntryMeta> AllocatorSink<'a, M> {
    /// Entries land in the same slot id on `dest`
    pub fn new(dest: &'a mut SlotAllocator<M>) -> Self {
        Self {
            dest,
            target: None,
            inserted: Vec::new(),
        }
    }

    /// Entries land in `target` on `dest` whatever their source slot
    pub fn retarget(dest: &'a mut SlotAllocator<M>, target: SlotId) -> Self {
        Self {
            dest,
            target: Some(target),
            inserted: Vec::new(),
        }
    }

    /// Keys and handles of every entry received so far
    pub fn inserted(&self) -> &[(Vec<u8>, Insertion)] {
        &self.inserted
    }
}

impl<M: EntryMeta> MigrationSink<M> for AllocatorSink<'_, M> {
    fn send(&mut self, slot: SlotId, entry: &EntryView<'_, M>) -> Result<()> {
        let slot = self.target.unwrap_or(slot);
        let mut key_meta = entry.key_meta.clone();
        let mut value_meta = entry.value_meta.clone();
        let ins = self
            .dest
            .insert(slot, entry.key, entry.value, &mut key_meta, &mut value_meta)?;
        self.inserted.push((entry.key.to_vec(), ins));
        Ok(())
    }
}

/// Sink that copies entries into memory
#[derive(Debug, Default)]
pub struct CollectSink {
    pub entries: Vec<(Vec<u8>, Vec<u8>)>,
    pub finished: Vec<SlotId>,
}

impl<M: EntryMeta> MigrationSink<M> for CollectSink {
    fn send(&mut self, _slot: SlotId, entry: &EntryView<'_, M>) -> Result<()> {
        self.entries.push((entry.key.to_vec(), entry.value.to_vec()));
        Ok(())
    }

    fn finish(&mut self, slot: SlotId) -> Result<()> {
        self.finished.push(slot);
        Ok(())
    }
}
