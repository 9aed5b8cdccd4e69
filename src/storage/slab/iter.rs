//! Forward cursors over a slot's live entries
//!
//! A cursor is a plain value holding `(block, offset)`; it borrows the
//! allocator only for the duration of each `next` call, so the caller can
//! read or free entries between steps. The slot's epoch guards against
//! walking a layout that changed under the cursor.

use super::allocator::{EntryRef, SlotAllocator};
use super::block::BlockId;
use super::free_list::SegmentRef;
use super::layout::FIRST_PAYLOAD;
use super::metadata::{EntryMeta, MetaRef};
use super::slot::SlotId;
use crate::error::{Error, Result};
use tracing::trace;

/// Source of entries, one at a time
pub trait EntrySource<M: EntryMeta> {
    /// The next live entry, or `None` once exhausted
    fn next_entry(&mut self, alloc: &mut SlotAllocator<M>) -> Result<Option<EntryRef>>;
}

/// Position of an in-flight walk over one slot
#[derive(Debug, Clone)]
pub struct SlotCursor {
    slot: SlotId,
    block: Option<BlockId>,
    offset: usize,
    epoch: u64,
    done: bool,
}

impl SlotCursor {
    pub(crate) fn new(slot: SlotId, head: Option<BlockId>, epoch: u64) -> Self {
        Self {
            slot,
            block: head,
            offset: FIRST_PAYLOAD,
            epoch,
            done: head.is_none(),
        }
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Advance to the next allocated segment
    ///
    /// Free segments are stepped over and left off the free list; a locked
    /// slot gets them back when [`SlotAllocator::unlock`] rebuilds its free
    /// space, not during the walk. At each block's epilogue the block's
    /// byte counters are refreshed from the walk before moving on. Once the
    /// last block is finished every further call returns `Ok(None)`.
    pub fn next<M: EntryMeta>(&mut self, alloc: &mut SlotAllocator<M>) -> Result<Option<EntryRef>> {
        if self.done {
            return Ok(None);
        }
        let slot = self.slot;
        let state = alloc.slot_state_mut(slot)?;
        if state.epoch != self.epoch {
            self.done = true;
            return Err(Error::StaleCursor {
                slot,
                reason: "segments were merged or blocks released".to_string(),
            });
        }

        while let Some(id) = self.block {
            let Some(block) = state.blocks.get_mut(&id) else {
                self.done = true;
                return Err(Error::StaleCursor {
                    slot,
                    reason: format!("{} no longer exists", id),
                });
            };

            let header = block.arena.header(self.offset);
            if header.is_sentinel() {
                block.resync_counters();
                trace!(%slot, block = %id, "Cursor finished block");
                self.block = block.next;
                self.offset = FIRST_PAYLOAD;
                continue;
            }

            let p = self.offset;
            self.offset += header.size();
            if header.is_allocated() {
                return Ok(Some(EntryRef {
                    segment: SegmentRef::new(id, p),
                    key_meta: MetaRef::new(id, p),
                    value_meta: MetaRef::new(id, p + M::ENCODED_LEN),
                }));
            }
        }

        self.done = true;
        Ok(None)
    }
}

impl<M: EntryMeta> EntrySource<M> for SlotCursor {
    fn next_entry(&mut self, alloc: &mut SlotAllocator<M>) -> Result<Option<EntryRef>> {
        self.next(alloc)
    }
}

/// Iterator adapter holding the allocator for the whole walk
pub struct Drain<'a, M: EntryMeta> {
    alloc: &'a mut SlotAllocator<M>,
    cursor: SlotCursor,
}

impl<'a, M: EntryMeta> Drain<'a, M> {
    pub(crate) fn new(alloc: &'a mut SlotAllocator<M>, cursor: SlotCursor) -> Self {
        Self { alloc, cursor }
    }

    /// Allocator being walked, for decoding yielded entries
    pub fn allocator(&self) -> &SlotAllocator<M> {
        self.alloc
    }
}

impl<M: EntryMeta> Iterator for Drain<'_, M> {
    type Item = Result<EntryRef>;

    fn next(&mut self) -> Option<Self::Item> {
        self.cursor.next(self.alloc).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AllocatorConfig;
    use crate::storage::slab::metadata::ObjectMeta;
    use crate::storage::slab::FreeOutcome;

    fn filled(slot: SlotId, keys: &[&str]) -> Result<(SlotAllocator, Vec<MetaRef>)> {
        let mut alloc = SlotAllocator::new(AllocatorConfig::with_block_capacity(256))?;
        let mut handles = Vec::new();
        for key in keys {
            let mut km = ObjectMeta::string();
            let mut vm = ObjectMeta::string();
            let ins = alloc.insert(slot, key.as_bytes(), b"v", &mut km, &mut vm)?;
            handles.push(ins.key_meta);
        }
        Ok((alloc, handles))
    }

    fn keys_of(alloc: &mut SlotAllocator, slot: SlotId) -> Result<Vec<Vec<u8>>> {
        let mut cursor = alloc.cursor(slot)?;
        let mut keys = Vec::new();
        while let Some(entry) = cursor.next(alloc)? {
            keys.push(alloc.entry(slot, entry.key_meta)?.key.to_vec());
        }
        Ok(keys)
    }

    #[test]
    fn test_empty_slot_ends_immediately() -> Result<()> {
        let mut alloc = SlotAllocator::<ObjectMeta>::new(AllocatorConfig::with_block_capacity(256))?;
        let mut cursor = alloc.cursor(SlotId(0))?;
        assert!(cursor.next(&mut alloc)?.is_none());
        assert!(cursor.next(&mut alloc)?.is_none());
        Ok(())
    }

    #[test]
    fn test_walks_all_blocks() -> Result<()> {
        // 56-byte segments, four per 256-byte block
        let keys: Vec<String> = (0..10).map(|i| format!("k{}", i)).collect();
        let refs: Vec<&str> = keys.iter().map(|s| s.as_str()).collect();
        let slot = SlotId(4);
        let (mut alloc, _) = filled(slot, &refs)?;
        assert_eq!(alloc.stats(slot)?.blocks, 3);

        let mut seen = keys_of(&mut alloc, slot)?;
        seen.sort();
        let mut expected: Vec<Vec<u8>> = keys.iter().map(|k| k.as_bytes().to_vec()).collect();
        expected.sort();
        assert_eq!(seen, expected);
        Ok(())
    }

    #[test]
    fn test_skips_deferred_segments_on_locked_slot() -> Result<()> {
        let slot = SlotId(0);
        let (mut alloc, handles) = filled(slot, &["a", "b", "c"])?;
        alloc.lock(slot)?;
        assert_eq!(alloc.free(slot, handles[1])?, FreeOutcome::Deferred);

        assert_eq!(keys_of(&mut alloc, slot)?, vec![b"a".to_vec(), b"c".to_vec()]);
        let stats = alloc.stats(slot)?;
        assert_eq!(stats.deferred_segments, 2);
        assert_eq!(stats.bytes_used + stats.bytes_free, 256);
        Ok(())
    }

    #[test]
    fn test_free_between_steps() -> Result<()> {
        let slot = SlotId(0);
        let (mut alloc, _) = filled(slot, &["a", "b", "c"])?;
        alloc.lock(slot)?;

        let mut cursor = alloc.cursor(slot)?;
        let mut count = 0;
        while let Some(entry) = cursor.next(&mut alloc)? {
            assert_eq!(alloc.free(slot, entry.key_meta)?, FreeOutcome::Deferred);
            count += 1;
        }
        assert_eq!(count, 3);
        assert_eq!(alloc.stats(slot)?.bytes_used, 0);
        Ok(())
    }

    #[test]
    fn test_stale_cursor_after_release() -> Result<()> {
        let slot = SlotId(0);
        let (mut alloc, handles) = filled(slot, &["a"])?;
        let mut cursor = alloc.cursor(slot)?;
        assert_eq!(alloc.free(slot, handles[0])?, FreeOutcome::BlockReleased);

        assert!(matches!(
            cursor.next(&mut alloc),
            Err(Error::StaleCursor { .. })
        ));
        assert!(cursor.next(&mut alloc)?.is_none());
        Ok(())
    }

    #[test]
    fn test_drain_iterator() -> Result<()> {
        let slot = SlotId(2);
        let (mut alloc, _) = filled(slot, &["x", "y"])?;
        let entries: Vec<EntryRef> = alloc.drain(slot)?.collect::<Result<_>>()?;
        assert_eq!(entries.len(), 2);
        Ok(())
    }

    #[test]
    fn test_independent_cursors() -> Result<()> {
        let (mut alloc, _) = filled(SlotId(0), &["a", "b"])?;
        let mut c1 = alloc.cursor(SlotId(0))?;
        let mut c2 = alloc.cursor(SlotId(0))?;
        let first = c1.next(&mut alloc)?;
        assert_eq!(c2.next(&mut alloc)?, first);
        assert!(c1.next(&mut alloc)?.is_some());
        assert!(c1.next(&mut alloc)?.is_none());
        assert!(c2.next_entry(&mut alloc)?.is_some());
        Ok(())
    }
}
