//! Per-slot heap allocator
//!
//! Inserts carve segments out of blocks with a first-fit search over the
//! slot's free list, splitting when the leftover can stand as a segment of
//! its own. Frees coalesce with free neighbors through the boundary tags and
//! hand back blocks that become entirely free.
//!
//! A locked slot stops recycling: its free list is emptied, frees only mark
//! segments free, and inserts land in blocks created after the lock. This
//! keeps the pre-lock blocks stable while a [`SlotCursor`] drains them.

use super::block::{Block, BlockId};
use super::free_list::SegmentRef;
use super::iter::{Drain, SlotCursor};
use super::layout::{segment_size, ALIGNMENT, FIRST_PAYLOAD, LENGTH_FIELD_SIZE, MIN_SEGMENT_SIZE, WSIZE};
use super::metadata::{EntryMeta, EntryView, MetaRef, ObjectMeta};
use super::slot::{AllocatorStats, SlotId, SlotState, SlotStats};
use crate::config::AllocatorConfig;
use crate::error::{Error, Result};
use crate::metrics::{
    BLOCKS_ALLOCATED, BLOCKS_RELEASED, DOUBLE_FREES, ENTRIES_FREED, ENTRIES_INSERTED, LIVE_BLOCKS,
    SLOT_LOCKS,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::marker::PhantomData;
use tracing::{debug, info, warn};

/// Result of a successful insert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Insertion {
    /// The allocated segment; its header word sits at `segment.header_offset()`
    pub segment: SegmentRef,
    /// Whether a fresh block had to be allocated
    pub new_block: bool,
    /// In-place key record; pass this to `free`
    pub key_meta: MetaRef,
    /// In-place value record
    pub value_meta: MetaRef,
}

impl Insertion {
    pub fn entry(&self) -> EntryRef {
        EntryRef {
            segment: self.segment,
            key_meta: self.key_meta,
            value_meta: self.value_meta,
        }
    }
}

/// A live entry located by a cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryRef {
    pub segment: SegmentRef,
    pub key_meta: MetaRef,
    pub value_meta: MetaRef,
}

/// What a call to [`SlotAllocator::free`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FreeOutcome {
    /// The segment was already free; nothing changed
    AlreadyFree,
    /// Freed, coalesced and put on the free list
    Freed,
    /// Freed and its block became empty and was released
    BlockReleased,
    /// Freed on a locked slot; space is recovered on unlock
    Deferred,
}

/// Heap allocator with one independent heap per hash slot
pub struct SlotAllocator<M: EntryMeta = ObjectMeta> {
    config: AllocatorConfig,
    slots: Vec<SlotState>,
    next_block_id: u32,
    _meta: PhantomData<fn() -> M>,
}

impl<M: EntryMeta> SlotAllocator<M> {
    /// Create an allocator with every slot empty and unlocked
    pub fn new(config: AllocatorConfig) -> Result<Self> {
        config.validate()?;
        let slots = (0..config.slot_count).map(|_| SlotState::default()).collect();
        info!(
            block_capacity = config.block_capacity,
            slot_count = config.slot_count,
            "Initializing slot allocator"
        );
        Ok(Self {
            config,
            slots,
            next_block_id: 0,
            _meta: PhantomData,
        })
    }

    /// Reset every slot, releasing all blocks
    pub fn init(&mut self) {
        self.destroy_all();
        for state in &mut self.slots {
            *state = state.successor();
        }
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    pub fn block_capacity(&self) -> usize {
        self.config.block_capacity
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Segment size an entry with these lengths would occupy
    pub fn required_segment_size(&self, key_len: usize, value_len: usize) -> usize {
        segment_size(key_len, value_len, M::ENCODED_LEN, M::ENCODED_LEN)
    }

    /// Smallest segment that can hold an entry: both records and two empty fields
    pub(crate) fn min_entry_size() -> usize {
        segment_size(0, 0, M::ENCODED_LEN, M::ENCODED_LEN)
    }

    fn slot_index(&self, slot: SlotId) -> Result<usize> {
        let idx = slot.index();
        if idx >= self.slots.len() {
            return Err(Error::SlotOutOfRange {
                slot: slot.0 as u32,
                count: self.slots.len(),
            });
        }
        Ok(idx)
    }

    pub(crate) fn slot_state(&self, slot: SlotId) -> Result<&SlotState> {
        let idx = self.slot_index(slot)?;
        Ok(&self.slots[idx])
    }

    pub(crate) fn slot_state_mut(&mut self, slot: SlotId) -> Result<&mut SlotState> {
        let idx = self.slot_index(slot)?;
        Ok(&mut self.slots[idx])
    }

    pub(crate) fn fresh_block_id(&mut self) -> Result<BlockId> {
        // u32::MAX encodes a nil free-list link
        if self.next_block_id == u32::MAX {
            return Err(Error::BlockIdsExhausted(BlockId(self.next_block_id - 1)));
        }
        let id = BlockId(self.next_block_id);
        self.next_block_id += 1;
        Ok(id)
    }

    /// Push a fresh, entirely free block at the front of the slot's block list
    ///
    /// The new block's segment is not put on the free list.
    pub fn allocate_empty_block(&mut self, slot: SlotId) -> Result<BlockId> {
        let idx = self.slot_index(slot)?;
        let id = self.fresh_block_id()?;
        self.slots[idx].push_front(Block::new(id, self.config.block_capacity));

        BLOCKS_ALLOCATED.inc();
        LIVE_BLOCKS.inc();
        debug!(%slot, block = %id, blocks = self.slots[idx].blocks.len(), "Allocated block");
        Ok(id)
    }

    /// Store a key/value pair with its two metadata records
    ///
    /// Both records get their `data_offset` patched before being copied into
    /// the segment. Later references must go through the returned
    /// [`MetaRef`]s, not the caller's copies.
    pub fn insert(
        &mut self,
        slot: SlotId,
        key: &[u8],
        value: &[u8],
        key_meta: &mut M,
        value_meta: &mut M,
    ) -> Result<Insertion> {
        let size = self.required_segment_size(key.len(), value.len());
        if size > self.config.block_capacity {
            return Err(Error::EntryTooLarge {
                size,
                capacity: self.config.block_capacity,
            });
        }
        let idx = self.slot_index(slot)?;

        let fit = {
            let state = &self.slots[idx];
            state.free.find_fit(&state.blocks, size)?
        };
        let (seg, new_block) = match fit {
            Some(seg) => (seg, false),
            None => {
                let id = self.allocate_empty_block(slot)?;
                let seg = SegmentRef::new(id, FIRST_PAYLOAD);
                let state = &mut self.slots[idx];
                state.free.insert(&mut state.blocks, seg)?;
                (seg, true)
            }
        };

        let state = &mut self.slots[idx];
        state.free.remove(&mut state.blocks, seg)?;

        let meta_len = M::ENCODED_LEN;
        let p = seg.pos();
        let remainder = {
            let block = state
                .blocks
                .get_mut(&seg.block)
                .ok_or_else(|| Error::Corrupted(format!("free list points into missing {}", seg.block)))?;
            let header = block.arena.header(p);
            let free_size = header.size();

            let (taken, remainder) = if free_size - size >= MIN_SEGMENT_SIZE {
                block.arena.put_boundary(p, size, true);
                let rest = p + size;
                block.arena.put_boundary(rest, free_size - size, false);
                if header.has_realloc_tag() {
                    block.arena.set_realloc_tag(rest, true);
                }
                (size, Some(SegmentRef::new(seg.block, rest)))
            } else {
                block.arena.put_boundary_keep_tag(p, free_size, true);
                (free_size, None)
            };
            block.note_allocated(taken);

            key_meta.set_data_offset((2 * meta_len + LENGTH_FIELD_SIZE) as u32);
            value_meta.set_data_offset((meta_len + LENGTH_FIELD_SIZE + key.len() + LENGTH_FIELD_SIZE) as u32);
            key_meta.encode(block.arena.bytes_mut(p, meta_len));
            value_meta.encode(block.arena.bytes_mut(p + meta_len, meta_len));
            let at = block.arena.write_prefixed(p + 2 * meta_len, key);
            block.arena.write_prefixed(at, value);
            remainder
        };
        if let Some(rest) = remainder {
            state.free.insert(&mut state.blocks, rest)?;
        }
        state.live_segments += 1;
        ENTRIES_INSERTED.inc();

        Ok(Insertion {
            segment: SegmentRef::new(seg.block, p),
            new_block,
            key_meta: MetaRef::new(seg.block, p),
            value_meta: MetaRef::new(seg.block, p + meta_len),
        })
    }

    /// Free the segment whose key record sits at `handle`
    pub fn free(&mut self, slot: SlotId, handle: MetaRef) -> Result<FreeOutcome> {
        let idx = self.slot_index(slot)?;

        if !self.slots[idx].blocks.contains_key(&handle.block) {
            if self.slots[idx].released.contains(&handle.block) {
                warn!(%slot, %handle, "Free of a segment whose block was already released");
                DOUBLE_FREES.inc();
                return Ok(FreeOutcome::AlreadyFree);
            }
            return Err(Error::InvalidHandle(format!(
                "{} does not belong to {}",
                handle.block, slot
            )));
        }

        let state = &mut self.slots[idx];
        let locked = state.locked;
        let p = handle.pos();
        let size = {
            let block = state
                .blocks
                .get_mut(&handle.block)
                .ok_or_else(|| Error::InvalidHandle(format!("{} vanished", handle.block)))?;
            if p < FIRST_PAYLOAD || p >= block.end() || p % ALIGNMENT != 0 {
                return Err(Error::InvalidHandle(format!(
                    "offset {} is not a segment position in {}",
                    p, handle.block
                )));
            }
            if !block.arena.header(p).is_allocated() {
                warn!(%slot, %handle, "Double free ignored");
                DOUBLE_FREES.inc();
                return Ok(FreeOutcome::AlreadyFree);
            }
            let size = block.check_segment(p)?.size();
            block.arena.put_boundary_keep_tag(p, size, false);
            block.note_freed(size);
            size
        };
        state.live_segments = state.live_segments.saturating_sub(1);
        ENTRIES_FREED.inc();

        if locked {
            debug!(%slot, %handle, size, "Deferred free on locked slot");
            return Ok(FreeOutcome::Deferred);
        }
        self.coalesce(idx, slot, SegmentRef::new(handle.block, p))
    }

    /// Merge a just-freed segment with its free neighbors, then list it or
    /// release its block
    fn coalesce(&mut self, idx: usize, slot: SlotId, seg: SegmentRef) -> Result<FreeOutcome> {
        let state = &mut self.slots[idx];
        let p = seg.pos();
        let (size, next, prev) = {
            let block = state
                .blocks
                .get(&seg.block)
                .ok_or_else(|| Error::Corrupted(format!("coalescing in missing {}", seg.block)))?;
            let size = block.arena.header(p).size();

            let next_p = p + size;
            let next_header = block.arena.header(next_p);
            let next = (!next_header.is_allocated()).then(|| (next_p, next_header.size()));

            let prev_p = block.arena.prev_payload(p);
            let prev = if prev_p != p && !block.arena.header(prev_p).is_allocated() {
                Some((prev_p, p - prev_p))
            } else {
                None
            };
            (size, next, prev)
        };

        let mut start = p;
        let mut total = size;
        if let Some((next_p, next_size)) = next {
            state.free.remove(&mut state.blocks, SegmentRef::new(seg.block, next_p))?;
            total += next_size;
        }
        if let Some((prev_p, prev_size)) = prev {
            state.free.remove(&mut state.blocks, SegmentRef::new(seg.block, prev_p))?;
            start = prev_p;
            total += prev_size;
        }

        let spans_block = {
            let block = state
                .blocks
                .get_mut(&seg.block)
                .ok_or_else(|| Error::Corrupted(format!("coalescing in missing {}", seg.block)))?;
            if total != size {
                block.arena.put_boundary_keep_tag(start, total, false);
            }
            block.spans_block(start)
        };
        if total != size {
            // boundaries inside the merged run no longer exist
            state.epoch += 1;
        }

        if spans_block {
            self.release_block(idx, slot, seg.block);
            return Ok(FreeOutcome::BlockReleased);
        }
        let state = &mut self.slots[idx];
        state.free.insert(&mut state.blocks, SegmentRef::new(seg.block, start))?;
        Ok(FreeOutcome::Freed)
    }

    fn release_block(&mut self, idx: usize, slot: SlotId, id: BlockId) {
        let state = &mut self.slots[idx];
        if state.unlink(id).is_some() {
            state.released.insert(id);
            state.epoch += 1;
            BLOCKS_RELEASED.inc();
            LIVE_BLOCKS.dec();
            debug!(%slot, block = %id, blocks = state.blocks.len(), "Released empty block");
        }
    }

    /// Freeze the slot's free space for migration
    pub fn lock(&mut self, slot: SlotId) -> Result<()> {
        let state = self.slot_state_mut(slot)?;
        state.locked = true;
        state.free.clear();
        SLOT_LOCKS.inc();
        info!(%slot, blocks = state.blocks.len(), "Locked slot");
        Ok(())
    }

    /// Lift the lock and recover every segment freed while it was held
    pub fn unlock(&mut self, slot: SlotId) -> Result<()> {
        let idx = self.slot_index(slot)?;
        if !self.slots[idx].locked {
            return Ok(());
        }
        self.slots[idx].locked = false;
        let released = self.rebuild_free_space(idx, slot)?;
        info!(%slot, released, "Unlocked slot");
        Ok(())
    }

    pub fn is_locked(&self, slot: SlotId) -> Result<bool> {
        Ok(self.slot_state(slot)?.locked)
    }

    /// Rescan every block of a slot: merge free runs, drop empty blocks,
    /// rebuild the free list and the counters. Returns released block count.
    pub(crate) fn rebuild_free_space(&mut self, idx: usize, slot: SlotId) -> Result<usize> {
        let mut empty = Vec::new();
        let mut free = Vec::new();
        let mut live = 0;
        {
            let state = &mut self.slots[idx];
            state.free.clear();
            for id in state.block_ids() {
                let Some(block) = state.blocks.get_mut(&id) else {
                    continue;
                };
                let runs = block.merge_free_runs();
                let census = block.resync_counters();
                if census.segments_used == 0 {
                    empty.push(id);
                } else {
                    live += census.segments_used;
                    free.extend(runs.into_iter().map(|p| SegmentRef::new(id, p)));
                }
            }
        }

        let released = empty.len();
        for id in empty {
            self.release_block(idx, slot, id);
        }

        let state = &mut self.slots[idx];
        // inserting in reverse leaves the list in block order
        for seg in free.into_iter().rev() {
            state.free.insert(&mut state.blocks, seg)?;
        }
        state.live_segments = live;
        state.epoch += 1;
        Ok(released)
    }

    /// Independent cursor over the slot's live entries
    pub fn cursor(&self, slot: SlotId) -> Result<SlotCursor> {
        let state = self.slot_state(slot)?;
        Ok(SlotCursor::new(slot, state.head, state.epoch))
    }

    /// Borrowing iterator over the slot's live entries
    pub fn drain(&mut self, slot: SlotId) -> Result<Drain<'_, M>> {
        let cursor = self.cursor(slot)?;
        Ok(Drain::new(self, cursor))
    }

    /// Release every block of the slot and reset it
    pub fn destroy_slot(&mut self, slot: SlotId) -> Result<()> {
        let state = self.slot_state_mut(slot)?;
        let blocks = state.blocks.len();
        *state = state.successor();

        if blocks > 0 {
            BLOCKS_RELEASED.inc_by(blocks as u64);
            LIVE_BLOCKS.sub(blocks as i64);
        }
        info!(%slot, blocks, "Destroyed slot");
        Ok(())
    }

    /// Release every block of every slot
    pub fn destroy_all(&mut self) {
        let mut total = 0;
        for state in &mut self.slots {
            if state.is_empty() && !state.locked {
                continue;
            }
            total += state.blocks.len();
            *state = state.successor();
        }
        if total > 0 {
            BLOCKS_RELEASED.inc_by(total as u64);
            LIVE_BLOCKS.sub(total as i64);
        }
        info!(blocks = total, "Destroyed all slots");
    }

    /// Snapshot of one slot
    pub fn stats(&self, slot: SlotId) -> Result<SlotStats> {
        let state = self.slot_state(slot)?;
        let mut stats = SlotStats {
            slot: slot.0,
            blocks: state.blocks.len(),
            free_list_len: state.free.len(),
            locked: state.locked,
            ..SlotStats::default()
        };
        for block in state.blocks.values() {
            let census = block.census();
            stats.bytes_used += block.bytes_used();
            stats.bytes_free += block.bytes_free();
            stats.segments_used += census.segments_used;
            stats.segments_free += census.segments_free;
        }
        stats.deferred_segments = stats.segments_free.saturating_sub(stats.free_list_len);
        Ok(stats)
    }

    /// Totals across the whole table
    pub fn totals(&self) -> AllocatorStats {
        let mut totals = AllocatorStats::default();
        for state in &self.slots {
            if state.locked {
                totals.locked_slots += 1;
            }
            if state.is_empty() {
                continue;
            }
            totals.slots_in_use += 1;
            totals.blocks += state.blocks.len();
            totals.segments_used += state.live_segments;
            for block in state.blocks.values() {
                totals.bytes_used += block.bytes_used();
                totals.bytes_free += block.bytes_free();
            }
        }
        totals
    }

    /// Slots that currently own blocks
    pub fn occupied_slots(&self) -> Vec<SlotId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.is_empty())
            .map(|(i, _)| SlotId(i as u16))
            .collect()
    }

    /// Block ids of a slot, head first
    pub fn block_ids(&self, slot: SlotId) -> Result<Vec<BlockId>> {
        Ok(self.slot_state(slot)?.block_ids())
    }

    /// Raw buffers of a slot's blocks, head first
    pub fn block_buffers(&self, slot: SlotId) -> Result<Vec<&[u8]>> {
        let state = self.slot_state(slot)?;
        Ok(state
            .block_ids()
            .into_iter()
            .filter_map(|id| state.blocks.get(&id))
            .map(|b| b.buffer())
            .collect())
    }

    /// Decode the entry whose key record sits at `handle`
    pub fn entry(&self, slot: SlotId, handle: MetaRef) -> Result<EntryView<'_, M>> {
        let state = self.slot_state(slot)?;
        let block = state
            .blocks
            .get(&handle.block)
            .ok_or_else(|| Error::InvalidHandle(format!("{} does not belong to {}", handle.block, slot)))?;
        let p = handle.pos();
        let header = block.check_segment(p)?;
        if !header.is_allocated() {
            return Err(Error::InvalidHandle(format!("segment {} is free", handle)));
        }
        if header.size() < Self::min_entry_size() {
            return Err(Error::Corrupted(format!(
                "segment {} of {} bytes cannot hold an entry",
                handle,
                header.size()
            )));
        }

        let meta_len = M::ENCODED_LEN;
        let limit = p + header.size() - 2 * WSIZE;
        let key_meta = M::decode(block.arena.bytes(p, meta_len))?;
        let value_meta = M::decode(block.arena.bytes(p + meta_len, meta_len))?;

        let key = prefixed_field(block, p, key_meta.data_offset(), limit)?;
        let value = prefixed_field(block, p + meta_len, value_meta.data_offset(), limit)?;
        Ok(EntryView {
            key_meta,
            value_meta,
            key,
            value,
        })
    }

    /// Walk a slot checking every structural property of its heap
    ///
    /// Intended for tests and offline inspection; cost is linear in the
    /// number of segments.
    pub fn check_slot(&self, slot: SlotId) -> Result<()> {
        let state = self.slot_state(slot)?;
        let capacity = self.config.block_capacity;

        let listed: HashSet<SegmentRef> = state.free.segments(&state.blocks)?.into_iter().collect();
        if listed.len() != state.free.len() {
            return Err(Error::Corrupted(format!(
                "{}: free list length {} but {} reachable",
                slot,
                state.free.len(),
                listed.len()
            )));
        }
        for seg in &listed {
            let listed_free = state
                .blocks
                .get(&seg.block)
                .map_or(false, |b| !b.arena.header(seg.pos()).is_allocated());
            if !listed_free {
                return Err(Error::Corrupted(format!("{}: free list holds in-use {}", slot, seg)));
            }
        }

        let mut free_unlisted = 0;
        for id in state.block_ids() {
            let Some(block) = state.blocks.get(&id) else {
                return Err(Error::Corrupted(format!("{}: list names missing {}", slot, id)));
            };
            if block.bytes_used() + block.bytes_free() != capacity {
                return Err(Error::Corrupted(format!("{}: {} counters do not add up", slot, id)));
            }
            let census = block.census();
            if census.bytes_used != block.bytes_used() {
                return Err(Error::Corrupted(format!(
                    "{}: {} reports {} used bytes, walk found {}",
                    slot,
                    id,
                    block.bytes_used(),
                    census.bytes_used
                )));
            }
            let mut prev_free = false;
            for (p, tag) in block.segments() {
                block.check_segment(p).map_err(|e| Error::Corrupted(e.to_string()))?;
                let free = !tag.is_allocated();
                if free && prev_free && !state.locked {
                    return Err(Error::Corrupted(format!(
                        "{}: adjacent free segments at {}+{}",
                        slot, id, p
                    )));
                }
                if free && !listed.contains(&SegmentRef::new(id, p)) {
                    free_unlisted += 1;
                }
                prev_free = free;
            }
        }
        if !state.locked && free_unlisted > 0 {
            return Err(Error::Corrupted(format!(
                "{}: {} free segment(s) missing from the free list",
                slot, free_unlisted
            )));
        }
        Ok(())
    }
}

/// Read a `u32`-prefixed field whose bytes start `offset` past `record`
fn prefixed_field(block: &Block, record: usize, offset: u32, limit: usize) -> Result<&[u8]> {
    let start = record + offset as usize;
    if start < record + LENGTH_FIELD_SIZE || start > limit {
        return Err(Error::Corrupted(format!(
            "data offset {} out of bounds in {}",
            offset,
            block.id()
        )));
    }
    let len = block.arena.word(start - LENGTH_FIELD_SIZE) as usize;
    if start + len > limit {
        return Err(Error::Corrupted(format!(
            "field of {} bytes overruns its segment in {}",
            len,
            block.id()
        )));
    }
    Ok(block.arena.bytes(start, len))
}
