//! Slot table entries
//!
//! Each hash slot owns an independent heap: a doubly linked list of blocks,
//! one free list spanning them, and a lock flag used while the slot is being
//! migrated away.

use super::block::{Block, BlockId};
use super::free_list::FreeList;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Number of hash slots in a cluster key space
pub const SLOT_COUNT: usize = 16384;

/// Hash slot identifier (0..16383)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotId(pub u16);

impl SlotId {
    pub fn new(id: u16) -> Self {
        Self(id)
    }

    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl From<u16> for SlotId {
    fn from(id: u16) -> Self {
        Self(id)
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Slot({})", self.0)
    }
}

/// CRC16/XMODEM (poly 0x1021, init 0), as used for cluster key slots
fn crc16(bytes: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &b in bytes {
        crc ^= (b as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Map a key to its hash slot
///
/// When the key contains a non-empty `{...}` section only that part is
/// hashed, so related keys can be pinned to one slot.
pub fn key_hash_slot(key: &[u8]) -> SlotId {
    let hashed = match key.iter().position(|&b| b == b'{') {
        Some(open) => match key[open + 1..].iter().position(|&b| b == b'}') {
            Some(len) if len > 0 => &key[open + 1..open + 1 + len],
            _ => key,
        },
        None => key,
    };
    SlotId(crc16(hashed) & (SLOT_COUNT as u16 - 1))
}

/// Point-in-time view of one slot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotStats {
    pub slot: u16,
    pub blocks: usize,
    pub bytes_used: usize,
    pub bytes_free: usize,
    pub segments_used: usize,
    pub segments_free: usize,
    pub free_list_len: usize,
    /// Free segments not yet returned to the free list (locked slots)
    pub deferred_segments: usize,
    pub locked: bool,
}

/// Totals across every slot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatorStats {
    pub slots_in_use: usize,
    pub locked_slots: usize,
    pub blocks: usize,
    pub bytes_used: usize,
    pub bytes_free: usize,
    pub segments_used: usize,
}

/// Mutable state of one slot
#[derive(Debug, Default)]
pub(crate) struct SlotState {
    pub(crate) blocks: HashMap<BlockId, Block>,
    pub(crate) head: Option<BlockId>,
    pub(crate) free: FreeList,
    pub(crate) locked: bool,
    pub(crate) live_segments: usize,
    /// Bumped whenever segment boundaries disappear; cursors compare it
    pub(crate) epoch: u64,
    /// Blocks this slot has given back; frees naming them are double frees
    pub(crate) released: HashSet<BlockId>,
}

impl SlotState {
    /// Empty state that keeps the epoch moving forward
    ///
    /// Blocks dropped with the old state join the released set.
    pub(crate) fn successor(&self) -> Self {
        let mut released = self.released.clone();
        released.extend(self.blocks.keys().copied());
        Self {
            epoch: self.epoch + 1,
            released,
            ..Self::default()
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub(crate) fn push_front(&mut self, mut block: Block) {
        let id = block.id;
        block.prev = None;
        block.next = self.head;
        if let Some(old) = self.head.and_then(|h| self.blocks.get_mut(&h)) {
            old.prev = Some(id);
        }
        self.head = Some(id);
        self.blocks.insert(id, block);
    }

    /// Remove a block from the list and the map
    pub(crate) fn unlink(&mut self, id: BlockId) -> Option<Block> {
        let block = self.blocks.remove(&id)?;
        match block.prev.and_then(|p| self.blocks.get_mut(&p)) {
            Some(prev) => prev.next = block.next,
            None => self.head = block.next,
        }
        if let Some(next) = block.next.and_then(|n| self.blocks.get_mut(&n)) {
            next.prev = block.prev;
        }
        Some(block)
    }

    /// Block ids in list order, head first
    pub(crate) fn block_ids(&self) -> Vec<BlockId> {
        let mut ids = Vec::with_capacity(self.blocks.len());
        let mut cursor = self.head;
        while let Some(id) = cursor {
            ids.push(id);
            cursor = self.blocks.get(&id).and_then(|b| b.next);
        }
        ids
    }
}
