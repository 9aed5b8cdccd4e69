//! Fixed-capacity blocks
//!
//! A block owns one arena of `capacity` usable bytes bounded by a prologue
//! and an epilogue sentinel. A fresh block holds a single free segment that
//! spans the whole capacity.

use super::layout::{Arena, BoundaryTag, FIRST_PAYLOAD, MIN_SEGMENT_SIZE, WSIZE};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a block, unique for the lifetime of an allocator
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId(pub u32);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block#{}", self.0)
    }
}

/// Per-block segment counts gathered by a walk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockCensus {
    pub segments_used: usize,
    pub segments_free: usize,
    pub bytes_used: usize,
}

/// One block of a slot's heap
#[derive(Debug)]
pub struct Block {
    pub(crate) id: BlockId,
    pub(crate) arena: Arena,
    capacity: usize,
    pub(crate) bytes_used: usize,
    pub(crate) bytes_free: usize,
    pub(crate) prev: Option<BlockId>,
    pub(crate) next: Option<BlockId>,
}

impl Block {
    /// Create an empty block: prologue, one free segment, epilogue
    pub fn new(id: BlockId, capacity: usize) -> Self {
        let mut arena = Arena::zeroed(capacity);
        arena.put_word(0, BoundaryTag::sentinel().raw());
        arena.put_boundary(FIRST_PAYLOAD, capacity, false);
        arena.put_word(WSIZE + capacity, BoundaryTag::sentinel().raw());

        Self {
            id,
            arena,
            capacity,
            bytes_used: 0,
            bytes_free: capacity,
            prev: None,
            next: None,
        }
    }

    /// Adopt a dumped buffer after checking its boundary tags
    ///
    /// Counters are provisional until the owning slot rescans the block.
    pub fn from_buffer(id: BlockId, capacity: usize, buffer: Vec<u8>) -> Result<Self> {
        if buffer.len() != capacity + 2 * WSIZE {
            return Err(Error::Corrupted(format!(
                "block buffer is {} bytes, expected {}",
                buffer.len(),
                capacity + 2 * WSIZE
            )));
        }
        let block = Self {
            id,
            arena: Arena::from_vec(buffer),
            capacity,
            bytes_used: 0,
            bytes_free: capacity,
            prev: None,
            next: None,
        };
        block.verify()?;
        Ok(block)
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    pub fn bytes_free(&self) -> usize {
        self.bytes_free
    }

    /// Raw buffer: prologue word, capacity bytes, epilogue word
    pub fn buffer(&self) -> &[u8] {
        self.arena.as_bytes()
    }

    /// Payload offset just past the last usable byte (the epilogue's payload)
    pub fn end(&self) -> usize {
        FIRST_PAYLOAD + self.capacity
    }

    pub(crate) fn note_allocated(&mut self, size: usize) {
        self.bytes_used += size;
        self.bytes_free -= size;
    }

    pub(crate) fn note_freed(&mut self, size: usize) {
        self.bytes_used -= size;
        self.bytes_free += size;
    }

    /// Whether the free segment at `p` spans the whole block
    pub(crate) fn spans_block(&self, p: usize) -> bool {
        self.arena.prev_payload(p) == p && self.arena.header(self.arena.next_payload(p)).is_sentinel()
    }

    /// Check that `p` plausibly starts a segment of this block
    ///
    /// Constant time: range, alignment, size and header/footer agreement.
    pub(crate) fn check_segment(&self, p: usize) -> Result<BoundaryTag> {
        if p < FIRST_PAYLOAD || p >= self.end() || p % 8 != 0 {
            return Err(Error::InvalidHandle(format!(
                "offset {} is not a segment position in {}",
                p, self.id
            )));
        }
        let header = self.arena.header(p);
        let size = header.size();
        if size < MIN_SEGMENT_SIZE || size % 8 != 0 || p + size > self.end() {
            return Err(Error::InvalidHandle(format!(
                "segment at {} in {} has implausible size {}",
                p, self.id, size
            )));
        }
        let footer = self.arena.footer(p);
        if footer.size() != size || footer.is_allocated() != header.is_allocated() {
            return Err(Error::InvalidHandle(format!(
                "segment at {} in {} has mismatched boundary tags",
                p, self.id
            )));
        }
        Ok(header)
    }

    /// Iterate `(payload offset, header)` over every segment, sentinels excluded
    pub fn segments(&self) -> Segments<'_> {
        Segments {
            block: self,
            pos: FIRST_PAYLOAD,
        }
    }

    /// Count segments and in-use bytes
    pub fn census(&self) -> BlockCensus {
        let mut census = BlockCensus::default();
        for (_, tag) in self.segments() {
            if tag.is_allocated() {
                census.segments_used += 1;
                census.bytes_used += tag.size();
            } else {
                census.segments_free += 1;
            }
        }
        census
    }

    /// Recompute `bytes_used`/`bytes_free` from the segment walk
    pub(crate) fn resync_counters(&mut self) -> BlockCensus {
        let census = self.census();
        self.bytes_used = census.bytes_used;
        self.bytes_free = self.capacity - census.bytes_used;
        census
    }

    /// Merge every run of adjacent free segments in place
    ///
    /// Returns the payload offsets of the surviving free segments.
    pub(crate) fn merge_free_runs(&mut self) -> Vec<usize> {
        let mut free = Vec::new();
        let mut p = FIRST_PAYLOAD;
        loop {
            let header = self.arena.header(p);
            if header.is_sentinel() {
                break;
            }
            if header.is_allocated() {
                p += header.size();
                continue;
            }
            let mut size = header.size();
            loop {
                let next = self.arena.header(p + size);
                if next.is_sentinel() || next.is_allocated() {
                    break;
                }
                size += next.size();
            }
            if size != header.size() {
                self.arena.put_boundary_keep_tag(p, size, false);
            }
            free.push(p);
            p += size;
        }
        free
    }

    /// Walk the block verifying every boundary tag
    fn verify(&self) -> Result<()> {
        let prologue = BoundaryTag::from_raw(self.arena.word(0));
        if !prologue.is_sentinel() || !prologue.is_allocated() {
            return Err(Error::Corrupted(format!("{} has no prologue", self.id)));
        }
        let epilogue = BoundaryTag::from_raw(self.arena.word(WSIZE + self.capacity));
        if !epilogue.is_sentinel() || !epilogue.is_allocated() {
            return Err(Error::Corrupted(format!("{} has no epilogue", self.id)));
        }

        let mut p = FIRST_PAYLOAD;
        while p < self.end() {
            let header = self.arena.header(p);
            let size = header.size();
            if size < MIN_SEGMENT_SIZE || p + size > self.end() {
                return Err(Error::Corrupted(format!(
                    "{}: segment at {} has size {}",
                    self.id, p, size
                )));
            }
            let footer = self.arena.footer(p);
            if footer.size() != size || footer.is_allocated() != header.is_allocated() {
                return Err(Error::Corrupted(format!(
                    "{}: header and footer disagree at {}",
                    self.id, p
                )));
            }
            p += size;
        }
        if p != self.end() {
            return Err(Error::Corrupted(format!(
                "{}: segments overrun the epilogue",
                self.id
            )));
        }
        Ok(())
    }
}

/// Forward walk over a block's segments
pub struct Segments<'a> {
    block: &'a Block,
    pos: usize,
}

impl Iterator for Segments<'_> {
    type Item = (usize, BoundaryTag);

    fn next(&mut self) -> Option<Self::Item> {
        let header = self.block.arena.header(self.pos);
        if header.is_sentinel() {
            return None;
        }
        let p = self.pos;
        self.pos += header.size();
        Some((p, header))
    }
}
