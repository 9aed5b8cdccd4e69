//! Segment layout primitives
//!
//! Every block buffer is an owned byte arena laid out as
//!
//! ```text
//! offset 0        4                                         4 + C    8 + C
//!        +--------+-----------------------------------------+--------+
//!        |prologue| hdr | payload ............. | ftr | hdr |epilogue|
//!        | (0, A) |<---------- segment ------------->| ... | (0, A) |
//!        +--------+-----------------------------------------+--------+
//! ```
//!
//! A segment is addressed by its payload offset `p`. The header word sits at
//! `p - 4`, the footer at `p + size - 8`, and `size` covers header, payload,
//! padding and footer. Sizes are multiples of 8 so the low three bits of a
//! boundary word carry flags:
//!
//! ```text
//! bit 0  allocated
//! bit 1  reallocation tag (carried across in-place rewrites)
//! ```
//!
//! While a segment is free its first 16 payload bytes hold the next/prev
//! free-list links, each an 8-byte `(block id, offset)` pair.
//!
//! All raw byte access to block buffers goes through [`Arena`].

use super::block::BlockId;
use super::free_list::SegmentRef;

/// Header/footer word size
pub const WSIZE: usize = 4;
/// Double word size
pub const DSIZE: usize = 8;
/// Segment alignment
pub const ALIGNMENT: usize = 8;
/// Per-segment bytes taken by header + footer
pub const OVERHEAD: usize = 8;
/// Smallest segment: header + next link + prev link + footer
pub const MIN_SEGMENT_SIZE: usize = 24;
/// Length prefix written before key and value bytes
pub const LENGTH_FIELD_SIZE: usize = 4;
/// Payload offset of the first segment in every block
pub const FIRST_PAYLOAD: usize = 2 * WSIZE;

const ALLOC_BIT: u32 = 0x1;
const TAG_BIT: u32 = 0x2;
const FLAG_MASK: u32 = 0x7;

const LINK_SIZE: usize = 8;
const NIL_BLOCK: u32 = u32::MAX;

/// Round up to the next multiple of [`ALIGNMENT`]
pub const fn align(n: usize) -> usize {
    (n + (ALIGNMENT - 1)) & !(ALIGNMENT - 1)
}

/// Segment size needed for an entry, header and footer included
pub const fn segment_size(
    key_len: usize,
    value_len: usize,
    key_meta_len: usize,
    value_meta_len: usize,
) -> usize {
    let payload = key_len + value_len + key_meta_len + value_meta_len + 2 * LENGTH_FIELD_SIZE;
    let size = align(payload) + OVERHEAD;
    if size > MIN_SEGMENT_SIZE {
        size
    } else {
        MIN_SEGMENT_SIZE
    }
}

/// A decoded boundary word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundaryTag(u32);

impl BoundaryTag {
    /// Pack a size and allocated bit into a word
    pub fn pack(size: usize, allocated: bool) -> Self {
        let mut word = size as u32 & !FLAG_MASK;
        if allocated {
            word |= ALLOC_BIT;
        }
        Self(word)
    }

    /// Decode a raw boundary word
    pub fn from_raw(word: u32) -> Self {
        Self(word)
    }

    /// Sentinel word bounding each end of a block
    pub fn sentinel() -> Self {
        Self::pack(0, true)
    }

    pub fn size(self) -> usize {
        (self.0 & !FLAG_MASK) as usize
    }

    pub fn is_allocated(self) -> bool {
        self.0 & ALLOC_BIT != 0
    }

    pub fn has_realloc_tag(self) -> bool {
        self.0 & TAG_BIT != 0
    }

    pub fn is_sentinel(self) -> bool {
        self.size() == 0
    }

    fn with_realloc_tag(self, tag: bool) -> Self {
        if tag {
            Self(self.0 | TAG_BIT)
        } else {
            Self(self.0 & !TAG_BIT)
        }
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

/// Owned byte arena backing one block, with typed boundary-tag access
#[derive(Debug)]
pub struct Arena {
    bytes: Box<[u8]>,
}

impl Arena {
    /// Zeroed arena for a block of `capacity` usable bytes
    pub fn zeroed(capacity: usize) -> Self {
        Self {
            bytes: vec![0u8; capacity + 2 * WSIZE].into_boxed_slice(),
        }
    }

    /// Wrap an existing buffer (used when loading dumped blocks)
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            bytes: bytes.into_boxed_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn word(&self, pos: usize) -> u32 {
        let mut w = [0u8; WSIZE];
        w.copy_from_slice(&self.bytes[pos..pos + WSIZE]);
        u32::from_le_bytes(w)
    }

    pub fn put_word(&mut self, pos: usize, word: u32) {
        self.bytes[pos..pos + WSIZE].copy_from_slice(&word.to_le_bytes());
    }

    /// Whether a whole word fits at `pos`
    pub fn has_word(&self, pos: usize) -> bool {
        pos.checked_add(WSIZE).map_or(false, |end| end <= self.bytes.len())
    }

    /// Header of the segment whose payload starts at `p`
    pub fn header(&self, p: usize) -> BoundaryTag {
        BoundaryTag(self.word(p - WSIZE))
    }

    /// Footer of the segment whose payload starts at `p`
    pub fn footer(&self, p: usize) -> BoundaryTag {
        BoundaryTag(self.word(p + self.header(p).size() - DSIZE))
    }

    /// Write header and footer without touching the reallocation tag
    pub fn put_boundary(&mut self, p: usize, size: usize, allocated: bool) {
        let tag = BoundaryTag::pack(size, allocated);
        self.put_word(p - WSIZE, tag.raw());
        self.put_word(p + size - DSIZE, tag.raw());
    }

    /// Write header and footer, keeping the reallocation tag of the old header
    pub fn put_boundary_keep_tag(&mut self, p: usize, size: usize, allocated: bool) {
        let keep = self.header(p).has_realloc_tag();
        let tag = BoundaryTag::pack(size, allocated).with_realloc_tag(keep);
        self.put_word(p - WSIZE, tag.raw());
        self.put_word(p + size - DSIZE, tag.raw());
    }

    /// Set or clear the reallocation tag in header and footer
    pub fn set_realloc_tag(&mut self, p: usize, tag: bool) {
        let header = self.header(p);
        let word = header.with_realloc_tag(tag).raw();
        self.put_word(p - WSIZE, word);
        self.put_word(p + header.size() - DSIZE, word);
    }

    /// Payload offset of the following segment
    pub fn next_payload(&self, p: usize) -> usize {
        p + self.header(p).size()
    }

    /// Payload offset of the preceding segment, read through its footer.
    /// Returns `p` itself when the preceding word is the prologue.
    pub fn prev_payload(&self, p: usize) -> usize {
        p - BoundaryTag(self.word(p - DSIZE)).size()
    }

    pub fn next_link(&self, p: usize) -> Option<SegmentRef> {
        self.link(p)
    }

    pub fn prev_link(&self, p: usize) -> Option<SegmentRef> {
        self.link(p + LINK_SIZE)
    }

    pub fn set_next_link(&mut self, p: usize, link: Option<SegmentRef>) {
        self.put_link(p, link);
    }

    pub fn set_prev_link(&mut self, p: usize, link: Option<SegmentRef>) {
        self.put_link(p + LINK_SIZE, link);
    }

    fn link(&self, pos: usize) -> Option<SegmentRef> {
        let block = self.word(pos);
        if block == NIL_BLOCK {
            return None;
        }
        Some(SegmentRef::new(BlockId(block), self.word(pos + WSIZE) as usize))
    }

    fn put_link(&mut self, pos: usize, link: Option<SegmentRef>) {
        match link {
            Some(seg) => {
                self.put_word(pos, seg.block.0);
                self.put_word(pos + WSIZE, seg.offset);
            }
            None => {
                self.put_word(pos, NIL_BLOCK);
                self.put_word(pos + WSIZE, 0);
            }
        }
    }

    pub fn bytes(&self, pos: usize, len: usize) -> &[u8] {
        &self.bytes[pos..pos + len]
    }

    pub fn bytes_mut(&mut self, pos: usize, len: usize) -> &mut [u8] {
        &mut self.bytes[pos..pos + len]
    }

    /// Copy `data` to `pos`, returning the position after it
    pub fn write_at(&mut self, pos: usize, data: &[u8]) -> usize {
        self.bytes[pos..pos + data.len()].copy_from_slice(data);
        pos + data.len()
    }

    /// Write a `u32` length prefix followed by `data`, returning the position after it
    pub fn write_prefixed(&mut self, pos: usize, data: &[u8]) -> usize {
        self.put_word(pos, data.len() as u32);
        self.write_at(pos + LENGTH_FIELD_SIZE, data)
    }
}
