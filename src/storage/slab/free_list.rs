//! Explicit free list
//!
//! A slot keeps one doubly linked list of free segments across all of its
//! blocks. The links live inside the free payloads themselves (see
//! [`Arena::next_link`](super::layout::Arena::next_link)), so the list only
//! stores its head. New segments are pushed at the front and searched
//! first-fit from there.

use super::block::{Block, BlockId};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Position of a segment: owning block plus payload offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SegmentRef {
    pub block: BlockId,
    pub offset: u32,
}

impl SegmentRef {
    pub fn new(block: BlockId, offset: usize) -> Self {
        Self {
            block,
            offset: offset as u32,
        }
    }

    /// Payload offset as an index into the block buffer
    pub fn pos(&self) -> usize {
        self.offset as usize
    }

    /// Offset of the segment's header word
    pub fn header_offset(&self) -> usize {
        self.pos() - super::layout::WSIZE
    }
}

impl fmt::Display for SegmentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.block, self.offset)
    }
}

fn block_of<'a>(blocks: &'a HashMap<BlockId, Block>, seg: SegmentRef) -> Result<&'a Block> {
    blocks
        .get(&seg.block)
        .ok_or_else(|| Error::Corrupted(format!("free list points into missing {}", seg.block)))
}

fn block_of_mut<'a>(
    blocks: &'a mut HashMap<BlockId, Block>,
    seg: SegmentRef,
) -> Result<&'a mut Block> {
    blocks
        .get_mut(&seg.block)
        .ok_or_else(|| Error::Corrupted(format!("free list points into missing {}", seg.block)))
}

/// Head of a slot's free list
#[derive(Debug, Default)]
pub struct FreeList {
    head: Option<SegmentRef>,
    len: usize,
}

impl FreeList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn head(&self) -> Option<SegmentRef> {
        self.head
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Forget every entry without touching block memory
    pub fn clear(&mut self) {
        self.head = None;
        self.len = 0;
    }

    /// Push a free segment at the front
    pub fn insert(&mut self, blocks: &mut HashMap<BlockId, Block>, seg: SegmentRef) -> Result<()> {
        let old_head = self.head;
        {
            let block = block_of_mut(blocks, seg)?;
            block.arena.set_next_link(seg.pos(), old_head);
            block.arena.set_prev_link(seg.pos(), None);
        }
        if let Some(head) = old_head {
            block_of_mut(blocks, head)?
                .arena
                .set_prev_link(head.pos(), Some(seg));
        }
        self.head = Some(seg);
        self.len += 1;
        Ok(())
    }

    /// Unlink a segment that is currently on the list
    pub fn remove(&mut self, blocks: &mut HashMap<BlockId, Block>, seg: SegmentRef) -> Result<()> {
        let (prev, next) = {
            let block = block_of(blocks, seg)?;
            (block.arena.prev_link(seg.pos()), block.arena.next_link(seg.pos()))
        };

        match prev {
            Some(prev) => block_of_mut(blocks, prev)?
                .arena
                .set_next_link(prev.pos(), next),
            None => {
                if self.head != Some(seg) {
                    return Err(Error::Corrupted(format!(
                        "{} has no predecessor but is not the free list head",
                        seg
                    )));
                }
                self.head = next;
            }
        }
        if let Some(next) = next {
            block_of_mut(blocks, next)?
                .arena
                .set_prev_link(next.pos(), prev);
        }
        self.len = self.len.saturating_sub(1);
        Ok(())
    }

    /// First segment whose size is at least `size`
    pub fn find_fit(
        &self,
        blocks: &HashMap<BlockId, Block>,
        size: usize,
    ) -> Result<Option<SegmentRef>> {
        let mut cursor = self.head;
        while let Some(seg) = cursor {
            let block = block_of(blocks, seg)?;
            if block.arena.header(seg.pos()).size() >= size {
                return Ok(Some(seg));
            }
            cursor = block.arena.next_link(seg.pos());
        }
        Ok(None)
    }

    /// Collect the list in order, head first
    pub fn segments(&self, blocks: &HashMap<BlockId, Block>) -> Result<Vec<SegmentRef>> {
        let mut out = Vec::with_capacity(self.len);
        let mut cursor = self.head;
        while let Some(seg) = cursor {
            if out.len() > self.len {
                return Err(Error::Corrupted("free list contains a cycle".to_string()));
            }
            out.push(seg);
            cursor = block_of(blocks, seg)?.arena.next_link(seg.pos());
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::slab::layout::FIRST_PAYLOAD;

    fn carve(blocks: &mut HashMap<BlockId, Block>, id: BlockId, sizes: &[usize]) -> Vec<SegmentRef> {
        let block = blocks.get_mut(&id).unwrap();
        let mut p = FIRST_PAYLOAD;
        let mut out = Vec::new();
        for &size in sizes {
            block.arena.put_boundary(p, size, false);
            out.push(SegmentRef::new(id, p));
            p += size;
        }
        out
    }

    #[test]
    fn test_insert_remove_and_order() -> Result<()> {
        let id = BlockId(0);
        let mut blocks = HashMap::new();
        blocks.insert(id, Block::new(id, 96));
        let segs = carve(&mut blocks, id, &[24, 32, 40]);

        let mut list = FreeList::new();
        for seg in &segs {
            list.insert(&mut blocks, *seg)?;
        }
        assert_eq!(list.len(), 3);
        assert_eq!(list.segments(&blocks)?, vec![segs[2], segs[1], segs[0]]);

        // unlink the middle one
        list.remove(&mut blocks, segs[1])?;
        assert_eq!(list.segments(&blocks)?, vec![segs[2], segs[0]]);

        // unlink the head
        list.remove(&mut blocks, segs[2])?;
        assert_eq!(list.head(), Some(segs[0]));
        list.remove(&mut blocks, segs[0])?;
        assert!(list.is_empty());
        assert_eq!(list.len(), 0);
        Ok(())
    }

    #[test]
    fn test_find_fit_is_first_fit() -> Result<()> {
        let id = BlockId(0);
        let mut blocks = HashMap::new();
        blocks.insert(id, Block::new(id, 96));
        let segs = carve(&mut blocks, id, &[24, 32, 40]);

        let mut list = FreeList::new();
        // head order: 24, 40, 32
        list.insert(&mut blocks, segs[1])?;
        list.insert(&mut blocks, segs[2])?;
        list.insert(&mut blocks, segs[0])?;

        assert_eq!(list.find_fit(&blocks, 24)?, Some(segs[0]));
        assert_eq!(list.find_fit(&blocks, 25)?, Some(segs[2]));
        assert_eq!(list.find_fit(&blocks, 41)?, None);
        Ok(())
    }

    #[test]
    fn test_missing_block_is_corruption() {
        let mut blocks = HashMap::new();
        let mut list = FreeList::new();
        let err = list.insert(&mut blocks, SegmentRef::new(BlockId(9), FIRST_PAYLOAD));
        assert!(matches!(err, Err(Error::Corrupted(_))));
    }
}
