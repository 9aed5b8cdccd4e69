//! Dump and load of a slot's raw block buffers
//!
//! The stream format is the slot's block buffers back to back, head block
//! first, each exactly `4 + capacity + 4` bytes with no framing. A loader
//! must therefore use the same block capacity as the dumper.

use super::allocator::SlotAllocator;
use super::block::Block;
use super::layout::WSIZE;
use super::metadata::EntryMeta;
use super::slot::SlotId;
use crate::error::{Error, Result};
use crate::metrics::{BLOCKS_ALLOCATED, LIVE_BLOCKS};
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;
use tracing::{info, warn};

impl<M: EntryMeta> SlotAllocator<M> {
    /// Write every block buffer of `slot` to `out`, returning bytes written
    pub fn dump<W: Write>(&self, slot: SlotId, mut out: W) -> Result<usize> {
        let mut written = 0;
        for buffer in self.block_buffers(slot)? {
            out.write_all(buffer)?;
            written += buffer.len();
        }
        out.flush()?;
        Ok(written)
    }

    /// Read block buffers into an empty slot, returning the block count
    ///
    /// Every buffer is validated before the slot is touched; a stream that
    /// fails validation leaves the slot empty.
    pub fn load<R: Read>(&mut self, slot: SlotId, mut input: R) -> Result<usize> {
        {
            let state = self.slot_state(slot)?;
            if !state.is_empty() {
                return Err(Error::SlotNotEmpty {
                    slot,
                    blocks: state.blocks.len(),
                });
            }
        }

        let capacity = self.block_capacity();
        let chunk = capacity + 2 * WSIZE;
        let mut blocks = Vec::new();
        loop {
            let mut buffer = vec![0u8; chunk];
            let n = read_full(&mut input, &mut buffer)?;
            if n == 0 {
                break;
            }
            if n < chunk {
                warn!(%slot, read = n, expected = chunk, "Truncated block in dump");
                return Err(Error::Corrupted(format!(
                    "truncated block: {} of {} bytes",
                    n, chunk
                )));
            }
            let id = self.fresh_block_id()?;
            let block = Block::from_buffer(id, capacity, buffer)
                .and_then(|block| check_entry_sizes(&block, Self::min_entry_size()).map(|_| block))
                .map_err(|e| {
                    warn!(%slot, block = blocks.len(), error = %e, "Rejected block in dump");
                    e
                })?;
            blocks.push(block);
        }

        let count = blocks.len();
        let idx = slot.index();
        {
            let state = self.slot_state_mut(slot)?;
            for block in blocks.into_iter().rev() {
                state.push_front(block);
            }
        }
        BLOCKS_ALLOCATED.inc_by(count as u64);
        LIVE_BLOCKS.add(count as i64);

        let released = self.rebuild_free_space(idx, slot)?;
        info!(%slot, blocks = count, released, "Loaded slot");
        Ok(count)
    }

    /// Dump a slot into a file, replacing it
    pub fn dump_to_file<P: AsRef<Path>>(&self, slot: SlotId, path: P) -> Result<usize> {
        let file = File::create(path.as_ref())?;
        let written = self.dump(slot, BufWriter::new(file))?;
        info!(%slot, path = ?path.as_ref(), bytes = written, "Dumped slot");
        Ok(written)
    }

    /// Load a slot from a file written by [`dump_to_file`](Self::dump_to_file)
    pub fn load_from_file<P: AsRef<Path>>(&mut self, slot: SlotId, path: P) -> Result<usize> {
        let file = File::open(path.as_ref())?;
        self.load(slot, BufReader::new(file))
    }
}

/// Every allocated segment must be large enough to decode as an entry
fn check_entry_sizes(block: &Block, min: usize) -> Result<()> {
    for (p, tag) in block.segments() {
        if tag.is_allocated() && tag.size() < min {
            return Err(Error::Corrupted(format!(
                "{} holds a {}-byte allocated segment at {}, entries need {}",
                block.id(),
                tag.size(),
                p,
                min
            )));
        }
    }
    Ok(())
}

/// Fill `buf` as far as the reader allows; returns bytes read (short only at EOF)
fn read_full<R: Read>(input: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AllocatorConfig;
    use crate::storage::slab::block::BlockId;
    use crate::storage::slab::layout::{FIRST_PAYLOAD, MIN_SEGMENT_SIZE};
    use crate::storage::slab::metadata::ObjectMeta;

    const CAPACITY: usize = 256;

    fn allocator() -> Result<SlotAllocator> {
        SlotAllocator::new(AllocatorConfig::with_block_capacity(CAPACITY))
    }

    fn fill(alloc: &mut SlotAllocator, slot: SlotId, n: usize) -> Result<()> {
        for i in 0..n {
            let mut km = ObjectMeta::string();
            let mut vm = ObjectMeta::string();
            alloc.insert(slot, format!("key{}", i).as_bytes(), b"value", &mut km, &mut vm)?;
        }
        Ok(())
    }

    #[test]
    fn test_dump_load_round_trip() -> Result<()> {
        let mut src = allocator()?;
        let slot = SlotId(11);
        fill(&mut src, slot, 6)?;

        let mut bytes = Vec::new();
        let written = src.dump(slot, &mut bytes)?;
        assert_eq!(written, src.stats(slot)?.blocks * (CAPACITY + 8));

        let mut dst = allocator()?;
        let target = SlotId(3);
        assert_eq!(dst.load(target, bytes.as_slice())?, src.stats(slot)?.blocks);

        let mut want = src.stats(slot)?;
        want.slot = target.0;
        assert_eq!(dst.stats(target)?, want);
        dst.check_slot(target)?;
        assert_eq!(dst.block_buffers(target)?, src.block_buffers(slot)?);
        Ok(())
    }

    #[test]
    fn test_load_requires_empty_slot() -> Result<()> {
        let mut alloc = allocator()?;
        fill(&mut alloc, SlotId(0), 1)?;
        let err = alloc.load(SlotId(0), std::io::empty());
        assert!(matches!(err, Err(Error::SlotNotEmpty { blocks: 1, .. })));
        Ok(())
    }

    #[test]
    fn test_load_rejects_truncated_stream() -> Result<()> {
        let mut src = allocator()?;
        fill(&mut src, SlotId(0), 2)?;
        let mut bytes = Vec::new();
        src.dump(SlotId(0), &mut bytes)?;
        bytes.truncate(bytes.len() - 10);

        let mut dst = allocator()?;
        assert!(matches!(
            dst.load(SlotId(0), bytes.as_slice()),
            Err(Error::Corrupted(_))
        ));
        assert_eq!(dst.stats(SlotId(0))?.blocks, 0);
        Ok(())
    }

    #[test]
    fn test_load_rejects_bad_tags() -> Result<()> {
        let mut src = allocator()?;
        fill(&mut src, SlotId(0), 1)?;
        let mut bytes = Vec::new();
        src.dump(SlotId(0), &mut bytes)?;
        // smash the first segment header
        bytes[4..8].copy_from_slice(&7u32.to_le_bytes());

        let mut dst = allocator()?;
        assert!(dst.load(SlotId(0), bytes.as_slice()).is_err());
        Ok(())
    }

    #[test]
    fn test_load_rejects_undersized_entry() -> Result<()> {
        // tags are consistent, but the allocated tail segment is too small for an entry
        let mut block = Block::new(BlockId(0), CAPACITY);
        let tail = CAPACITY - MIN_SEGMENT_SIZE;
        block.arena.put_boundary(FIRST_PAYLOAD, tail, false);
        block.arena.put_boundary(FIRST_PAYLOAD + tail, MIN_SEGMENT_SIZE, true);
        let bytes = block.buffer().to_vec();

        let mut dst = allocator()?;
        let err = dst.load(SlotId(2), bytes.as_slice());
        assert!(matches!(err, Err(Error::Corrupted(_))));
        assert_eq!(dst.stats(SlotId(2))?.blocks, 0);
        Ok(())
    }

    #[test]
    fn test_file_round_trip() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("slotheap_persist_{}", std::process::id()));
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("slot.bin");

        let mut src = allocator()?;
        fill(&mut src, SlotId(1), 3)?;
        src.dump_to_file(SlotId(1), &path)?;

        let mut dst = allocator()?;
        dst.load_from_file(SlotId(1), &path)?;
        assert_eq!(dst.stats(SlotId(1))?.segments_used, 3);

        std::fs::remove_dir_all(dir).ok();
        Ok(())
    }
}
