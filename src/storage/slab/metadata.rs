//! Key/value metadata records
//!
//! Every stored entry carries two fixed-size records, one describing the key
//! and one describing the value. The allocator copies them into the segment
//! payload and patches their `data_offset` so each record alone locates its
//! bytes:
//!
//! ```text
//! payload: | key meta | value meta | klen | key ... | vlen | value ... |
//!          ^--------- key data_offset --------^
//!                     ^------ value data_offset ---------------^
//! ```

use super::block::BlockId;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A fixed-size record stored ahead of an entry's key or value bytes
pub trait EntryMeta: Sized + Clone {
    /// Encoded size in bytes; identical for every record of the type
    const ENCODED_LEN: usize;

    /// Offset of the described bytes from the start of this record
    fn data_offset(&self) -> u32;

    fn set_data_offset(&mut self, offset: u32);

    /// Write exactly `ENCODED_LEN` bytes into `out`
    fn encode(&self, out: &mut [u8]);

    fn decode(bytes: &[u8]) -> Result<Self>;
}

/// Type tag of a stored object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ObjectKind {
    String = 0,
    List = 1,
    Set = 2,
    Hash = 3,
    ZSet = 4,
    Stream = 5,
}

impl TryFrom<u8> for ObjectKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => Self::String,
            1 => Self::List,
            2 => Self::Set,
            3 => Self::Hash,
            4 => Self::ZSet,
            5 => Self::Stream,
            other => {
                return Err(Error::Corrupted(format!("unknown object kind {}", other)));
            }
        })
    }
}

/// Default record: a compact object header in the style of a KV server's
/// object descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub kind: ObjectKind,
    pub encoding: u8,
    pub lru: u32,
    pub refcount: u32,
    pub data_offset: u32,
}

impl ObjectMeta {
    pub fn new(kind: ObjectKind) -> Self {
        Self {
            kind,
            encoding: 0,
            lru: 0,
            refcount: 1,
            data_offset: 0,
        }
    }

    pub fn string() -> Self {
        Self::new(ObjectKind::String)
    }
}

impl Default for ObjectMeta {
    fn default() -> Self {
        Self::string()
    }
}

impl EntryMeta for ObjectMeta {
    // kind, encoding, 2 pad bytes, lru, refcount, data_offset
    const ENCODED_LEN: usize = 16;

    fn data_offset(&self) -> u32 {
        self.data_offset
    }

    fn set_data_offset(&mut self, offset: u32) {
        self.data_offset = offset;
    }

    fn encode(&self, out: &mut [u8]) {
        out[0] = self.kind as u8;
        out[1] = self.encoding;
        out[2..4].fill(0);
        out[4..8].copy_from_slice(&self.lru.to_le_bytes());
        out[8..12].copy_from_slice(&self.refcount.to_le_bytes());
        out[12..16].copy_from_slice(&self.data_offset.to_le_bytes());
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::ENCODED_LEN {
            return Err(Error::Corrupted(format!(
                "object record needs {} bytes, got {}",
                Self::ENCODED_LEN,
                bytes.len()
            )));
        }
        let word = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        Ok(Self {
            kind: ObjectKind::try_from(bytes[0])?,
            encoding: bytes[1],
            lru: word(4),
            refcount: word(8),
            data_offset: word(12),
        })
    }
}

/// In-place position of a metadata record inside a block
///
/// The key record's position doubles as the segment identity passed to
/// [`SlotAllocator::free`](super::SlotAllocator::free).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetaRef {
    pub block: BlockId,
    pub offset: u32,
}

impl MetaRef {
    pub fn new(block: BlockId, offset: usize) -> Self {
        Self {
            block,
            offset: offset as u32,
        }
    }

    pub fn pos(&self) -> usize {
        self.offset as usize
    }
}

impl fmt::Display for MetaRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.block, self.offset)
    }
}

/// Decoded view of a stored entry, borrowing its bytes from the block
#[derive(Debug, Clone)]
pub struct EntryView<'a, M> {
    pub key_meta: M,
    pub value_meta: M,
    pub key: &'a [u8],
    pub value: &'a [u8],
}

impl<M> EntryView<'_, M> {
    /// Key plus value byte count
    pub fn len(&self) -> usize {
        self.key.len() + self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.key.is_empty() && self.value.is_empty()
    }
}
