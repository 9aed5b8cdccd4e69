// slotheap - Rust Implementation
// Per-hash-slot heap allocator for a sharded in-memory key-value store

#![warn(rust_2018_idioms)]

pub mod config;
pub mod metrics;
pub mod storage;

// Re-exports for convenience
pub use config::AllocatorConfig;
pub use storage::slab::{
    key_hash_slot, EntryMeta, EntryRef, EntryView, FreeOutcome, Insertion, MetaRef, ObjectMeta,
    SlotAllocator, SlotCursor, SlotId, SlotStats,
};
pub use storage::{migrate_slot, MigrationReport, MigrationSink, SlotStore};

/// slotheap error types
pub mod error {
    use crate::storage::slab::{BlockId, SlotId};
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Slot {slot} out of range (slot count: {count})")]
        SlotOutOfRange { slot: u32, count: usize },

        #[error("Entry needs {size} bytes but blocks hold at most {capacity}")]
        EntryTooLarge { size: usize, capacity: usize },

        #[error("Invalid entry handle: {0}")]
        InvalidHandle(String),

        #[error("Cursor over {slot} is stale: {reason}")]
        StaleCursor { slot: SlotId, reason: String },

        #[error("{slot} still owns {blocks} block(s)")]
        SlotNotEmpty { slot: SlotId, blocks: usize },

        #[error("Corrupted block data: {0}")]
        Corrupted(String),

        #[error("Block ids exhausted after {0}")]
        BlockIdsExhausted(BlockId),

        #[error("Invalid configuration: {0}")]
        InvalidConfig(String),

        #[error("Migration error: {0}")]
        Migration(String),

        #[error("I/O error: {0}")]
        Io(#[from] std::io::Error),

        #[error("Configuration error: {0}")]
        Config(#[from] ::config::ConfigError),
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_format() {
        let _version: &str = VERSION;
    }

    #[test]
    fn test_error_display() {
        let err = error::Error::EntryTooLarge {
            size: 4096,
            capacity: 1024,
        };
        assert_eq!(
            err.to_string(),
            "Entry needs 4096 bytes but blocks hold at most 1024"
        );
    }
}
