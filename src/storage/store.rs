//! Key-indexed store over the slot allocator
//!
//! Combines SlotAllocator + a key index.
//! This is the integration layer a key-value server would sit on.
//!
//! - Keys are routed to their hash slot
//! - The index keeps each key's slot and key-record handle
//! - Overwrites free the previous segment
//! - Slots can be saved to and reopened from a directory of dump files

use super::migration::{self, MigrationReport, MigrationSink};
use super::slab::{key_hash_slot, MetaRef, ObjectMeta, SlotAllocator, SlotId, SlotStats};
use crate::config::AllocatorConfig;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

/// Key-value store backed by per-slot heaps
pub struct SlotStore {
    allocator: SlotAllocator<ObjectMeta>,
    index: HashMap<Vec<u8>, (SlotId, MetaRef)>,
}

impl SlotStore {
    /// Create an empty store
    pub fn new(config: AllocatorConfig) -> Result<Self> {
        Ok(Self {
            allocator: SlotAllocator::new(config)?,
            index: HashMap::new(),
        })
    }

    /// Slot a key is stored in
    ///
    /// Cluster hash slot, folded onto the configured slot count.
    pub fn slot_for(&self, key: &[u8]) -> SlotId {
        let slot = key_hash_slot(key);
        SlotId((slot.index() % self.allocator.slot_count()) as u16)
    }

    /// Get value for a key
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let (slot, handle) = match self.index.get(key) {
            Some(entry) => *entry,
            None => return Ok(None),
        };
        let view = self.allocator.entry(slot, handle)?;
        Ok(Some(view.value.to_vec()))
    }

    /// Set key-value pair, replacing any previous value
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.set_with_meta(key, value, ObjectMeta::string(), ObjectMeta::string())
    }

    /// Set key-value pair with explicit metadata records
    pub fn set_with_meta(
        &mut self,
        key: &[u8],
        value: &[u8],
        mut key_meta: ObjectMeta,
        mut value_meta: ObjectMeta,
    ) -> Result<()> {
        let slot = self.slot_for(key);
        let size = self.allocator.required_segment_size(key.len(), value.len());
        if size > self.allocator.block_capacity() {
            return Err(Error::EntryTooLarge {
                size,
                capacity: self.allocator.block_capacity(),
            });
        }

        // Free the old segment first so its space can be reused
        if let Some((old_slot, old)) = self.index.remove(key) {
            self.allocator.free(old_slot, old)?;
        }

        let ins = self
            .allocator
            .insert(slot, key, value, &mut key_meta, &mut value_meta)?;
        self.index.insert(key.to_vec(), (slot, ins.key_meta));

        debug!(%slot, key_len = key.len(), value_len = value.len(), new_block = ins.new_block, "Set key-value");
        Ok(())
    }

    /// Delete a key
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        let (slot, handle) = match self.index.remove(key) {
            Some(entry) => entry,
            None => return Ok(false),
        };
        self.allocator.free(slot, handle)?;

        debug!(%slot, key_len = key.len(), "Deleted key");
        Ok(true)
    }

    /// Check if key exists
    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.index.contains_key(key)
    }

    /// List all keys
    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.index.keys().cloned().collect()
    }

    /// Get number of keys
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn allocator(&self) -> &SlotAllocator<ObjectMeta> {
        &self.allocator
    }

    pub fn stats(&self, slot: SlotId) -> Result<SlotStats> {
        self.allocator.stats(slot)
    }

    /// Ship a slot's entries to `sink` and forget its keys
    pub fn migrate_slot<K: MigrationSink<ObjectMeta>>(
        &mut self,
        slot: SlotId,
        sink: &mut K,
    ) -> Result<MigrationReport> {
        let report = migration::migrate_slot(&mut self.allocator, slot, sink)?;
        self.index.retain(|_, (s, _)| *s != slot);
        Ok(report)
    }

    /// Dump every occupied slot into `dir`, one file per slot
    pub fn save<P: AsRef<Path>>(&self, dir: P) -> Result<usize> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let slots = self.allocator.occupied_slots();
        for slot in &slots {
            self.allocator
                .dump_to_file(*slot, dir.join(slot_file_name(*slot)))?;
        }
        info!(path = ?dir, slots = slots.len(), keys = self.len(), "Saved slot store");
        Ok(slots.len())
    }

    /// Reopen a store saved with [`save`](Self::save), rebuilding the key index
    pub fn open<P: AsRef<Path>>(dir: P, config: AllocatorConfig) -> Result<Self> {
        let dir = dir.as_ref();
        let mut store = Self::new(config)?;

        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let Some(slot) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(parse_slot_file_name)
            else {
                continue;
            };
            store.allocator.load_from_file(slot, &path)?;
            store.reindex(slot)?;
        }

        info!(path = ?dir, keys = store.len(), "Opened slot store");
        Ok(store)
    }

    fn reindex(&mut self, slot: SlotId) -> Result<()> {
        let mut cursor = self.allocator.cursor(slot)?;
        while let Some(entry) = cursor.next(&mut self.allocator)? {
            let view = self.allocator.entry(slot, entry.key_meta)?;
            if self.index.insert(view.key.to_vec(), (slot, entry.key_meta)).is_some() {
                return Err(Error::Corrupted(format!("duplicate key in {}", slot)));
            }
        }
        Ok(())
    }
}

fn slot_file_name(slot: SlotId) -> String {
    format!("slot_{:05}.bin", slot.0)
}

fn parse_slot_file_name(name: &str) -> Option<SlotId> {
    let id = name.strip_prefix("slot_")?.strip_suffix(".bin")?;
    id.parse::<u16>().ok().map(SlotId)
}
