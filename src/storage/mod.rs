//! Storage layer
//!
//! # Architecture
//!
//! ```text
//! SlotStore (key → (slot, key record))
//!   └─→ SlotAllocator
//!        └─→ Slot(0..16383)
//!             └─→ Blocks (boundary-tagged segments)
//!
//! migrate_slot: lock → drain cursor → MigrationSink::send → finish → destroy
//! ```
//!
//! The allocator in [`slab`] is the core. [`store`] is a minimal host that
//! maps keys to their hash slot and keeps the handles needed to read and
//! free entries. [`migration`] is the boundary towards whatever ships a
//! slot's entries to another node.

pub mod migration;
pub mod slab;
pub mod store;

pub use migration::{migrate_slot, AllocatorSink, CollectSink, MigrationReport, MigrationSink};
pub use slab::{SlotAllocator, SlotId, SlotStats};
pub use store::SlotStore;
