//! Per-slot heap allocator
//!
//! Each of the 16384 hash slots owns an independent heap of fixed-capacity
//! blocks. Entries are carved out of blocks as boundary-tagged segments and
//! located afterwards through the in-place position of their key record.
//!
//! # Architecture
//!
//! ```text
//! SlotAllocator
//!   ├─→ Slot(0)     → Blocks: [#7] ⇄ [#2]      Free: #7+8 → #2+312
//!   ├─→ Slot(1)     → (empty, no buffers)
//!   ├─→ Slot(12182) → Blocks: [#5]  locked     Free: []
//!   └─→ ...
//!
//! Block (capacity C)
//!   [prologue][hdr|key meta|value meta|klen|key|vlen|value|ftr][hdr|next|prev|..|ftr][epilogue]
//!             └────────────── allocated segment ─────────────┘└──── free segment ────┘
//! ```
//!
//! Free segments are threaded into one list per slot through their own
//! payload bytes. Inserts search it first-fit; frees coalesce neighbors and
//! release blocks that end up empty.
//!
//! Migration locks a slot, drains it with a [`SlotCursor`], then destroys it.

pub mod allocator;
pub mod block;
pub mod free_list;
pub mod iter;
pub mod layout;
pub mod metadata;
pub mod persist;
pub mod slot;

pub use allocator::{EntryRef, FreeOutcome, Insertion, SlotAllocator};
pub use block::{Block, BlockId};
pub use free_list::SegmentRef;
pub use iter::{Drain, EntrySource, SlotCursor};
pub use metadata::{EntryMeta, EntryView, MetaRef, ObjectKind, ObjectMeta};
pub use slot::{key_hash_slot, AllocatorStats, SlotId, SlotStats, SLOT_COUNT};
