//! Prometheus metrics for the slot allocator
//!
//! Features:
//! - Block lifecycle (allocated, released, live)
//! - Entry traffic (inserts, frees, double frees)
//! - Slot locking for migration

use prometheus::{
    core::{AtomicU64, GenericCounter},
    Encoder, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use tracing::{error, info};

use crate::storage::slab::SlotStats;

lazy_static::lazy_static! {
    /// Global metrics registry
    pub static ref METRICS_REGISTRY: Registry = Registry::new();

    // Block lifecycle
    pub static ref BLOCKS_ALLOCATED: GenericCounter<AtomicU64> = GenericCounter::new(
        "slotheap_blocks_allocated_total",
        "Total blocks allocated"
    ).unwrap();

    pub static ref BLOCKS_RELEASED: GenericCounter<AtomicU64> = GenericCounter::new(
        "slotheap_blocks_released_total",
        "Total blocks released"
    ).unwrap();

    pub static ref LIVE_BLOCKS: IntGauge = IntGauge::new(
        "slotheap_live_blocks",
        "Blocks currently held by all slots"
    ).unwrap();

    // Entry traffic
    pub static ref ENTRIES_INSERTED: GenericCounter<AtomicU64> = GenericCounter::new(
        "slotheap_entries_inserted_total",
        "Total entries inserted"
    ).unwrap();

    pub static ref ENTRIES_FREED: GenericCounter<AtomicU64> = GenericCounter::new(
        "slotheap_entries_freed_total",
        "Total entries freed"
    ).unwrap();

    pub static ref DOUBLE_FREES: GenericCounter<AtomicU64> = GenericCounter::new(
        "slotheap_double_free_total",
        "Frees of segments that were already free"
    ).unwrap();

    // Migration
    pub static ref SLOT_LOCKS: GenericCounter<AtomicU64> = GenericCounter::new(
        "slotheap_slot_locks_total",
        "Total slot lock operations"
    ).unwrap();

    pub static ref SLOT_BYTES_USED: IntGaugeVec = IntGaugeVec::new(
        Opts::new("slotheap_slot_bytes_used", "Bytes in use per observed slot"),
        &["slot"]
    ).unwrap();
}

/// Initialize metrics registry
pub fn init_metrics() {
    info!("Initializing Prometheus metrics");

    METRICS_REGISTRY.register(Box::new(BLOCKS_ALLOCATED.clone())).ok();
    METRICS_REGISTRY.register(Box::new(BLOCKS_RELEASED.clone())).ok();
    METRICS_REGISTRY.register(Box::new(LIVE_BLOCKS.clone())).ok();

    METRICS_REGISTRY.register(Box::new(ENTRIES_INSERTED.clone())).ok();
    METRICS_REGISTRY.register(Box::new(ENTRIES_FREED.clone())).ok();
    METRICS_REGISTRY.register(Box::new(DOUBLE_FREES.clone())).ok();

    METRICS_REGISTRY.register(Box::new(SLOT_LOCKS.clone())).ok();
    METRICS_REGISTRY.register(Box::new(SLOT_BYTES_USED.clone())).ok();

    info!("Metrics initialized successfully");
}

/// Publish a slot snapshot to the per-slot gauge
pub fn record_slot_stats(stats: &SlotStats) {
    SLOT_BYTES_USED
        .with_label_values(&[&stats.slot.to_string()])
        .set(stats.bytes_used as i64);
}

/// Export all metrics in Prometheus text format
pub fn export_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = METRICS_REGISTRY.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return String::from("# Error encoding metrics\n");
    }

    String::from_utf8(buffer).unwrap_or_else(|_| String::from("# Error converting metrics\n"))
}
