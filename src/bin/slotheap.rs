//! slotheap command-line tool
//!
//! Drives the per-slot allocator outside a server:
//! - Synthetic workloads with allocator statistics
//! - Slot migration into a dump file
//! - Inspection of dump files
//! - Effective configuration
//!
//! # Examples
//!
//! ```bash
//! # Insert 50k keys spread over 16 slots, deleting every third
//! slotheap workload --keys 50000 --slots 16 --delete-every 3
//!
//! # Migrate the busiest slot into a dump file
//! slotheap migrate --output slot.bin
//!
//! # Inspect a dump
//! slotheap inspect slot.bin --slot 42
//! ```

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use slotheap::metrics::{export_metrics, init_metrics, record_slot_stats};
use slotheap::storage::AllocatorSink;
use slotheap::{AllocatorConfig, SlotAllocator, SlotId, SlotStats, SlotStore};
use std::path::PathBuf;
use tracing::info;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// slotheap - per-hash-slot heap allocator tooling
#[derive(Parser, Debug)]
#[command(name = "slotheap")]
#[command(version = slotheap::VERSION)]
#[command(about = "Per-hash-slot heap allocator tooling", long_about = None)]
#[command(author = "Anton Feldmann <anton.feldmann@gmail.com>")]
struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,

    /// Allocator configuration file (TOML)
    #[arg(long, global = true, env = "SLOTHEAP_CONFIG")]
    config: Option<PathBuf>,

    /// Log directory path
    #[arg(long, global = true, default_value = "logs", env = "SLOTHEAP_LOG_DIR")]
    log_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "RUST_LOG")]
    log_level: String,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a synthetic insert/delete workload and print statistics
    Workload(WorkloadArgs),

    /// Run a workload, then migrate one slot into a dump file
    Migrate(MigrateArgs),

    /// Load a dump file into a slot and print what it holds
    Inspect(InspectArgs),

    /// Print the effective configuration
    Config,
}

/// Workload arguments
#[derive(Args, Debug, Clone)]
struct WorkloadArgs {
    /// Number of keys to insert
    #[arg(short, long, default_value = "10000")]
    keys: usize,

    /// Number of hash slots the keys are spread over
    #[arg(short, long, default_value = "8")]
    slots: usize,

    /// Value size in bytes
    #[arg(long, default_value = "64")]
    value_size: usize,

    /// Delete every Nth key after inserting (0 disables)
    #[arg(long, default_value = "0")]
    delete_every: usize,

    /// Print Prometheus metrics afterwards
    #[arg(long)]
    metrics: bool,
}

/// Migration arguments
#[derive(Args, Debug)]
struct MigrateArgs {
    #[command(flatten)]
    workload: WorkloadArgs,

    /// Slot to migrate (default: the slot holding the most entries)
    #[arg(long)]
    slot: Option<u16>,

    /// Output dump file
    #[arg(short, long)]
    output: PathBuf,
}

/// Inspect arguments
#[derive(Args, Debug)]
struct InspectArgs {
    /// Dump file to load
    input: PathBuf,

    /// Slot to load the dump into
    #[arg(long, default_value = "0")]
    slot: u16,

    /// Maximum number of entries to print
    #[arg(short, long, default_value = "20")]
    limit: usize,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(&cli)?;
    init_metrics();

    let config = AllocatorConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    // Execute command
    match &cli.command {
        Commands::Workload(args) => workload_command(&cli, config, args),
        Commands::Migrate(args) => migrate_command(&cli, config, args),
        Commands::Inspect(args) => inspect_command(&cli, config, args),
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

/// Setup logging with rolling files and console output
fn setup_logging(cli: &Cli) -> anyhow::Result<()> {
    std::fs::create_dir_all(&cli.log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &cli.log_dir, "slotheap.log");

    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(!cli.no_color),
        )
        .with(fmt::layer().with_writer(file_appender).with_ansi(false))
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    Ok(())
}

/// Fill a store with `args.keys` uuid-named keys pinned to `args.slots` hash tags
fn run_workload(config: AllocatorConfig, args: &WorkloadArgs) -> anyhow::Result<SlotStore> {
    let mut store = SlotStore::new(config)?;
    let value = vec![b'x'; args.value_size];
    let spread = args.slots.max(1);

    let mut keys = Vec::with_capacity(args.keys);
    for i in 0..args.keys {
        let key = format!("{{s{}}}:{}", i % spread, uuid::Uuid::new_v4());
        store.set(key.as_bytes(), &value)?;
        keys.push(key);
    }

    let mut deleted = 0;
    if args.delete_every > 0 {
        for key in keys.iter().step_by(args.delete_every) {
            if store.delete(key.as_bytes())? {
                deleted += 1;
            }
        }
    }

    info!(inserted = args.keys, deleted, live = store.len(), "Workload finished");
    Ok(store)
}

fn occupied_stats(alloc: &SlotAllocator) -> anyhow::Result<Vec<SlotStats>> {
    let mut stats = Vec::new();
    for slot in alloc.occupied_slots() {
        stats.push(alloc.stats(slot)?);
    }
    Ok(stats)
}

fn print_stats(cli: &Cli, stats: &[SlotStats]) -> anyhow::Result<()> {
    if cli.json {
        println!("{}", serde_json::to_string_pretty(stats)?);
        return Ok(());
    }
    println!(
        "{:>6} {:>6} {:>12} {:>12} {:>8} {:>8} {:>8} {:>8}",
        "slot", "blocks", "used", "free", "live", "holes", "listed", "deferred"
    );
    for s in stats {
        println!(
            "{:>6} {:>6} {:>12} {:>12} {:>8} {:>8} {:>8} {:>8}{}",
            s.slot,
            s.blocks,
            s.bytes_used,
            s.bytes_free,
            s.segments_used,
            s.segments_free,
            s.free_list_len,
            s.deferred_segments,
            if s.locked { "  locked" } else { "" }
        );
    }
    Ok(())
}

/// Workload command - insert/delete and report per-slot usage
fn workload_command(cli: &Cli, config: AllocatorConfig, args: &WorkloadArgs) -> anyhow::Result<()> {
    let store = run_workload(config, args)?;
    let stats = occupied_stats(store.allocator())?;
    for s in &stats {
        record_slot_stats(s);
    }
    print_stats(cli, &stats)?;

    let totals = store.allocator().totals();
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&totals)?);
    } else {
        println!(
            "total: {} slot(s), {} block(s), {} bytes used, {} bytes free",
            totals.slots_in_use, totals.blocks, totals.bytes_used, totals.bytes_free
        );
    }

    if args.metrics {
        print!("{}", export_metrics());
    }
    Ok(())
}

/// Migrate command - drain one slot into a fresh allocator and dump it
fn migrate_command(cli: &Cli, config: AllocatorConfig, args: &MigrateArgs) -> anyhow::Result<()> {
    let mut store = run_workload(config.clone(), &args.workload)?;

    let slot = match args.slot {
        Some(id) => SlotId(id),
        None => occupied_stats(store.allocator())?
            .into_iter()
            .max_by_key(|s| s.segments_used)
            .map(|s| SlotId(s.slot))
            .context("Workload left every slot empty")?,
    };

    let mut dest: SlotAllocator = SlotAllocator::new(config)?;
    let report = {
        let mut sink = AllocatorSink::new(&mut dest);
        store.migrate_slot(slot, &mut sink)?
    };
    let written = dest
        .dump_to_file(slot, &args.output)
        .with_context(|| format!("Failed to write {}", args.output.display()))?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "migrated {}: {} entries, {} bytes of data, {} block(s) released, {} bytes written to {}",
            slot,
            report.entries,
            report.bytes,
            report.blocks,
            written,
            args.output.display()
        );
    }
    Ok(())
}

/// Inspect command - load a dump, verify it and list entries
fn inspect_command(cli: &Cli, config: AllocatorConfig, args: &InspectArgs) -> anyhow::Result<()> {
    let slot = SlotId(args.slot);
    let mut alloc: SlotAllocator = SlotAllocator::new(config)?;
    let blocks = alloc
        .load_from_file(slot, &args.input)
        .with_context(|| format!("Failed to load {}", args.input.display()))?;
    alloc.check_slot(slot)?;
    info!(%slot, blocks, "Dump verified");

    print_stats(cli, &[alloc.stats(slot)?])?;

    let mut cursor = alloc.cursor(slot)?;
    let mut shown = 0;
    while shown < args.limit {
        let Some(entry) = cursor.next(&mut alloc)? else {
            break;
        };
        let view = alloc.entry(slot, entry.key_meta)?;
        println!(
            "{}  {:?}  {} byte(s)",
            entry.key_meta,
            String::from_utf8_lossy(view.key),
            view.value.len()
        );
        shown += 1;
    }
    Ok(())
}
