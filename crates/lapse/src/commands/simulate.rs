//! Simulate command - drives a synthetic workload through the scheduler.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Args;
use console::{Style, style};
use lapse_cache::{
    MemoryBatcher, MemoryStore, RemovalCause, RemovalProtocol, Scheduler, SchedulerConfig,
    SchedulerStats,
};
use lapse_config::{EvictionConfig, ExpirationConfig, LapseConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, info};

use super::Context;

/// Arguments for the simulate command.
#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// Number of distinct entry ids
    #[arg(long, default_value_t = 50, value_parser = clap::value_parser!(u32).range(1..))]
    pub entries: u32,

    /// Number of accesses to perform
    #[arg(long, default_value_t = 500)]
    pub accesses: u32,

    /// Delay between accesses in milliseconds
    #[arg(long, default_value_t = 1)]
    pub interval_ms: u64,

    /// Percentage of accesses that hold the entry until the next access
    #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u32).range(0..=100))]
    pub hold_percent: u32,

    /// Idle timeout in milliseconds, negative for immortal (overrides config)
    #[arg(long, allow_negative_numbers = true)]
    pub idle_timeout_ms: Option<i64>,

    /// Maximum resident entries, negative for unbounded (overrides config)
    #[arg(long, allow_negative_numbers = true)]
    pub max_entries: Option<i64>,

    /// Time to wait after the workload for pending expirations, in milliseconds
    #[arg(long, default_value_t = 100)]
    pub settle_ms: u64,

    /// Seed for the access sequence
    #[arg(long, default_value_t = 42)]
    pub seed: u64,
}

/// Simulation summary for JSON output.
#[derive(Debug, Serialize)]
struct SimulationReport {
    idle_timeout_ms: Option<u64>,
    max_entries: Option<usize>,
    accesses: u32,
    resident: usize,
    passivated: usize,
    batches: BatchReport,
    removals: RemovalReport,
}

#[derive(Debug, Serialize)]
struct BatchReport {
    begun: u64,
    closed: u64,
    discarded: u64,
}

#[derive(Debug, Serialize)]
struct RemovalReport {
    expired: u64,
    evicted: u64,
    skipped_locked: u64,
    skipped_absent: u64,
    skipped_not_expired: u64,
    failed: u64,
    batch_errors: u64,
}

impl From<&SchedulerStats> for RemovalReport {
    fn from(stats: &SchedulerStats) -> Self {
        Self {
            expired: stats.expired,
            evicted: stats.evicted,
            skipped_locked: stats.skipped_locked,
            skipped_absent: stats.skipped_absent,
            skipped_not_expired: stats.skipped_not_expired,
            failed: stats.failed,
            batch_errors: stats.batch_errors,
        }
    }
}

/// Run the simulate command.
pub async fn run(args: SimulateArgs, ctx: &Context) -> Result<()> {
    let config = resolve_config(&args, &ctx.loaded.config)?;

    let store = Arc::new(MemoryStore::<String>::new());
    let batcher = Arc::new(MemoryBatcher::new());
    let protocol = RemovalProtocol::<String, _, _>::new(Arc::clone(&store), Arc::clone(&batcher))
        .with_idle_timeout(config.idle_timeout)
        .with_eviction_backend(store.clone())
        .with_listener(Arc::new(|id: &String, cause: RemovalCause| {
            debug!(id = %id, cause = %cause, "Entry left the cache");
        }));
    let scheduler = Scheduler::<String>::start(config.clone(), Arc::new(protocol))?;

    info!(
        entries = args.entries,
        accesses = args.accesses,
        seed = args.seed,
        "Starting simulation"
    );

    let mut rng = StdRng::seed_from_u64(args.seed);
    let mut held: Option<String> = None;
    let interval = Duration::from_millis(args.interval_ms);

    for _ in 0..args.accesses {
        if let Some(id) = held.take() {
            release(&store, &scheduler, id);
        }

        let id = format!("entry-{}", rng.random_range(0..args.entries));
        if rng.random_ratio(args.hold_percent, 100) && store.check_out(id.clone()) {
            scheduler.on_access(id.clone());
            scheduler.suspend(&id);
            held = Some(id);
        } else {
            store.touch(id.clone());
            scheduler.on_access(id);
        }

        if !interval.is_zero() {
            sleep(interval).await;
        }
    }
    if let Some(id) = held.take() {
        release(&store, &scheduler, id);
    }

    if args.settle_ms > 0 {
        sleep(Duration::from_millis(args.settle_ms)).await;
    }

    let stats = scheduler.stats();
    scheduler.shutdown().await;

    let report = SimulationReport {
        idle_timeout_ms: config.idle_timeout.map(|t| t.as_millis() as u64),
        max_entries: config.max_entries,
        accesses: args.accesses,
        resident: store.len(),
        passivated: store.passivated().len(),
        batches: BatchReport {
            begun: batcher.begun(),
            closed: batcher.closed(),
            discarded: batcher.discarded(),
        },
        removals: RemovalReport::from(&stats),
    };

    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    Ok(())
}

/// Apply command-line overrides on top of the loaded config.
fn resolve_config(args: &SimulateArgs, base: &LapseConfig) -> Result<SchedulerConfig> {
    let mut config = base.clone();
    if let Some(ms) = args.idle_timeout_ms {
        config.expiration = Some(ExpirationConfig {
            idle_timeout_ms: Some(ms),
        });
    }
    if let Some(max) = args.max_entries {
        config.eviction = Some(EvictionConfig {
            max_entries: Some(max),
        });
    }
    config.validate()?;
    Ok(SchedulerConfig::from(&config))
}

fn release(store: &MemoryStore<String>, scheduler: &Scheduler<String>, id: String) {
    store.release(&id);
    store.touch(id.clone());
    scheduler.on_access(id);
}

fn print_report(report: &SimulationReport) {
    let dim = Style::new().dim();
    let value = |v: u64| style(v).cyan();

    println!();
    println!("{}", style("Simulation Results").bold());
    println!("{}", dim.apply_to("─".repeat(40)));
    println!(
        "  {} {}",
        dim.apply_to("Idle timeout:"),
        report
            .idle_timeout_ms
            .map_or_else(|| "immortal".to_string(), |ms| format!("{ms}ms"))
    );
    println!(
        "  {} {}",
        dim.apply_to("Max entries: "),
        report
            .max_entries
            .map_or_else(|| "unbounded".to_string(), |max| max.to_string())
    );
    println!("  {} {}", dim.apply_to("Accesses:    "), report.accesses);
    println!();
    println!("  Resident:    {}", value(report.resident as u64));
    println!("  Passivated:  {}", value(report.passivated as u64));
    println!("  Expired:     {}", value(report.removals.expired));
    println!("  Evicted:     {}", value(report.removals.evicted));
    println!(
        "  Skipped:     {} locked, {} absent, {} not expired",
        value(report.removals.skipped_locked),
        value(report.removals.skipped_absent),
        value(report.removals.skipped_not_expired)
    );
    if report.removals.failed > 0 || report.removals.batch_errors > 0 {
        println!(
            "  Errors:      {} failed, {} batch",
            style(report.removals.failed).red(),
            style(report.removals.batch_errors).red()
        );
    }
    println!(
        "  Batches:     {} begun, {} closed, {} discarded",
        report.batches.begun, report.batches.closed, report.batches.discarded
    );
    println!();
}
