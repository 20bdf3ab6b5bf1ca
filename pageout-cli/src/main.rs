//! pageout-cli: drives a [`pageout_core::PageoutEngine`] over the in-process
//! simulation backend for a fixed duration, printing reclamation and
//! scheduler stats as it runs.
#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log::info;

use pageout_core::sim::Simulation;
use pageout_core::{Collaborators, PageRing, PageoutEngine, PageoutTunables};

/// pageout-cli CLI arguments.
#[derive(Parser, Debug)]
#[command(name = "pageout-cli")]
#[command(about = "Run the page reclamation engine against a simulated workload")]
#[command(version)]
struct Cli {
    /// Total pages in the simulated physical page ring.
    #[arg(long, default_value = "1048576")]
    total_pages: u64,

    /// How long to run before shutting down, in seconds.
    #[arg(long, default_value = "10")]
    duration_secs: u64,

    /// How often to print stats, in seconds.
    #[arg(long, default_value = "1")]
    report_interval_secs: u64,

    /// Free pages reported to the scheduler at startup; a low value
    /// relative to `total_pages` drives the scanners into low-memory mode.
    #[arg(long)]
    freemem: Option<u64>,

    /// Pages requested by blocked allocators at startup.
    #[arg(long, default_value = "0")]
    needfree: u64,

    /// Fraction (0-100) of pages pre-marked dirty with a backing vnode, to
    /// exercise the writeback pipeline.
    #[arg(long, default_value = "5")]
    dirty_percent: u64,

    /// Deadman threshold in seconds; 0 disables it.
    #[arg(long, default_value = "90")]
    deadman_seconds: u64,
}

fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));
    let cli = Cli::parse();

    let sim = Arc::new(Simulation::new(cli.total_pages));
    seed_workload(&sim, cli.dirty_percent);
    sim.set_freemem(cli.freemem.unwrap_or(cli.total_pages / 4));
    sim.set_needfree(cli.needfree);

    let tunables = PageoutTunables::default().with_deadman_seconds(cli.deadman_seconds);
    let collab: Arc<dyn Collaborators> = sim.clone();
    let engine = PageoutEngine::new(tunables, collab).context("failed to start pageout engine")?;

    info!(
        "pageout-cli: starting engine over {} pages, thresholds={:?}",
        cli.total_pages,
        engine.thresholds()
    );
    engine.run();

    let stop = Arc::new(AtomicBool::new(false));
    let ticks = cli.duration_secs.div_ceil(cli.report_interval_secs.max(1));
    for _ in 0..ticks {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        thread::sleep(Duration::from_secs(cli.report_interval_secs.max(1)));
        report(&engine);
    }

    engine.shutdown();
    report(&engine);
    info!("pageout-cli: engine shut down");
    Ok(())
}

/// Pre-mark a `dirty_percent` share of pages as dirty and vnode-backed, so
/// the writeback pipeline has real work from the first scheduler tick.
fn seed_workload(sim: &Arc<Simulation>, dirty_percent: u64) {
    let dirty_percent = dirty_percent.min(100);
    if dirty_percent == 0 {
        return;
    }
    let stride = (100 / dirty_percent).max(1);
    let mut page = 0u64;
    let total = sim.total_pages();
    while page < total {
        sim.set_mod(page, true);
        sim.set_vnode(page, Some(page / 4096 + 1));
        page += stride;
    }
}

fn report(engine: &PageoutEngine) {
    let stats = engine.stats();
    let sched = engine.scheduler_stats();
    println!(
        "freed={} fsfree={} execfree={} anonfree={} dirty={} anondirty={} timeouts={} | \
         low_mem_ticks={} zone_cap_ticks={} idle_ticks={} | writeback_depth={}",
        stats.dfree.load(Ordering::Relaxed),
        stats.fsfree.load(Ordering::Relaxed),
        stats.execfree.load(Ordering::Relaxed),
        stats.anonfree.load(Ordering::Relaxed),
        stats.zpo_dirty.load(Ordering::Relaxed),
        stats.zpo_anondirty.load(Ordering::Relaxed),
        stats.timeouts.load(Ordering::Relaxed),
        sched.low_mem_scan.load(Ordering::Relaxed),
        sched.zone_cap_scan.load(Ordering::Relaxed),
        sched.idle_ticks.load(Ordering::Relaxed),
        engine.writeback_depth(),
    );
}
