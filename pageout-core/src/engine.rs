//! Ties the threshold configurator, scanner fleet, writeback pipeline, and
//! deadman together into one running system.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use log::error;

use crate::collab::Collaborators;
use crate::config::{
    make_clock_init, setupclock, ClockInit, CpuBudget, PageoutTunables, Thresholds,
    MIN_PO_SHARE, SCHEDPAGING_HZ,
};
use crate::error::Result;
use crate::scanner::ScannerFleet;
use crate::scheduler::schedpaging;
use crate::stats::{PageoutStats, SchedulerStats};
use crate::writeback::{Deadman, DeadmanVerdict, WritebackQueue};

/// Global scalar state shared by the ticker, scanner fleet, and drainer.
/// Everything here is a single-word atomic: the original's "tick tolerates
/// stale reads" ordering contract (§4.2) means relaxed/acquire-release is
/// enough, no cross-field lock is needed.
pub(crate) struct SharedState {
    pub nscan: AtomicU64,
    pub desscan: AtomicU64,
    pub pageout_nsec: AtomicU64,
    pub po_share: AtomicU64,
    pub zones_over: AtomicBool,
    pub calibration_done: AtomicBool,
    pub n_page_scanners: AtomicUsize,
    pub des_page_scanners: AtomicUsize,
}

impl SharedState {
    fn new(initial_target: usize) -> Self {
        Self {
            nscan: AtomicU64::new(0),
            desscan: AtomicU64::new(0),
            pageout_nsec: AtomicU64::new(0),
            po_share: AtomicU64::new(MIN_PO_SHARE),
            zones_over: AtomicBool::new(false),
            calibration_done: AtomicBool::new(false),
            n_page_scanners: AtomicUsize::new(0),
            des_page_scanners: AtomicUsize::new(initial_target),
        }
    }
}

/// Calibration accumulators. Single-writer: scanner 0, only while
/// `calibration_done` is false.
pub(crate) struct CalibrationState {
    pub sample_cnt: AtomicU64,
    pub sample_pages: AtomicU64,
    pub sample_etime: AtomicU64,
    pub new_spread: Mutex<Option<u64>>,
}

impl CalibrationState {
    fn new() -> Self {
        Self {
            sample_cnt: AtomicU64::new(0),
            sample_pages: AtomicU64::new(0),
            sample_etime: AtomicU64::new(0),
            new_spread: Mutex::new(None),
        }
    }
}

/// The wakeup signal scanners park on between cycles: a generation counter
/// bumped and broadcast by the scheduler tick.
pub(crate) type WakeupSignal = (Mutex<u64>, Condvar);

/// The page reclamation engine. Owns the derived thresholds, the shared
/// scalar state, the scanner fleet, and the writeback pipeline; drives them
/// from three background threads started by [`PageoutEngine::run`].
pub struct PageoutEngine {
    pub(crate) clock_init: ClockInit,
    pub(crate) thresholds: RwLock<Thresholds>,
    pub(crate) cpu_budget: CpuBudget,
    pub(crate) shared: SharedState,
    pub(crate) calibration: CalibrationState,
    pub(crate) stats: PageoutStats,
    pub(crate) sched_stats: SchedulerStats,
    pub(crate) collab: Arc<dyn Collaborators>,
    pub(crate) writeback: Arc<WritebackQueue>,
    pub(crate) deadman: Deadman,
    pub(crate) fleet: ScannerFleet,
    pub(crate) shutdown: Arc<AtomicBool>,
    pub(crate) wakeup: Arc<WakeupSignal>,
    pub(crate) memavail: Arc<(Mutex<()>, Condvar)>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl PageoutEngine {
    /// Validate `tunables`, snapshot them against `collab`'s reported total
    /// page count, and derive the boot-time thresholds (`setupclock` with
    /// `recalc=false`).
    pub fn new(tunables: PageoutTunables, collab: Arc<dyn Collaborators>) -> Result<Arc<Self>> {
        let total_pages = collab.ring().total_pages();
        let clock_init = make_clock_init(tunables.clone(), total_pages)?;
        let cpu_budget = CpuBudget::derive(&clock_init.tunables);
        let thresholds = setupclock(&clock_init, false, None);
        let capacity = tunables.async_list_size.unwrap_or(256);
        let writeback = Arc::new(WritebackQueue::new(capacity, thresholds.maxpgio));
        let deadman = Deadman::new(tunables.pageout_deadman_seconds.unwrap_or(90));
        let initial_target = thresholds.des_page_scanners;

        Ok(Arc::new(Self {
            clock_init,
            thresholds: RwLock::new(thresholds),
            cpu_budget,
            shared: SharedState::new(initial_target),
            calibration: CalibrationState::new(),
            stats: PageoutStats::default(),
            sched_stats: SchedulerStats::default(),
            collab,
            writeback,
            deadman,
            fleet: ScannerFleet::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
            wakeup: Arc::new((Mutex::new(0), Condvar::new())),
            memavail: Arc::new((Mutex::new(()), Condvar::new())),
            handles: Mutex::new(Vec::new()),
        }))
    }

    /// A read-only snapshot of the currently derived thresholds.
    pub fn thresholds(&self) -> Thresholds {
        *self.thresholds.read().unwrap()
    }

    /// Reclamation counters accumulated so far.
    pub fn stats(&self) -> &PageoutStats {
        &self.stats
    }

    /// Scheduler wake-reason counters accumulated so far.
    pub fn scheduler_stats(&self) -> &SchedulerStats {
        &self.sched_stats
    }

    /// Pending writeback requests.
    pub fn writeback_depth(&self) -> usize {
        self.writeback.len()
    }

    /// Whether the startup calibration pass has completed.
    pub fn calibration_done(&self) -> bool {
        self.shared.calibration_done.load(Ordering::Acquire)
    }

    /// Re-run the threshold configurator against the frozen boot snapshot,
    /// optionally with a freshly calibrated handspread. Never derives from
    /// the previous [`Thresholds`] — only from the snapshot — so repeated
    /// recalcs stay idempotent.
    pub(crate) fn recalc(&self, new_spread: Option<u64>) {
        let th = setupclock(&self.clock_init, true, new_spread);
        self.shared
            .des_page_scanners
            .store(th.des_page_scanners, Ordering::Release);
        self.writeback.retune_max_pushes(th.maxpgio);
        *self.thresholds.write().unwrap() = th;
    }

    /// Start the ticker, scanner fleet, drainer, and deadman. Returns once
    /// all background threads have been spawned; call [`Self::shutdown`] to
    /// stop them.
    pub fn run(self: &Arc<Self>) {
        self.shared.n_page_scanners.store(1, Ordering::Release);
        self.fleet.rebalance(self, 1);

        let mut handles = Vec::with_capacity(3);

        let ticker_engine = self.clone();
        handles.push(
            thread::Builder::new()
                .name("pageout-ticker".into())
                .spawn(move || run_ticker(ticker_engine))
                .expect("failed to spawn ticker thread"),
        );

        let drainer_engine = self.clone();
        handles.push(
            thread::Builder::new()
                .name("pageout-drainer".into())
                .spawn(move || {
                    drainer_engine
                        .writeback
                        .run(drainer_engine.collab.as_ref(), &drainer_engine.shutdown)
                })
                .expect("failed to spawn drainer thread"),
        );

        let deadman_engine = self.clone();
        handles.push(
            thread::Builder::new()
                .name("pageout-deadman".into())
                .spawn(move || run_deadman(deadman_engine))
                .expect("failed to spawn deadman thread"),
        );

        self.handles.lock().unwrap().extend(handles);
    }

    /// Cooperative stop: not part of the source kernel's scope (process 2
    /// never exits), added so a library/CLI consumer can tear the engine
    /// down deterministically in tests and demos.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.fleet.wake_all(&self.wakeup);
        self.writeback.notify_tick();

        let handles: Vec<_> = self.handles.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        self.fleet.join_all();
    }
}

fn run_ticker(engine: Arc<PageoutEngine>) {
    let period = Duration::from_millis(1000 / SCHEDPAGING_HZ);
    while !engine.shutdown.load(Ordering::Relaxed) {
        schedpaging(&engine);
        thread::sleep(period);
    }
}

fn run_deadman(engine: Arc<PageoutEngine>) {
    while !engine.shutdown.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_secs(1));
        if engine.shutdown.load(Ordering::Relaxed) {
            break;
        }
        let freemem = engine.collab.observables().freemem();
        if let DeadmanVerdict::Panic { freemem } = engine.deadman.tick(&engine.writeback, freemem) {
            error!("pageout: deadman detected no writeback progress for configured limit, freemem={freemem}");
            std::process::abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PageoutTunables;
    use crate::sim::Simulation;
    use std::time::Duration as StdDuration;

    #[test]
    fn engine_boots_and_shuts_down_cleanly() {
        let sim: Arc<dyn Collaborators> = Arc::new(Simulation::new(4096));
        let engine = PageoutEngine::new(PageoutTunables::default(), sim).unwrap();
        engine.run();
        thread::sleep(StdDuration::from_millis(50));
        engine.shutdown();
        assert!(engine.thresholds().lotsfree > 0);
    }

    #[test]
    fn rejects_zero_total_pages() {
        let sim: Arc<dyn Collaborators> = Arc::new(Simulation::new(0));
        assert!(PageoutEngine::new(PageoutTunables::default(), sim).is_err());
    }
}
