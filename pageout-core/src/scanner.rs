//! The scanner fleet: a task-set of long-lived threads walking the page
//! ring with a front/back hand pair, growing and shrinking to track
//! `des_page_scanners`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, info};

use crate::collab::PageId;
use crate::config::{MAX_PSCAN_THREADS, PAGEOUT_RESET_CNT, PAGEOUT_SAMPLE_LIM, PAGES_POLL_MASK};
use crate::engine::PageoutEngine;
use crate::predicate::{checkpage, CheckPageResult, CheckpageContext, PageoutHand};

struct ScannerSlot {
    reset: Arc<AtomicBool>,
    join: thread::JoinHandle<()>,
}

/// Task-set of scanner threads. Each owns its slot index and exits
/// voluntarily once it observes `inst >= n_page_scanners`; growth spawns a
/// new thread directly, per the design notes' "task set" replacement for
/// the source's kernel-primitive thread spawn + self-terminate pattern.
pub(crate) struct ScannerFleet {
    slots: std::sync::Mutex<Vec<Option<ScannerSlot>>>,
}

impl ScannerFleet {
    pub(crate) fn new() -> Self {
        Self {
            slots: std::sync::Mutex::new((0..MAX_PSCAN_THREADS).map(|_| None).collect()),
        }
    }

    /// Broadcast a wakeup to every parked scanner.
    pub(crate) fn wake_all(&self, wakeup: &crate::engine::WakeupSignal) {
        let (lock, cv) = wakeup;
        let mut generation = lock.lock().unwrap();
        *generation = generation.wrapping_add(1);
        cv.notify_all();
    }

    /// Converge the live thread count toward `target`: reap any thread that
    /// has already self-exited, raise every live slot's reset flag (forcing
    /// reposition, and self-exit for any slot now `>= target`), then spawn
    /// new threads for any still-missing slot below `target`.
    pub(crate) fn rebalance(&self, engine: &Arc<PageoutEngine>, target: usize) {
        let target = target.clamp(1, MAX_PSCAN_THREADS);
        let mut slots = self.slots.lock().unwrap();

        for slot_opt in slots.iter_mut() {
            let finished = slot_opt
                .as_ref()
                .map(|s| s.join.is_finished())
                .unwrap_or(false);
            if finished {
                *slot_opt = None;
            }
        }

        for slot in slots.iter().flatten() {
            slot.reset.store(true, Ordering::Release);
        }

        let mut live = slots.iter().filter(|s| s.is_some()).count();
        if target > live {
            for inst in 0..MAX_PSCAN_THREADS {
                if live >= target {
                    break;
                }
                if slots[inst].is_some() {
                    continue;
                }
                let reset = Arc::new(AtomicBool::new(true));
                let engine_clone = engine.clone();
                let reset_clone = reset.clone();
                let join = thread::Builder::new()
                    .name(format!("pageout-scan:{inst}"))
                    .spawn(move || run_scanner(inst, engine_clone, reset_clone))
                    .expect("failed to spawn scanner thread");
                slots[inst] = Some(ScannerSlot { reset, join });
                live += 1;
            }
        }
        debug!("pageout: scanner fleet rebalanced, target={target} live={live}");
    }

    /// Join every thread that is still tracked. Called from
    /// [`PageoutEngine::shutdown`](crate::PageoutEngine::shutdown).
    pub(crate) fn join_all(&self) {
        let mut slots = self.slots.lock().unwrap();
        for slot_opt in slots.iter_mut() {
            if let Some(slot) = slot_opt.take() {
                let _ = slot.join.join();
            }
        }
    }
}

fn run_scanner(inst: usize, engine: Arc<PageoutEngine>, reset_flag: Arc<AtomicBool>) {
    let mut fronthand: PageId = 0;
    let mut backhand: PageId = 0;
    let mut wraps: u64 = 0;
    let mut wrap_fail_streak: u32 = 0;
    let mut last_seen_generation: u64 = 0;

    loop {
        if engine.shutdown.load(Ordering::Relaxed) {
            return;
        }

        {
            let (lock, cv) = engine.wakeup.as_ref();
            let mut generation = lock.lock().unwrap();
            while *generation == last_seen_generation
                && !engine.shutdown.load(Ordering::Relaxed)
            {
                let (next, timeout) = cv
                    .wait_timeout(generation, Duration::from_millis(200))
                    .unwrap();
                generation = next;
                if timeout.timed_out() {
                    break;
                }
            }
            last_seen_generation = *generation;
        }

        if engine.shutdown.load(Ordering::Relaxed) {
            return;
        }

        if reset_flag.swap(false, Ordering::AcqRel) {
            let n_page_scanners = engine.shared.n_page_scanners.load(Ordering::Acquire);
            if inst >= n_page_scanners {
                debug!("pageout-scan:{inst} exiting, surplus to target {n_page_scanners}");
                return;
            }
            reposition(inst, &engine, &mut fronthand, &mut backhand);
            wraps = 0;
            wrap_fail_streak = 0;
        }

        scan_cycle(
            inst,
            &engine,
            &reset_flag,
            &mut fronthand,
            &mut backhand,
            &mut wraps,
            &mut wrap_fail_streak,
        );
    }
}

fn reposition(inst: usize, engine: &Arc<PageoutEngine>, fronthand: &mut PageId, backhand: &mut PageId) {
    let ring = engine.collab.ring();
    let total_pages = ring.total_pages().max(1);
    let n = engine
        .shared
        .n_page_scanners
        .load(Ordering::Acquire)
        .max(1) as u64;
    let th = *engine.thresholds.read().unwrap();

    *backhand = ring.at((total_pages / n) * inst as u64);
    *fronthand = if th.handspreadpages >= total_pages {
        ring.at(*backhand + total_pages - 1)
    } else {
        ring.nextn(*backhand, th.handspreadpages)
    };
}

#[allow(clippy::too_many_arguments)]
fn scan_cycle(
    inst: usize,
    engine: &Arc<PageoutEngine>,
    reset_flag: &Arc<AtomicBool>,
    fronthand: &mut PageId,
    backhand: &mut PageId,
    wraps: &mut u64,
    wrap_fail_streak: &mut u32,
) {
    let ring = engine.collab.ring();
    let th = *engine.thresholds.read().unwrap();
    let startup = !engine.shared.calibration_done.load(Ordering::Acquire);
    let zones_over = engine.shared.zones_over.load(Ordering::Acquire);
    let nscan_limit = if startup {
        ring.total_pages()
    } else {
        engine.shared.desscan.load(Ordering::Acquire)
    };
    let pageout_nsec = engine.shared.pageout_nsec.load(Ordering::Acquire);
    let sample_start = engine.collab.clock().now_ns();

    let mut nscan_cnt: u64 = 0;
    let mut pages_polled: u64 = 0;
    let mut calib_pages: u64 = 0;

    loop {
        if nscan_cnt >= nscan_limit {
            break;
        }
        let obs = engine.collab.observables();
        let low_memory = obs.freemem() < th.lotsfree.saturating_add(obs.needfree());
        if !(zones_over || low_memory || startup) {
            break;
        }

        pages_polled += 1;
        if pages_polled & PAGES_POLL_MASK == PAGES_POLL_MASK {
            let elapsed = engine
                .collab
                .clock()
                .now_ns()
                .saturating_sub(sample_start);
            if elapsed >= pageout_nsec {
                if !zones_over {
                    engine.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                }
                break;
            }
        }

        let ctx = CheckpageContext {
            collab: engine.collab.as_ref(),
            stats: &engine.stats,
            po_share: engine.shared.po_share.load(Ordering::Acquire),
            zones_over,
            writeback: engine.writeback.as_ref(),
        };
        let front_result = checkpage(*fronthand, PageoutHand::Front, &ctx);
        let back_result = checkpage(*backhand, PageoutHand::Back, &ctx);

        if front_result == CheckPageResult::Freed || back_result == CheckPageResult::Freed {
            *wrap_fail_streak = 0;
        }
        if front_result != CheckPageResult::Ineligible || back_result != CheckPageResult::Ineligible {
            nscan_cnt += 1;
        }
        if inst == 0 && startup {
            calib_pages += 2;
        }

        *fronthand = ring.next(*fronthand);
        *backhand = ring.next(*backhand);

        if *fronthand == ring.first() {
            *wraps += 1;
            if *wraps % PAGEOUT_RESET_CNT == 0 {
                reset_flag.store(true, Ordering::Release);
            }
            if !zones_over && low_memory && !startup {
                if front_result == CheckPageResult::Freed || back_result == CheckPageResult::Freed {
                    *wrap_fail_streak = 0;
                } else {
                    *wrap_fail_streak += 1;
                    if *wrap_fail_streak >= 2 {
                        let share = engine.shared.po_share.load(Ordering::Acquire);
                        if share >= crate::config::MAX_PO_SHARE {
                            break;
                        }
                        engine
                            .shared
                            .po_share
                            .store((share * 2).min(crate::config::MAX_PO_SHARE), Ordering::Release);
                    }
                }
            }
        }
    }

    engine.shared.nscan.fetch_add(nscan_cnt, Ordering::Relaxed);

    if inst == 0 && startup {
        calibration_tail(engine, calib_pages, sample_start);
    }
}

fn calibration_tail(engine: &Arc<PageoutEngine>, pages: u64, sample_start: u64) {
    let elapsed = engine
        .collab
        .clock()
        .now_ns()
        .saturating_sub(sample_start)
        .max(1);
    engine
        .calibration
        .sample_pages
        .fetch_add(pages, Ordering::Relaxed);
    engine
        .calibration
        .sample_etime
        .fetch_add(elapsed, Ordering::Relaxed);
    let samples = engine.calibration.sample_cnt.fetch_add(1, Ordering::Relaxed) + 1;
    if samples < PAGEOUT_SAMPLE_LIM {
        return;
    }

    let mut new_spread = engine.calibration.new_spread.lock().unwrap();
    if new_spread.is_some() {
        return;
    }

    let total_pages = engine.calibration.sample_pages.load(Ordering::Relaxed);
    let total_etime = engine.calibration.sample_etime.load(Ordering::Relaxed).max(1);
    let rate = total_pages.saturating_mul(1_000_000_000) / total_etime;
    let spread = (rate / 10).max(1);
    *new_spread = Some(spread);
    drop(new_spread);

    engine.shared.calibration_done.store(true, Ordering::Release);
    engine.recalc(Some(spread));
    info!("pageout: calibration complete, rate={rate} pages/sec, handspread retuned to {spread}");
}
