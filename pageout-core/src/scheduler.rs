//! The scheduler tick (`schedpaging`): runs four times a second, decides
//! how hard to scan this cycle, and wakes the scanner fleet.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::trace;

use crate::config::{MAX_PSCAN_THREADS, SCHEDPAGING_HZ};
use crate::engine::PageoutEngine;

/// Cache-reap headroom above `lotsfree` at which the tick asks the slab
/// allocator to reap ahead of actual pressure. Not part of the tunables
/// table (the distilled spec's tunable list omits it); left at zero, which
/// recovers "only reap once pressure is already at lotsfree".
const KMEM_REAPAHEAD: u64 = 0;

/// Run one scheduler tick. Mirrors §4.2's ten-step procedure; reschedule is
/// the caller's job (the ticker thread sleeps `1/SCHEDPAGING_HZ` between
/// calls).
pub(crate) fn schedpaging(engine: &Arc<PageoutEngine>) {
    let obs = engine.collab.observables();
    let relief = engine.collab.relief();

    let freemem = obs.freemem();
    let needfree = obs.needfree();
    let deficit = obs.deficit();
    let th = engine.thresholds();

    // 1. Cache reaping.
    if freemem < th.lotsfree + needfree + KMEM_REAPAHEAD {
        relief.kmem_reap();
        if freemem < th.lotsfree + needfree {
            relief.seg_preap();
        }
    }

    // 3. Reset nscan for this cycle.
    engine.shared.nscan.store(0, Ordering::Relaxed);

    let calibration_done = engine.shared.calibration_done.load(Ordering::Acquire);

    // 4. vavail.
    let needfree_component = if calibration_done { needfree } else { 0 };
    let vavail = freemem
        .saturating_sub(deficit)
        .saturating_sub(needfree_component)
        .min(th.lotsfree);

    // 5. desscan.
    let desscan = if needfree > 0 && !calibration_done {
        th.fastscan / SCHEDPAGING_HZ
    } else {
        let lotsfree = th.lotsfree.max(1);
        (th.slowscan * vavail + th.fastscan * (lotsfree - vavail)) / lotsfree / SCHEDPAGING_HZ
    };
    engine.shared.desscan.store(desscan, Ordering::Release);

    // 6. pageout_nsec.
    let pageout_nsec = if !calibration_done {
        engine.cpu_budget.max_pageout_nsec
    } else {
        let lotsfree = th.lotsfree.max(1);
        let span = engine.cpu_budget.max_pageout_nsec - engine.cpu_budget.min_pageout_nsec;
        engine.cpu_budget.min_pageout_nsec + (lotsfree - vavail) * span / lotsfree
    };
    engine.shared.pageout_nsec.store(pageout_nsec, Ordering::Release);

    // 7. Rebalance scanner count.
    if calibration_done {
        let desired = engine.shared.des_page_scanners.load(Ordering::Acquire);
        let current = engine.shared.n_page_scanners.load(Ordering::Acquire);
        if desired != current {
            let max_allowed = if th.handspreadpages > 0 {
                (engine.collab.ring().total_pages() / th.handspreadpages).max(1) as usize
            } else {
                MAX_PSCAN_THREADS
            };
            let clamped = desired.clamp(1, MAX_PSCAN_THREADS.min(max_allowed));
            engine.shared.des_page_scanners.store(clamped, Ordering::Release);
            engine.shared.n_page_scanners.store(clamped, Ordering::Release);
            engine.fleet.rebalance(engine, clamped);
        }
    }

    // 8. Wake reason.
    let low_memory = freemem < th.lotsfree + needfree || !calibration_done;
    engine.shared.zones_over.store(false, Ordering::Release);

    if low_memory {
        engine.sched_stats.low_mem_scan.fetch_add(1, Ordering::Relaxed);
        relief.kcage_cageout_wakeup();
        engine.fleet.wake_all(&engine.wakeup);
    } else if obs.zone_num_over_cap() > 0 {
        engine.sched_stats.zone_cap_scan.fetch_add(1, Ordering::Relaxed);
        engine
            .shared
            .desscan
            .store(engine.collab.ring().total_pages(), Ordering::Release);
        let zone_nsec = engine
            .clock_init
            .tunables
            .zone_pageout_nsec
            .filter(|&n| n != 0)
            .unwrap_or(engine.cpu_budget.max_pageout_nsec);
        engine.shared.pageout_nsec.store(zone_nsec, Ordering::Release);
        engine.shared.zones_over.store(true, Ordering::Release);
        engine.fleet.wake_all(&engine.wakeup);
    } else {
        engine.sched_stats.idle_ticks.fetch_add(1, Ordering::Relaxed);
        let current_share = engine.shared.po_share.load(Ordering::Acquire);
        if current_share > crate::config::MIN_PO_SHARE {
            engine.shared.po_share.store(
                (current_share / 2).max(crate::config::MIN_PO_SHARE),
                Ordering::Release,
            );
        }
        if !engine.writeback.is_empty() {
            engine.writeback.notify_tick();
        }
    }

    // 9. Broadcast memory-available, deliberately without holding the
    // paired lock — the next tick retries if a waiter misses this one.
    if obs.kmem_avail() {
        let (_, cv) = engine.memavail.as_ref();
        cv.notify_all();
    }

    trace!(
        "pageout: tick freemem={freemem} needfree={needfree} vavail={vavail} desscan={desscan} pageout_nsec={pageout_nsec}"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::Collaborators;
    use crate::config::PageoutTunables;
    use crate::sim::Simulation;

    fn engine_with(total_pages: u64) -> (Arc<PageoutEngine>, Arc<Simulation>) {
        let sim = Arc::new(Simulation::new(total_pages));
        let engine =
            PageoutEngine::new(PageoutTunables::default(), sim.clone() as Arc<dyn Collaborators>)
                .unwrap();
        (engine, sim)
    }

    #[test]
    fn tick_under_pressure_produces_consistent_desscan() {
        let (engine, sim) = engine_with(4096);
        engine.shared.calibration_done.store(true, Ordering::Release);
        sim.set_freemem(1000);
        sim.set_needfree(500);

        schedpaging(&engine);
        // See `config::tests::boot_sizing_1gib` and friends for the exact
        // numeric scenarios on `setupclock`; this only checks the tick
        // stays within the bounds the threshold configurator promises.
        assert!(engine.shared.desscan.load(Ordering::Acquire) <= engine.thresholds().fastscan);
    }

    #[test]
    fn zone_cap_only_mode_sets_full_scan_and_zones_over() {
        let (engine, sim) = engine_with(1_000_000);
        engine.shared.calibration_done.store(true, Ordering::Release);
        sim.set_freemem(1_000_000);
        sim.set_zone_num_over_cap(1);

        schedpaging(&engine);
        assert!(engine.shared.zones_over.load(Ordering::Acquire));
        assert_eq!(
            engine.shared.desscan.load(Ordering::Acquire),
            engine.collab.ring().total_pages()
        );
        assert_eq!(
            engine.shared.pageout_nsec.load(Ordering::Acquire),
            engine.cpu_budget.max_pageout_nsec
        );
    }

    #[test]
    fn zone_cap_only_mode_honors_zone_pageout_nsec_tunable() {
        let sim = Arc::new(Simulation::new(1_000_000));
        let mut tunables = PageoutTunables::default();
        tunables.zone_pageout_nsec = Some(123_456);
        let engine =
            PageoutEngine::new(tunables, sim.clone() as Arc<dyn Collaborators>).unwrap();
        engine.shared.calibration_done.store(true, Ordering::Release);
        sim.set_freemem(1_000_000);
        sim.set_zone_num_over_cap(1);

        schedpaging(&engine);
        assert_eq!(engine.shared.pageout_nsec.load(Ordering::Acquire), 123_456);
    }

    #[test]
    fn idle_tick_halves_po_share() {
        let (engine, sim) = engine_with(1_000_000);
        engine.shared.calibration_done.store(true, Ordering::Release);
        engine.shared.po_share.store(64, Ordering::Release);
        sim.set_freemem(1_000_000);

        schedpaging(&engine);
        assert_eq!(engine.shared.po_share.load(Ordering::Acquire), 32);
    }
}
