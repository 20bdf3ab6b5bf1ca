//! The page predicate: classify one page as ineligible, referenced, or
//! freeable, and drive it to the free list or the writeback queue.

use std::sync::atomic::Ordering;

use crate::collab::{Collaborators, PageAttr, PageId};
use crate::config::PAGESIZE;
use crate::stats::PageoutStats;
use crate::writeback::WritebackSink;

/// Which hand is calling `checkpage`. The two behave differently enough —
/// clear-and-move-on versus sample-and-trail — that this stays a tagged
/// enum with an exhaustive match rather than a trait object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageoutHand {
    /// Clears the reference bit it observes.
    Front,
    /// Samples without clearing; trailing by `handspreadpages`.
    Back,
}

/// Outcome of one `checkpage` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckPageResult {
    /// The page was never a candidate; not counted as a scan failure.
    Ineligible,
    /// The page was examined but is still referenced, still being written
    /// back, or its queue slot was unavailable.
    NotFreed,
    /// The page is on the free list, or a writeback request was enqueued
    /// that will free it asynchronously.
    Freed,
}

/// Everything `checkpage` needs beyond the page id and hand: the
/// collaborator bundle, the stats to bump, the current `po_share`
/// sensitivity, the writeback sink, and whether zone-over-cap mode is
/// active this tick.
pub struct CheckpageContext<'a> {
    /// External collaborators.
    pub collab: &'a dyn Collaborators,
    /// Counters to update on freed/dirty outcomes.
    pub stats: &'a PageoutStats,
    /// Current sharing-sensitivity ceiling.
    pub po_share: u64,
    /// Whether this cycle is scanning only zone-over-cap pages.
    pub zones_over: bool,
    /// Where to enqueue dirty-page writeback requests.
    pub writeback: &'a dyn WritebackSink,
}

/// Classify and, if eligible, reclaim page `pp`.
///
/// Operates under the page's own exclusive lock once past the ineligibility
/// gate; the lock is always released before returning.
pub fn checkpage(pp: PageId, hand: PageoutHand, ctx: &CheckpageContext<'_>) -> CheckPageResult {
    let pages = ctx.collab.pages();

    if pages.is_kernel(pp) || pages.is_free(pp) || pages.lckcnt(pp) != 0 || pages.cowcnt(pp) != 0 {
        return CheckPageResult::Ineligible;
    }
    if ctx.collab.hat().checkshare(pp, ctx.po_share) {
        return CheckPageResult::Ineligible;
    }

    if !pages.try_lock_exclusive(pp) {
        return CheckPageResult::Ineligible;
    }
    if pages.is_free(pp) || pages.lckcnt(pp) != 0 || pages.cowcnt(pp) != 0 {
        pages.unlock(pp);
        return CheckPageResult::Ineligible;
    }

    if ctx.zones_over {
        let over = pages
            .zone_id(pp)
            .map(|zid| ctx.collab.observables().zone_over_cap(zid))
            .unwrap_or(false);
        if !over {
            pages.unlock(pp);
            return CheckPageResult::Ineligible;
        }
    }

    let mut attr = sample(ctx, pp, hand);

    loop {
        if attr.contains(PageAttr::REF) {
            if hand == PageoutHand::Front {
                ctx.collab.hat().clr_ref(pp);
            }
            pages.unlock(pp);
            return CheckPageResult::NotFreed;
        }

        if pages.size_code(pp) != 0 {
            if !ctx.collab.hat().try_demote(pp) {
                pages.unlock(pp);
                return CheckPageResult::Ineligible;
            }
            attr = ctx.collab.hat().get_attr(pp);
            continue;
        }

        if attr.contains(PageAttr::MOD) {
            return dirty_path(ctx, pp);
        }

        return clean_path(ctx, pp);
    }
}

fn sample(ctx: &CheckpageContext<'_>, pp: PageId, hand: PageoutHand) -> PageAttr {
    match hand {
        PageoutHand::Front => ctx.collab.hat().pagesync(pp, true),
        PageoutHand::Back => ctx.collab.hat().pagesync(pp, false),
    }
}

/// Hand a dirty page to the writeback queue, holding the vnode across the
/// page-lock drop as the counted-handle design note requires.
fn dirty_path(ctx: &CheckpageContext<'_>, pp: PageId) -> CheckPageResult {
    let pages = ctx.collab.pages();
    let Some(vp) = pages.vnode(pp) else {
        // Dirty anonymous memory with no backing vnode yet: nothing to
        // write back to. Leave it resident.
        pages.unlock(pp);
        return CheckPageResult::NotFreed;
    };

    ctx.collab.vnodes().hold(vp);
    pages.unlock(pp);

    let offset = pp.saturating_mul(PAGESIZE);
    if ctx.writeback.queue_io_request(vp, offset) {
        if pages.is_swapfs_vnode(vp) {
            ctx.stats.zpo_anondirty.fetch_add(1, Ordering::Relaxed);
        } else {
            ctx.stats.zpo_dirty.fetch_add(1, Ordering::Relaxed);
        }
        CheckPageResult::Freed
    } else {
        ctx.collab.vnodes().release(vp);
        CheckPageResult::NotFreed
    }
}

/// Unload mappings and, absent any freshly observed reference or
/// modification, dispose the page to the free list.
fn clean_path(ctx: &CheckpageContext<'_>, pp: PageId) -> CheckPageResult {
    let pages = ctx.collab.pages();
    let attr = ctx.collab.hat().page_unload_force(pp);

    if attr.contains(PageAttr::REF) {
        pages.unlock(pp);
        return CheckPageResult::NotFreed;
    }
    if attr.contains(PageAttr::MOD) {
        return dirty_path(ctx, pp);
    }

    ctx.collab.disposer().dispose_free(pp);
    ctx.stats.dfree.fetch_add(1, Ordering::Relaxed);
    match pages.vnode(pp) {
        None => {
            ctx.stats.anonfree.fetch_add(1, Ordering::Relaxed);
        }
        Some(vp) if pages.is_swapfs_vnode(vp) => {
            ctx.stats.anonfree.fetch_add(1, Ordering::Relaxed);
        }
        Some(vp) if pages.is_exec_vnode(vp) => {
            ctx.stats.execfree.fetch_add(1, Ordering::Relaxed);
        }
        Some(_) => {
            ctx.stats.fsfree.fetch_add(1, Ordering::Relaxed);
        }
    }
    pages.unlock(pp);
    CheckPageResult::Freed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::Simulation;

    fn ctx<'a>(
        sim: &'a Simulation,
        stats: &'a PageoutStats,
        writeback: &'a dyn WritebackSink,
        zones_over: bool,
    ) -> CheckpageContext<'a> {
        CheckpageContext {
            collab: sim,
            stats,
            po_share: crate::config::MAX_PO_SHARE,
            zones_over,
            writeback,
        }
    }

    #[test]
    fn referenced_page_is_not_freed_and_front_hand_clears_ref() {
        let sim = Simulation::new(16);
        sim.set_ref(0, true);
        let stats = PageoutStats::default();
        let noop = crate::writeback::WritebackQueue::new(4, 40);
        let c = ctx(&sim, &stats, &noop, false);

        let result = checkpage(0, PageoutHand::Front, &c);
        assert_eq!(result, CheckPageResult::NotFreed);
        assert!(!sim.get_ref(0));
    }

    #[test]
    fn clean_unreferenced_page_is_freed() {
        let sim = Simulation::new(16);
        let stats = PageoutStats::default();
        let queue = crate::writeback::WritebackQueue::new(4, 40);
        let c = ctx(&sim, &stats, &queue, false);

        let result = checkpage(1, PageoutHand::Back, &c);
        assert_eq!(result, CheckPageResult::Freed);
        assert!(sim.is_free(1));
        assert_eq!(stats.dfree.load(Ordering::Relaxed), 1);
        assert_eq!(stats.anonfree.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn clean_executable_page_is_counted_as_execfree() {
        let sim = Simulation::new(16);
        sim.set_vnode(6, Some(11));
        sim.set_exec(11, true);
        let stats = PageoutStats::default();
        let queue = crate::writeback::WritebackQueue::new(4, 40);
        let c = ctx(&sim, &stats, &queue, false);

        let result = checkpage(6, PageoutHand::Back, &c);
        assert_eq!(result, CheckPageResult::Freed);
        assert_eq!(stats.execfree.load(Ordering::Relaxed), 1);
        assert_eq!(stats.fsfree.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn clean_plain_file_page_is_counted_as_fsfree() {
        let sim = Simulation::new(16);
        sim.set_vnode(7, Some(12));
        let stats = PageoutStats::default();
        let queue = crate::writeback::WritebackQueue::new(4, 40);
        let c = ctx(&sim, &stats, &queue, false);

        let result = checkpage(7, PageoutHand::Back, &c);
        assert_eq!(result, CheckPageResult::Freed);
        assert_eq!(stats.fsfree.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn dirty_page_with_vnode_enqueues_writeback() {
        let sim = Simulation::new(16);
        sim.set_vnode(2, Some(7));
        sim.set_mod(2, true);
        let stats = PageoutStats::default();
        let queue = crate::writeback::WritebackQueue::new(4, 40);
        let c = ctx(&sim, &stats, &queue, false);

        let result = checkpage(2, PageoutHand::Back, &c);
        assert_eq!(result, CheckPageResult::Freed);
        assert_eq!(queue.len(), 1);
        assert_eq!(stats.zpo_dirty.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn full_writeback_queue_releases_hold_and_reports_not_freed() {
        let sim = Simulation::new(16);
        sim.set_vnode(3, Some(9));
        sim.set_mod(3, true);
        let stats = PageoutStats::default();
        let queue = crate::writeback::WritebackQueue::new(0, 40);
        let c = ctx(&sim, &stats, &queue, false);

        let result = checkpage(3, PageoutHand::Back, &c);
        assert_eq!(result, CheckPageResult::NotFreed);
        assert_eq!(sim.hold_count(9), 0);
    }

    #[test]
    fn kernel_page_is_ineligible() {
        let sim = Simulation::new(16);
        sim.set_kernel(4, true);
        let stats = PageoutStats::default();
        let queue = crate::writeback::WritebackQueue::new(4, 40);
        let c = ctx(&sim, &stats, &queue, false);

        assert_eq!(
            checkpage(4, PageoutHand::Front, &c),
            CheckPageResult::Ineligible
        );
    }

    #[test]
    fn zone_cap_mode_skips_pages_outside_an_over_cap_zone() {
        let sim = Simulation::new(16);
        sim.set_zone(5, Some(1));
        let stats = PageoutStats::default();
        let queue = crate::writeback::WritebackQueue::new(4, 40);
        let c = ctx(&sim, &stats, &queue, true);

        assert_eq!(
            checkpage(5, PageoutHand::Front, &c),
            CheckPageResult::Ineligible
        );

        sim.set_zone_over_cap(1, true);
        assert_eq!(checkpage(5, PageoutHand::Front, &c), CheckPageResult::Freed);
    }
}
