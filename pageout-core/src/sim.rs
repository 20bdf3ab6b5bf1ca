//! In-process simulation of every external collaborator from §6. Used by
//! this crate's own tests and by the demo CLI; a real kernel integration
//! would implement the same traits against actual page tables, HAT calls,
//! and vnodes instead.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use crate::collab::{
    Collaborators, Hat, PageAttr, PageDisposer, PageId, PageRing, PageTable, PressureRelief,
    SystemClock, SystemObservables, VnodeId, VnodeOps, ZoneId,
};

#[derive(Clone, Copy, Default)]
struct PageCell {
    kernel: bool,
    free: bool,
    lckcnt: u32,
    cowcnt: u32,
    size_code: u8,
    vnode: Option<VnodeId>,
    zone: Option<ZoneId>,
    referenced: bool,
    modified: bool,
}

/// A deterministic, single-process stand-in for the physical page ring,
/// HAT layer, vnode layer, and allocator-observed state.
pub struct Simulation {
    total_pages: u64,
    pages: Vec<Mutex<PageCell>>,
    vnode_holds: Mutex<HashMap<VnodeId, u32>>,
    swapfs_vnodes: Mutex<HashSet<VnodeId>>,
    exec_vnodes: Mutex<HashSet<VnodeId>>,
    zone_over_cap: Mutex<HashMap<ZoneId, bool>>,
    freemem: AtomicU64,
    needfree: AtomicU64,
    deficit: AtomicU64,
    zone_num_over_cap: AtomicU32,
    kmem_avail: AtomicBool,
    start: Instant,
}

impl Simulation {
    /// Build a simulation with `total_pages` pages, all initially clean,
    /// unreferenced, and not free (i.e. resident and scannable), with
    /// `freemem` defaulted to the full page count.
    pub fn new(total_pages: u64) -> Self {
        let page_count = total_pages as usize;
        Self {
            total_pages,
            pages: (0..page_count).map(|_| Mutex::new(PageCell::default())).collect(),
            vnode_holds: Mutex::new(HashMap::new()),
            swapfs_vnodes: Mutex::new(HashSet::new()),
            exec_vnodes: Mutex::new(HashSet::new()),
            zone_over_cap: Mutex::new(HashMap::new()),
            freemem: AtomicU64::new(total_pages),
            needfree: AtomicU64::new(0),
            deficit: AtomicU64::new(0),
            zone_num_over_cap: AtomicU32::new(0),
            kmem_avail: AtomicBool::new(false),
            start: Instant::now(),
        }
    }

    fn cell(&self, p: PageId) -> &Mutex<PageCell> {
        &self.pages[p as usize]
    }

    /// Test/demo hook: mark a page as currently referenced.
    pub fn set_ref(&self, p: PageId, value: bool) {
        self.cell(p).lock().unwrap().referenced = value;
    }

    /// Test/demo hook: read whether a page is currently referenced.
    pub fn get_ref(&self, p: PageId) -> bool {
        self.cell(p).lock().unwrap().referenced
    }

    /// Test/demo hook: mark a page as currently modified (dirty).
    pub fn set_mod(&self, p: PageId, value: bool) {
        self.cell(p).lock().unwrap().modified = value;
    }

    /// Test/demo hook: assign (or clear) a page's backing vnode.
    pub fn set_vnode(&self, p: PageId, vnode: Option<VnodeId>) {
        self.cell(p).lock().unwrap().vnode = vnode;
    }

    /// Test/demo hook: mark a page as belonging to kernel address space.
    pub fn set_kernel(&self, p: PageId, value: bool) {
        self.cell(p).lock().unwrap().kernel = value;
    }

    /// Test/demo hook: assign a page's owning zone.
    pub fn set_zone(&self, p: PageId, zone: Option<ZoneId>) {
        self.cell(p).lock().unwrap().zone = zone;
    }

    /// Test/demo hook: flip whether a zone is reported over its cap.
    pub fn set_zone_over_cap(&self, zid: ZoneId, over: bool) {
        self.zone_over_cap.lock().unwrap().insert(zid, over);
    }

    /// Test/demo hook: mark a vnode as swap-backed (anonymous).
    pub fn set_swapfs(&self, vnode: VnodeId, swapfs: bool) {
        let mut set = self.swapfs_vnodes.lock().unwrap();
        if swapfs {
            set.insert(vnode);
        } else {
            set.remove(&vnode);
        }
    }

    /// Test/demo hook: mark a vnode as backing an executable mapping.
    pub fn set_exec(&self, vnode: VnodeId, exec: bool) {
        let mut set = self.exec_vnodes.lock().unwrap();
        if exec {
            set.insert(vnode);
        } else {
            set.remove(&vnode);
        }
    }

    /// Test/demo hook: current hold count on a vnode.
    pub fn hold_count(&self, vnode: VnodeId) -> u32 {
        *self.vnode_holds.lock().unwrap().get(&vnode).unwrap_or(&0)
    }

    /// Test/demo hook: whether a page is on the free list.
    pub fn is_free(&self, p: PageId) -> bool {
        self.cell(p).lock().unwrap().free
    }

    /// Test/demo hook: set the observed free-page count.
    pub fn set_freemem(&self, value: u64) {
        self.freemem.store(value, Ordering::Relaxed);
    }

    /// Test/demo hook: set the observed waiter-requested page count.
    pub fn set_needfree(&self, value: u64) {
        self.needfree.store(value, Ordering::Relaxed);
    }

    /// Test/demo hook: set the observed deficit.
    pub fn set_deficit(&self, value: u64) {
        self.deficit.store(value, Ordering::Relaxed);
    }

    /// Test/demo hook: set the number of zones over their cap.
    pub fn set_zone_num_over_cap(&self, value: u32) {
        self.zone_num_over_cap.store(value, Ordering::Relaxed);
    }

    /// Test/demo hook: flip whether the allocator reports kernel memory
    /// headroom.
    pub fn set_kmem_avail(&self, value: bool) {
        self.kmem_avail.store(value, Ordering::Relaxed);
    }
}

impl PageRing for Simulation {
    fn total_pages(&self) -> u64 {
        self.total_pages
    }
}

impl PageTable for Simulation {
    fn is_kernel(&self, p: PageId) -> bool {
        self.cell(p).lock().unwrap().kernel
    }

    fn is_free(&self, p: PageId) -> bool {
        self.cell(p).lock().unwrap().free
    }

    fn lckcnt(&self, p: PageId) -> u32 {
        self.cell(p).lock().unwrap().lckcnt
    }

    fn cowcnt(&self, p: PageId) -> u32 {
        self.cell(p).lock().unwrap().cowcnt
    }

    fn size_code(&self, p: PageId) -> u8 {
        self.cell(p).lock().unwrap().size_code
    }

    fn vnode(&self, p: PageId) -> Option<VnodeId> {
        self.cell(p).lock().unwrap().vnode
    }

    fn zone_id(&self, p: PageId) -> Option<ZoneId> {
        self.cell(p).lock().unwrap().zone
    }

    fn is_swapfs_vnode(&self, vp: VnodeId) -> bool {
        self.swapfs_vnodes.lock().unwrap().contains(&vp)
    }

    fn is_exec_vnode(&self, vp: VnodeId) -> bool {
        self.exec_vnodes.lock().unwrap().contains(&vp)
    }

    fn try_lock_exclusive(&self, _p: PageId) -> bool {
        // The simulation has no contending mutators, so the non-blocking
        // try-lock never fails.
        true
    }

    fn unlock(&self, _p: PageId) {}
}

impl Hat for Simulation {
    fn pagesync(&self, p: PageId, zero: bool) -> PageAttr {
        let mut cell = self.cell(p).lock().unwrap();
        let mut attr = PageAttr::empty();
        if cell.referenced {
            attr |= PageAttr::REF;
        }
        if cell.modified {
            attr |= PageAttr::MOD;
        }
        if zero {
            cell.referenced = false;
            cell.modified = false;
        }
        attr
    }

    fn clr_ref(&self, p: PageId) {
        self.cell(p).lock().unwrap().referenced = false;
    }

    fn page_unload_force(&self, p: PageId) -> PageAttr {
        let cell = self.cell(p).lock().unwrap();
        let mut attr = PageAttr::empty();
        if cell.referenced {
            attr |= PageAttr::REF;
        }
        if cell.modified {
            attr |= PageAttr::MOD;
        }
        attr
    }

    fn get_attr(&self, p: PageId) -> PageAttr {
        let cell = self.cell(p).lock().unwrap();
        let mut attr = PageAttr::empty();
        if cell.referenced {
            attr |= PageAttr::REF;
        }
        if cell.modified {
            attr |= PageAttr::MOD;
        }
        attr
    }

    fn checkshare(&self, _p: PageId, _threshold: u64) -> bool {
        false
    }

    fn try_demote(&self, p: PageId) -> bool {
        self.cell(p).lock().unwrap().size_code = 0;
        true
    }
}

impl VnodeOps for Simulation {
    fn hold(&self, vp: VnodeId) {
        *self.vnode_holds.lock().unwrap().entry(vp).or_insert(0) += 1;
    }

    fn release(&self, vp: VnodeId) {
        if let Some(count) = self.vnode_holds.lock().unwrap().get_mut(&vp) {
            *count = count.saturating_sub(1);
        }
    }

    fn putpage(&self, _vp: VnodeId, _offset: u64) -> std::io::Result<()> {
        Ok(())
    }
}

impl PageDisposer for Simulation {
    fn dispose_free(&self, p: PageId) {
        self.cell(p).lock().unwrap().free = true;
    }
}

impl SystemObservables for Simulation {
    fn freemem(&self) -> u64 {
        self.freemem.load(Ordering::Relaxed)
    }

    fn needfree(&self) -> u64 {
        self.needfree.load(Ordering::Relaxed)
    }

    fn deficit(&self) -> u64 {
        self.deficit.load(Ordering::Relaxed)
    }

    fn zone_num_over_cap(&self) -> u32 {
        self.zone_num_over_cap.load(Ordering::Relaxed)
    }

    fn zone_over_cap(&self, zid: ZoneId) -> bool {
        *self.zone_over_cap.lock().unwrap().get(&zid).unwrap_or(&false)
    }

    fn kmem_avail(&self) -> bool {
        self.kmem_avail.load(Ordering::Relaxed)
    }
}

impl PressureRelief for Simulation {
    fn kmem_reap(&self) {}
    fn seg_preap(&self) {}
    fn kcage_cageout_wakeup(&self) {}
}

impl SystemClock for Simulation {
    fn now_ns(&self) -> u64 {
        self.start.elapsed().as_nanos() as u64
    }
}

impl Collaborators for Simulation {
    fn ring(&self) -> &dyn PageRing {
        self
    }

    fn pages(&self) -> &dyn PageTable {
        self
    }

    fn hat(&self) -> &dyn Hat {
        self
    }

    fn vnodes(&self) -> &dyn VnodeOps {
        self
    }

    fn disposer(&self) -> &dyn PageDisposer {
        self
    }

    fn observables(&self) -> &dyn SystemObservables {
        self
    }

    fn relief(&self) -> &dyn PressureRelief {
        self
    }

    fn clock(&self) -> &dyn SystemClock {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_pages_are_clean_and_resident() {
        let sim = Simulation::new(8);
        assert!(!sim.is_free(0));
        assert!(!sim.get_ref(0));
    }

    #[test]
    fn ring_wraps_at_total_pages() {
        let sim = Simulation::new(4);
        assert_eq!(sim.ring().next(3), 0);
        assert_eq!(sim.ring().nextn(2, 5), 3);
    }

    #[test]
    fn vnode_hold_release_is_counted() {
        let sim = Simulation::new(1);
        sim.vnodes().hold(42);
        sim.vnodes().hold(42);
        assert_eq!(sim.hold_count(42), 2);
        sim.vnodes().release(42);
        assert_eq!(sim.hold_count(42), 1);
    }
}
