//! Narrow interfaces to the external collaborators this crate does not own:
//! the page table / HAT layer, the vnode layer, the allocator's observable
//! state, and the system clock. Everything here is a trait so a real kernel
//! integration and the in-process [`crate::sim`] backend can share the same
//! engine code.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Index into the logical page ring, `[0, total_pages)`.
pub type PageId = u64;
/// Opaque zone identifier, as returned by [`PageTable::zone_id`].
pub type ZoneId = u32;
/// Opaque vnode identifier, held across the page-lock drop on the dirty
/// path and released by the drainer after writeback completes.
pub type VnodeId = u64;

bitflags! {
    /// Reference and modified bits as sampled or cleared by the HAT layer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct PageAttr: u8 {
        /// The page has been referenced (read or written) since last sampled.
        const REF = 0b0000_0001;
        /// The page has been modified since last sampled.
        const MOD = 0b0000_0010;
    }
}

/// Physical page ring iterator. `next`/`nextn` use modular arithmetic; the
/// source's pointer-chasing representation is an implementation detail this
/// crate does not mirror.
pub trait PageRing: Send + Sync {
    /// Total pageable physical pages. Immutable after boot.
    fn total_pages(&self) -> u64;

    /// The first page in ring order.
    fn first(&self) -> PageId {
        0
    }

    /// The page one slot past `p`, wrapping at `total_pages`.
    fn next(&self, p: PageId) -> PageId {
        let total = self.total_pages().max(1);
        (p + 1) % total
    }

    /// The page `k` slots past `p`, wrapping at `total_pages`.
    fn nextn(&self, p: PageId, k: u64) -> PageId {
        let total = self.total_pages().max(1);
        (p + k) % total
    }

    /// The page at ring offset `offset`, wrapping at `total_pages`.
    fn at(&self, offset: u64) -> PageId {
        let total = self.total_pages().max(1);
        offset % total
    }
}

/// Non-blocking per-page locking and the handful of attribute reads
/// `checkpage`'s ineligibility gate needs.
pub trait PageTable: Send + Sync {
    /// Page belongs to a kernel address space and is never reclaimable.
    fn is_kernel(&self, p: PageId) -> bool;
    /// Page is already on the free list.
    fn is_free(&self, p: PageId) -> bool;
    /// Number of long-term holders (e.g. locked-in-memory mappings).
    fn lckcnt(&self, p: PageId) -> u32;
    /// Copy-on-write reference count.
    fn cowcnt(&self, p: PageId) -> u32;
    /// Page size code; nonzero means a large page that may need demotion
    /// before reclamation.
    fn size_code(&self, p: PageId) -> u8;
    /// Backing vnode, if any (absent for pure anonymous memory with no
    /// swap reservation yet).
    fn vnode(&self, p: PageId) -> Option<VnodeId>;
    /// Owning zone, if the host tracks per-zone accounting.
    fn zone_id(&self, p: PageId) -> Option<ZoneId>;
    /// Whether a vnode is swap-backed (anonymous) rather than file-backed.
    fn is_swapfs_vnode(&self, vp: VnodeId) -> bool;
    /// Whether a vnode backs an executable mapping (text/data segments),
    /// distinct from an ordinary file-backed vnode.
    fn is_exec_vnode(&self, vp: VnodeId) -> bool;
    /// Attempt a non-blocking exclusive lock; `false` on contention.
    fn try_lock_exclusive(&self, p: PageId) -> bool;
    /// Release a lock previously acquired by `try_lock_exclusive`.
    fn unlock(&self, p: PageId);
}

/// Hardware address translation primitives.
pub trait Hat: Send + Sync {
    /// Sample reference/modified bits across all mappings. `zero` clears
    /// them after sampling (front-hand semantics); when `false`, bits are
    /// left intact (back-hand semantics).
    fn pagesync(&self, p: PageId, zero: bool) -> PageAttr;
    /// Explicitly clear the reference bit.
    fn clr_ref(&self, p: PageId);
    /// Unload all mappings, forcing any further access to fault in fresh
    /// attributes; returns the attributes observed immediately after.
    fn page_unload_force(&self, p: PageId) -> PageAttr;
    /// Re-read attributes without side effects.
    fn get_attr(&self, p: PageId) -> PageAttr;
    /// Whether the page is mapped by more than `threshold` address spaces.
    fn checkshare(&self, p: PageId, threshold: u64) -> bool;
    /// Best-effort demotion of a large page to base page size.
    fn try_demote(&self, p: PageId) -> bool;
}

/// VFS back-end for dirty-page writeback.
pub trait VnodeOps: Send + Sync {
    /// Take a counted hold, keeping the vnode alive across the page-lock
    /// drop and the cross-thread handoff to the drainer.
    fn hold(&self, vp: VnodeId);
    /// Release a hold taken by `hold`.
    fn release(&self, vp: VnodeId);
    /// Issue the asynchronous write-and-free for one page at `offset`.
    fn putpage(&self, vp: VnodeId, offset: u64) -> std::io::Result<()>;
}

/// Returns a clean page to the free list.
pub trait PageDisposer: Send + Sync {
    /// Dispose page `p`, which must be exclusively locked by the caller.
    fn dispose_free(&self, p: PageId);
}

/// Allocator and zone-accounting state the scheduler observes but does not
/// own.
pub trait SystemObservables: Send + Sync {
    /// Pages currently on the free list.
    fn freemem(&self) -> u64;
    /// Pages requested by blocked allocators.
    fn needfree(&self) -> u64;
    /// Pages the reclaimer still owes, decayed by the allocator.
    fn deficit(&self) -> u64;
    /// Count of zones currently exceeding their soft memory cap.
    fn zone_num_over_cap(&self) -> u32;
    /// Whether a specific zone is over its cap.
    fn zone_over_cap(&self, zid: ZoneId) -> bool;
    /// Whether the kernel memory allocator currently has headroom.
    fn kmem_avail(&self) -> bool;
}

/// Pressure-relief collaborators invoked by the scheduler tick.
pub trait PressureRelief: Send + Sync {
    /// Ask the slab allocator to reap caches.
    fn kmem_reap(&self);
    /// Ask the segment layer to pre-reap.
    fn seg_preap(&self);
    /// Wake the kernel memory cage's cageout thread.
    fn kcage_cageout_wakeup(&self);
}

/// Monotonic clock, standing in for `gethrtime()`.
pub trait SystemClock: Send + Sync {
    /// Nanoseconds since an arbitrary epoch, monotonic within a process.
    fn now_ns(&self) -> u64;
}

/// Bundle of every external collaborator the engine needs. Implemented once
/// for a real kernel integration, and once (as [`crate::sim::Simulation`])
/// for tests and the demo CLI.
pub trait Collaborators: Send + Sync {
    /// The physical page ring.
    fn ring(&self) -> &dyn PageRing;
    /// The page table.
    fn pages(&self) -> &dyn PageTable;
    /// The HAT layer.
    fn hat(&self) -> &dyn Hat;
    /// The vnode layer.
    fn vnodes(&self) -> &dyn VnodeOps;
    /// The free-list disposer.
    fn disposer(&self) -> &dyn PageDisposer;
    /// Observed allocator/zone state.
    fn observables(&self) -> &dyn SystemObservables;
    /// Pressure-relief collaborators.
    fn relief(&self) -> &dyn PressureRelief;
    /// The system clock.
    fn clock(&self) -> &dyn SystemClock;
}
