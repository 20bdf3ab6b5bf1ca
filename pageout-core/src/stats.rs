//! Process-wide reclamation counters.
//!
//! The original scanner keeps most of these as per-CPU kstats for write
//! locality; this crate has no CPU-affinity concept, so they collapse into
//! plain atomics. Counted, never logged — matching §7's "always expected,
//! only counted" rule for ordinary reclamation outcomes.

use std::sync::atomic::AtomicU64;

/// Counters updated by [`crate::predicate::checkpage`] and the scan loop.
#[derive(Debug, Default)]
pub struct PageoutStats {
    /// Pages returned directly to the free list.
    pub dfree: AtomicU64,
    /// Clean file-backed pages freed.
    pub fsfree: AtomicU64,
    /// Clean executable-mapping pages freed.
    pub execfree: AtomicU64,
    /// Clean anonymous pages freed.
    pub anonfree: AtomicU64,
    /// Dirty file-backed pages handed to the writeback queue.
    pub zpo_dirty: AtomicU64,
    /// Dirty anonymous (swapfs-backed) pages handed to the writeback queue.
    pub zpo_anondirty: AtomicU64,
    /// Scan cycles that ended on CPU-budget exhaustion rather than
    /// reaching `desscan` or relieving memory pressure.
    pub timeouts: AtomicU64,
}

/// Counters updated by the scheduler tick.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    /// Ticks that woke scanners because of low free memory (or startup).
    pub low_mem_scan: AtomicU64,
    /// Ticks that woke scanners solely because a zone is over its cap.
    pub zone_cap_scan: AtomicU64,
    /// Ticks where neither condition held and scanners stayed parked.
    pub idle_ticks: AtomicU64,
}
