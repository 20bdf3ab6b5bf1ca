//! Page reclamation core: threshold derivation, a multi-threaded two-handed
//! clock scanner, and an asynchronous writeback pipeline, modeled after a
//! Unix-like kernel's virtual memory pageout subsystem.
//!
//! [`PageoutEngine`] is the entry point. Build one from a [`PageoutTunables`]
//! and an `Arc<dyn Collaborators>` (the host's page table, HAT layer, vnode
//! layer, and allocator state), call [`PageoutEngine::run`] to start the
//! ticker, scanner fleet, writeback drainer, and deadman threads, and
//! [`PageoutEngine::shutdown`] to stop them. [`sim::Simulation`] is a
//! self-contained `Collaborators` implementation for tests and the demo CLI.

mod collab;
mod config;
mod engine;
mod error;
mod predicate;
mod scanner;
mod scheduler;
pub mod sim;
mod stats;
mod writeback;

pub use collab::{
    Collaborators, Hat, PageAttr, PageDisposer, PageId, PageRing, PageTable, PressureRelief,
    SystemClock, SystemObservables, VnodeId, VnodeOps, ZoneId,
};
pub use config::{
    bytes_to_pages, PageoutTunables, ThresholdStyle, Thresholds, MAX_PSCAN_THREADS, PAGESIZE,
    SCHEDPAGING_HZ,
};
pub use engine::PageoutEngine;
pub use error::{ConfigError, PageoutError, Result};
pub use predicate::{CheckPageResult, PageoutHand};
pub use stats::{PageoutStats, SchedulerStats};
pub use writeback::{Deadman, DeadmanVerdict, WritebackQueue, WritebackSink};
