//! Bounded writeback pipeline and deadman watchdog.
//!
//! A preallocated pool of request slots is split between a free list and a
//! pending FIFO; a single drainer thread pops from the pending side, issues
//! the write, and returns the slot to the free list. The deadman runs at
//! 1 Hz and escalates to a process abort if a single write stalls too long
//! — there is no soft recovery from a pageout deadlock.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use log::{debug, warn};

use crate::collab::{Collaborators, VnodeId};
use crate::config::SCHEDPAGING_HZ;

/// Sink `checkpage` enqueues dirty-page writeback requests into. Kept as a
/// trait (rather than a concrete `WritebackQueue` reference) so the
/// predicate module does not need to know about the drainer or deadman.
pub trait WritebackSink: Send + Sync {
    /// Attempt to enqueue a write of the page at `offset` within `vnode`.
    /// Returns `false` if the queue has no free slot; the caller releases
    /// its vnode hold in that case.
    fn queue_io_request(&self, vnode: VnodeId, offset: u64) -> bool;
}

#[derive(Debug, Clone, Copy)]
struct AsyncReq {
    vnode: VnodeId,
    offset: u64,
}

struct Inner {
    slots: Vec<Option<AsyncReq>>,
    free_list: VecDeque<usize>,
    push_list: VecDeque<usize>,
    pushes: u64,
    max_pushes: u64,
}

/// The bounded free-list/pending-list pair of writeback requests, plus the
/// drainer's progress counters the deadman watches.
pub struct WritebackQueue {
    inner: Mutex<Inner>,
    cv: Condvar,
    pageout_pushing: AtomicBool,
    pageout_pushcount: AtomicU64,
}

impl WritebackQueue {
    /// Build a queue with `capacity` preallocated slots (default 256 per
    /// the async_list_size tunable) and an initial per-tick push quota
    /// derived from `maxpgio`.
    pub fn new(capacity: usize, maxpgio: u64) -> Self {
        let free_list = (0..capacity).collect();
        Self {
            inner: Mutex::new(Inner {
                slots: vec![None; capacity],
                free_list,
                push_list: VecDeque::new(),
                pushes: 0,
                max_pushes: max_pushes_from(maxpgio),
            }),
            cv: Condvar::new(),
            pageout_pushing: AtomicBool::new(false),
            pageout_pushcount: AtomicU64::new(0),
        }
    }

    /// Re-derive `max_pushes` from a freshly retuned `maxpgio`. Called every
    /// time the drainer wakes, not just once at startup — the original's
    /// one-shot computation is flagged in the design notes as a likely bug
    /// this crate does not reproduce.
    pub fn retune_max_pushes(&self, maxpgio: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.max_pushes = max_pushes_from(maxpgio);
    }

    /// Number of requests currently pending drain.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().push_list.len()
    }

    /// Whether the pending list is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a write is currently in flight in the drainer.
    pub fn pushing(&self) -> bool {
        self.pageout_pushing.load(Ordering::Acquire)
    }

    /// Total requests the drainer has completed (successfully or not).
    pub fn pushcount(&self) -> u64 {
        self.pageout_pushcount.load(Ordering::Acquire)
    }

    /// Poke the drainer, e.g. from the scheduler's idle branch when
    /// something is queued but the drainer might be waiting on quota reset.
    pub fn notify_tick(&self) {
        self.cv.notify_all();
    }

    /// Block until a slot is drainable or `shutdown` is observed, then
    /// issue one write. Returns `false` only when shutting down with
    /// nothing left to drain.
    fn drain_one(&self, collab: &dyn Collaborators, shutdown: &AtomicBool) -> bool {
        let mut guard = self.inner.lock().unwrap();
        loop {
            if !guard.push_list.is_empty() && guard.pushes <= guard.max_pushes {
                break;
            }
            if shutdown.load(Ordering::Relaxed) && guard.push_list.is_empty() {
                return false;
            }
            let (next, _timeout) = self
                .cv
                .wait_timeout(guard, Duration::from_millis(200))
                .unwrap();
            guard = next;
            // Every re-entry into the wait resets the per-tick push quota,
            // whether the wakeup was a real signal or the poll timeout —
            // otherwise a backlog that never empties leaves `pushes` stuck
            // above `max_pushes` forever and the drainer never unblocks.
            guard.pushes = 0;
        }

        let slot = guard.push_list.pop_front().expect("checked non-empty above");
        let req = guard.slots[slot].take().expect("pending slot always filled");
        drop(guard);

        self.pageout_pushing.store(true, Ordering::Release);
        let result = collab.vnodes().putpage(req.vnode, req.offset);
        match &result {
            Ok(()) => debug!("pageout: wrote back vnode {} offset {}", req.vnode, req.offset),
            Err(e) => warn!("pageout: putpage failed for vnode {}: {e}", req.vnode),
        }
        collab.vnodes().release(req.vnode);

        let mut guard = self.inner.lock().unwrap();
        if result.is_ok() {
            guard.pushes += 1;
        }
        guard.slots[slot] = None;
        guard.free_list.push_back(slot);
        self.pageout_pushing.store(false, Ordering::Release);
        self.pageout_pushcount.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Drive the drainer loop until `shutdown` is set and the queue drains.
    pub fn run(&self, collab: &dyn Collaborators, shutdown: &AtomicBool) {
        while self.drain_one(collab, shutdown) {
            if shutdown.load(Ordering::Relaxed) && self.is_empty() {
                break;
            }
        }
    }
}

fn max_pushes_from(maxpgio: u64) -> u64 {
    (maxpgio / SCHEDPAGING_HZ).max(1)
}

impl WritebackSink for WritebackQueue {
    fn queue_io_request(&self, vnode: VnodeId, offset: u64) -> bool {
        let mut guard = self.inner.lock().unwrap();
        let Some(slot) = guard.free_list.pop_front() else {
            return false;
        };
        guard.slots[slot] = Some(AsyncReq { vnode, offset });
        guard.push_list.push_back(slot);
        let freelist_emptied = guard.free_list.is_empty();
        drop(guard);
        if freelist_emptied {
            self.cv.notify_one();
        }
        true
    }
}

/// Outcome of one deadman tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadmanVerdict {
    /// No stuck write detected.
    Ok,
    /// A single write has not progressed for `pageout_deadman_seconds`; the
    /// caller must treat this as fatal.
    Panic {
        /// Free page count at the moment of escalation, for the crash
        /// diagnostic.
        freemem: u64,
    },
}

/// 1 Hz watchdog over the writeback drainer's single in-flight write.
pub struct Deadman {
    seconds: u64,
    stucktime: AtomicU64,
    pushcount_seen: AtomicU64,
}

impl Deadman {
    /// `seconds == 0` disables the deadman entirely.
    pub fn new(seconds: u64) -> Self {
        Self {
            seconds,
            stucktime: AtomicU64::new(0),
            pushcount_seen: AtomicU64::new(0),
        }
    }

    /// Evaluate one tick against the queue's current progress counters.
    pub fn tick(&self, queue: &WritebackQueue, freemem: u64) -> DeadmanVerdict {
        if self.seconds == 0 {
            return DeadmanVerdict::Ok;
        }

        if !queue.pushing() {
            self.stucktime.store(0, Ordering::Relaxed);
            self.pushcount_seen.store(queue.pushcount(), Ordering::Relaxed);
            return DeadmanVerdict::Ok;
        }

        let seen = self.pushcount_seen.load(Ordering::Relaxed);
        let current = queue.pushcount();
        if current != seen {
            self.stucktime.store(0, Ordering::Relaxed);
            self.pushcount_seen.store(current, Ordering::Relaxed);
            return DeadmanVerdict::Ok;
        }

        let stuck = self.stucktime.fetch_add(1, Ordering::Relaxed) + 1;
        if stuck >= self.seconds {
            DeadmanVerdict::Panic { freemem }
        } else {
            DeadmanVerdict::Ok
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::Simulation;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn enqueue_fills_free_list_then_reports_full() {
        let q = WritebackQueue::new(2, 40);
        assert!(q.queue_io_request(1, 0));
        assert!(q.queue_io_request(1, 4096));
        assert!(!q.queue_io_request(1, 8192));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn drainer_processes_requests_and_replenishes_free_list() {
        let sim = Arc::new(Simulation::new(4));
        sim.set_vnode(0, Some(1));
        let queue = Arc::new(WritebackQueue::new(4, 4 * SCHEDPAGING_HZ));
        queue.queue_io_request(1, 0);

        let shutdown = Arc::new(AtomicBool::new(false));
        let (q2, s2, sd2) = (queue.clone(), sim.clone(), shutdown.clone());
        let handle = thread::spawn(move || {
            q2.run(s2.as_ref(), &sd2);
        });

        let mut waited = 0;
        while queue.pushcount() == 0 && waited < 500 {
            thread::sleep(Duration::from_millis(5));
            waited += 1;
        }
        shutdown.store(true, Ordering::Relaxed);
        queue.notify_tick();
        handle.join().unwrap();

        assert_eq!(queue.pushcount(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn drainer_keeps_draining_a_backlog_larger_than_the_push_quota() {
        // maxpgio=2, SCHEDPAGING_HZ=4 -> max_pushes=1: only one push is
        // allowed per quota window. Queue more requests than that and
        // confirm the drainer still empties the backlog instead of
        // stalling once `pushes` exceeds `max_pushes`.
        let sim = Arc::new(Simulation::new(8));
        for p in 0..8u64 {
            sim.set_vnode(p, Some(p + 1));
        }
        let queue = Arc::new(WritebackQueue::new(8, 2));
        for p in 0..8u64 {
            assert!(queue.queue_io_request(p + 1, p * 4096));
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let (q2, s2, sd2) = (queue.clone(), sim.clone(), shutdown.clone());
        let handle = thread::spawn(move || {
            q2.run(s2.as_ref(), &sd2);
        });

        let mut waited = 0;
        while queue.pushcount() < 8 && waited < 2000 {
            thread::sleep(Duration::from_millis(5));
            waited += 1;
        }
        shutdown.store(true, Ordering::Relaxed);
        queue.notify_tick();
        handle.join().unwrap();

        assert_eq!(queue.pushcount(), 8);
        assert!(queue.is_empty());
    }

    #[test]
    fn deadman_resets_on_progress_and_fires_without_it() {
        let queue = WritebackQueue::new(1, 4);
        let deadman = Deadman::new(3);

        queue.pageout_pushing.store(true, Ordering::Relaxed);
        assert_eq!(deadman.tick(&queue, 1000), DeadmanVerdict::Ok);
        assert_eq!(deadman.tick(&queue, 1000), DeadmanVerdict::Ok);
        assert_eq!(
            deadman.tick(&queue, 1000),
            DeadmanVerdict::Panic { freemem: 1000 }
        );
    }

    #[test]
    fn deadman_disabled_when_seconds_zero() {
        let queue = WritebackQueue::new(1, 4);
        let deadman = Deadman::new(0);
        queue.pageout_pushing.store(true, Ordering::Relaxed);
        for _ in 0..10 {
            assert_eq!(deadman.tick(&queue, 0), DeadmanVerdict::Ok);
        }
    }
}
