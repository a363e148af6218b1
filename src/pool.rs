//! Object pools + recycler - strict checkout/return discipline
//!
//! Hot-path objects (canonical events, merged events, execution reports)
//! are checked out of typed pools and must be returned exactly once.
//! Free-lists are lock-free ring buffers; counters are atomics.
//!
//! # Contract
//!
//! - `checkout()` returns a zeroed instance. Pool exhaustion is not an
//!   error: a fresh instance is allocated instead.
//! - `recycle()` resets every field and re-enqueues the instance. Returns
//!   beyond the configured cache size are dropped and freed.
//! - With debug checks on, the pool keeps a live-set keyed by pointer
//!   address and writes a poison word into recycled instances. Recycling
//!   a pointer already in the returned set is a programmer error and
//!   aborts the process.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_queue::ArrayQueue;
use dashmap::DashMap;

use crate::config::PoolConfig;

/// Poison pattern written into the first machine word of a recycled
/// instance when debug checks are enabled.
pub const POISON_PATTERN: u64 = 0xDEAD_BEEF_DEAD_BEEF;

// ============================================================
// POOL SLOT + POOLABLE
// ============================================================

/// Pool bookkeeping embedded as the FIRST field of every poolable struct,
/// so the poison sentinel occupies the leading machine word.
#[derive(Debug, Default)]
pub struct PoolSlot {
    poison: u64,
    returned: bool,
}

impl PoolSlot {
    /// True once the owning instance has been returned to its pool.
    /// Cleared again on checkout.
    pub fn is_returned(&self) -> bool {
        self.returned
    }
}

/// Implemented by every pooled type.
pub trait Poolable: Default + Send + std::fmt::Debug + 'static {
    fn slot(&mut self) -> &mut PoolSlot;
    fn slot_ref(&self) -> &PoolSlot;

    /// Reset every data field to its zero value. Must be total and
    /// idempotent; pool bookkeeping is handled by the pool itself.
    fn reset(&mut self);
}

// ============================================================
// DEBUG LEDGER
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq)]
enum PtrState {
    Live,
    Returned,
}

/// Address-keyed checkout ledger, only consulted when debug checks are on.
#[derive(Debug, Default)]
struct DebugLedger {
    states: DashMap<usize, PtrState>,
}

impl DebugLedger {
    fn mark_live(&self, addr: usize) {
        self.states.insert(addr, PtrState::Live);
    }

    /// Returns an error message if this return violates the discipline.
    fn mark_returned(&self, addr: usize) -> Result<(), &'static str> {
        match self.states.get(&addr).map(|s| *s) {
            Some(PtrState::Live) => {
                self.states.insert(addr, PtrState::Returned);
                Ok(())
            }
            Some(PtrState::Returned) => Err("double free: pointer already recycled"),
            None => Err("recycle without a preceding checkout"),
        }
    }

    fn forget(&self, addr: usize) {
        self.states.remove(&addr);
    }

    fn live_count(&self) -> usize {
        self.states
            .iter()
            .filter(|e| *e.value() == PtrState::Live)
            .count()
    }
}

// ============================================================
// TYPED POOL
// ============================================================

/// Lock-free pool of boxed instances of one type.
#[derive(Debug)]
pub struct Pool<T: Poolable> {
    name: &'static str,
    free: ArrayQueue<Box<T>>,
    ledger: Option<DebugLedger>,
    checkouts: AtomicU64,
    recycles: AtomicU64,
    fresh_allocs: AtomicU64,
    overflow_dropped: AtomicU64,
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub checkouts: u64,
    pub recycles: u64,
    pub fresh_allocs: u64,
    pub overflow_dropped: u64,
    pub cached: usize,
}

impl<T: Poolable> Pool<T> {
    pub fn new(name: &'static str, max_cached: usize, debug_checks: bool) -> Self {
        Self {
            name,
            free: ArrayQueue::new(max_cached.max(1)),
            ledger: debug_checks.then(DebugLedger::default),
            checkouts: AtomicU64::new(0),
            recycles: AtomicU64::new(0),
            fresh_allocs: AtomicU64::new(0),
            overflow_dropped: AtomicU64::new(0),
        }
    }

    /// Checkout a zeroed instance. Never fails: an empty free-list falls
    /// back to a fresh allocation.
    pub fn checkout(&self) -> Box<T> {
        self.checkouts.fetch_add(1, Ordering::Relaxed);

        let mut obj = match self.free.pop() {
            Some(mut cached) => {
                if self.ledger.is_some() && cached.slot_ref().poison != POISON_PATTERN {
                    self.fail(format!(
                        "pool {}: cached instance missing poison word (free-list corruption)",
                        self.name
                    ));
                }
                cached.slot().poison = 0;
                cached
            }
            None => {
                self.fresh_allocs.fetch_add(1, Ordering::Relaxed);
                Box::new(T::default())
            }
        };

        obj.slot().returned = false;
        if let Some(ledger) = &self.ledger {
            ledger.mark_live(addr_of(&*obj));
        }
        obj
    }

    /// Return an instance to the pool. Resets all fields; in debug mode
    /// poisons the first word and records the return. A second return of
    /// the same pointer is fatal.
    pub fn recycle(&self, mut obj: Box<T>) {
        if obj.slot_ref().returned {
            self.fail(format!(
                "pool {}: instance carries returned flag on recycle (double free)",
                self.name
            ));
        }
        if let Some(ledger) = &self.ledger {
            if let Err(violation) = ledger.mark_returned(addr_of(&*obj)) {
                self.fail(format!("pool {}: {}", self.name, violation));
            }
        }

        obj.reset();
        obj.slot().returned = true;
        if self.ledger.is_some() {
            obj.slot().poison = POISON_PATTERN;
        }
        self.recycles.fetch_add(1, Ordering::Relaxed);

        if let Err(dropped) = self.free.push(obj) {
            // Cache full: free the instance and forget its address so a
            // later allocation at the same address starts clean.
            self.overflow_dropped.fetch_add(1, Ordering::Relaxed);
            if let Some(ledger) = &self.ledger {
                ledger.forget(addr_of(&*dropped));
            }
            drop(dropped);
        }
    }

    /// Batch return; `None` entries are skipped.
    pub fn recycle_many<I>(&self, objects: I)
    where
        I: IntoIterator<Item = Option<Box<T>>>,
    {
        for obj in objects.into_iter().flatten() {
            self.recycle(obj);
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            checkouts: self.checkouts.load(Ordering::Relaxed),
            recycles: self.recycles.load(Ordering::Relaxed),
            fresh_allocs: self.fresh_allocs.load(Ordering::Relaxed),
            overflow_dropped: self.overflow_dropped.load(Ordering::Relaxed),
            cached: self.free.len(),
        }
    }

    /// Instances currently checked out according to the counters.
    pub fn outstanding(&self) -> u64 {
        self.checkouts
            .load(Ordering::Relaxed)
            .saturating_sub(self.recycles.load(Ordering::Relaxed))
    }

    /// Live instances per the debug ledger; `None` when debug checks are
    /// off.
    pub fn live_debug(&self) -> Option<usize> {
        self.ledger.as_ref().map(|l| l.live_count())
    }

    fn fail(&self, msg: String) -> ! {
        tracing::error!(pool = self.name, "{msg}");
        #[cfg(test)]
        panic!("{msg}");
        #[cfg(not(test))]
        {
            eprintln!("{msg}");
            std::process::abort();
        }
    }
}

/// Heap address of a boxed instance, the ledger key.
fn addr_of<T>(obj: &T) -> usize {
    obj as *const T as usize
}

// ============================================================
// RECYCLER
// ============================================================

use crate::event::{Event, ExecReport, MergedEvent};

/// Process-wide recycling service holding the typed pools. Constructed
/// once at startup and injected into every component that allocates on
/// the hot path; there are no implicit global reads.
#[derive(Debug)]
pub struct Recycler {
    events: Pool<Event>,
    merged: Pool<MergedEvent>,
    exec_reports: Pool<ExecReport>,
}

/// Counters for all three pools.
#[derive(Debug, Clone, Copy)]
pub struct RecyclerStats {
    pub events: PoolStats,
    pub merged: PoolStats,
    pub exec_reports: PoolStats,
}

impl Recycler {
    pub fn new(config: &PoolConfig) -> Arc<Self> {
        Arc::new(Self {
            events: Pool::new("event", config.max_cached, config.debug_checks),
            merged: Pool::new("merged_event", config.max_cached, config.debug_checks),
            exec_reports: Pool::new("exec_report", config.max_cached, config.debug_checks),
        })
    }

    pub fn checkout_event(&self) -> Box<Event> {
        self.events.checkout()
    }

    pub fn recycle_event(&self, event: Box<Event>) {
        self.events.recycle(event);
    }

    pub fn recycle_events<I>(&self, events: I)
    where
        I: IntoIterator<Item = Option<Box<Event>>>,
    {
        self.events.recycle_many(events);
    }

    pub fn checkout_merged(&self) -> Box<MergedEvent> {
        self.merged.checkout()
    }

    pub fn recycle_merged(&self, merged: Box<MergedEvent>) {
        self.merged.recycle(merged);
    }

    pub fn checkout_exec_report(&self) -> Box<ExecReport> {
        self.exec_reports.checkout()
    }

    pub fn recycle_exec_report(&self, report: Box<ExecReport>) {
        self.exec_reports.recycle(report);
    }

    pub fn stats(&self) -> RecyclerStats {
        RecyclerStats {
            events: self.events.stats(),
            merged: self.merged.stats(),
            exec_reports: self.exec_reports.stats(),
        }
    }

    /// Events checked out and not yet returned, across all pools.
    pub fn outstanding(&self) -> u64 {
        self.events.outstanding() + self.merged.outstanding() + self.exec_reports.outstanding()
    }
}
