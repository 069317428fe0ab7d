//! # Statistics
//!
//! Lock-free counters shared by every worker, and the read-only snapshot
//! exposed to the request surface.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counter block
#[derive(Debug, Default)]
pub struct Stats {
    reclaim_requests: AtomicU64,
    swapin_requests: AtomicU64,
    queue_full_drops: AtomicU64,
    alloc_drops: AtomicU64,
    cancellations: AtomicU64,
    stale_items: AtomicU64,
    stale_processes: AtomicU64,
    pages_scanned: AtomicU64,
    pages_reclaimed: AtomicU64,
    pages_swapped_in: AtomicU64,
    promoted_batches: AtomicU64,
    sweep_runs: AtomicU64,
    memex_passes: AtomicU64,
    state_races: AtomicU64,
    counter_underflows: AtomicU64,
    swapin_retries: AtomicU64,
    walks_in_flight: AtomicU64,
}

/// Which counter to bump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    /// Reclaim work items enqueued
    ReclaimRequests,
    /// Swap-in work items enqueued
    SwapinRequests,
    /// Work items rejected by a full queue
    QueueFullDrops,
    /// Per-process records that could not be allocated
    AllocDrops,
    /// Queued reclaims cancelled by a return to foreground
    Cancellations,
    /// Dequeued items whose request had been superseded
    StaleItems,
    /// Dequeued items or candidates whose process had exited
    StaleProcesses,
    /// Sweep passes completed
    SweepRuns,
    /// Low-memory reclaimer passes completed
    MemexPasses,
    /// Unexpected state changes found at walk completion
    StateRaces,
    /// Swap-in walks restarted after a page-table race
    SwapinRetries,
}

impl Stats {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::ReclaimRequests => &self.reclaim_requests,
            Counter::SwapinRequests => &self.swapin_requests,
            Counter::QueueFullDrops => &self.queue_full_drops,
            Counter::AllocDrops => &self.alloc_drops,
            Counter::Cancellations => &self.cancellations,
            Counter::StaleItems => &self.stale_items,
            Counter::StaleProcesses => &self.stale_processes,
            Counter::SweepRuns => &self.sweep_runs,
            Counter::MemexPasses => &self.memex_passes,
            Counter::StateRaces => &self.state_races,
            Counter::SwapinRetries => &self.swapin_retries,
        }
    }

    /// Increment a counter
    #[inline]
    pub fn bump(&self, counter: Counter) {
        self.counter(counter).fetch_add(1, Ordering::Relaxed);
    }

    /// Account for one reclaim walk
    pub fn record_walk(&self, scanned: u64, reclaimed: u64, promoted_batches: u64) {
        self.pages_scanned.fetch_add(scanned, Ordering::Relaxed);
        self.pages_reclaimed.fetch_add(reclaimed, Ordering::Relaxed);
        self.promoted_batches
            .fetch_add(promoted_batches, Ordering::Relaxed);
    }

    /// Account for pages brought back in
    pub fn record_swapin(&self, pages: u64) {
        self.pages_swapped_in.fetch_add(pages, Ordering::Relaxed);
    }

    /// A walk started
    pub fn walk_started(&self) {
        self.walks_in_flight.fetch_add(1, Ordering::AcqRel);
    }

    /// A walk finished
    ///
    /// The in-flight gauge is clamped at zero. Going below it means a
    /// start/finish pair was mismatched; that is counted and logged.
    pub fn walk_finished(&self) {
        let dec = self
            .walks_in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if dec.is_err() {
            self.counter_underflows.fetch_add(1, Ordering::Relaxed);
            log::warn!("Stats: walks_in_flight underflow, clamped at 0");
        }
    }

    /// Take a consistent-enough snapshot of every counter
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            reclaim_requests: load(&self.reclaim_requests),
            swapin_requests: load(&self.swapin_requests),
            queue_full_drops: load(&self.queue_full_drops),
            alloc_drops: load(&self.alloc_drops),
            cancellations: load(&self.cancellations),
            stale_items: load(&self.stale_items),
            stale_processes: load(&self.stale_processes),
            pages_scanned: load(&self.pages_scanned),
            pages_reclaimed: load(&self.pages_reclaimed),
            pages_swapped_in: load(&self.pages_swapped_in),
            promoted_batches: load(&self.promoted_batches),
            sweep_runs: load(&self.sweep_runs),
            memex_passes: load(&self.memex_passes),
            state_races: load(&self.state_races),
            counter_underflows: load(&self.counter_underflows),
            swapin_retries: load(&self.swapin_retries),
            walks_in_flight: load(&self.walks_in_flight),
        }
    }
}

/// Point-in-time copy of [`Stats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Reclaim work items enqueued
    pub reclaim_requests: u64,
    /// Swap-in work items enqueued
    pub swapin_requests: u64,
    /// Work items rejected by a full queue
    pub queue_full_drops: u64,
    /// Per-process records that could not be allocated
    pub alloc_drops: u64,
    /// Queued reclaims cancelled by a return to foreground
    pub cancellations: u64,
    /// Dequeued items whose request had been superseded
    pub stale_items: u64,
    /// Items or candidates whose process had exited
    pub stale_processes: u64,
    /// Pages looked at by reclaim walks
    pub pages_scanned: u64,
    /// Pages written to a backend
    pub pages_reclaimed: u64,
    /// Pages faulted in or read ahead
    pub pages_swapped_in: u64,
    /// Batches rerouted from the slow to the fast backend
    pub promoted_batches: u64,
    /// Sweep passes completed
    pub sweep_runs: u64,
    /// Low-memory reclaimer passes completed
    pub memex_passes: u64,
    /// Unexpected state changes found at walk completion
    pub state_races: u64,
    /// Internal counters clamped at zero
    pub counter_underflows: u64,
    /// Swap-in walks restarted after a page-table race
    pub swapin_retries: u64,
    /// Walks currently running
    pub walks_in_flight: u64,
}
