//! # Process Reclaim State Tracker
//!
//! Owns one [`ProcessRecord`] per process and is the only component allowed
//! to take a process from `Standby` into a queued state. The consuming
//! daemon (or the sweep) is the only one allowed to take it back out.
//!
//! ## State Machine
//!
//! ```text
//!              background, cooldown elapsed
//!   STANDBY ─────────────────────────────────▶ RECLAIM_QUEUED
//!     ▲  ▲ ◀──────────── foreground ───────────────┘   │
//!     │  │                                  daemon      │
//!     │  │                                  dequeues    ▼
//!     │  └──────────── walk done ─────────────── RECLAIM_DONE
//!     │                                               │ foreground
//!     │                                               ▼
//!     └──────────── swap-in done ──────────────  SWAPIN_QUEUED
//!
//!   STANDBY ──── sweep marks ───▶ GC_RECLAIM_QUEUED ──── sweep done ───▶ STANDBY
//! ```
//!
//! Every transition runs under the record's lock. The lock is never held
//! across a walk; walks of one process are serialized by a separate walk
//! lock instead.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Duration;

use hashbrown::{HashMap, HashSet};
use memplus_hal::Pid;
use spin::{Mutex, RwLock};

use crate::config::MemplusConfig;
use crate::queue::{WorkItem, WorkQueue};
use crate::stats::{Counter, Stats};
use crate::walker::ScanMarkers;

// =============================================================================
// Types
// =============================================================================

/// Per-process reclaim state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReclaimState {
    /// Idle; initial and terminal state of every cycle
    Standby,
    /// Waiting in the reclaim queue
    ReclaimQueued,
    /// Being walked by the reclaim daemon
    ReclaimDone,
    /// Waiting in the swap-in queue (or being walked by its daemon)
    SwapinQueued,
    /// Claimed by the background sweep
    GcReclaimQueued,
}

impl ReclaimState {
    /// Whether some worker currently owns the process
    pub const fn is_busy(&self) -> bool {
        !matches!(self, Self::Standby)
    }
}

/// Application-provided reclaim classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReclaimClass {
    /// Memory will be needed soon; treat as foreground
    WillNeed,
    /// Do not react to priority changes
    Ignore,
    /// Default: reclaim to the slow backend
    #[default]
    Normal,
    /// Frequently reused: reclaim to the fast backend
    Frequent,
}

impl ReclaimClass {
    /// The class a page batch is dispatched with
    pub const fn batch_class(&self) -> Self {
        match self {
            Self::Frequent => Self::Frequent,
            _ => Self::Normal,
        }
    }
}

/// A priority-change notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityChange {
    /// Process
    pub pid: Pid,
    /// Classification carried by the notification
    pub classification: ReclaimClass,
    /// Tier before the change
    pub old_tier: i32,
    /// Tier after the change
    pub new_tier: i32,
    /// Store `classification` on the record
    pub update: bool,
}

/// Outcome of [`Tracker::on_priority_change`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Nothing to do
    Unchanged,
    /// Classification says to ignore the process
    Ignored,
    /// Reclaim requested
    ReclaimQueued,
    /// Queued reclaim cancelled before the daemon got to it
    Cancelled,
    /// Swap-in requested
    SwapinQueued,
    /// The target queue was full; state left untouched
    QueueFull,
    /// No record could be allocated
    Dropped,
    /// Priority tracking is turned off by the enable tunable
    Disabled,
}

// =============================================================================
// Process Record
// =============================================================================

/// Draw a ticket no other record or item has ever carried
///
/// Records start at ticket 0, which no item is ever given, so a record
/// recreated for a reused pid never matches the items of the old one.
fn fresh_ticket() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug)]
struct RecordInner {
    state: ReclaimState,
    cooldown_until: Duration,
    classification: ReclaimClass,
    ticket: u64,
}

/// Reclaim bookkeeping of one process
#[derive(Debug)]
pub struct ProcessRecord {
    pid: Pid,
    inner: Mutex<RecordInner>,
    walk: std::sync::Mutex<()>,
    markers: ScanMarkers,
}

impl ProcessRecord {
    /// Create a `Standby` record
    pub fn new(pid: Pid) -> Self {
        Self {
            pid,
            inner: Mutex::new(RecordInner {
                state: ReclaimState::Standby,
                cooldown_until: Duration::ZERO,
                classification: ReclaimClass::Normal,
                ticket: 0,
            }),
            walk: std::sync::Mutex::new(()),
            markers: ScanMarkers::new(),
        }
    }

    /// Process ID
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Current state
    pub fn state(&self) -> ReclaimState {
        self.inner.lock().state
    }

    /// Stored classification
    pub fn classification(&self) -> ReclaimClass {
        self.inner.lock().classification
    }

    /// Mapping scan markers of this process
    pub fn markers(&self) -> &ScanMarkers {
        &self.markers
    }

    /// Hold while walking the process
    pub(crate) fn walk_guard(&self) -> MutexGuard<'_, ()> {
        self.walk.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reclaim daemon: claim a dequeued item
    ///
    /// Moves `ReclaimQueued` to `ReclaimDone` when the ticket is still the
    /// live one and returns the classification to walk with.
    pub(crate) fn begin_reclaim(&self, ticket: u64) -> Option<ReclaimClass> {
        let mut inner = self.inner.lock();
        if inner.state != ReclaimState::ReclaimQueued || inner.ticket != ticket {
            return None;
        }
        inner.state = ReclaimState::ReclaimDone;
        Some(inner.classification)
    }

    /// Reclaim daemon: walk finished
    ///
    /// A swap-in requested during the walk is left for the swap-in daemon.
    pub(crate) fn finish_reclaim(&self) -> ReclaimState {
        let mut inner = self.inner.lock();
        if inner.state == ReclaimState::ReclaimDone {
            inner.state = ReclaimState::Standby;
        }
        inner.state
    }

    /// Swap-in daemon: check a dequeued item is still live
    pub(crate) fn begin_swapin(&self, ticket: u64) -> bool {
        let inner = self.inner.lock();
        inner.state == ReclaimState::SwapinQueued && inner.ticket == ticket
    }

    /// Swap-in daemon: walk finished
    pub(crate) fn finish_swapin(&self) {
        let mut inner = self.inner.lock();
        if inner.state == ReclaimState::SwapinQueued {
            inner.state = ReclaimState::Standby;
        }
    }

    /// Sweep: claim an idle process
    pub(crate) fn mark_gc(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != ReclaimState::Standby {
            return false;
        }
        inner.state = ReclaimState::GcReclaimQueued;
        true
    }

    /// Sweep: release the process
    ///
    /// Always leaves the record in `Standby`. Returns the unexpected state
    /// found if someone else moved it in between.
    pub(crate) fn finish_gc(&self) -> Result<(), ReclaimState> {
        let mut inner = self.inner.lock();
        let found = inner.state;
        inner.state = ReclaimState::Standby;
        if found == ReclaimState::GcReclaimQueued {
            Ok(())
        } else {
            inner.ticket = fresh_ticket();
            Err(found)
        }
    }

    #[cfg(test)]
    pub(crate) fn force_state(&self, state: ReclaimState) {
        self.inner.lock().state = state;
    }
}

// =============================================================================
// Tracker
// =============================================================================

/// Process reclaim state tracker
#[derive(Debug)]
pub struct Tracker {
    records: RwLock<HashMap<Pid, Arc<ProcessRecord>>>,
    reclaim_queue: WorkQueue,
    swapin_queue: WorkQueue,
    cooldown: Duration,
    background_tier: i32,
    foreground_tier: i32,
}

impl Tracker {
    /// Create an empty tracker
    pub fn new(config: &MemplusConfig) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            reclaim_queue: WorkQueue::new("ReclaimQueue"),
            swapin_queue: WorkQueue::new("SwapinQueue"),
            cooldown: config.cooldown,
            background_tier: config.background_tier,
            foreground_tier: config.foreground_tier,
        }
    }

    /// The reclaim request queue
    pub fn reclaim_queue(&self) -> &WorkQueue {
        &self.reclaim_queue
    }

    /// The swap-in request queue
    pub fn swapin_queue(&self) -> &WorkQueue {
        &self.swapin_queue
    }

    /// Look up a record
    pub fn record(&self, pid: Pid) -> Option<Arc<ProcessRecord>> {
        self.records.read().get(&pid).cloned()
    }

    /// Look up a record, creating a `Standby` one if needed
    ///
    /// Returns `None` only when the table cannot grow.
    pub fn record_or_insert(&self, pid: Pid, stats: &Stats) -> Option<Arc<ProcessRecord>> {
        if let Some(record) = self.record(pid) {
            return Some(record);
        }

        let mut records = self.records.write();
        if let Some(record) = records.get(&pid) {
            return Some(record.clone());
        }
        if records.try_reserve(1).is_err() {
            stats.bump(Counter::AllocDrops);
            log::debug!("Tracker: no memory for record of pid {}", pid);
            return None;
        }
        let record = Arc::new(ProcessRecord::new(pid));
        records.insert(pid, record.clone());
        Some(record)
    }

    /// Current state of a process, `None` if untracked
    pub fn state(&self, pid: Pid) -> Option<ReclaimState> {
        self.record(pid).map(|r| r.state())
    }

    /// Queued items of a process that would still be acted on
    ///
    /// Counts both queues. Never more than one.
    pub fn live_items(&self, pid: Pid) -> usize {
        let Some(record) = self.record(pid) else {
            return 0;
        };
        let ticket = record.inner.lock().ticket;
        let live = |item: &WorkItem| item.pid == pid && item.ticket == ticket;
        self.reclaim_queue.count_where(live) + self.swapin_queue.count_where(live)
    }

    /// Forget a process
    pub fn remove(&self, pid: Pid) -> bool {
        self.records.write().remove(&pid).is_some()
    }

    /// Forget every process not in `running`
    ///
    /// Returns how many records were dropped.
    pub fn retain_processes(&self, running: &HashSet<Pid>) -> usize {
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|pid, _| running.contains(pid));
        before - records.len()
    }

    /// Number of tracked processes
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Check if no process is tracked
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// React to a priority change
    ///
    /// Never blocks beyond the record and queue locks, and never reports
    /// failure to the caller.
    pub fn on_priority_change(
        &self,
        change: &PriorityChange,
        now: Duration,
        stats: &Stats,
    ) -> Transition {
        let Some(record) = self.record_or_insert(change.pid, stats) else {
            return Transition::Dropped;
        };

        let mut inner = record.inner.lock();
        if change.update {
            inner.classification = change.classification;
        }

        let class = inner.classification;
        if class == ReclaimClass::Ignore {
            return Transition::Ignored;
        }

        let foreground = class == ReclaimClass::WillNeed || change.new_tier == self.foreground_tier;
        let to_background =
            change.old_tier < self.background_tier && change.new_tier >= self.background_tier;

        if foreground {
            match inner.state {
                ReclaimState::ReclaimQueued => {
                    inner.state = ReclaimState::Standby;
                    inner.ticket = fresh_ticket();
                    stats.bump(Counter::Cancellations);
                    log::debug!("Tracker: pid {} reclaim cancelled", change.pid);
                    Transition::Cancelled
                },
                ReclaimState::ReclaimDone => {
                    let item = WorkItem {
                        pid: change.pid,
                        previous_tier: change.old_tier,
                        ticket: fresh_ticket(),
                    };
                    if !self.swapin_queue.enqueue(item) {
                        stats.bump(Counter::QueueFullDrops);
                        return Transition::QueueFull;
                    }
                    inner.ticket = item.ticket;
                    inner.state = ReclaimState::SwapinQueued;
                    stats.bump(Counter::SwapinRequests);
                    log::debug!("Tracker: pid {} swap-in queued", change.pid);
                    Transition::SwapinQueued
                },
                _ => Transition::Unchanged,
            }
        } else if to_background {
            if inner.state != ReclaimState::Standby || now < inner.cooldown_until {
                return Transition::Unchanged;
            }
            let item = WorkItem {
                pid: change.pid,
                previous_tier: change.old_tier,
                ticket: fresh_ticket(),
            };
            if !self.reclaim_queue.enqueue(item) {
                stats.bump(Counter::QueueFullDrops);
                return Transition::QueueFull;
            }
            inner.ticket = item.ticket;
            inner.state = ReclaimState::ReclaimQueued;
            inner.cooldown_until = now + self.cooldown;
            stats.bump(Counter::ReclaimRequests);
            log::debug!("Tracker: pid {} reclaim queued", change.pid);
            Transition::ReclaimQueued
        } else {
            Transition::Unchanged
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> (Tracker, Stats) {
        (Tracker::new(&MemplusConfig::default()), Stats::new())
    }

    fn to_background(pid: u32) -> PriorityChange {
        PriorityChange {
            pid: Pid(pid),
            classification: ReclaimClass::Normal,
            old_tier: 200,
            new_tier: 900,
            update: false,
        }
    }

    fn to_foreground(pid: u32) -> PriorityChange {
        PriorityChange {
            pid: Pid(pid),
            classification: ReclaimClass::Normal,
            old_tier: 900,
            new_tier: 0,
            update: false,
        }
    }

    const T0: Duration = Duration::from_secs(100);

    #[test]
    fn test_background_queues_once() {
        let (tracker, stats) = tracker();

        assert_eq!(
            tracker.on_priority_change(&to_background(1), T0, &stats),
            Transition::ReclaimQueued
        );
        assert_eq!(tracker.state(Pid(1)), Some(ReclaimState::ReclaimQueued));
        assert_eq!(tracker.reclaim_queue().len(), 1);

        // Re-trigger while queued: no duplicate item
        let later = T0 + Duration::from_secs(10);
        assert_eq!(
            tracker.on_priority_change(&to_background(1), later, &stats),
            Transition::Unchanged
        );
        assert_eq!(tracker.reclaim_queue().len(), 1);
        assert_eq!(stats.snapshot().reclaim_requests, 1);
    }

    #[test]
    fn test_cooldown_separates_triggers() {
        let (tracker, stats) = tracker();
        tracker.on_priority_change(&to_background(1), T0, &stats);
        tracker.on_priority_change(&to_foreground(1), T0, &stats);
        assert_eq!(tracker.state(Pid(1)), Some(ReclaimState::Standby));

        let early = T0 + Duration::from_millis(1999);
        assert_eq!(
            tracker.on_priority_change(&to_background(1), early, &stats),
            Transition::Unchanged
        );

        let due = T0 + Duration::from_secs(2);
        assert_eq!(
            tracker.on_priority_change(&to_background(1), due, &stats),
            Transition::ReclaimQueued
        );
    }

    #[test]
    fn test_foreground_cancels_queued_reclaim() {
        let (tracker, stats) = tracker();
        tracker.on_priority_change(&to_background(1), T0, &stats);

        assert_eq!(
            tracker.on_priority_change(&to_foreground(1), T0, &stats),
            Transition::Cancelled
        );
        assert_eq!(tracker.state(Pid(1)), Some(ReclaimState::Standby));
        assert!(tracker.swapin_queue().is_empty());

        // The item is still queued but its ticket is dead
        let item = tracker.reclaim_queue().dequeue().unwrap();
        let record = tracker.record(Pid(1)).unwrap();
        assert_eq!(record.begin_reclaim(item.ticket), None);
    }

    #[test]
    fn test_foreground_during_walk_queues_swapin() {
        let (tracker, stats) = tracker();
        tracker.on_priority_change(&to_background(1), T0, &stats);
        let item = tracker.reclaim_queue().dequeue().unwrap();
        let record = tracker.record(Pid(1)).unwrap();
        assert_eq!(record.begin_reclaim(item.ticket), Some(ReclaimClass::Normal));

        assert_eq!(
            tracker.on_priority_change(&to_foreground(1), T0, &stats),
            Transition::SwapinQueued
        );
        assert_eq!(tracker.swapin_queue().len(), 1);

        // Reclaim completion leaves the swap-in request alone
        assert_eq!(record.finish_reclaim(), ReclaimState::SwapinQueued);

        let swapin = tracker.swapin_queue().dequeue().unwrap();
        assert!(record.begin_swapin(swapin.ticket));
        record.finish_swapin();
        assert_eq!(record.state(), ReclaimState::Standby);
    }

    #[test]
    fn test_will_need_forces_foreground() {
        let (tracker, stats) = tracker();
        tracker.on_priority_change(&to_background(1), T0, &stats);

        let hint = PriorityChange {
            classification: ReclaimClass::WillNeed,
            update: true,
            old_tier: 900,
            new_tier: 900,
            ..to_background(1)
        };
        assert_eq!(
            tracker.on_priority_change(&hint, T0, &stats),
            Transition::Cancelled
        );
    }

    #[test]
    fn test_ignore_is_noop() {
        let (tracker, stats) = tracker();
        let change = PriorityChange {
            classification: ReclaimClass::Ignore,
            update: true,
            ..to_background(1)
        };
        assert_eq!(
            tracker.on_priority_change(&change, T0, &stats),
            Transition::Ignored
        );
        assert_eq!(tracker.state(Pid(1)), Some(ReclaimState::Standby));
        assert!(tracker.reclaim_queue().is_empty());
    }

    #[test]
    fn test_update_flag_stores_classification() {
        let (tracker, stats) = tracker();
        let change = PriorityChange {
            classification: ReclaimClass::Frequent,
            update: true,
            ..to_background(1)
        };
        tracker.on_priority_change(&change, T0, &stats);
        assert_eq!(
            tracker.record(Pid(1)).unwrap().classification(),
            ReclaimClass::Frequent
        );

        // Without the flag the stored value is kept
        let change = PriorityChange {
            classification: ReclaimClass::Ignore,
            ..to_foreground(1)
        };
        tracker.on_priority_change(&change, T0, &stats);
        assert_eq!(
            tracker.record(Pid(1)).unwrap().classification(),
            ReclaimClass::Frequent
        );
    }

    #[test]
    fn test_tier_must_cross_threshold() {
        let (tracker, stats) = tracker();
        let within = PriorityChange {
            old_tier: 850,
            new_tier: 900,
            ..to_background(1)
        };
        assert_eq!(
            tracker.on_priority_change(&within, T0, &stats),
            Transition::Unchanged
        );
    }

    #[test]
    fn test_queue_overflow_leaves_standby() {
        let (tracker, stats) = tracker();
        for pid in 0..200 {
            tracker.on_priority_change(&to_background(pid), T0, &stats);
        }

        assert_eq!(tracker.reclaim_queue().len(), 128);
        assert_eq!(tracker.state(Pid(127)), Some(ReclaimState::ReclaimQueued));
        assert_eq!(tracker.state(Pid(128)), Some(ReclaimState::Standby));
        assert_eq!(stats.snapshot().queue_full_drops, 72);
    }

    #[test]
    fn test_reused_pid_does_not_revive_old_item() {
        let (tracker, stats) = tracker();
        tracker.on_priority_change(&to_background(1), T0, &stats);
        assert!(tracker.remove(Pid(1)));
        tracker.on_priority_change(&to_background(1), T0, &stats);

        assert_eq!(tracker.live_items(Pid(1)), 1);
        assert_eq!(tracker.reclaim_queue().len(), 2);

        let old = tracker.reclaim_queue().dequeue().unwrap();
        let new = tracker.reclaim_queue().dequeue().unwrap();
        assert_ne!(old.ticket, new.ticket);

        let record = tracker.record(Pid(1)).unwrap();
        assert_eq!(record.begin_reclaim(old.ticket), None);
        assert_eq!(record.begin_reclaim(new.ticket), Some(ReclaimClass::Normal));
    }

    #[test]
    fn test_gc_claim_and_race() {
        let record = ProcessRecord::new(Pid(1));
        assert!(record.mark_gc());
        assert!(!record.mark_gc());
        assert_eq!(record.finish_gc(), Ok(()));

        assert!(record.mark_gc());
        record.force_state(ReclaimState::SwapinQueued);
        assert_eq!(record.finish_gc(), Err(ReclaimState::SwapinQueued));
        assert_eq!(record.state(), ReclaimState::Standby);
    }
}
