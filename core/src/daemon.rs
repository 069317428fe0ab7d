//! # Daemons
//!
//! Every background worker is a named thread parked on a blocking
//! receive. Producers wake it through a [`Waker`]: a one-slot channel, so
//! any number of wakes issued while the worker is busy collapse into one.
//!
//! The reclaim and swap-in daemons share one loop: check the stop flag,
//! drain their queue one item at a time, park. Stop is only ever observed
//! between items, never in the middle of a walk.

use std::fmt;
use std::io;
use std::sync::atomic::Ordering;
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use memplus_hal::Pid;
use spin::Mutex;

use crate::error::MemplusError;
use crate::event::{MemplusEvent, WalkOrigin};
use crate::queue::{WorkItem, WorkQueue};
use crate::service::Shared;
use crate::stats::Counter;
use crate::walker::ReclaimRequest;
use crate::{memex, sweep};

// =============================================================================
// Wake Channel
// =============================================================================

/// Message delivered to a parked worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DaemonSignal {
    /// Look for work
    Wake,
    /// Exit
    Stop,
}

/// Producer side of a worker's wake channel
#[derive(Debug)]
pub(crate) struct Waker {
    tx: Mutex<Option<SyncSender<DaemonSignal>>>,
}

impl Waker {
    pub(crate) const fn new() -> Self {
        Self {
            tx: Mutex::new(None),
        }
    }

    /// Create the channel and hand back the worker's end
    pub(crate) fn install(&self) -> Receiver<DaemonSignal> {
        let (tx, rx) = mpsc::sync_channel(1);
        *self.tx.lock() = Some(tx);
        rx
    }

    /// Wake the worker if it is parked; no-op if a wake is already pending
    pub(crate) fn wake(&self) {
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.try_send(DaemonSignal::Wake);
        }
    }

    /// Tell the worker to exit and disconnect the channel
    pub(crate) fn stop(&self) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.try_send(DaemonSignal::Stop);
        }
    }
}

// =============================================================================
// Workers
// =============================================================================

/// Background workers of the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DaemonKind {
    /// Drains the reclaim queue
    Reclaim,
    /// Drains the swap-in queue
    Swapin,
    /// Runs sweep passes
    Sweep,
    /// Runs low-memory passes
    Memex,
}

impl DaemonKind {
    /// All workers, in start order
    pub const ALL: [DaemonKind; 4] = [Self::Reclaim, Self::Swapin, Self::Sweep, Self::Memex];

    /// Thread name
    pub const fn thread_name(&self) -> &'static str {
        match self {
            Self::Reclaim => "memplus-reclaim",
            Self::Swapin => "memplus-swapin",
            Self::Sweep => "memplus-sweep",
            Self::Memex => "memplus-memex",
        }
    }
}

impl fmt::Display for DaemonKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reclaim => write!(f, "ReclaimDaemon"),
            Self::Swapin => write!(f, "SwapinDaemon"),
            Self::Sweep => write!(f, "Sweep"),
            Self::Memex => write!(f, "MemEx"),
        }
    }
}

/// Waker of a worker
pub(crate) fn waker(shared: &Shared, kind: DaemonKind) -> &Waker {
    match kind {
        DaemonKind::Reclaim => shared.tracker.reclaim_queue().waker(),
        DaemonKind::Swapin => shared.tracker.swapin_queue().waker(),
        DaemonKind::Sweep => shared.sweep.waker(),
        DaemonKind::Memex => &shared.memex_waker,
    }
}

/// Start a worker thread
pub(crate) fn spawn(kind: DaemonKind, shared: Arc<Shared>) -> io::Result<JoinHandle<()>> {
    let rx = waker(&shared, kind).install();
    thread::Builder::new()
        .name(kind.thread_name().into())
        .spawn(move || {
            log::info!("{}: started", kind);
            match kind {
                DaemonKind::Reclaim | DaemonKind::Swapin => run_queue_daemon(&shared, kind, &rx),
                DaemonKind::Sweep => sweep::run_worker(&shared, &rx),
                DaemonKind::Memex => memex::run_worker(&shared, &rx),
            }
            log::info!("{}: stopped", kind);
        })
}

fn run_queue_daemon(shared: &Shared, kind: DaemonKind, rx: &Receiver<DaemonSignal>) {
    let queue: &WorkQueue = match kind {
        DaemonKind::Swapin => shared.tracker.swapin_queue(),
        _ => shared.tracker.reclaim_queue(),
    };

    loop {
        if shared.stop.load(Ordering::Acquire) {
            break;
        }

        while let Some(item) = queue.dequeue() {
            let outcome = match kind {
                DaemonKind::Swapin => process_swapin_item(shared, item),
                _ => process_reclaim_item(shared, item),
            };
            log::trace!("{}: pid {} {:?}", kind, item.pid, outcome);
            if shared.stop.load(Ordering::Acquire) {
                break;
            }
        }

        match rx.recv() {
            Ok(DaemonSignal::Wake) => continue,
            Ok(DaemonSignal::Stop) | Err(_) => break,
        }
    }
}

// =============================================================================
// Item Processing
// =============================================================================

/// What happened to a dequeued item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ItemOutcome {
    /// The walk ran
    Walked,
    /// The process no longer exists
    ProcessGone,
    /// The request was cancelled or superseded
    Stale,
    /// The walk hit a host error
    Failed,
}

/// Classify a walk error
fn walk_failed(shared: &Shared, kind: DaemonKind, pid: Pid, err: &MemplusError) -> ItemOutcome {
    match err {
        MemplusError::ProcessNotFound(_) => {
            shared.stats.bump(Counter::StaleProcesses);
            log::debug!("{}: pid {} exited mid-walk", kind, pid);
            ItemOutcome::ProcessGone
        },
        err => {
            log::warn!("{}: pid {}: {}", kind, pid, err);
            ItemOutcome::Failed
        },
    }
}

pub(crate) fn process_reclaim_item(shared: &Shared, item: WorkItem) -> ItemOutcome {
    let pid = item.pid;
    let Some(record) = shared.tracker.record(pid) else {
        shared.stats.bump(Counter::StaleProcesses);
        return ItemOutcome::ProcessGone;
    };
    if shared.host.scanner.process(pid).is_none() {
        shared.stats.bump(Counter::StaleProcesses);
        shared.tracker.remove(pid);
        log::debug!("ReclaimDaemon: pid {} exited while queued", pid);
        return ItemOutcome::ProcessGone;
    }

    let _walking = record.walk_guard();
    let Some(class) = record.begin_reclaim(item.ticket) else {
        shared.stats.bump(Counter::StaleItems);
        return ItemOutcome::Stale;
    };

    shared.stats.walk_started();
    let result = shared.walker.reclaim(
        pid,
        ReclaimRequest::targeted(class, record.markers()),
        None,
        &shared.stats,
    );
    shared.stats.walk_finished();
    let state = record.finish_reclaim();
    log::debug!("ReclaimDaemon: pid {} done, now {:?}", pid, state);

    match result {
        Ok(stats) => {
            shared.events.publish(MemplusEvent::ReclaimCompleted {
                pid,
                origin: WalkOrigin::Queued,
                stats,
            });
            ItemOutcome::Walked
        },
        Err(err) => walk_failed(shared, DaemonKind::Reclaim, pid, &err),
    }
}

pub(crate) fn process_swapin_item(shared: &Shared, item: WorkItem) -> ItemOutcome {
    let pid = item.pid;
    let Some(record) = shared.tracker.record(pid) else {
        shared.stats.bump(Counter::StaleProcesses);
        return ItemOutcome::ProcessGone;
    };
    if shared.host.scanner.process(pid).is_none() {
        shared.stats.bump(Counter::StaleProcesses);
        shared.tracker.remove(pid);
        log::debug!("SwapinDaemon: pid {} exited while queued", pid);
        return ItemOutcome::ProcessGone;
    }

    // Waits for a reclaim walk of the same process to finish first
    let _walking = record.walk_guard();
    if !record.begin_swapin(item.ticket) {
        shared.stats.bump(Counter::StaleItems);
        return ItemOutcome::Stale;
    }

    shared.stats.walk_started();
    let result = shared.walker.swapin(pid, record.markers(), &shared.stats);
    shared.stats.walk_finished();
    record.finish_swapin();

    match result {
        Ok(pages) => {
            shared.events.publish(MemplusEvent::SwapinCompleted {
                pid,
                origin: WalkOrigin::Queued,
                pages,
            });
            ItemOutcome::Walked
        },
        Err(err) => walk_failed(shared, DaemonKind::Swapin, pid, &err),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use memplus_hal::{BackendClass, MappingFlags, Pid};

    use super::*;
    use crate::event::EventTopic;
    use crate::testing::SimRig;
    use crate::tracker::{PriorityChange, ReclaimClass, ReclaimState, Transition};

    const APP: Pid = Pid(300);

    fn background(pid: Pid) -> PriorityChange {
        PriorityChange {
            pid,
            classification: ReclaimClass::Normal,
            old_tier: 200,
            new_tier: 900,
            update: false,
        }
    }

    fn foreground(pid: Pid) -> PriorityChange {
        PriorityChange {
            pid,
            classification: ReclaimClass::Normal,
            old_tier: 900,
            new_tier: 0,
            update: false,
        }
    }

    #[test]
    fn test_waker_coalesces_and_stops() {
        let waker = Waker::new();
        waker.wake();
        let rx = waker.install();
        waker.wake();
        waker.wake();
        assert_eq!(rx.try_recv(), Ok(DaemonSignal::Wake));
        assert!(rx.try_recv().is_err());

        waker.stop();
        assert_eq!(rx.recv(), Ok(DaemonSignal::Stop));
        assert!(rx.recv().is_err());
    }

    #[test]
    fn test_reclaim_item_walks_and_resets() {
        let rig = SimRig::new();
        rig.host.spawn(APP, "com.example.app", 900);
        rig.host.add_mapping(APP, MappingFlags::empty(), 40);
        let shared = rig.shared();
        let (_, events) = shared.events.subscribe(&[EventTopic::Reclaim]);

        let now = rig.now();
        assert_eq!(
            shared.tracker.on_priority_change(&background(APP), now, &shared.stats),
            Transition::ReclaimQueued
        );
        let item = shared.tracker.reclaim_queue().dequeue().unwrap();

        assert_eq!(process_reclaim_item(&shared, item), ItemOutcome::Walked);
        assert_eq!(shared.tracker.state(APP), Some(ReclaimState::Standby));
        assert_eq!(rig.host.swapped_count(APP, BackendClass::Slow), 40);
        assert_eq!(shared.stats.snapshot().walks_in_flight, 0);

        match events.recv_timeout(Duration::from_secs(1)) {
            Ok(MemplusEvent::ReclaimCompleted { pid, origin, stats }) => {
                assert_eq!(pid, APP);
                assert_eq!(origin, WalkOrigin::Queued);
                assert_eq!(stats.reclaimed, 40);
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_cancelled_item_is_stale() {
        let rig = SimRig::new();
        rig.host.spawn(APP, "com.example.app", 900);
        rig.host.add_mapping(APP, MappingFlags::empty(), 8);
        let shared = rig.shared();

        let now = rig.now();
        shared.tracker.on_priority_change(&background(APP), now, &shared.stats);
        assert_eq!(
            shared.tracker.on_priority_change(&foreground(APP), now, &shared.stats),
            Transition::Cancelled
        );

        let item = shared.tracker.reclaim_queue().dequeue().unwrap();
        assert_eq!(process_reclaim_item(&shared, item), ItemOutcome::Stale);
        assert_eq!(rig.host.resident_count(APP), 8);
        assert_eq!(shared.stats.snapshot().stale_items, 1);
        assert_eq!(shared.stats.snapshot().swapin_requests, 0);
    }

    #[test]
    fn test_superseded_item_is_stale() {
        let rig = SimRig::new();
        rig.host.spawn(APP, "com.example.app", 900);
        let shared = rig.shared();
        let stats = &shared.stats;

        shared.tracker.on_priority_change(&background(APP), rig.now(), stats);
        shared.tracker.on_priority_change(&foreground(APP), rig.now(), stats);
        rig.clock.advance(Duration::from_secs(3));
        shared.tracker.on_priority_change(&background(APP), rig.now(), stats);
        assert_eq!(shared.tracker.reclaim_queue().len(), 2);

        let old = shared.tracker.reclaim_queue().dequeue().unwrap();
        let live = shared.tracker.reclaim_queue().dequeue().unwrap();
        assert_eq!(process_reclaim_item(&shared, old), ItemOutcome::Stale);
        assert_eq!(shared.tracker.state(APP), Some(ReclaimState::ReclaimQueued));
        assert_eq!(process_reclaim_item(&shared, live), ItemOutcome::Walked);
        assert_eq!(shared.tracker.state(APP), Some(ReclaimState::Standby));
    }

    #[test]
    fn test_exited_process_skipped() {
        let rig = SimRig::new();
        rig.host.spawn(APP, "com.example.app", 900);
        let shared = rig.shared();

        shared.tracker.on_priority_change(&background(APP), rig.now(), &shared.stats);
        rig.host.kill(APP);

        let item = shared.tracker.reclaim_queue().dequeue().unwrap();
        assert_eq!(process_reclaim_item(&shared, item), ItemOutcome::ProcessGone);
        assert_eq!(shared.tracker.state(APP), None);
        assert_eq!(shared.stats.snapshot().stale_processes, 1);
    }

    #[test]
    fn test_swapin_item_after_reclaim() {
        let rig = SimRig::new();
        rig.host.spawn(APP, "com.example.app", 900);
        let mapping = rig.host.add_mapping(APP, MappingFlags::empty(), 0);
        rig.host.add_swapped(APP, mapping, 20, BackendClass::Fast);
        let shared = rig.shared_with(
            crate::config::MemplusConfig::default().with_swapin_min_pages(10),
        );

        let record = shared.tracker.record_or_insert(APP, &shared.stats).unwrap();
        record.force_state(ReclaimState::ReclaimDone);
        assert_eq!(
            shared.tracker.on_priority_change(&foreground(APP), rig.now(), &shared.stats),
            Transition::SwapinQueued
        );

        let item = shared.tracker.swapin_queue().dequeue().unwrap();
        assert_eq!(process_swapin_item(&shared, item), ItemOutcome::Walked);
        assert_eq!(shared.tracker.state(APP), Some(ReclaimState::Standby));
        assert_eq!(rig.host.faulted_in(), 20);
        assert!(record.markers().is_marked(mapping));
    }

    #[test]
    fn test_host_error_is_not_a_gone_process() {
        let rig = SimRig::new();
        rig.host.spawn(APP, "com.example.app", 900);
        let mapping = rig.host.add_mapping(APP, MappingFlags::empty(), 0);
        rig.host.add_swapped(APP, mapping, 20, BackendClass::Fast);
        let shared = rig.shared_with(
            crate::config::MemplusConfig::default().with_swapin_min_pages(10),
        );

        let record = shared.tracker.record_or_insert(APP, &shared.stats).unwrap();
        record.force_state(ReclaimState::ReclaimDone);
        shared.tracker.on_priority_change(&foreground(APP), rig.now(), &shared.stats);
        rig.host.inject_io_errors(1);

        let item = shared.tracker.swapin_queue().dequeue().unwrap();
        assert_eq!(process_swapin_item(&shared, item), ItemOutcome::Failed);
        assert_eq!(shared.stats.snapshot().stale_processes, 0);
        assert_eq!(shared.tracker.state(APP), Some(ReclaimState::Standby));
        assert_eq!(rig.host.faulted_in(), 0);
    }
}
