//! # System Sweep
//!
//! A rate-limited background pass over every idle user process, run only
//! while the display is off. Each page must survive a number of sweep
//! visits before it is reclaimed; that number shrinks the longer the
//! screen has been on since the previous pass.
//!
//! ## Pass
//!
//! 1. Snapshot up to `sweep_max_processes` user processes in `Standby`
//! 2. Drop skip-countdown entries of processes missing from the snapshot
//! 3. For each candidate: wait for the panel to be off, claim it
//!    (`Standby -> GcReclaimQueued`), walk it, release it
//! 4. Clear the screen-on accumulator

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::time::Duration;

use hashbrown::HashSet;
use memplus_hal::{Pid, ProcessInfo};
use spin::Mutex;

use crate::countdown::SkipCountdownTable;
use crate::daemon::{DaemonSignal, Waker};
use crate::event::MemplusEvent;
use crate::service::Shared;
use crate::stats::Counter;
use crate::tracker::ReclaimState;
use crate::walker::ReclaimRequest;

/// Outcome of [`crate::Memplus::trigger_sweep`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepTrigger {
    /// A pass will run
    Scheduled,
    /// The previous pass started less than one sweep interval ago
    RateLimited,
    /// A pass is pending or running
    AlreadyRunning,
    /// The service is off
    Disabled,
}

/// Summary of one sweep pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Processes in the snapshot
    pub candidates: usize,
    /// Processes walked
    pub walked: usize,
    /// Candidates that exited or were busy when their turn came
    pub skipped: usize,
    /// Candidates whose state changed under the sweep
    pub races: usize,
    /// Pages written to a backend
    pub pages_reclaimed: u64,
    /// Skip-countdown reset value used for new pages
    pub skip_countdown: u8,
    /// The pass was cut short by shutdown or the enable tunable
    pub interrupted: bool,
}

// =============================================================================
// Trigger
// =============================================================================

/// Trigger state shared between the request surface and the worker
#[derive(Debug)]
pub(crate) struct SweepControl {
    waker: Waker,
    pending: AtomicBool,
    last_start: Mutex<Option<Duration>>,
}

impl SweepControl {
    pub(crate) const fn new() -> Self {
        Self {
            waker: Waker::new(),
            pending: AtomicBool::new(false),
            last_start: Mutex::new(None),
        }
    }

    pub(crate) fn waker(&self) -> &Waker {
        &self.waker
    }

    /// Request a pass
    ///
    /// Unless `force` is set, a pass is refused within `interval` of the
    /// previous accepted request.
    pub(crate) fn trigger(&self, now: Duration, interval: Duration, force: bool) -> SweepTrigger {
        let mut last_start = self.last_start.lock();
        if self.pending.load(Ordering::Acquire) {
            return SweepTrigger::AlreadyRunning;
        }
        if let Some(last) = *last_start {
            if !force && now < last.saturating_add(interval) {
                return SweepTrigger::RateLimited;
            }
        }

        *last_start = Some(now);
        self.pending.store(true, Ordering::Release);
        drop(last_start);

        self.waker.wake();
        SweepTrigger::Scheduled
    }

    fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    fn finish(&self) {
        self.pending.store(false, Ordering::Release);
    }
}

// =============================================================================
// Worker
// =============================================================================

pub(crate) fn run_worker(shared: &Shared, rx: &Receiver<DaemonSignal>) {
    let mut table = SkipCountdownTable::new(shared.config.skip_table_max_pages);

    loop {
        if shared.stop.load(Ordering::Acquire) {
            break;
        }

        if shared.sweep.is_pending() {
            let report = run_pass(shared, &mut table);
            shared.sweep.finish();
            shared.events.publish(MemplusEvent::SweepCompleted(report));
        }

        match rx.recv() {
            Ok(DaemonSignal::Wake) => continue,
            Ok(DaemonSignal::Stop) | Err(_) => break,
        }
    }
}

/// Processes a pass will visit, in order
fn snapshot(shared: &Shared, processes: Vec<ProcessInfo>) -> Vec<ProcessInfo> {
    processes
        .into_iter()
        .filter(|p| !p.kernel_thread)
        .filter(|p| {
            shared
                .tracker
                .state(p.pid)
                .map_or(true, |s| s == ReclaimState::Standby)
        })
        .take(shared.config.sweep_max_processes)
        .collect()
}

/// Run one sweep pass
///
/// Completion is published by the worker once the trigger is released.
pub(crate) fn run_pass(shared: &Shared, table: &mut SkipCountdownTable) -> SweepReport {
    let processes = shared.host.scanner.processes();
    let running: HashSet<Pid> = processes.iter().map(|p| p.pid).collect();
    let dropped = shared.tracker.retain_processes(&running);
    if dropped > 0 {
        log::debug!("Sweep: forgot {} exited processes", dropped);
    }

    let candidates = snapshot(shared, processes);
    let live: HashSet<Pid> = candidates.iter().map(|p| p.pid).collect();
    table.retain_processes(&live);

    let skip_countdown = shared
        .display
        .skip_countdown(shared.now(), shared.config.screen_on_step);
    let mut report = SweepReport {
        candidates: candidates.len(),
        skip_countdown,
        ..SweepReport::default()
    };
    log::info!(
        "Sweep: starting over {} processes, countdown {}",
        report.candidates,
        skip_countdown
    );

    for info in &candidates {
        if !shared.display.wait_for_suspend(&shared.stop)
            || !shared.tunables.mode().is_enabled()
        {
            report.interrupted = true;
            break;
        }
        sweep_one(shared, table, info.pid, &mut report);
    }

    if !report.interrupted {
        shared.display.reset_accumulator(shared.now());
    }
    shared.stats.bump(Counter::SweepRuns);
    log::info!(
        "Sweep: walked {} of {}, reclaimed {} pages",
        report.walked,
        report.candidates,
        report.pages_reclaimed
    );
    report
}

fn sweep_one(shared: &Shared, table: &mut SkipCountdownTable, pid: Pid, report: &mut SweepReport) {
    if shared.host.scanner.process(pid).is_none() {
        shared.stats.bump(Counter::StaleProcesses);
        report.skipped += 1;
        return;
    }
    let Some(record) = shared.tracker.record_or_insert(pid, &shared.stats) else {
        report.skipped += 1;
        return;
    };
    if !record.mark_gc() {
        log::debug!("Sweep: pid {} busy, skipped", pid);
        report.skipped += 1;
        return;
    }

    let result = {
        let _walking = record.walk_guard();
        let mut pass = table.pass(pid, report.skip_countdown);
        shared.stats.walk_started();
        let result = shared.walker.reclaim(
            pid,
            ReclaimRequest::sweep(record.markers()),
            Some(&mut pass),
            &shared.stats,
        );
        shared.stats.walk_finished();
        result
    };

    if let Err(found) = record.finish_gc() {
        log::warn!("Sweep: pid {} moved to {:?} during walk, reset", pid, found);
        shared.stats.bump(Counter::StateRaces);
        report.races += 1;
    }

    match result {
        Ok(walk) => {
            report.walked += 1;
            report.pages_reclaimed += walk.reclaimed;
        },
        Err(err) => {
            log::debug!("Sweep: pid {}: {}", pid, err);
            shared.stats.bump(Counter::StaleProcesses);
            report.skipped += 1;
        },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use memplus_hal::{BackendClass, MappingFlags};

    use super::*;
    use crate::config::MemplusConfig;
    use crate::testing::SimRig;

    const DAY: Duration = Duration::from_secs(24 * 3600);

    fn screen_off() -> MemplusConfig {
        MemplusConfig::default().with_initial_panel_on(false)
    }

    #[test]
    fn test_trigger_rate_limited() {
        let control = SweepControl::new();
        let t0 = Duration::from_secs(10);

        assert_eq!(control.trigger(t0, DAY, false), SweepTrigger::Scheduled);
        assert_eq!(control.trigger(t0, DAY, false), SweepTrigger::AlreadyRunning);
        control.finish();

        assert_eq!(control.trigger(t0 + DAY / 2, DAY, false), SweepTrigger::RateLimited);
        assert_eq!(control.trigger(t0 + DAY / 2, DAY, true), SweepTrigger::Scheduled);
        control.finish();
        assert_eq!(control.trigger(t0 + DAY * 2, DAY, false), SweepTrigger::Scheduled);
    }

    #[test]
    fn test_pass_skips_busy_and_kernel() {
        let rig = SimRig::new();
        let idle = rig.host.spawn(Pid(10), "com.example.idle", 900);
        let busy = rig.host.spawn(Pid(11), "com.example.busy", 900);
        rig.host
            .insert(memplus_hal::ProcessInfo::new(Pid(2), "kswapd0", 0).kernel());
        rig.host.add_mapping(idle, MappingFlags::empty(), 4);
        rig.host.add_mapping(busy, MappingFlags::empty(), 4);

        let shared = rig.shared_with(screen_off());
        let record = shared.tracker.record_or_insert(busy, &shared.stats).unwrap();
        record.force_state(ReclaimState::ReclaimQueued);

        let mut table = SkipCountdownTable::new(1024);
        let report = run_pass(&shared, &mut table);
        assert_eq!(report.candidates, 1);
        assert_eq!(report.walked, 1);
        assert_eq!(report.skip_countdown, 7);
        assert_eq!(shared.tracker.state(idle), Some(ReclaimState::Standby));
        assert_eq!(shared.tracker.state(busy), Some(ReclaimState::ReclaimQueued));
        assert_eq!(shared.stats.snapshot().sweep_runs, 1);
    }

    #[test]
    fn test_page_survives_countdown_visits() {
        let rig = SimRig::new();
        let pid = rig.host.spawn(Pid(20), "com.example.app", 900);
        rig.host.add_mapping(pid, MappingFlags::empty(), 3);
        let shared = rig.shared_with(screen_off());
        let mut table = SkipCountdownTable::new(1024);

        // Seeding pass, then six qualifying visits the pages survive
        for _ in 0..7 {
            let report = run_pass(&shared, &mut table);
            assert_eq!(report.pages_reclaimed, 0);
            assert_eq!(rig.host.resident_count(pid), 3);
        }

        let report = run_pass(&shared, &mut table);
        assert_eq!(report.pages_reclaimed, 3);
        assert_eq!(rig.host.swapped_count(pid, BackendClass::Slow), 3);
        assert!(table.is_empty());
    }

    #[test]
    fn test_screen_on_time_shortens_countdown() {
        let rig = SimRig::new();
        let pid = rig.host.spawn(Pid(21), "com.example.app", 900);
        rig.host.add_mapping(pid, MappingFlags::empty(), 2);
        let shared = rig.shared_with(MemplusConfig::default());

        // Seven hours of screen-on time: new pages start at zero
        rig.clock.advance(Duration::from_secs(7 * 3600));
        shared.display.set_panel(false, rig.now());

        let mut table = SkipCountdownTable::new(1024);
        let report = run_pass(&shared, &mut table);
        assert_eq!(report.skip_countdown, 0);
        assert_eq!(report.pages_reclaimed, 2);

        // The accumulator was cleared by the completed pass
        assert_eq!(
            shared.display.skip_countdown(rig.now(), shared.config.screen_on_step),
            7
        );
    }

    #[test]
    fn test_exited_processes_dropped_from_table() {
        let rig = SimRig::new();
        let gone = rig.host.spawn(Pid(30), "com.example.gone", 900);
        rig.host.add_mapping(gone, MappingFlags::empty(), 5);
        let shared = rig.shared_with(screen_off());
        let mut table = SkipCountdownTable::new(1024);

        run_pass(&shared, &mut table);
        assert_eq!(table.len(), 5);

        rig.host.kill(gone);
        run_pass(&shared, &mut table);
        assert!(table.is_empty());
    }

    #[test]
    fn test_pass_forgets_exited_records() {
        let rig = SimRig::new();
        let alive = rig.host.spawn(Pid(31), "com.example.alive", 900);
        let shared = rig.shared_with(screen_off());
        let stats = &shared.stats;
        shared.tracker.record_or_insert(alive, stats).unwrap();
        shared.tracker.record_or_insert(Pid(32), stats).unwrap();
        assert_eq!(shared.tracker.len(), 2);

        run_pass(&shared, &mut SkipCountdownTable::new(1024));
        assert_eq!(shared.tracker.len(), 1);
        assert!(shared.tracker.record(alive).is_some());
        assert!(shared.tracker.record(Pid(32)).is_none());
    }

    #[test]
    fn test_pass_waits_for_suspend() {
        let rig = SimRig::new();
        let pid = rig.host.spawn(Pid(40), "com.example.app", 900);
        rig.host.add_mapping(pid, MappingFlags::empty(), 1);
        let shared = rig.shared_with(MemplusConfig::default());

        let worker = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || run_pass(&shared, &mut SkipCountdownTable::new(16)))
        };
        thread::sleep(Duration::from_millis(30));
        assert_eq!(shared.stats.snapshot().sweep_runs, 0);

        shared.display.set_panel(false, rig.now());
        let report = worker.join().unwrap();
        assert_eq!(report.walked, 1);
        assert!(!report.interrupted);
    }

    #[test]
    fn test_pass_interrupted_by_stop() {
        let rig = SimRig::new();
        rig.host.spawn(Pid(50), "com.example.app", 900);
        let shared = rig.shared_with(MemplusConfig::default());
        shared.stop.store(true, Ordering::Release);

        let report = run_pass(&shared, &mut SkipCountdownTable::new(16));
        assert!(report.interrupted);
        assert_eq!(report.walked, 0);
    }
}
