//! # Low-Memory Aggressive Reclaimer (MemEx)
//!
//! Armed with a watermark in MiB. While available memory is at or below it,
//! MemEx walks user apps from the least important tier down, reclaiming
//! everything to the fast backend, and stops issuing candidates as soon as
//! memory recovers. It bypasses the per-process state machine entirely.
//!
//! Processes are bucketed by tier into a fixed slot array. The low end of
//! the array is the system partition, the high end the app partition; only
//! apps are reclaimed.

use std::sync::atomic::Ordering;
use std::sync::mpsc::{Receiver, RecvTimeoutError};

use memplus_hal::{Pid, ProcessInfo};

use crate::daemon::DaemonSignal;
use crate::error::MemplusError;
use crate::event::MemplusEvent;
use crate::service::Shared;
use crate::stats::Counter;
use crate::tracker::ReclaimClass;
use crate::walker::ReclaimRequest;

/// Candidate order of one pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemexPlan {
    /// System processes, lowest tier first
    pub system: Vec<Pid>,
    /// Apps, highest tier first
    pub apps: Vec<Pid>,
}

/// Summary of one MemEx pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemexPassReport {
    /// Apps walked
    pub walked: usize,
    /// Pages written to a backend
    pub pages_reclaimed: u64,
    /// Memory rose above the watermark before the plan was exhausted
    pub stopped_early: bool,
    /// Size of the system partition
    pub system_candidates: usize,
    /// Size of the app partition
    pub app_candidates: usize,
}

/// Order processes for a pass
///
/// Kernel threads and processes matching `excluded` are left out. Tiers are
/// clamped into `0..slots`.
pub fn build_plan<F>(
    processes: &[ProcessInfo],
    slots: usize,
    app_tier_min: i32,
    excluded: F,
) -> MemexPlan
where
    F: Fn(&str) -> bool,
{
    if slots == 0 {
        return MemexPlan::default();
    }

    let top = i32::try_from(slots - 1).unwrap_or(i32::MAX);
    let mut table: Vec<Vec<Pid>> = vec![Vec::new(); slots];
    for info in processes {
        if info.kernel_thread || excluded(&info.name) {
            continue;
        }
        table[info.tier.clamp(0, top) as usize].push(info.pid);
    }

    let split = (app_tier_min.max(0) as usize).min(slots);
    MemexPlan {
        system: table[..split].iter().flatten().copied().collect(),
        apps: table[split..].iter().rev().flatten().copied().collect(),
    }
}

// =============================================================================
// Worker
// =============================================================================

pub(crate) fn run_worker(shared: &Shared, rx: &Receiver<DaemonSignal>) {
    shared
        .host
        .placement
        .apply_to_current(shared.config.memex_profile);

    loop {
        if shared.stop.load(Ordering::Acquire) {
            break;
        }

        let watermark = shared.tunables.watermark_mb();
        if watermark > 0
            && shared.tunables.mode().is_enabled()
            && shared.host.monitor.available_mb() <= watermark
        {
            run_pass(shared);
        }

        match rx.recv_timeout(shared.config.memex_poll_interval) {
            Ok(DaemonSignal::Wake) | Err(RecvTimeoutError::Timeout) => continue,
            Ok(DaemonSignal::Stop) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// Run one pass, polling the watermark before every candidate
pub(crate) fn run_pass(shared: &Shared) -> MemexPassReport {
    let plan = build_plan(
        &shared.host.scanner.processes(),
        shared.config.memex_slots,
        shared.config.memex_app_tier_min,
        |name| shared.tunables.is_camera_process(name),
    );
    let mut report = MemexPassReport {
        system_candidates: plan.system.len(),
        app_candidates: plan.apps.len(),
        ..MemexPassReport::default()
    };

    for &pid in &plan.apps {
        let watermark = shared.tunables.watermark_mb();
        if watermark == 0 || shared.host.monitor.available_mb() > watermark {
            report.stopped_early = true;
            break;
        }
        if shared.stop.load(Ordering::Acquire) {
            break;
        }

        shared.stats.walk_started();
        let result = shared.walker.reclaim(
            pid,
            ReclaimRequest::untracked(ReclaimClass::Frequent),
            None,
            &shared.stats,
        );
        shared.stats.walk_finished();

        match result {
            Ok(walk) => {
                report.walked += 1;
                report.pages_reclaimed += walk.reclaimed;
            },
            Err(MemplusError::ProcessNotFound(_)) => shared.stats.bump(Counter::StaleProcesses),
            Err(err) => log::debug!("MemEx: pid {}: {}", pid, err),
        }
    }

    shared.stats.bump(Counter::MemexPasses);
    log::info!(
        "MemEx: walked {} of {} apps, reclaimed {} pages{}",
        report.walked,
        report.app_candidates,
        report.pages_reclaimed,
        if report.stopped_early { ", memory recovered" } else { "" }
    );
    shared.events.publish(MemplusEvent::MemexPassCompleted(report));
    report
}
