//! # memplus Service
//!
//! One owning handle constructed at startup with the host's capabilities
//! injected. It holds every queue, table and worker; there is no global
//! state. Host notifications come in through [`Memplus::handle_event`] (or
//! an attached channel), completions go out through [`Memplus::subscribe`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use memplus_hal::{Pid, PAGE_SIZE};

use crate::config::{MemplusConfig, Tunables};
use crate::daemon::{self, DaemonKind, Waker};
use crate::display::DisplayMonitor;
use crate::error::{MemplusError, MemplusResult};
use crate::event::{EventHub, EventTopic, HostEvent, MemplusEvent, WalkOrigin};
use crate::host::Host;
use crate::selector::BackendSelector;
use crate::stats::{Stats, StatsSnapshot};
use crate::sweep::{SweepControl, SweepTrigger};
use crate::tracker::{PriorityChange, ReclaimClass, ReclaimState, Tracker, Transition};
use crate::walker::{ReclaimRequest, ScanMarkers, WalkLimits, WalkStats, Walker};

/// How often the event pump rechecks the stop flag
const EVENT_POLL: Duration = Duration::from_millis(50);

// =============================================================================
// Shared State
// =============================================================================

/// Everything the workers share
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) config: MemplusConfig,
    pub(crate) tunables: Tunables,
    pub(crate) host: Host,
    pub(crate) tracker: Tracker,
    pub(crate) walker: Walker,
    pub(crate) display: DisplayMonitor,
    pub(crate) stats: Stats,
    pub(crate) events: EventHub,
    pub(crate) sweep: SweepControl,
    pub(crate) memex_waker: Waker,
    pub(crate) stop: AtomicBool,
}

impl Shared {
    pub(crate) fn new(host: Host, config: MemplusConfig) -> Self {
        let walker = Walker::new(
            host.scanner.clone(),
            BackendSelector::new(host.fast.clone(), host.slow.clone()),
            WalkLimits::from_config(&config),
        );
        let display = DisplayMonitor::new(config.initial_panel_on, host.clock.now());

        Self {
            tracker: Tracker::new(&config),
            walker,
            display,
            tunables: Tunables::new(),
            stats: Stats::new(),
            events: EventHub::new(),
            sweep: SweepControl::new(),
            memex_waker: Waker::new(),
            stop: AtomicBool::new(false),
            config,
            host,
        }
    }

    pub(crate) fn now(&self) -> Duration {
        self.host.clock.now()
    }

    pub(crate) fn handle_event(&self, event: HostEvent) {
        match event {
            HostEvent::PriorityChanged(change) => {
                self.on_priority_change(&change);
            },
            HostEvent::DisplayChanged { panel_on } => self.display.set_panel(panel_on, self.now()),
            HostEvent::MemoryPressure { available_mb } => self.notify_memory_pressure(available_mb),
            HostEvent::ProcessExited { pid } => {
                if self.tracker.remove(pid) {
                    log::debug!("Tracker: pid {} exited, record dropped", pid);
                }
            },
        }
    }

    pub(crate) fn on_priority_change(&self, change: &PriorityChange) -> Transition {
        if !self.tunables.mode().tracks_priority() {
            return Transition::Disabled;
        }
        self.tracker
            .on_priority_change(change, self.now(), &self.stats)
    }

    pub(crate) fn notify_memory_pressure(&self, available_mb: u64) {
        let watermark = self.tunables.watermark_mb();
        if watermark > 0 && available_mb <= watermark {
            self.memex_waker.wake();
        }
    }
}

// =============================================================================
// Public Handle
// =============================================================================

/// Free capacity of both swap backends, in pages
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwapSpace {
    /// Free pages on the fast backend
    pub fast_free: u64,
    /// Capacity of the fast backend
    pub fast_total: u64,
    /// Free pages on the slow backend
    pub slow_free: u64,
    /// Capacity of the slow backend
    pub slow_total: u64,
}

impl SwapSpace {
    /// Free bytes across both backends
    pub const fn free_bytes(&self) -> u64 {
        (self.fast_free + self.slow_free) * PAGE_SIZE as u64
    }
}

/// The memplus service
#[derive(Debug)]
pub struct Memplus {
    shared: Arc<Shared>,
    workers: Vec<(DaemonKind, JoinHandle<()>)>,
    pumps: Vec<JoinHandle<()>>,
}

impl Memplus {
    /// Construct the service and start its workers
    pub fn start(host: Host, config: MemplusConfig) -> MemplusResult<Self> {
        let mut service = Self {
            shared: Arc::new(Shared::new(host, config)),
            workers: Vec::new(),
            pumps: Vec::new(),
        };

        for kind in DaemonKind::ALL {
            let handle = daemon::spawn(kind, service.shared.clone())?;
            service.workers.push((kind, handle));
        }

        log::info!("memplus: started {} workers", service.workers.len());
        Ok(service)
    }

    /// Feed one host event
    pub fn handle_event(&self, event: HostEvent) {
        self.shared.handle_event(event);
    }

    /// Feed host events from a channel on a dedicated thread
    ///
    /// The pump ends when the sender side is dropped or on shutdown.
    pub fn attach_event_source(&mut self, events: Receiver<HostEvent>) -> MemplusResult<()> {
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("memplus-events".into())
            .spawn(move || loop {
                if shared.stop.load(Ordering::Acquire) {
                    break;
                }
                match events.recv_timeout(EVENT_POLL) {
                    Ok(event) => shared.handle_event(event),
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
        self.pumps.push(handle);
        Ok(())
    }

    /// Priority-change notification
    ///
    /// Never blocks on a walk and never fails; the outcome is informational.
    pub fn on_priority_change(&self, change: PriorityChange) -> Transition {
        self.shared.on_priority_change(&change)
    }

    /// Display panel transition
    pub fn on_display_change(&self, panel_on: bool) {
        self.shared.display.set_panel(panel_on, self.shared.now());
    }

    /// Available-memory notification; wakes MemEx when at or below the
    /// watermark
    pub fn notify_memory_pressure(&self, available_mb: u64) {
        self.shared.notify_memory_pressure(available_mb);
    }

    /// Request a sweep pass
    pub fn trigger_sweep(&self, force: bool) -> SweepTrigger {
        if !self.shared.tunables.mode().is_enabled() {
            return SweepTrigger::Disabled;
        }
        self.shared
            .sweep
            .trigger(self.shared.now(), self.shared.config.sweep_interval, force)
    }

    /// Arm MemEx at `mb` MiB of available memory (0 disarms it)
    pub fn set_memex_watermark(&self, mb: u64) {
        self.shared.tunables.set_watermark_mb(mb);
        log::info!("MemEx: watermark set to {} MiB", mb);
        self.shared.memex_waker.wake();
    }

    /// Runtime tunables
    pub fn tunables(&self) -> &Tunables {
        &self.shared.tunables
    }

    /// Service configuration
    pub fn config(&self) -> &MemplusConfig {
        &self.shared.config
    }

    /// Subscribe to every outbound event
    pub fn subscribe(&self) -> Receiver<MemplusEvent> {
        self.subscribe_to(&[EventTopic::All])
    }

    /// Subscribe to some outbound events
    pub fn subscribe_to(&self, topics: &[EventTopic]) -> Receiver<MemplusEvent> {
        self.shared.events.subscribe(topics).1
    }

    // =========================================================================
    // Synchronous Request Surface
    // =========================================================================

    fn ensure_enabled(&self) -> MemplusResult<()> {
        if self.shared.stop.load(Ordering::Acquire) {
            return Err(MemplusError::Stopped);
        }
        if !self.shared.tunables.mode().is_enabled() {
            return Err(MemplusError::Disabled);
        }
        Ok(())
    }

    /// Resident anonymous memory of a process, in bytes
    pub fn resident_anon_size(&self, pid: Pid) -> MemplusResult<u64> {
        let memory = self
            .shared
            .host
            .scanner
            .memory(pid)
            .map_err(|e| MemplusError::from_host(pid, e))?;
        Ok(memory.anon_resident * PAGE_SIZE as u64)
    }

    /// Reclaim a process now, bypassing the queues
    ///
    /// Uses the process's stored classification; its state is not touched.
    pub fn force_reclaim(&self, pid: Pid) -> MemplusResult<WalkStats> {
        self.ensure_enabled()?;
        let shared = &self.shared;
        if shared.host.scanner.process(pid).is_none() {
            return Err(MemplusError::ProcessNotFound(pid));
        }

        let result = match shared.tracker.record_or_insert(pid, &shared.stats) {
            Some(record) => {
                let _walking = record.walk_guard();
                let request = ReclaimRequest::targeted(record.classification(), record.markers());
                shared.stats.walk_started();
                let result = shared.walker.reclaim(pid, request, None, &shared.stats);
                shared.stats.walk_finished();
                result
            },
            None => {
                let request = ReclaimRequest::untracked(ReclaimClass::Normal);
                shared.stats.walk_started();
                let result = shared.walker.reclaim(pid, request, None, &shared.stats);
                shared.stats.walk_finished();
                result
            },
        };

        let stats = result?;
        shared.events.publish(MemplusEvent::ReclaimCompleted {
            pid,
            origin: WalkOrigin::Forced,
            stats,
        });
        Ok(stats)
    }

    /// Swap a process in now, bypassing the queues
    pub fn force_swapin(&self, pid: Pid) -> MemplusResult<u64> {
        self.ensure_enabled()?;
        let shared = &self.shared;
        if shared.host.scanner.process(pid).is_none() {
            return Err(MemplusError::ProcessNotFound(pid));
        }

        let record = shared.tracker.record_or_insert(pid, &shared.stats);
        let scratch = ScanMarkers::new();
        let _walking = record.as_ref().map(|r| r.walk_guard());
        let markers = record.as_ref().map_or(&scratch, |r| r.markers());

        shared.stats.walk_started();
        let result = shared.walker.swapin(pid, markers, &shared.stats);
        shared.stats.walk_finished();

        let pages = result?;
        shared.events.publish(MemplusEvent::SwapinCompleted {
            pid,
            origin: WalkOrigin::Forced,
            pages,
        });
        Ok(pages)
    }

    /// Free and total capacity of both backends
    pub fn free_swap_space(&self) -> SwapSpace {
        let host = &self.shared.host;
        SwapSpace {
            fast_free: host.fast.free_pages(),
            fast_total: host.fast.total_pages(),
            slow_free: host.slow.free_pages(),
            slow_total: host.slow.total_pages(),
        }
    }

    /// Reclaim state of a process, `None` if untracked
    pub fn process_state(&self, pid: Pid) -> Option<ReclaimState> {
        self.shared.tracker.state(pid)
    }

    /// Queued requests of a process that are still live
    pub fn live_requests(&self, pid: Pid) -> usize {
        self.shared.tracker.live_items(pid)
    }

    /// Statistics snapshot
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Stop and join every worker
    ///
    /// Walks in progress finish first. Idempotent.
    pub fn shutdown(&mut self) {
        if self.shared.stop.swap(true, Ordering::AcqRel) && self.workers.is_empty() {
            return;
        }

        for kind in DaemonKind::ALL {
            daemon::waker(&self.shared, kind).stop();
        }
        self.shared.display.interrupt();

        for (kind, handle) in self.workers.drain(..) {
            if handle.join().is_err() {
                log::warn!("{}: worker panicked", kind);
            }
        }
        for pump in self.pumps.drain(..) {
            if pump.join().is_err() {
                log::warn!("memplus: event pump panicked");
            }
        }
        log::info!("memplus: stopped");
    }

    /// Whether [`Memplus::shutdown`] has run
    pub fn is_stopped(&self) -> bool {
        self.shared.stop.load(Ordering::Acquire)
    }
}

impl Drop for Memplus {
    fn drop(&mut self) {
        self.shutdown();
    }
}
