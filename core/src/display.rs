//! # Display State
//!
//! Tracks panel on/off transitions fed by the host. The sweep daemon waits
//! here for the device to suspend, and derives its skip-countdown policy
//! from the accumulated screen-on time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::config::SKIP_COUNTDOWN_MAX;

/// Interval at which a suspend wait rechecks the stop flag
const STOP_POLL: Duration = Duration::from_millis(50);

#[derive(Debug)]
struct PanelState {
    panel_on: bool,
    on_since: Duration,
    cumulative_on: Duration,
    suspend_edges: u64,
}

/// Panel state and screen-on accumulator
#[derive(Debug)]
pub struct DisplayMonitor {
    state: Mutex<PanelState>,
    changed: Condvar,
}

impl DisplayMonitor {
    /// Create a monitor with the given initial panel state
    pub fn new(panel_on: bool, now: Duration) -> Self {
        Self {
            state: Mutex::new(PanelState {
                panel_on,
                on_since: now,
                cumulative_on: Duration::ZERO,
                suspend_edges: 0,
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PanelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Feed a panel transition
    pub fn set_panel(&self, on: bool, now: Duration) {
        let mut state = self.lock();
        if state.panel_on == on {
            return;
        }

        if on {
            state.on_since = now;
        } else {
            let interval = now.saturating_sub(state.on_since);
            state.cumulative_on += interval;
            state.suspend_edges += 1;
            log::debug!(
                "Display: suspended, screen-on total {:?}",
                state.cumulative_on
            );
        }
        state.panel_on = on;
        drop(state);

        self.changed.notify_all();
    }

    /// Whether the panel is off
    pub fn is_suspended(&self) -> bool {
        !self.lock().panel_on
    }

    /// Number of panel-off transitions observed
    pub fn suspend_edges(&self) -> u64 {
        self.lock().suspend_edges
    }

    /// Screen-on time accumulated so far, including a running interval
    pub fn screen_on_time(&self, now: Duration) -> Duration {
        let state = self.lock();
        if state.panel_on {
            state.cumulative_on + now.saturating_sub(state.on_since)
        } else {
            state.cumulative_on
        }
    }

    /// Skip-countdown reset value
    ///
    /// Starts at 7 and drops by one per `step` of screen-on time, so pages
    /// of a heavily used device are reclaimed sooner.
    pub fn skip_countdown(&self, now: Duration, step: Duration) -> u8 {
        if step.is_zero() {
            return 0;
        }
        let buckets = self.screen_on_time(now).as_nanos() / step.as_nanos();
        SKIP_COUNTDOWN_MAX - buckets.min(u128::from(SKIP_COUNTDOWN_MAX)) as u8
    }

    /// Start a new accumulation period
    pub fn reset_accumulator(&self, now: Duration) {
        let mut state = self.lock();
        state.cumulative_on = Duration::ZERO;
        state.on_since = now;
    }

    /// Block until the panel is off
    ///
    /// Returns `false` if `stop` was raised first. Nothing else interrupts
    /// the wait.
    pub fn wait_for_suspend(&self, stop: &AtomicBool) -> bool {
        let mut state = self.lock();
        loop {
            if stop.load(Ordering::Acquire) {
                return false;
            }
            if !state.panel_on {
                return true;
            }
            state = self
                .changed
                .wait_timeout(state, STOP_POLL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Wake every waiter so it can recheck its stop flag
    pub fn interrupt(&self) {
        self.changed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn test_accumulates_on_suspend_edges() {
        let display = DisplayMonitor::new(true, Duration::ZERO);
        display.set_panel(false, 2 * HOUR);
        display.set_panel(true, 3 * HOUR);
        display.set_panel(false, 4 * HOUR);

        assert_eq!(display.suspend_edges(), 2);
        assert_eq!(display.screen_on_time(10 * HOUR), 3 * HOUR);
        assert_eq!(display.skip_countdown(10 * HOUR, HOUR), 4);
    }

    #[test]
    fn test_running_interval_counts() {
        let display = DisplayMonitor::new(true, Duration::ZERO);
        assert_eq!(display.skip_countdown(Duration::ZERO, HOUR), 7);
        assert_eq!(display.skip_countdown(HOUR * 30, HOUR), 0);
    }

    #[test]
    fn test_duplicate_transitions_ignored() {
        let display = DisplayMonitor::new(false, Duration::ZERO);
        display.set_panel(false, HOUR);
        assert_eq!(display.suspend_edges(), 0);
        assert!(display.is_suspended());
    }

    #[test]
    fn test_reset_accumulator() {
        let display = DisplayMonitor::new(true, Duration::ZERO);
        display.set_panel(false, 5 * HOUR);
        display.reset_accumulator(6 * HOUR);
        assert_eq!(display.skip_countdown(6 * HOUR, HOUR), 7);
    }

    #[test]
    fn test_wait_for_suspend() {
        let display = Arc::new(DisplayMonitor::new(true, Duration::ZERO));
        let stop = Arc::new(AtomicBool::new(false));

        let waiter = {
            let display = display.clone();
            let stop = stop.clone();
            thread::spawn(move || display.wait_for_suspend(&stop))
        };
        thread::sleep(Duration::from_millis(20));
        display.set_panel(false, HOUR);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_wait_interrupted_by_stop() {
        let display = DisplayMonitor::new(true, Duration::ZERO);
        let stop = AtomicBool::new(true);
        assert!(!display.wait_for_suspend(&stop));
    }
}
