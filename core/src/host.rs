//! # Host Bundle
//!
//! The collaborators injected into the service at startup.

use std::sync::Arc;
use std::time::{Duration, Instant};

use memplus_hal::{
    AddressSpaceScanner, Clock, MemoryMonitor, NoPlacement, SwapBackend, WorkerPlacement,
};

/// Host capabilities used by memplus
#[derive(Clone)]
pub struct Host {
    /// Process and address space access
    pub scanner: Arc<dyn AddressSpaceScanner>,
    /// Compressed in-memory backend
    pub fast: Arc<dyn SwapBackend>,
    /// Block-device backend
    pub slow: Arc<dyn SwapBackend>,
    /// Available-memory source for MemEx
    pub monitor: Arc<dyn MemoryMonitor>,
    /// Time source for cooldowns, sweep rate limit and screen-on time
    pub clock: Arc<dyn Clock>,
    /// Scheduling controls for the MemEx worker
    pub placement: Arc<dyn WorkerPlacement>,
}

impl Host {
    /// Bundle the required capabilities with a monotonic clock and no
    /// worker placement
    pub fn new(
        scanner: Arc<dyn AddressSpaceScanner>,
        fast: Arc<dyn SwapBackend>,
        slow: Arc<dyn SwapBackend>,
        monitor: Arc<dyn MemoryMonitor>,
    ) -> Self {
        Self {
            scanner,
            fast,
            slow,
            monitor,
            clock: Arc::new(MonotonicClock::new()),
            placement: Arc::new(NoPlacement),
        }
    }

    /// Replace the clock
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the worker placement
    pub fn with_placement(mut self, placement: Arc<dyn WorkerPlacement>) -> Self {
        self.placement = placement;
        self
    }
}

impl core::fmt::Debug for Host {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Host")
            .field("fast", &self.fast.class())
            .field("slow", &self.slow.class())
            .field("now", &self.clock.now())
            .finish_non_exhaustive()
    }
}

/// Clock counting from its own creation
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Start counting now
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_clock() {
        let clock = MonotonicClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
