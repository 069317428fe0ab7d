//! Simulated host wiring for unit tests

use std::sync::Arc;
use std::time::Duration;

use memplus_hal::sim::{ManualClock, SimHost, SimMonitor, SimPlacement};
use memplus_hal::Clock;

use crate::config::MemplusConfig;
use crate::host::Host;
use crate::service::Shared;

/// A simulated host with handles on every capability
pub(crate) struct SimRig {
    pub(crate) host: Arc<SimHost>,
    pub(crate) monitor: Arc<SimMonitor>,
    pub(crate) clock: Arc<ManualClock>,
    pub(crate) placement: Arc<SimPlacement>,
}

impl SimRig {
    pub(crate) fn new() -> Self {
        Self {
            host: Arc::new(SimHost::new(1 << 16, 1 << 16)),
            monitor: Arc::new(SimMonitor::new(4096)),
            clock: Arc::new(ManualClock::starting_at(Duration::from_secs(1000))),
            placement: Arc::new(SimPlacement::default()),
        }
    }

    pub(crate) fn now(&self) -> Duration {
        self.clock.now()
    }

    pub(crate) fn host(&self) -> Host {
        Host::new(
            self.host.clone(),
            self.host.fast_backend(),
            self.host.slow_backend(),
            self.monitor.clone(),
        )
        .with_clock(self.clock.clone())
        .with_placement(self.placement.clone())
    }

    pub(crate) fn shared(&self) -> Arc<Shared> {
        self.shared_with(MemplusConfig::default())
    }

    pub(crate) fn shared_with(&self, config: MemplusConfig) -> Arc<Shared> {
        Arc::new(Shared::new(self.host(), config))
    }
}
