//! # memplus Core
//!
//! Process-aware anonymous memory reclaim and swap-in scheduler.
//!
//! When a process drops into the background its anonymous pages are
//! pushed out to a swap backend; when it returns to the foreground they
//! are brought back before the process faults on them. A rate-limited
//! sweep reclaims long-idle pages while the screen is off, and a
//! low-memory reclaimer empties background apps when available memory
//! falls under a watermark.
//!
//! ## Components
//!
//! - **Tracker**: per-process state machine driven by priority changes
//! - **Work Queues**: bounded reclaim and swap-in FIFOs
//! - **Walkers**: per-process reclaim and swap-in over the host scanner
//! - **Selector**: fast/slow swap backend routing
//! - **Daemons**: one parked worker per queue
//! - **Sweep**: screen-off pass with per-page skip countdowns
//! - **MemEx**: watermark-driven aggressive reclaimer
//!
//! ## Host Boundary
//!
//! Every host interaction goes through the traits of [`memplus_hal`],
//! bundled into a [`Host`] and injected into [`Memplus::start`].
//!
//! ```rust,ignore
//! let mut memplus = Memplus::start(host, MemplusConfig::default())?;
//! memplus.attach_event_source(host_events)?;
//! let completions = memplus.subscribe();
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod countdown;
pub mod daemon;
pub mod display;
pub mod error;
pub mod event;
pub mod host;
pub mod memex;
pub mod queue;
pub mod selector;
pub mod service;
pub mod stats;
pub mod sweep;
pub mod tracker;
pub mod walker;

#[cfg(test)]
mod testing;

pub use config::{EnableMode, MemplusConfig, Tunables, Verbosity};
pub use daemon::DaemonKind;
pub use error::{MemplusError, MemplusResult};
pub use event::{EventTopic, HostEvent, MemplusEvent, SubscriptionId, WalkOrigin};
pub use host::{Host, MonotonicClock};
pub use memex::{MemexPassReport, MemexPlan};
pub use service::{Memplus, SwapSpace};
pub use stats::StatsSnapshot;
pub use sweep::{SweepReport, SweepTrigger};
pub use tracker::{PriorityChange, ReclaimClass, ReclaimState, Transition};
pub use walker::WalkStats;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
