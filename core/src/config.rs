//! # Configuration
//!
//! Construction-time constants live in [`MemplusConfig`]. Values that an
//! operator may flip while the service runs live in [`Tunables`].

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Duration;

use log::LevelFilter;
use memplus_hal::{WorkerProfile, PAGE_SIZE};
use spin::RwLock;
use static_assertions::const_assert;

// =============================================================================
// Constants
// =============================================================================

/// Capacity of each work queue
pub const QUEUE_CAPACITY: usize = 128;

/// Soft cap on pages isolated into one batch
pub const RECLAIM_BATCH_PAGES: usize = 32;

/// Largest skip-countdown value
pub const SKIP_COUNTDOWN_MAX: u8 = 7;

/// Processes larger than this are always reclaimed to the fast backend
pub const BIG_PROCESS_BYTES: u64 = 200 * 1024 * 1024;

/// Processes at or below this many anonymous pages are not swapped in
pub const SWAPIN_MIN_PAGES: u64 = 10_000;

const_assert!(QUEUE_CAPACITY > 0);
const_assert!(RECLAIM_BATCH_PAGES > 0 && RECLAIM_BATCH_PAGES <= QUEUE_CAPACITY);
const_assert!(BIG_PROCESS_BYTES % PAGE_SIZE as u64 == 0);

/// Process names never touched by the low-memory reclaimer
pub const DEFAULT_CAMERA_EXCLUSIONS: &[&str] = &[
    "cameraserver",
    "camera.provider",
    "android.hardware.camera",
    "com.android.camera",
];

// =============================================================================
// Static Configuration
// =============================================================================

/// Service configuration
#[derive(Debug, Clone)]
pub struct MemplusConfig {
    /// Minimum time between two reclaim triggers of one process
    pub cooldown: Duration,
    /// Tier at or above which a process counts as background
    pub background_tier: i32,
    /// Tier of a foreground process
    pub foreground_tier: i32,
    /// Processes above this many anonymous pages are forced to "frequent"
    pub big_process_pages: u64,
    /// Minimum anonymous pages for a swap-in walk to run
    pub swapin_min_pages: u64,
    /// Page-table race retries before a swap-in walk gives up
    pub swapin_max_retries: u32,
    /// Backoff before the first swap-in retry, doubled on each retry
    pub swapin_backoff: Duration,
    /// Minimum time between two unforced sweeps
    pub sweep_interval: Duration,
    /// Most processes considered by one sweep
    pub sweep_max_processes: usize,
    /// Screen-on time that lowers the skip countdown by one
    pub screen_on_step: Duration,
    /// Upper bound on pages tracked by the skip-countdown table
    pub skip_table_max_pages: usize,
    /// Panel state assumed at startup
    pub initial_panel_on: bool,
    /// Number of tier slots the low-memory reclaimer buckets processes into
    pub memex_slots: usize,
    /// Lowest tier counted as an app by the low-memory reclaimer
    pub memex_app_tier_min: i32,
    /// Watermark poll period of the low-memory reclaimer
    pub memex_poll_interval: Duration,
    /// Scheduling profile of the low-memory reclaimer
    pub memex_profile: WorkerProfile,
}

impl MemplusConfig {
    /// Set the reclaim cooldown
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Set the background tier threshold
    pub fn with_background_tier(mut self, tier: i32) -> Self {
        self.background_tier = tier;
        self
    }

    /// Set the swap-in size threshold
    pub fn with_swapin_min_pages(mut self, pages: u64) -> Self {
        self.swapin_min_pages = pages;
        self
    }

    /// Set the big-process threshold
    pub fn with_big_process_pages(mut self, pages: u64) -> Self {
        self.big_process_pages = pages;
        self
    }

    /// Set the sweep rate limit
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set the screen-on step per countdown bucket
    pub fn with_screen_on_step(mut self, step: Duration) -> Self {
        self.screen_on_step = step;
        self
    }

    /// Set the initial panel state
    pub fn with_initial_panel_on(mut self, on: bool) -> Self {
        self.initial_panel_on = on;
        self
    }

    /// Set the low-memory reclaimer poll period
    pub fn with_memex_poll_interval(mut self, interval: Duration) -> Self {
        self.memex_poll_interval = interval;
        self
    }

    /// Set the low-memory reclaimer scheduling profile
    pub fn with_memex_profile(mut self, profile: WorkerProfile) -> Self {
        self.memex_profile = profile;
        self
    }
}

impl Default for MemplusConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(2),
            background_tier: 800,
            foreground_tier: 0,
            big_process_pages: BIG_PROCESS_BYTES / PAGE_SIZE as u64,
            swapin_min_pages: SWAPIN_MIN_PAGES,
            swapin_max_retries: 3,
            swapin_backoff: Duration::from_millis(1),
            sweep_interval: Duration::from_secs(24 * 60 * 60),
            sweep_max_processes: 1024,
            screen_on_step: Duration::from_secs(60 * 60),
            skip_table_max_pages: 1 << 20,
            initial_panel_on: true,
            memex_slots: 1001,
            memex_app_tier_min: 100,
            memex_poll_interval: Duration::from_millis(500),
            memex_profile: WorkerProfile {
                nice: 10,
                cpu_mask: 0b1111,
            },
        }
    }
}

// =============================================================================
// Runtime Tunables
// =============================================================================

/// Global enable mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EnableMode {
    /// Every trigger is ignored
    Off                = 0,
    /// Fully enabled
    On                 = 1,
    /// The host's own swap policy drives per-process reclaim; only the
    /// sweep, the low-memory reclaimer and forced requests run
    SystemControlsSwap = 2,
}

impl EnableMode {
    /// Decode a raw tunable value
    pub const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Off),
            1 => Some(Self::On),
            2 => Some(Self::SystemControlsSwap),
            _ => None,
        }
    }

    /// Whether priority changes drive reclaim and swap-in
    pub const fn tracks_priority(&self) -> bool {
        matches!(self, Self::On)
    }

    /// Whether background reclaimers may run
    pub const fn is_enabled(&self) -> bool {
        !matches!(self, Self::Off)
    }
}

/// Diagnostic verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Verbosity {
    /// Warnings and errors only
    Quiet   = 0,
    /// Worker lifecycle and pass summaries
    Normal  = 1,
    /// Every state transition
    Verbose = 2,
    /// Every page decision
    Trace   = 3,
}

impl Verbosity {
    /// Decode a raw tunable value, saturating at [`Verbosity::Trace`]
    pub const fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Quiet,
            1 => Self::Normal,
            2 => Self::Verbose,
            _ => Self::Trace,
        }
    }

    /// Matching log level filter
    pub const fn level_filter(&self) -> LevelFilter {
        match self {
            Self::Quiet => LevelFilter::Warn,
            Self::Normal => LevelFilter::Info,
            Self::Verbose => LevelFilter::Debug,
            Self::Trace => LevelFilter::Trace,
        }
    }
}

/// Runtime tunables
#[derive(Debug)]
pub struct Tunables {
    mode: AtomicU8,
    watermark_mb: AtomicU64,
    verbosity: AtomicU8,
    camera_names: RwLock<Vec<String>>,
}

impl Tunables {
    /// Tunables with everything enabled and the low-memory reclaimer disarmed
    pub fn new() -> Self {
        Self {
            mode: AtomicU8::new(EnableMode::On as u8),
            watermark_mb: AtomicU64::new(0),
            verbosity: AtomicU8::new(Verbosity::Normal as u8),
            camera_names: RwLock::new(
                DEFAULT_CAMERA_EXCLUSIONS
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            ),
        }
    }

    /// Current enable mode
    pub fn mode(&self) -> EnableMode {
        EnableMode::from_raw(self.mode.load(Ordering::Acquire)).unwrap_or(EnableMode::Off)
    }

    /// Change the enable mode
    pub fn set_mode(&self, mode: EnableMode) {
        self.mode.store(mode as u8, Ordering::Release);
        log::info!("Tunables: mode set to {:?}", mode);
    }

    /// Low-memory watermark in MiB, 0 when disarmed
    pub fn watermark_mb(&self) -> u64 {
        self.watermark_mb.load(Ordering::Acquire)
    }

    /// Arm (or with 0, disarm) the low-memory reclaimer
    pub fn set_watermark_mb(&self, mb: u64) {
        self.watermark_mb.store(mb, Ordering::Release);
    }

    /// Current verbosity
    pub fn verbosity(&self) -> Verbosity {
        Verbosity::from_raw(self.verbosity.load(Ordering::Relaxed))
    }

    /// Change verbosity and apply it to the `log` facade
    pub fn set_verbosity(&self, verbosity: Verbosity) {
        self.verbosity.store(verbosity as u8, Ordering::Relaxed);
        log::set_max_level(verbosity.level_filter());
    }

    /// Replace the camera exclusion list
    pub fn set_camera_exclusions<I, S>(&self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *self.camera_names.write() = names.into_iter().map(Into::into).collect();
    }

    /// Snapshot of the camera exclusion list
    pub fn camera_exclusions(&self) -> Vec<String> {
        self.camera_names.read().clone()
    }

    /// Whether a process name matches the camera exclusion list
    pub fn is_camera_process(&self, name: &str) -> bool {
        self.camera_names
            .read()
            .iter()
            .any(|pattern| !pattern.is_empty() && name.contains(pattern.as_str()))
    }
}

impl Default for Tunables {
    fn default() -> Self {
        Self::new()
    }
}
