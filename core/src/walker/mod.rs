//! # Address Space Walkers
//!
//! The reclaim walker pushes a process's anonymous pages out to the swap
//! backends; the swap-in walker pulls them back. Both depend only on the
//! host's [`AddressSpaceScanner`] capability and never hold a process
//! record lock while walking.
//!
//! ## Scan Markers
//!
//! A swap-in walk marks every mapping it visits. A queued or forced reclaim
//! skips marked mappings, so memory that was just brought back is not
//! pushed out again by the next trigger. Every reclaim walk clears the
//! markers when it finishes; the sweep ignores them entirely.

mod reclaim;
mod swapin;

use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashSet;
use memplus_hal::{AddressSpaceScanner, MappingId};
use spin::Mutex;

use crate::config::MemplusConfig;
use crate::selector::BackendSelector;
use crate::tracker::ReclaimClass;

pub use reclaim::ReclaimRequest;

// =============================================================================
// Scan Markers
// =============================================================================

/// Set of mappings visited by the last swap-in walk of a process
#[derive(Debug, Default)]
pub struct ScanMarkers {
    marked: Mutex<HashSet<MappingId>>,
}

impl ScanMarkers {
    /// Create an empty marker set
    pub fn new() -> Self {
        Self::default()
    }

    /// Check a mapping
    pub fn is_marked(&self, mapping: MappingId) -> bool {
        self.marked.lock().contains(&mapping)
    }

    /// Mark a mapping as visited
    pub fn mark(&self, mapping: MappingId) {
        self.marked.lock().insert(mapping);
    }

    /// Forget every mark
    pub fn clear(&self) {
        self.marked.lock().clear();
    }

    /// Number of marked mappings
    pub fn len(&self) -> usize {
        self.marked.lock().len()
    }

    /// Check if nothing is marked
    pub fn is_empty(&self) -> bool {
        self.marked.lock().is_empty()
    }
}

// =============================================================================
// Walk Results and Limits
// =============================================================================

/// Counters of one reclaim walk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkStats {
    /// Resident pages examined
    pub scanned: u64,
    /// Pages isolated into a batch
    pub isolated: u64,
    /// Pages written to a backend
    pub reclaimed: u64,
    /// Batches promoted from the slow to the fast backend
    pub promoted_batches: u64,
    /// Mappings skipped as unwalkable or marked
    pub skipped_mappings: u64,
}

/// Size and retry limits of the walkers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkLimits {
    /// Processes above this many pages are always reclaimed as "frequent"
    pub big_process_pages: u64,
    /// Processes at or below this many pages are not swapped in
    pub swapin_min_pages: u64,
    /// Restarts allowed after a page-table race
    pub swapin_max_retries: u32,
    /// Sleep before the first restart; doubled on every further one
    pub swapin_backoff: Duration,
}

impl WalkLimits {
    /// Limits from the service configuration
    pub fn from_config(config: &MemplusConfig) -> Self {
        Self {
            big_process_pages: config.big_process_pages,
            swapin_min_pages: config.swapin_min_pages,
            swapin_max_retries: config.swapin_max_retries,
            swapin_backoff: config.swapin_backoff,
        }
    }
}

impl Default for WalkLimits {
    fn default() -> Self {
        Self::from_config(&MemplusConfig::default())
    }
}

// =============================================================================
// Walker
// =============================================================================

/// Reclaim and swap-in walker over a host scanner
pub struct Walker {
    scanner: Arc<dyn AddressSpaceScanner>,
    selector: BackendSelector,
    limits: WalkLimits,
}

impl core::fmt::Debug for Walker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Walker")
            .field("selector", &self.selector)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl Walker {
    /// Create a walker
    pub fn new(
        scanner: Arc<dyn AddressSpaceScanner>,
        selector: BackendSelector,
        limits: WalkLimits,
    ) -> Self {
        Self {
            scanner,
            selector,
            limits,
        }
    }

    /// Host scanner
    pub fn scanner(&self) -> &dyn AddressSpaceScanner {
        self.scanner.as_ref()
    }

    /// Backend selector
    pub fn selector(&self) -> &BackendSelector {
        &self.selector
    }

    /// Walk limits
    pub fn limits(&self) -> &WalkLimits {
        &self.limits
    }

    /// Classification a reclaim walk of a process of `total_pages` runs with
    fn effective_class(&self, requested: ReclaimClass, total_pages: u64) -> ReclaimClass {
        if total_pages > self.limits.big_process_pages {
            ReclaimClass::Frequent
        } else {
            requested
        }
    }
}
