//! # Skip Countdown
//!
//! Sidecar table owned by the sweep daemon. Each resident page the sweep
//! looks at carries a countdown in `0..=7`; a page becomes eligible for
//! reclaim once enough qualifying sweep visits have brought it to zero.
//!
//! - First sighting seeds the countdown with the current policy value and
//!   is not a qualifying visit
//! - Every later visit decrements; reaching zero makes the page eligible
//! - A reclaimed page is forgotten
//!
//! Entries only survive while their page keeps being observed: a process's
//! entries are replaced by the pages seen in its latest pass, and processes
//! missing from a sweep snapshot are dropped entirely.

use hashbrown::{HashMap, HashSet};
use memplus_hal::{PageId, Pid};

use crate::config::SKIP_COUNTDOWN_MAX;

/// Per-page skip-countdown table
#[derive(Debug)]
pub struct SkipCountdownTable {
    pages: HashMap<Pid, HashMap<PageId, u8>>,
    max_pages: usize,
}

impl SkipCountdownTable {
    /// Create an empty table tracking at most `max_pages` pages
    pub fn new(max_pages: usize) -> Self {
        Self {
            pages: HashMap::new(),
            max_pages,
        }
    }

    /// Pages currently tracked
    pub fn len(&self) -> usize {
        self.pages.values().map(HashMap::len).sum()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.pages.values().all(HashMap::is_empty)
    }

    /// Countdown of a page, if tracked
    pub fn get(&self, pid: Pid, page: PageId) -> Option<u8> {
        self.pages.get(&pid).and_then(|m| m.get(&page)).copied()
    }

    /// Drop every process not in `live`
    pub fn retain_processes(&mut self, live: &HashSet<Pid>) {
        self.pages.retain(|pid, _| live.contains(pid));
    }

    /// Start a pass over one process with the given reset value
    pub fn pass(&mut self, pid: Pid, reset: u8) -> CountdownPass<'_> {
        let previous = self.pages.remove(&pid).unwrap_or_default();
        let budget = self.max_pages.saturating_sub(self.len());
        CountdownPass {
            table: self,
            pid,
            reset: reset.min(SKIP_COUNTDOWN_MAX),
            previous,
            observed: HashMap::new(),
            budget,
        }
    }
}

/// One sweep pass over one process
///
/// Commits the observed pages back into the table when dropped.
#[derive(Debug)]
pub struct CountdownPass<'a> {
    table: &'a mut SkipCountdownTable,
    pid: Pid,
    reset: u8,
    previous: HashMap<PageId, u8>,
    observed: HashMap<PageId, u8>,
    budget: usize,
}

impl CountdownPass<'_> {
    /// Reset value used for newly seen pages
    pub fn reset_value(&self) -> u8 {
        self.reset
    }

    /// Record a qualifying visit; returns whether the page is eligible
    pub fn visit(&mut self, page: PageId) -> bool {
        if let Some(&countdown) = self.observed.get(&page) {
            return countdown == 0;
        }

        let next = match self.previous.remove(&page) {
            Some(countdown) => countdown.saturating_sub(1),
            None if self.observed.len() >= self.budget => {
                // Untracked pages only pass when the policy says "now"
                return self.reset == 0;
            },
            None => self.reset,
        };
        self.observed.insert(page, next);
        next == 0
    }

    /// Forget a page that was written out
    pub fn reclaimed(&mut self, page: PageId) {
        self.observed.remove(&page);
    }
}

impl Drop for CountdownPass<'_> {
    fn drop(&mut self) {
        let observed = std::mem::take(&mut self.observed);
        if !observed.is_empty() {
            self.table.pages.insert(self.pid, observed);
        }
    }
}
