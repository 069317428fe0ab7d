//! # Swap Backends
//!
//! Two storage classes with different latency and capacity trade-offs.

use core::fmt;

use crate::mm::PageInfo;
use crate::process::Pid;

/// Swap backend class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendClass {
    /// Compressed in-memory store
    Fast,
    /// Block-device store
    Slow,
}

impl BackendClass {
    /// Short name for diagnostics
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Slow => "slow",
        }
    }
}

impl fmt::Display for BackendClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Swap backend trait
pub trait SwapBackend: Send + Sync {
    /// Storage class of this backend
    fn class(&self) -> BackendClass;

    /// Free capacity in pages, queried fresh on every call
    fn free_pages(&self) -> u64;

    /// Total capacity in pages
    fn total_pages(&self) -> u64;

    /// Write a batch of isolated pages
    ///
    /// Writes a prefix of `pages` and returns its length. Pages past the
    /// returned count were not written and stay with the caller.
    fn write(&self, pid: Pid, pages: &[PageInfo]) -> usize;
}
