//! # Process Identity
//!
//! Process handles as seen by the scheduler.

use alloc::string::String;
use core::fmt;

use crate::mm::PAGE_SIZE;

/// Process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Pid(pub u32);

impl Pid {
    /// Get raw value
    pub const fn raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A resolved process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    /// Process ID
    pub pid: Pid,
    /// Command name
    pub name: String,
    /// Current priority tier (0 = foreground, higher = more background)
    pub tier: i32,
    /// Kernel thread (no user address space)
    pub kernel_thread: bool,
}

impl ProcessInfo {
    /// Create a user process
    pub fn new(pid: Pid, name: impl Into<String>, tier: i32) -> Self {
        Self {
            pid,
            name: name.into(),
            tier,
            kernel_thread: false,
        }
    }

    /// Mark as kernel thread
    pub fn kernel(mut self) -> Self {
        self.kernel_thread = true;
        self
    }
}

/// Anonymous memory footprint of a process, in pages
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessMemory {
    /// Resident anonymous pages
    pub anon_resident: u64,
    /// Anonymous pages living on a swap backend
    pub swapped: u64,
}

impl ProcessMemory {
    /// Resident plus swapped anonymous pages
    #[inline]
    pub const fn total_pages(&self) -> u64 {
        self.anon_resident + self.swapped
    }

    /// Resident plus swapped anonymous size in bytes
    #[inline]
    pub const fn total_bytes(&self) -> u64 {
        self.total_pages() * PAGE_SIZE as u64
    }
}
