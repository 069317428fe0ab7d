//! # Address Space Scanning
//!
//! The page-table walk primitive is owned by the host. The scheduler sees a
//! process as a list of mappings, and a mapping as a list of resident
//! anonymous pages plus a list of swapped-out entries.
//!
//! A host is expected to hold its mapping-list read lock only while one
//! mapping is being enumerated, never across a whole walk.

use alloc::vec::Vec;
use core::fmt;

use bitflags::bitflags;
use static_assertions::const_assert;

use crate::error::HostResult;
use crate::process::{Pid, ProcessInfo, ProcessMemory};
use crate::swap::BackendClass;

/// Page size in bytes
pub const PAGE_SIZE: usize = 4096;

const_assert!(PAGE_SIZE.is_power_of_two());

// =============================================================================
// Identifiers
// =============================================================================

/// Mapping (VMA) identifier, unique within a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct MappingId(pub u64);

/// Page identifier, unique within the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PageId(pub u64);

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

// =============================================================================
// Mappings
// =============================================================================

bitflags! {
    /// Mapping properties relevant to reclaim
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MappingFlags: u32 {
        /// Backed by a file
        const FILE_BACKED = 1 << 0;
        /// Backed by huge pages
        const HUGE        = 1 << 1;
        /// Locked in memory
        const LOCKED      = 1 << 2;
        /// Shared between address spaces
        const SHARED      = 1 << 3;

        /// Mappings the walkers never touch
        const UNRECLAIMABLE = Self::FILE_BACKED.bits() | Self::HUGE.bits() | Self::LOCKED.bits();
    }
}

/// A contiguous region of a process address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingInfo {
    /// Mapping ID
    pub id: MappingId,
    /// Start virtual address
    pub start: u64,
    /// End virtual address (exclusive)
    pub end: u64,
    /// Properties
    pub flags: MappingFlags,
}

impl MappingInfo {
    /// Whether the walkers may visit this mapping
    #[inline]
    pub fn is_walkable(&self) -> bool {
        !self.flags.intersects(MappingFlags::UNRECLAIMABLE)
    }

    /// Size in pages
    #[inline]
    pub fn page_count(&self) -> u64 {
        self.end.saturating_sub(self.start) / PAGE_SIZE as u64
    }
}

// =============================================================================
// Pages
// =============================================================================

bitflags! {
    /// Per-page state relevant to reclaim
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PageFlags: u32 {
        /// Application hinted the page will be needed soon
        const WILL_NEED   = 1 << 0;
        /// Resident page that already holds a slot on a swap backend
        const SWAP_BACKED = 1 << 1;
        /// Page is currently being written to a swap backend
        const WRITEBACK   = 1 << 2;
    }
}

/// A resident anonymous page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo {
    /// Page ID
    pub id: PageId,
    /// Owning mapping
    pub mapping: MappingId,
    /// Number of address spaces mapping this page
    pub map_count: u32,
    /// Page state
    pub flags: PageFlags,
}

impl PageInfo {
    /// Mapped by more than one address space
    #[inline]
    pub const fn is_shared(&self) -> bool {
        self.map_count > 1
    }
}

/// A swapped-out anonymous page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapEntry {
    /// Page ID the entry was swapped out from
    pub page: PageId,
    /// Owning mapping
    pub mapping: MappingId,
    /// Backend holding the contents
    pub backend: BackendClass,
}

// =============================================================================
// Scanner Capability
// =============================================================================

/// Address space scanner trait
///
/// Implemented by the host. All enumeration calls return snapshots; the
/// walkers tolerate pages disappearing between enumeration and use.
pub trait AddressSpaceScanner: Send + Sync {
    /// Resolve a process, `None` if it no longer exists
    fn process(&self, pid: Pid) -> Option<ProcessInfo>;

    /// Snapshot of all live processes
    fn processes(&self) -> Vec<ProcessInfo>;

    /// Anonymous memory footprint of a process
    fn memory(&self, pid: Pid) -> HostResult<ProcessMemory>;

    /// Mappings of a process
    fn mappings(&self, pid: Pid) -> HostResult<Vec<MappingInfo>>;

    /// Resident anonymous pages of one mapping
    fn resident_pages(&self, pid: Pid, mapping: &MappingInfo) -> HostResult<Vec<PageInfo>>;

    /// Swapped-out pages of one mapping
    fn swapped_pages(&self, pid: Pid, mapping: &MappingInfo) -> HostResult<Vec<SwapEntry>>;

    /// Drop the will-need hint of a page
    fn clear_will_need(&self, pid: Pid, page: &PageInfo);

    /// Take a page off the host LRU so it can be handed to a backend
    fn isolate(&self, pid: Pid, page: &PageInfo) -> bool;

    /// Return isolated pages that were not written out
    fn putback(&self, pid: Pid, pages: &[PageInfo]);

    /// Synchronously fault a swapped page back in
    fn swap_in(&self, pid: Pid, entry: &SwapEntry) -> HostResult<()>;

    /// Start an asynchronous read-ahead of a swapped page
    fn read_ahead(&self, pid: Pid, entry: &SwapEntry);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unreclaimable_mappings() {
        let mut mapping = MappingInfo {
            id: MappingId(1),
            start: 0x1000,
            end: 0x5000,
            flags: MappingFlags::empty(),
        };
        assert!(mapping.is_walkable());
        assert_eq!(mapping.page_count(), 4);

        mapping.flags = MappingFlags::LOCKED;
        assert!(!mapping.is_walkable());

        mapping.flags = MappingFlags::SHARED;
        assert!(mapping.is_walkable());
    }

    #[test]
    fn test_shared_page() {
        let page = PageInfo {
            id: PageId(7),
            mapping: MappingId(1),
            map_count: 2,
            flags: PageFlags::empty(),
        };
        assert!(page.is_shared());
    }
}
