//! # Host Errors
//!
//! Failures reported by the host capabilities.

use core::fmt;

/// Result type for host operations
pub type HostResult<T> = Result<T, HostError>;

/// Host error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostError {
    /// The process exited or was never known
    ProcessGone,
    /// The mapping was unmapped while being visited
    MappingGone,
    /// A concurrent page-table update was detected mid-walk
    PageTableRace,
    /// The page could not be isolated or is busy
    Busy,
    /// Backing store I/O failure
    Io,
    /// Operation not supported by this host
    NotSupported,
}

impl HostError {
    /// Whether repeating the operation may succeed
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::PageTableRace | Self::Busy)
    }
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProcessGone => write!(f, "Process no longer exists"),
            Self::MappingGone => write!(f, "Mapping no longer exists"),
            Self::PageTableRace => write!(f, "Page table changed during walk"),
            Self::Busy => write!(f, "Resource busy"),
            Self::Io => write!(f, "Backing store I/O error"),
            Self::NotSupported => write!(f, "Operation not supported"),
        }
    }
}
