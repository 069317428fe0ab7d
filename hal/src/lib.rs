//! # memplus Host Abstraction Layer
//!
//! The boundary between the reclaim scheduler and the machine it runs on.
//! Everything the scheduler needs from the host is expressed here as a small
//! set of capability traits:
//!
//! - **AddressSpaceScanner**: enumerate processes, mappings and pages,
//!   isolate pages and fault swapped pages back in
//! - **SwapBackend**: a page store of a given [`BackendClass`]
//! - **MemoryMonitor**: system-wide available memory
//! - **Clock**: monotonic time since boot
//! - **WorkerPlacement**: scheduling priority and CPU affinity of workers
//!
//! The walk algorithms only depend on these traits, never on a host-specific
//! page table format.
//!
//! ## Simulation
//!
//! With the `sim` feature, [`sim`] provides an in-memory host that
//! implements every trait. It is what the scheduler's own tests run on.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod error;
pub mod mm;
pub mod process;
pub mod sched;
pub mod swap;
pub mod time;

#[cfg(feature = "sim")]
pub mod sim;

pub use error::{HostError, HostResult};
pub use mm::{
    AddressSpaceScanner, MappingFlags, MappingId, MappingInfo, PageFlags, PageId, PageInfo,
    SwapEntry, PAGE_SIZE,
};
pub use process::{Pid, ProcessInfo, ProcessMemory};
pub use sched::{NoPlacement, WorkerPlacement, WorkerProfile};
pub use swap::{BackendClass, SwapBackend};
pub use time::Clock;

/// Memory monitor trait
///
/// Reports the amount of memory the host considers available for new
/// allocations. Polled by the low-memory reclaimer between candidates.
pub trait MemoryMonitor: Send + Sync {
    /// Available memory in MiB
    fn available_mb(&self) -> u64;
}
