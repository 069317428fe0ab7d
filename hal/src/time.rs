//! # Time Source

use core::time::Duration;

/// Monotonic clock trait
pub trait Clock: Send + Sync {
    /// Time elapsed since an arbitrary fixed origin (typically boot)
    fn now(&self) -> Duration;
}
