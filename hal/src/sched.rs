//! # Worker Placement
//!
//! Background workers that compete with foreground work run at a reduced
//! scheduling priority on a restricted set of CPUs. How that is enforced is
//! up to the host.

/// Scheduling profile of a worker thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerProfile {
    /// Nice value (-20..=19, higher = lower priority)
    pub nice: i8,
    /// Allowed CPUs as a bit mask (bit n = CPU n)
    pub cpu_mask: u64,
}

impl WorkerProfile {
    /// Normal priority, any CPU
    pub const DEFAULT: Self = Self {
        nice: 0,
        cpu_mask: u64::MAX,
    };

    /// Whether the mask allows a given CPU
    #[inline]
    pub const fn allows_cpu(&self, cpu: u32) -> bool {
        cpu < 64 && self.cpu_mask & (1 << cpu) != 0
    }
}

impl Default for WorkerProfile {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Worker placement trait
pub trait WorkerPlacement: Send + Sync {
    /// Apply a profile to the calling thread
    fn apply_to_current(&self, profile: WorkerProfile);
}

/// Placement that leaves threads untouched
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPlacement;

impl WorkerPlacement for NoPlacement {
    fn apply_to_current(&self, profile: WorkerProfile) {
        log::trace!("WorkerPlacement: ignoring {:?}", profile);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_mask() {
        let little = WorkerProfile {
            nice: 10,
            cpu_mask: 0b1111,
        };
        assert!(little.allows_cpu(0));
        assert!(little.allows_cpu(3));
        assert!(!little.allows_cpu(4));
        assert!(!little.allows_cpu(64));
        assert!(WorkerProfile::DEFAULT.allows_cpu(63));
    }
}
