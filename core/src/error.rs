//! # Errors
//!
//! Only the synchronous request surface and the service lifecycle report
//! errors. Background workers absorb their failures and count them in
//! [`crate::stats::Stats`].

use std::fmt;
use std::io;

use memplus_hal::{HostError, Pid};

/// Result type for memplus operations
pub type MemplusResult<T> = Result<T, MemplusError>;

/// memplus error types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemplusError {
    /// The process does not exist (or exited mid-request)
    ProcessNotFound(Pid),
    /// The host capability failed
    Host(HostError),
    /// The service is disabled by the enable tunable
    Disabled,
    /// The service has been shut down
    Stopped,
    /// A worker thread could not be spawned
    Spawn(io::ErrorKind),
}

impl MemplusError {
    /// Map a host error raised while working on `pid`
    pub fn from_host(pid: Pid, err: HostError) -> Self {
        match err {
            HostError::ProcessGone => Self::ProcessNotFound(pid),
            other => Self::Host(other),
        }
    }
}

impl From<HostError> for MemplusError {
    fn from(err: HostError) -> Self {
        Self::Host(err)
    }
}

impl From<io::Error> for MemplusError {
    fn from(err: io::Error) -> Self {
        Self::Spawn(err.kind())
    }
}

impl fmt::Display for MemplusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProcessNotFound(pid) => write!(f, "Process {} not found", pid),
            Self::Host(err) => write!(f, "Host error: {}", err),
            Self::Disabled => write!(f, "memplus is disabled"),
            Self::Stopped => write!(f, "memplus has been shut down"),
            Self::Spawn(kind) => write!(f, "Failed to spawn worker: {:?}", kind),
        }
    }
}

impl std::error::Error for MemplusError {}
