//! # Swap Backend Selector
//!
//! Routes a page batch to the fast (compressed) or slow (block-device)
//! backend. Capacity is queried at dispatch time, never cached.

use std::sync::Arc;

use memplus_hal::{BackendClass, PageInfo, Pid, SwapBackend};

use crate::tracker::ReclaimClass;

/// Result of dispatching one batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatch {
    /// Pages written (a prefix of the batch)
    pub written: usize,
    /// Backend the batch went to
    pub backend: BackendClass,
    /// A "normal" batch was rerouted to the fast backend
    pub promoted: bool,
}

/// Backend selector
#[derive(Clone)]
pub struct BackendSelector {
    fast: Arc<dyn SwapBackend>,
    slow: Arc<dyn SwapBackend>,
}

impl core::fmt::Debug for BackendSelector {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BackendSelector")
            .field("fast_free", &self.fast.free_pages())
            .field("slow_free", &self.slow.free_pages())
            .finish()
    }
}

impl BackendSelector {
    /// Create a selector over two backends
    pub fn new(fast: Arc<dyn SwapBackend>, slow: Arc<dyn SwapBackend>) -> Self {
        Self { fast, slow }
    }

    /// Pick the backend for a batch of `len` pages
    ///
    /// "Frequent" always goes fast. "Normal" goes slow unless the slow
    /// backend cannot take the whole batch, in which case it is promoted.
    /// A batch is never demoted.
    pub fn route(&self, len: usize, class: ReclaimClass) -> (BackendClass, bool) {
        match class.batch_class() {
            ReclaimClass::Frequent => (BackendClass::Fast, false),
            _ if self.slow.free_pages() < len as u64 => (BackendClass::Fast, true),
            _ => (BackendClass::Slow, false),
        }
    }

    /// Write a batch
    ///
    /// Pages past [`Dispatch::written`] are left to the caller; there is no
    /// retry here.
    pub fn dispatch(&self, pid: Pid, batch: &[PageInfo], class: ReclaimClass) -> Dispatch {
        if batch.is_empty() {
            return Dispatch {
                written: 0,
                backend: BackendClass::Slow,
                promoted: false,
            };
        }

        let (backend, promoted) = self.route(batch.len(), class);
        let written = self.backend(backend).write(pid, batch);
        log::trace!(
            "Selector: pid {} wrote {}/{} pages to {}{}",
            pid,
            written,
            batch.len(),
            backend,
            if promoted { " (promoted)" } else { "" }
        );

        Dispatch {
            written,
            backend,
            promoted,
        }
    }

    /// Backend of a class
    pub fn backend(&self, class: BackendClass) -> &dyn SwapBackend {
        match class {
            BackendClass::Fast => self.fast.as_ref(),
            BackendClass::Slow => self.slow.as_ref(),
        }
    }
}
