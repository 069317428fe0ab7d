//! Reclaim walk

use std::thread;

use arrayvec::ArrayVec;
use memplus_hal::{HostError, PageFlags, PageInfo, Pid};

use super::{ScanMarkers, WalkStats, Walker};
use crate::config::RECLAIM_BATCH_PAGES;
use crate::countdown::CountdownPass;
use crate::error::{MemplusError, MemplusResult};
use crate::stats::Stats;
use crate::tracker::ReclaimClass;

type Batch = ArrayVec<PageInfo, RECLAIM_BATCH_PAGES>;

/// Parameters of one reclaim walk
#[derive(Debug, Clone, Copy)]
pub struct ReclaimRequest<'a> {
    /// Requested classification
    pub class: ReclaimClass,
    /// Markers of the process; cleared once the walk ends
    pub markers: Option<&'a ScanMarkers>,
    /// Skip mappings marked by a previous swap-in
    pub honor_markers: bool,
}

impl<'a> ReclaimRequest<'a> {
    /// Walk on behalf of a queued or forced request
    pub fn targeted(class: ReclaimClass, markers: &'a ScanMarkers) -> Self {
        Self {
            class,
            markers: Some(markers),
            honor_markers: true,
        }
    }

    /// Walk on behalf of the sweep
    pub fn sweep(markers: &'a ScanMarkers) -> Self {
        Self {
            class: ReclaimClass::Normal,
            markers: Some(markers),
            honor_markers: false,
        }
    }

    /// Walk with no record attached
    pub fn untracked(class: ReclaimClass) -> Self {
        Self {
            class,
            markers: None,
            honor_markers: false,
        }
    }
}

impl Walker {
    /// Reclaim the anonymous pages of a process
    ///
    /// With a countdown pass, a page is only taken once its skip countdown
    /// has run out. A process that exits mid-walk ends the walk with what
    /// was reclaimed so far.
    pub fn reclaim(
        &self,
        pid: Pid,
        request: ReclaimRequest<'_>,
        mut countdown: Option<&mut CountdownPass<'_>>,
        stats: &Stats,
    ) -> MemplusResult<WalkStats> {
        let memory = self
            .scanner
            .memory(pid)
            .map_err(|e| MemplusError::from_host(pid, e))?;
        let mappings = self
            .scanner
            .mappings(pid)
            .map_err(|e| MemplusError::from_host(pid, e))?;

        let class = self.effective_class(request.class, memory.total_pages());
        if class != request.class {
            log::trace!(
                "Reclaim: pid {} holds {} pages, forcing frequent",
                pid,
                memory.total_pages()
            );
        }

        let mut walk = WalkStats::default();
        let mut batch = Batch::new();

        for mapping in &mappings {
            let marked = request.honor_markers
                && request.markers.is_some_and(|m| m.is_marked(mapping.id));
            if !mapping.is_walkable() || marked {
                walk.skipped_mappings += 1;
                continue;
            }

            let pages = match self.scanner.resident_pages(pid, mapping) {
                Ok(pages) => pages,
                Err(HostError::ProcessGone) => {
                    log::debug!("Reclaim: pid {} exited mid-walk", pid);
                    break;
                },
                Err(err) => {
                    log::trace!("Reclaim: pid {} mapping {:?}: {}", pid, mapping.id, err);
                    continue;
                },
            };

            for page in &pages {
                walk.scanned += 1;
                if page.flags.contains(PageFlags::WILL_NEED) {
                    self.scanner.clear_will_need(pid, page);
                }
                if !is_candidate(page, class) {
                    continue;
                }
                if let Some(pass) = countdown.as_deref_mut() {
                    if !pass.visit(page.id) {
                        continue;
                    }
                }
                if !self.scanner.isolate(pid, page) {
                    continue;
                }

                walk.isolated += 1;
                batch.push(*page);
                if batch.is_full() {
                    self.flush(pid, &mut batch, class, countdown.as_deref_mut(), &mut walk);
                }
            }

            self.flush(pid, &mut batch, class, countdown.as_deref_mut(), &mut walk);
            thread::yield_now();
        }

        if let Some(markers) = request.markers {
            markers.clear();
        }

        stats.record_walk(walk.scanned, walk.reclaimed, walk.promoted_batches);
        log::debug!(
            "Reclaim: pid {} scanned {} reclaimed {} ({:?})",
            pid,
            walk.scanned,
            walk.reclaimed,
            class
        );
        Ok(walk)
    }

    /// Hand the batch to a backend and put back whatever it did not take
    fn flush(
        &self,
        pid: Pid,
        batch: &mut Batch,
        class: ReclaimClass,
        countdown: Option<&mut CountdownPass<'_>>,
        walk: &mut WalkStats,
    ) {
        if batch.is_empty() {
            return;
        }

        let dispatch = self.selector.dispatch(pid, batch, class);
        let (written, rest) = batch.split_at(dispatch.written.min(batch.len()));

        if let Some(pass) = countdown {
            for page in written {
                pass.reclaimed(page.id);
            }
        }
        if !rest.is_empty() {
            self.scanner.putback(pid, rest);
        }

        walk.reclaimed += written.len() as u64;
        if dispatch.promoted {
            walk.promoted_batches += 1;
        }
        batch.clear();
    }
}

/// Page-level filter
fn is_candidate(page: &PageInfo, class: ReclaimClass) -> bool {
    if page.is_shared() || page.flags.contains(PageFlags::WRITEBACK) {
        return false;
    }
    !(class.batch_class() == ReclaimClass::Normal && page.flags.contains(PageFlags::SWAP_BACKED))
}
