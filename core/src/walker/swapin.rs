//! Swap-in walk

use std::thread;

use hashbrown::HashSet;
use memplus_hal::{BackendClass, HostError, HostResult, MappingId, Pid};

use super::{ScanMarkers, Walker};
use crate::error::{MemplusError, MemplusResult};
use crate::stats::{Counter, Stats};

impl Walker {
    /// Bring the swapped-out anonymous pages of a process back in
    ///
    /// Pages on the fast backend are faulted in synchronously, pages on the
    /// slow backend get an asynchronous read-ahead. Small processes are not
    /// worth the cost and return `Ok(0)` without walking.
    ///
    /// Mappings already marked by an earlier swap-in are skipped until a
    /// reclaim walk clears the markers. A page-table race restarts the walk,
    /// skipping mappings already done, at most `swapin_max_retries` times
    /// with exponential backoff.
    pub fn swapin(&self, pid: Pid, markers: &ScanMarkers, stats: &Stats) -> MemplusResult<u64> {
        let memory = self
            .scanner
            .memory(pid)
            .map_err(|e| MemplusError::from_host(pid, e))?;
        if memory.total_pages() <= self.limits.swapin_min_pages {
            log::trace!(
                "Swapin: pid {} too small ({} pages)",
                pid,
                memory.total_pages()
            );
            return Ok(0);
        }

        let mut visited = HashSet::new();
        let mut pages = 0;
        let mut retries = 0;
        let mut backoff = self.limits.swapin_backoff;

        loop {
            match self.swapin_pass(pid, markers, &mut visited, &mut pages) {
                Ok(()) => break,
                Err(HostError::PageTableRace) if retries < self.limits.swapin_max_retries => {
                    retries += 1;
                    stats.bump(Counter::SwapinRetries);
                    log::debug!("Swapin: pid {} page table raced, retry {}", pid, retries);
                    thread::sleep(backoff);
                    backoff = backoff.saturating_mul(2);
                },
                Err(HostError::PageTableRace) => {
                    log::warn!("Swapin: pid {} gave up after {} retries", pid, retries);
                    break;
                },
                Err(HostError::ProcessGone) => {
                    log::debug!("Swapin: pid {} exited mid-walk", pid);
                    break;
                },
                Err(err) => {
                    stats.record_swapin(pages);
                    return Err(MemplusError::from_host(pid, err));
                },
            }
        }

        stats.record_swapin(pages);
        log::debug!("Swapin: pid {} brought back {} pages", pid, pages);
        Ok(pages)
    }

    fn swapin_pass(
        &self,
        pid: Pid,
        markers: &ScanMarkers,
        visited: &mut HashSet<MappingId>,
        pages: &mut u64,
    ) -> HostResult<()> {
        for mapping in self.scanner.mappings(pid)? {
            if !mapping.is_walkable()
                || visited.contains(&mapping.id)
                || markers.is_marked(mapping.id)
            {
                continue;
            }

            let entries = match self.scanner.swapped_pages(pid, &mapping) {
                Err(HostError::MappingGone) => continue,
                other => other?,
            };

            for entry in &entries {
                match entry.backend {
                    BackendClass::Fast => match self.scanner.swap_in(pid, entry) {
                        Ok(()) => *pages += 1,
                        Err(HostError::MappingGone) => break,
                        Err(err) => return Err(err),
                    },
                    BackendClass::Slow => {
                        self.scanner.read_ahead(pid, entry);
                        *pages += 1;
                    },
                }
            }

            visited.insert(mapping.id);
            markers.mark(mapping.id);
            thread::yield_now();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use memplus_hal::sim::SimHost;
    use memplus_hal::MappingFlags;

    use super::*;
    use crate::selector::BackendSelector;
    use crate::walker::WalkLimits;

    const PID: Pid = Pid(9);

    fn setup(min_pages: u64) -> (Arc<SimHost>, Walker) {
        let host = Arc::new(SimHost::new(4096, 4096));
        host.spawn(PID, "com.example.gallery", 0);
        let limits = WalkLimits {
            swapin_min_pages: min_pages,
            swapin_backoff: Duration::from_micros(10),
            ..WalkLimits::default()
        };
        let walker = Walker::new(
            host.clone(),
            BackendSelector::new(host.fast_backend(), host.slow_backend()),
            limits,
        );
        (host, walker)
    }

    #[test]
    fn test_fast_faulted_slow_read_ahead() {
        let (host, walker) = setup(10);
        let mapping = host.add_mapping(PID, MappingFlags::empty(), 4);
        host.add_swapped(PID, mapping, 6, BackendClass::Fast);
        host.add_swapped(PID, mapping, 5, BackendClass::Slow);

        let markers = ScanMarkers::new();
        let stats = Stats::new();
        let pages = walker.swapin(PID, &markers, &stats).unwrap();

        assert_eq!(pages, 11);
        assert_eq!(host.faulted_in(), 6);
        assert_eq!(host.read_aheads(), 5);
        assert_eq!(host.resident_count(PID), 15);
        assert!(markers.is_marked(mapping));
        assert_eq!(stats.snapshot().pages_swapped_in, 11);
    }

    #[test]
    fn test_small_process_not_walked() {
        let (host, walker) = setup(10);
        let mapping = host.add_mapping(PID, MappingFlags::empty(), 4);
        host.add_swapped(PID, mapping, 6, BackendClass::Fast);

        let pages = walker.swapin(PID, &ScanMarkers::new(), &Stats::new()).unwrap();
        assert_eq!(pages, 0);
        assert_eq!(host.faulted_in(), 0);
    }

    #[test]
    fn test_unwalkable_mapping_skipped() {
        let (host, walker) = setup(0);
        let locked = host.add_mapping(PID, MappingFlags::LOCKED, 0);
        host.add_swapped(PID, locked, 3, BackendClass::Fast);
        let plain = host.add_mapping(PID, MappingFlags::empty(), 0);
        host.add_swapped(PID, plain, 2, BackendClass::Fast);

        let markers = ScanMarkers::new();
        let pages = walker.swapin(PID, &markers, &Stats::new()).unwrap();
        assert_eq!(pages, 2);
        assert!(!markers.is_marked(locked));
    }

    #[test]
    fn test_race_retried_with_bound() {
        let (host, walker) = setup(0);
        let first = host.add_mapping(PID, MappingFlags::empty(), 0);
        host.add_swapped(PID, first, 2, BackendClass::Fast);
        let second = host.add_mapping(PID, MappingFlags::empty(), 0);
        host.add_swapped(PID, second, 3, BackendClass::Fast);

        let stats = Stats::new();
        host.inject_races(2);
        let pages = walker.swapin(PID, &ScanMarkers::new(), &stats).unwrap();
        assert_eq!(pages, 5);
        assert_eq!(stats.snapshot().swapin_retries, 2);
    }

    #[test]
    fn test_race_gives_up() {
        let (host, walker) = setup(0);
        let mapping = host.add_mapping(PID, MappingFlags::empty(), 0);
        host.add_swapped(PID, mapping, 2, BackendClass::Fast);

        let stats = Stats::new();
        host.inject_races(100);
        let pages = walker.swapin(PID, &ScanMarkers::new(), &stats).unwrap();
        assert_eq!(pages, 0);
        assert_eq!(stats.snapshot().swapin_retries, 3);
    }

    #[test]
    fn test_repeated_swapin_skips_marked() {
        let (host, walker) = setup(0);
        let mapping = host.add_mapping(PID, MappingFlags::empty(), 0);
        host.add_swapped(PID, mapping, 4, BackendClass::Fast);

        let markers = ScanMarkers::new();
        let stats = Stats::new();
        assert_eq!(walker.swapin(PID, &markers, &stats), Ok(4));

        // Pushed out again behind the tracker's back
        host.add_swapped(PID, mapping, 3, BackendClass::Fast);
        assert_eq!(walker.swapin(PID, &markers, &stats), Ok(0));
        assert_eq!(host.swapped_count(PID, BackendClass::Fast), 3);

        // A reclaim walk clears the markers
        markers.clear();
        assert_eq!(walker.swapin(PID, &markers, &stats), Ok(3));
    }

    #[test]
    fn test_missing_process() {
        let (_host, walker) = setup(0);
        let result = walker.swapin(Pid(1234), &ScanMarkers::new(), &Stats::new());
        assert_eq!(result, Err(MemplusError::ProcessNotFound(Pid(1234))));
    }
}
