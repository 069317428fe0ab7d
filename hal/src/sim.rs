//! # Simulated Host
//!
//! An in-memory host implementing every capability trait. Processes,
//! mappings and pages are plain data; the two backends move pages between
//! the resident and swapped lists of the shared state.
//!
//! ```rust,ignore
//! let host = SimHost::new(1024, 4096);
//! let pid = host.spawn(Pid(100), "com.example.app", 900);
//! host.add_mapping(pid, MappingFlags::empty(), 64);
//! ```

use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use core::time::Duration;

use hashbrown::HashSet;
use spin::Mutex;

use crate::error::{HostError, HostResult};
use crate::mm::{
    AddressSpaceScanner, MappingFlags, MappingId, MappingInfo, PageFlags, PageId, PageInfo,
    SwapEntry, PAGE_SIZE,
};
use crate::process::{Pid, ProcessInfo, ProcessMemory};
use crate::sched::{WorkerPlacement, WorkerProfile};
use crate::swap::{BackendClass, SwapBackend};
use crate::time::Clock;
use crate::MemoryMonitor;

// =============================================================================
// Shared State
// =============================================================================

struct SimMapping {
    info: MappingInfo,
    resident: Vec<PageInfo>,
    swapped: Vec<SwapEntry>,
}

struct SimProcess {
    info: ProcessInfo,
    mappings: Vec<SimMapping>,
}

impl SimProcess {
    fn mapping_mut(&mut self, id: MappingId) -> Option<&mut SimMapping> {
        self.mappings.iter_mut().find(|m| m.info.id == id)
    }
}

#[derive(Default)]
struct SimState {
    processes: BTreeMap<Pid, SimProcess>,
    isolated: HashSet<PageId>,
    next_page: u64,
    next_mapping: u64,
}

impl SimState {
    fn alloc_page(&mut self) -> PageId {
        self.next_page += 1;
        PageId(self.next_page)
    }

    fn process(&self, pid: Pid) -> HostResult<&SimProcess> {
        self.processes.get(&pid).ok_or(HostError::ProcessGone)
    }

    fn process_mut(&mut self, pid: Pid) -> HostResult<&mut SimProcess> {
        self.processes.get_mut(&pid).ok_or(HostError::ProcessGone)
    }

    /// Move a swapped entry back to the resident list
    fn bring_back(&mut self, pid: Pid, entry: &SwapEntry) -> HostResult<bool> {
        let proc = self.process_mut(pid)?;
        let mapping = proc.mapping_mut(entry.mapping).ok_or(HostError::MappingGone)?;
        let Some(pos) = mapping.swapped.iter().position(|e| e.page == entry.page) else {
            return Ok(false);
        };
        mapping.swapped.swap_remove(pos);
        mapping.resident.push(PageInfo {
            id: entry.page,
            mapping: entry.mapping,
            map_count: 1,
            flags: PageFlags::SWAP_BACKED,
        });
        Ok(true)
    }
}

// =============================================================================
// Backend
// =============================================================================

/// Simulated swap backend
pub struct SimBackend {
    class: BackendClass,
    total: u64,
    used: AtomicU64,
    writes: AtomicU64,
    state: Arc<Mutex<SimState>>,
}

impl SimBackend {
    fn new(class: BackendClass, total: u64, state: Arc<Mutex<SimState>>) -> Self {
        Self {
            class,
            total,
            used: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            state,
        }
    }

    /// Pages currently stored
    pub fn used_pages(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    /// Number of write calls received
    pub fn write_calls(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Occupy capacity without storing pages
    pub fn fill(&self, pages: u64) {
        let used = self.used.load(Ordering::Relaxed);
        self.used
            .store((used + pages).min(self.total), Ordering::Relaxed);
    }

    fn release(&self, pages: u64) {
        let _ = self
            .used
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
                Some(used.saturating_sub(pages))
            });
    }
}

impl core::fmt::Debug for SimBackend {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SimBackend")
            .field("class", &self.class)
            .field("total", &self.total)
            .field("used", &self.used_pages())
            .finish_non_exhaustive()
    }
}

impl SwapBackend for SimBackend {
    fn class(&self) -> BackendClass {
        self.class
    }

    fn free_pages(&self) -> u64 {
        self.total.saturating_sub(self.used.load(Ordering::Relaxed))
    }

    fn total_pages(&self) -> u64 {
        self.total
    }

    fn write(&self, pid: Pid, pages: &[PageInfo]) -> usize {
        self.writes.fetch_add(1, Ordering::Relaxed);

        let room = self.free_pages().min(pages.len() as u64) as usize;
        let mut state = self.state.lock();
        let mut written = 0;

        for page in &pages[..room] {
            state.isolated.remove(&page.id);
            let Ok(proc) = state.process_mut(pid) else {
                break;
            };
            let Some(mapping) = proc.mapping_mut(page.mapping) else {
                continue;
            };
            if let Some(pos) = mapping.resident.iter().position(|p| p.id == page.id) {
                mapping.resident.swap_remove(pos);
                mapping.swapped.push(SwapEntry {
                    page: page.id,
                    mapping: page.mapping,
                    backend: self.class,
                });
            }
            written += 1;
        }

        self.used.fetch_add(written as u64, Ordering::Relaxed);
        written
    }
}

// =============================================================================
// Host
// =============================================================================

/// Simulated host
pub struct SimHost {
    state: Arc<Mutex<SimState>>,
    fast: Arc<SimBackend>,
    slow: Arc<SimBackend>,
    pending_races: AtomicU32,
    pending_io: AtomicU32,
    faulted_in: AtomicU64,
    read_aheads: AtomicU64,
}

impl SimHost {
    /// Create a host with the given backend capacities (in pages)
    pub fn new(fast_pages: u64, slow_pages: u64) -> Self {
        let state = Arc::new(Mutex::new(SimState::default()));
        Self {
            fast: Arc::new(SimBackend::new(BackendClass::Fast, fast_pages, state.clone())),
            slow: Arc::new(SimBackend::new(BackendClass::Slow, slow_pages, state.clone())),
            state,
            pending_races: AtomicU32::new(0),
            pending_io: AtomicU32::new(0),
            faulted_in: AtomicU64::new(0),
            read_aheads: AtomicU64::new(0),
        }
    }

    /// The compressed backend
    pub fn fast_backend(&self) -> Arc<SimBackend> {
        self.fast.clone()
    }

    /// The block-device backend
    pub fn slow_backend(&self) -> Arc<SimBackend> {
        self.slow.clone()
    }

    /// Add a process
    pub fn spawn(&self, pid: Pid, name: impl Into<String>, tier: i32) -> Pid {
        self.insert(ProcessInfo::new(pid, name, tier))
    }

    /// Add a process from a full description
    pub fn insert(&self, info: ProcessInfo) -> Pid {
        let pid = info.pid;
        self.state.lock().processes.insert(
            pid,
            SimProcess {
                info,
                mappings: Vec::new(),
            },
        );
        pid
    }

    /// Remove a process
    pub fn kill(&self, pid: Pid) {
        let mut state = self.state.lock();
        if let Some(proc) = state.processes.remove(&pid) {
            for mapping in &proc.mappings {
                for page in &mapping.resident {
                    state.isolated.remove(&page.id);
                }
            }
        }
    }

    /// Change the priority tier of a process
    pub fn set_tier(&self, pid: Pid, tier: i32) {
        if let Some(proc) = self.state.lock().processes.get_mut(&pid) {
            proc.info.tier = tier;
        }
    }

    /// Add a mapping with `pages` private resident pages
    pub fn add_mapping(&self, pid: Pid, flags: MappingFlags, pages: usize) -> MappingId {
        self.add_mapping_with(pid, flags, pages, 1, PageFlags::empty())
    }

    /// Add a mapping whose pages carry the given map count and flags
    pub fn add_mapping_with(
        &self,
        pid: Pid,
        flags: MappingFlags,
        pages: usize,
        map_count: u32,
        page_flags: PageFlags,
    ) -> MappingId {
        let mut state = self.state.lock();
        state.next_mapping += 1;
        let id = MappingId(state.next_mapping);
        let start = id.0 << 32;

        let resident = (0..pages)
            .map(|_| PageInfo {
                id: state.alloc_page(),
                mapping: id,
                map_count,
                flags: page_flags,
            })
            .collect();

        if let Some(proc) = state.processes.get_mut(&pid) {
            proc.mappings.push(SimMapping {
                info: MappingInfo {
                    id,
                    start,
                    end: start + (pages * PAGE_SIZE) as u64,
                    flags,
                },
                resident,
                swapped: Vec::new(),
            });
        }
        id
    }

    /// Add `count` swapped-out pages on `backend` to an existing mapping
    pub fn add_swapped(&self, pid: Pid, mapping: MappingId, count: usize, backend: BackendClass) {
        let mut state = self.state.lock();
        let pages: Vec<PageId> = (0..count).map(|_| state.alloc_page()).collect();
        let Ok(proc) = state.process_mut(pid) else {
            return;
        };
        let Some(m) = proc.mapping_mut(mapping) else {
            return;
        };
        for page in pages {
            m.swapped.push(SwapEntry {
                page,
                mapping,
                backend,
            });
        }
        drop(state);

        match backend {
            BackendClass::Fast => self.fast.fill(count as u64),
            BackendClass::Slow => self.slow.fill(count as u64),
        }
    }

    /// Make the next `count` swapped-page enumerations fail with a race
    pub fn inject_races(&self, count: u32) {
        self.pending_races.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` swapped-page enumerations fail with an I/O error
    pub fn inject_io_errors(&self, count: u32) {
        self.pending_io.store(count, Ordering::SeqCst);
    }

    /// Resident anonymous pages of a process
    pub fn resident_count(&self, pid: Pid) -> usize {
        self.state
            .lock()
            .processes
            .get(&pid)
            .map(|p| p.mappings.iter().map(|m| m.resident.len()).sum())
            .unwrap_or(0)
    }

    /// Swapped pages of a process on one backend
    pub fn swapped_count(&self, pid: Pid, backend: BackendClass) -> usize {
        self.state
            .lock()
            .processes
            .get(&pid)
            .map(|p| {
                p.mappings
                    .iter()
                    .flat_map(|m| m.swapped.iter())
                    .filter(|e| e.backend == backend)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Resident page IDs of a mapping
    pub fn resident_pages_of(&self, pid: Pid, mapping: MappingId) -> Vec<PageId> {
        let mut state = self.state.lock();
        state
            .process_mut(pid)
            .ok()
            .and_then(|p| p.mapping_mut(mapping))
            .map(|m| m.resident.iter().map(|p| p.id).collect())
            .unwrap_or_default()
    }

    /// Pages currently isolated and not yet written or put back
    pub fn isolated_count(&self) -> usize {
        self.state.lock().isolated.len()
    }

    /// Synchronous swap-ins served
    pub fn faulted_in(&self) -> u64 {
        self.faulted_in.load(Ordering::Relaxed)
    }

    /// Read-aheads issued
    pub fn read_aheads(&self) -> u64 {
        self.read_aheads.load(Ordering::Relaxed)
    }

    fn release_slot(&self, backend: BackendClass) {
        match backend {
            BackendClass::Fast => self.fast.release(1),
            BackendClass::Slow => self.slow.release(1),
        }
    }
}

impl core::fmt::Debug for SimHost {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SimHost")
            .field("processes", &self.state.lock().processes.len())
            .field("fast", &self.fast)
            .field("slow", &self.slow)
            .finish_non_exhaustive()
    }
}

impl AddressSpaceScanner for SimHost {
    fn process(&self, pid: Pid) -> Option<ProcessInfo> {
        self.state.lock().processes.get(&pid).map(|p| p.info.clone())
    }

    fn processes(&self) -> Vec<ProcessInfo> {
        self.state
            .lock()
            .processes
            .values()
            .map(|p| p.info.clone())
            .collect()
    }

    fn memory(&self, pid: Pid) -> HostResult<ProcessMemory> {
        let state = self.state.lock();
        let proc = state.process(pid)?;
        let mut mem = ProcessMemory::default();
        for mapping in proc.mappings.iter().filter(|m| m.info.is_walkable()) {
            mem.anon_resident += mapping.resident.len() as u64;
            mem.swapped += mapping.swapped.len() as u64;
        }
        Ok(mem)
    }

    fn mappings(&self, pid: Pid) -> HostResult<Vec<MappingInfo>> {
        let state = self.state.lock();
        Ok(state.process(pid)?.mappings.iter().map(|m| m.info).collect())
    }

    fn resident_pages(&self, pid: Pid, mapping: &MappingInfo) -> HostResult<Vec<PageInfo>> {
        let mut state = self.state.lock();
        let proc = state.process_mut(pid)?;
        let m = proc.mapping_mut(mapping.id).ok_or(HostError::MappingGone)?;
        Ok(m.resident.clone())
    }

    fn swapped_pages(&self, pid: Pid, mapping: &MappingInfo) -> HostResult<Vec<SwapEntry>> {
        let take = |pending: &AtomicU32| {
            pending
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        };
        if take(&self.pending_races) {
            return Err(HostError::PageTableRace);
        }
        if take(&self.pending_io) {
            return Err(HostError::Io);
        }

        let mut state = self.state.lock();
        let proc = state.process_mut(pid)?;
        let m = proc.mapping_mut(mapping.id).ok_or(HostError::MappingGone)?;
        Ok(m.swapped.clone())
    }

    fn clear_will_need(&self, pid: Pid, page: &PageInfo) {
        let mut state = self.state.lock();
        let Ok(proc) = state.process_mut(pid) else {
            return;
        };
        if let Some(m) = proc.mapping_mut(page.mapping) {
            if let Some(p) = m.resident.iter_mut().find(|p| p.id == page.id) {
                p.flags.remove(PageFlags::WILL_NEED);
            }
        }
    }

    fn isolate(&self, pid: Pid, page: &PageInfo) -> bool {
        let mut state = self.state.lock();
        if state.process(pid).is_err() {
            return false;
        }
        state.isolated.insert(page.id)
    }

    fn putback(&self, _pid: Pid, pages: &[PageInfo]) {
        let mut state = self.state.lock();
        for page in pages {
            state.isolated.remove(&page.id);
        }
    }

    fn swap_in(&self, pid: Pid, entry: &SwapEntry) -> HostResult<()> {
        if self.state.lock().bring_back(pid, entry)? {
            self.release_slot(entry.backend);
            self.faulted_in.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn read_ahead(&self, pid: Pid, entry: &SwapEntry) {
        if let Ok(true) = self.state.lock().bring_back(pid, entry) {
            self.release_slot(entry.backend);
            self.read_aheads.fetch_add(1, Ordering::Relaxed);
        }
    }
}

// =============================================================================
// Clock, Monitor, Placement
// =============================================================================

/// Clock advanced by hand
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    /// Clock starting at `start`
    pub fn starting_at(start: Duration) -> Self {
        Self {
            nanos: AtomicU64::new(start.as_nanos() as u64),
        }
    }

    /// Move time forward
    pub fn advance(&self, by: Duration) {
        self.nanos
            .fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }
}

/// Memory monitor with an optional script of readings
///
/// Each poll consumes the next scripted reading; once the script is
/// exhausted the fixed level is reported.
#[derive(Debug, Default)]
pub struct SimMonitor {
    level: AtomicU64,
    script: Mutex<VecDeque<u64>>,
    polls: AtomicU64,
}

impl SimMonitor {
    /// Monitor reporting a fixed level
    pub fn new(available_mb: u64) -> Self {
        Self {
            level: AtomicU64::new(available_mb),
            ..Self::default()
        }
    }

    /// Change the fixed level
    pub fn set(&self, available_mb: u64) {
        self.level.store(available_mb, Ordering::SeqCst);
    }

    /// Queue readings returned by the next polls
    pub fn script(&self, readings: &[u64]) {
        self.script.lock().extend(readings.iter().copied());
    }

    /// Number of polls so far
    pub fn polls(&self) -> u64 {
        self.polls.load(Ordering::SeqCst)
    }
}

impl MemoryMonitor for SimMonitor {
    fn available_mb(&self) -> u64 {
        self.polls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.level.load(Ordering::SeqCst))
    }
}

/// Placement that records every applied profile
#[derive(Debug, Default)]
pub struct SimPlacement {
    applied: Mutex<Vec<WorkerProfile>>,
}

impl SimPlacement {
    /// Profiles applied so far
    pub fn applied(&self) -> Vec<WorkerProfile> {
        self.applied.lock().clone()
    }
}

impl WorkerPlacement for SimPlacement {
    fn apply_to_current(&self, profile: WorkerProfile) {
        self.applied.lock().push(profile);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_write_moves_pages() {
        let host = SimHost::new(8, 8);
        let pid = host.spawn(Pid(10), "app", 900);
        let map = host.add_mapping(pid, MappingFlags::empty(), 4);

        let mapping = host.mappings(pid).unwrap()[0];
        let pages = host.resident_pages(pid, &mapping).unwrap();
        assert_eq!(pages.len(), 4);
        assert!(pages.iter().all(|p| host.isolate(pid, p)));

        let written = host.slow_backend().write(pid, &pages[..3]);
        assert_eq!(written, 3);
        assert_eq!(host.resident_pages_of(pid, map).len(), 1);
        assert_eq!(host.swapped_count(pid, BackendClass::Slow), 3);
        assert_eq!(host.slow_backend().free_pages(), 5);
        assert_eq!(host.isolated_count(), 1);
    }

    #[test]
    fn test_backend_short_write() {
        let host = SimHost::new(2, 0);
        let pid = host.spawn(Pid(10), "app", 900);
        host.add_mapping(pid, MappingFlags::empty(), 4);

        let mapping = host.mappings(pid).unwrap()[0];
        let pages = host.resident_pages(pid, &mapping).unwrap();
        assert_eq!(host.fast_backend().write(pid, &pages), 2);
        assert_eq!(host.fast_backend().free_pages(), 0);
        assert_eq!(host.slow_backend().write(pid, &pages[2..]), 0);
    }

    #[test]
    fn test_swap_in_and_read_ahead() {
        let host = SimHost::new(8, 8);
        let pid = host.spawn(Pid(10), "app", 0);
        let map = host.add_mapping(pid, MappingFlags::empty(), 0);
        host.add_swapped(pid, map, 2, BackendClass::Fast);
        host.add_swapped(pid, map, 1, BackendClass::Slow);

        let mapping = host.mappings(pid).unwrap()[0];
        for entry in host.swapped_pages(pid, &mapping).unwrap() {
            match entry.backend {
                BackendClass::Fast => host.swap_in(pid, &entry).unwrap(),
                BackendClass::Slow => host.read_ahead(pid, &entry),
            }
        }

        assert_eq!(host.faulted_in(), 2);
        assert_eq!(host.read_aheads(), 1);
        assert_eq!(host.resident_count(pid), 3);
        assert_eq!(host.fast_backend().used_pages(), 0);
    }

    #[test]
    fn test_injected_races() {
        let host = SimHost::new(8, 8);
        let pid = host.spawn(Pid(10), "app", 0);
        host.add_mapping(pid, MappingFlags::empty(), 1);
        let mapping = host.mappings(pid).unwrap()[0];

        host.inject_races(2);
        assert_eq!(host.swapped_pages(pid, &mapping), Err(HostError::PageTableRace));
        assert_eq!(host.swapped_pages(pid, &mapping), Err(HostError::PageTableRace));
        assert!(host.swapped_pages(pid, &mapping).is_ok());
    }

    #[test]
    fn test_killed_process() {
        let host = SimHost::new(8, 8);
        let pid = host.spawn(Pid(10), "app", 0);
        host.kill(pid);
        assert!(host.process(pid).is_none());
        assert_eq!(host.memory(pid), Err(HostError::ProcessGone));
    }

    #[test]
    fn test_scripted_monitor() {
        let monitor = SimMonitor::new(500);
        monitor.script(&[100, 200]);
        assert_eq!(monitor.available_mb(), 100);
        assert_eq!(monitor.available_mb(), 200);
        assert_eq!(monitor.available_mb(), 500);
        assert_eq!(monitor.polls(), 3);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::starting_at(Duration::from_secs(5));
        clock.advance(Duration::from_millis(1500));
        assert_eq!(clock.now(), Duration::from_millis(6500));
    }
}
