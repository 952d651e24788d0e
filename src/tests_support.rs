//! Test-only `Arch` double. Mirrors the teacher kernel's pattern of a small,
//! deterministic fake standing in for hardware in unit tests (see
//! `memory/frame_allocator.rs`'s test module), adapted here to the whole
//! `Arch` seam instead of a single allocator.

use std::collections::HashMap;
use std::sync::Mutex;

use alloc::vec::Vec;

use crate::arch::{Arch, CpuId};
use crate::cell::CellId;
use crate::error::{HvError, HvResult};
use crate::memregion::MemoryRegion;

#[derive(Default)]
struct Inner {
    suspended: Vec<CpuId>,
    reset_counts: HashMap<CpuId, u32>,
    pool_total: usize,
    pool_used: usize,
    remap_total: usize,
    remap_used: usize,
    temporary: HashMap<u64, Vec<u8>>,
    fail_cell_create: Option<CellId>,
    fail_map_region: Option<u64>,
}

/// A software stand-in for the architecture layer, good enough to drive
/// every `cellctl` code path deterministically from a single-threaded test.
pub struct MockArch {
    inner: Mutex<Inner>,
}

impl MockArch {
    /// `pool_pages` backs both the general and remap pools equally; tests
    /// that need to distinguish them construct two `MockArch`es.
    pub fn new(_capacity_hint: usize, pool_pages: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                pool_total: pool_pages,
                remap_total: pool_pages,
                ..Inner::default()
            }),
        }
    }

    /// Currently-suspended cpu ids, ascending.
    pub fn suspended(&self) -> Vec<CpuId> {
        let mut v = self.inner.lock().unwrap().suspended.clone();
        v.sort_unstable();
        v
    }

    /// Stages bytes `map_temporary` returns for the given guest-physical
    /// address, simulating a guest configuration blob sitting in memory.
    pub fn stage_temporary(&self, guest_phys: u64, bytes: Vec<u8>) {
        self.inner.lock().unwrap().temporary.insert(guest_phys, bytes);
    }

    pub fn reset_count(&self, cpu: CpuId) -> u32 {
        *self.inner.lock().unwrap().reset_counts.get(&cpu).unwrap_or(&0)
    }

    /// Makes the next `cell_create` for `cell` fail with `HvError::Oom`,
    /// for rollback-path tests.
    pub fn fail_next_cell_create(&self, cell: CellId) {
        self.inner.lock().unwrap().fail_cell_create = Some(cell);
    }

    /// Makes `map_memory_region` fail once the region's `phys_start` matches,
    /// for partial-rollback tests.
    pub fn fail_map_region_at(&self, phys_start: u64) {
        self.inner.lock().unwrap().fail_map_region = Some(phys_start);
    }
}

impl Arch for MockArch {
    fn suspend_cpu(&self, cpu: CpuId) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.suspended.contains(&cpu) {
            inner.suspended.push(cpu);
        }
    }

    fn resume_cpu(&self, cpu: CpuId) {
        self.inner.lock().unwrap().suspended.retain(|&c| c != cpu);
    }

    fn park_cpu(&self, _cpu: CpuId) {}

    fn reset_cpu(&self, cpu: CpuId) {
        *self.inner.lock().unwrap().reset_counts.entry(cpu).or_insert(0) += 1;
    }

    fn shutdown_cpu(&self, _cpu: CpuId) {}

    fn shutdown(&self) {}

    fn panic_stop(&self, _cpu: CpuId) {}

    fn panic_halt(&self, _cpu: CpuId) {}

    fn relax(&self) {}

    fn map_memory_region(&self, _cell: CellId, region: &MemoryRegion) -> HvResult<()> {
        let inner = self.inner.lock().unwrap();
        if inner.fail_map_region == Some(region.phys_start) {
            return Err(HvError::Invalid);
        }
        Ok(())
    }

    fn unmap_memory_region(&self, _cell: CellId, _region: &MemoryRegion) -> HvResult<()> {
        Ok(())
    }

    fn cell_create(&self, cell: CellId) -> HvResult<()> {
        let inner = self.inner.lock().unwrap();
        if inner.fail_cell_create == Some(cell) {
            return Err(HvError::Oom);
        }
        Ok(())
    }

    fn cell_destroy(&self, _cell: CellId) -> HvResult<()> {
        Ok(())
    }

    fn config_commit(&self) {}

    fn map_temporary(&self, guest_phys: u64, max_len: usize) -> HvResult<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        let bytes = inner.temporary.get(&guest_phys).cloned().unwrap_or_default();
        if bytes.len() > max_len {
            return Err(HvError::TooBig);
        }
        Ok(bytes)
    }

    fn try_alloc_pool_page(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.pool_used < inner.pool_total {
            inner.pool_used += 1;
            true
        } else {
            false
        }
    }

    fn free_pool_page(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.pool_used = inner.pool_used.saturating_sub(1);
    }

    fn pool_pages_total(&self) -> usize {
        self.inner.lock().unwrap().pool_total
    }

    fn pool_pages_used(&self) -> usize {
        self.inner.lock().unwrap().pool_used
    }

    fn remap_pages_total(&self) -> usize {
        self.inner.lock().unwrap().remap_total
    }

    fn remap_pages_used(&self) -> usize {
        self.inner.lock().unwrap().remap_used
    }
}
