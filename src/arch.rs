//! The architecture collaborator interface (`spec.md` §6).
//!
//! Everything in this module is an external seam: suspending a physical CPU,
//! programming VMCS/VMCB-equivalent state, committing a guest memory map, and
//! the physical-page pool are all out of scope for this crate (`spec.md` §1).
//! The core only ever calls through `dyn Arch`.

use alloc::vec::Vec;

use crate::cell::CellId;
use crate::error::HvResult;
use crate::memregion::MemoryRegion;

pub type CpuId = usize;

/// Everything the cell-lifecycle core needs from the host architecture layer.
///
/// Implementations are expected to be cheap to call from inside a suspended-root
/// window; `suspend_cpu`/`resume_cpu` are the only methods allowed to block on
/// another CPU, and they must do so synchronously (`spec.md` §4.D).
pub trait Arch: Send + Sync {
    /// Synchronously suspends `cpu`; returns once `cpu` has entered the
    /// suspended state. Never called with the caller's own CPU.
    fn suspend_cpu(&self, cpu: CpuId);
    /// Inverse of `suspend_cpu`.
    fn resume_cpu(&self, cpu: CpuId);
    /// Parks a CPU permanently out of the scheduling rotation (used while a CPU
    /// migrates between cells).
    fn park_cpu(&self, cpu: CpuId);
    /// Architecturally resets a CPU to its cell-entry state.
    fn reset_cpu(&self, cpu: CpuId);
    /// Architecturally shuts a single CPU down (used during global shutdown).
    fn shutdown_cpu(&self, cpu: CpuId);
    /// Architecturally shuts the whole host down. Never returns on success.
    fn shutdown(&self);
    /// Marks `cpu` stopped and invokes the architecture-level stop sequence.
    fn panic_stop(&self, cpu: CpuId);
    /// Architecture-level action taken when a CPU observes a fatal error but
    /// cannot be stopped outright.
    fn panic_halt(&self, cpu: CpuId);
    /// A CPU-relax hint for the comm-region spin loop (`spec.md` §4.E).
    fn relax(&self);

    /// Maps `region` into `cell`'s architectural page tables.
    fn map_memory_region(&self, cell: CellId, region: &MemoryRegion) -> HvResult<()>;
    /// Unmaps `region` from `cell`'s architectural page tables.
    fn unmap_memory_region(&self, cell: CellId, region: &MemoryRegion) -> HvResult<()>;
    /// Architecture-level cell creation (VMCS/VMCB-equivalent setup).
    fn cell_create(&self, cell: CellId) -> HvResult<()>;
    /// Architecture-level cell teardown, inverse of `cell_create`.
    fn cell_destroy(&self, cell: CellId) -> HvResult<()>;
    /// Commits whatever page-table/map edits have been staged since the last
    /// commit. Required before a suspended cell may be resumed.
    fn config_commit(&self);

    /// Maps up to `max_len` bytes of guest-physical memory starting at
    /// `guest_phys` read-only into a bounded hypervisor-private window and
    /// returns a private copy. `spec.md` §6 calls this the
    /// `NUM_TEMPORARY_PAGES`-bounded helper; returns `HvError::TooBig` if the
    /// requested length does not fit.
    fn map_temporary(&self, guest_phys: u64, max_len: usize) -> HvResult<Vec<u8>>;

    /// Attempts to draw one page from the general memory pool, for heap-backed
    /// CPU-set storage (`spec.md` §4.A). Returns whether the allocation
    /// succeeded; accounting only, the core never dereferences pool memory.
    fn try_alloc_pool_page(&self) -> bool;
    /// Returns one page to the general memory pool.
    fn free_pool_page(&self);
    /// Total pages in the general memory pool (`MEM_POOL_SIZE`).
    fn pool_pages_total(&self) -> usize;
    /// Pages currently drawn from the general memory pool (`MEM_POOL_USED`).
    fn pool_pages_used(&self) -> usize;

    /// Total pages in the remap scratch pool (`REMAP_POOL_SIZE`), used while
    /// reassembling root's memory map during `set_loadable`/`destroy`.
    fn remap_pages_total(&self) -> usize;
    /// Pages currently drawn from the remap scratch pool (`REMAP_POOL_USED`).
    fn remap_pages_used(&self) -> usize;
}
