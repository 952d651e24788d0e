//! The `Cell` data model (`spec.md` §3).

use alloc::string::String;
use alloc::vec::Vec;
use bitflags::bitflags;

use crate::comm::CommRegion;
use crate::cpuset::CpuSet;
use crate::memregion::MemoryRegion;

pub type CellId = usize;

/// The id reserved for the root cell; present at registry construction, never
/// destroyed (`spec.md` §3 invariant 6).
pub const ROOT_CELL_ID: CellId = 0;

bitflags! {
    /// Cell-wide configuration flags (`spec.md` §6).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CellFlags: u32 {
        /// The cell will not cooperate via the comm region; every message is
        /// auto-approved.
        const PASSIVE_COMMREG = 1 << 0;
    }
}

/// The cell's configuration blob: name, cpu-set, memory regions, flags
/// (`spec.md` §3, §6).
#[derive(Debug, Clone)]
pub struct CellConfig {
    pub name: String,
    pub cpu_set_size: usize,
    pub regions: Vec<MemoryRegion>,
    pub flags: CellFlags,
}

/// A partition: a disjoint slice of CPUs and physical memory (`spec.md` §3).
pub struct Cell {
    pub id: CellId,
    pub config: CellConfig,
    pub cpu_set: CpuSet,
    pub comm_page: CommRegion,
    pub loadable: bool,
    pub data_pages: usize,
}

impl Cell {
    pub fn new(id: CellId, config: CellConfig, cpu_set: CpuSet, data_pages: usize) -> Self {
        let comm_page = CommRegion::new();
        comm_page.set_cell_state(crate::comm::CellState::ShutDown);
        Self {
            id,
            config,
            cpu_set,
            comm_page,
            loadable: false,
            data_pages,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn is_root(&self) -> bool {
        self.id == ROOT_CELL_ID
    }
}
