//! Per-CPU bookkeeping (`spec.md` §3 "Per-CPU record").

use crate::arch::CpuId;
use crate::cell::CellId;
use crate::error::HvError;

/// Number of statistics counters tracked per CPU (`spec.md` §6 `STAT_BASE+i`).
pub const NUM_STATS: usize = 32;
/// Index of the per-CPU hypercall counter (`spec.md` §4.G "Dispatch
/// increments a per-CPU hypercall counter").
pub const STAT_HYPERCALLS: usize = 0;
const STAT_MASK: u32 = (1 << 30) - 1;

/// A 30-bit saturating counter (`spec.md` §3, §6: "Statistics are returned with
/// 30 significant bits").
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stat(u32);

impl Stat {
    pub fn increment(&mut self) {
        if self.0 < STAT_MASK {
            self.0 += 1;
        }
    }

    pub fn get(&self) -> u32 {
        self.0 & STAT_MASK
    }
}

/// The shutdown handshake state of a single root CPU (`spec.md` §4.G).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    None,
    Started,
    Error(HvError),
}

/// Per-CPU record, one per physical CPU the system configuration enabled.
#[derive(Debug, Clone)]
pub struct PerCpu {
    pub cpu_id: CpuId,
    pub cell: CellId,
    pub failed: bool,
    pub shutdown_state: ShutdownState,
    pub cpu_stopped: bool,
    pub stats: [Stat; NUM_STATS],
}

impl PerCpu {
    pub fn new(cpu_id: CpuId, cell: CellId) -> Self {
        Self {
            cpu_id,
            cell,
            failed: false,
            shutdown_state: ShutdownState::None,
            cpu_stopped: false,
            stats: [Stat::default(); NUM_STATS],
        }
    }

    /// Rehomes this CPU to `cell` and clears its failure/statistics state, as
    /// every reconfiguration that moves a CPU between cells does
    /// (`spec.md` §4.F `create`/`destroy`).
    pub fn rehome(&mut self, cell: CellId) {
        self.cell = cell;
        self.failed = false;
        self.stats = [Stat::default(); NUM_STATS];
    }

    pub fn increment_stat(&mut self, index: usize) {
        if let Some(stat) = self.stats.get_mut(index) {
            stat.increment();
        }
    }
}
