//! The single global `Hypervisor` value (`spec.md` §9: "Three process-wide
//! objects are load-bearing: the root cell ..., the system configuration
//! ..., and the shutdown lock").
//!
//! Mirrors the teacher kernel's `globals.rs`/`threading::SCHEDULER` pattern: a
//! lazily-initialized global guarding the one mutable structure the rest of
//! the crate operates on, reached through free functions rather than passed
//! explicitly through every call (`threading/mod.rs`'s `with_current`,
//! `for_each`, `add_process`, ...).

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::{Once, RwLock};

use crate::arch::{Arch, CpuId};
use crate::cell::{Cell, CellConfig, ROOT_CELL_ID};
use crate::memregion::MemoryRegion;
use crate::percpu::PerCpu;
use crate::registry::Registry;

/// The host's static configuration, immutable after boot (`spec.md` §9).
#[derive(Debug, Clone)]
pub struct SystemConfig {
    pub num_cpus: usize,
    /// Root's original memory-region list, used by [`crate::memregion::remap_to_root`]
    /// as the set of root-configuration regions to reassemble from.
    pub root_regions: Vec<MemoryRegion>,
}

/// A guest-initiated global-shutdown decision, recorded once and then
/// observed by every root CPU (`spec.md` §4.G).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownDecision {
    Started,
    Denied,
}

/// The global shutdown barrier: a single spin-lock guarding the collective
/// shutdown decision (`spec.md` §5: "only one [spin-lock]: the global
/// `shutdown_lock`").
#[derive(Default)]
pub struct ShutdownBarrier {
    pub decision: Option<ShutdownDecision>,
}

pub struct Hypervisor {
    pub arch: Arc<dyn Arch>,
    pub system: SystemConfig,
    pub registry: RwLock<Registry>,
    pub percpu: RwLock<Vec<PerCpu>>,
    pub shutdown_lock: spin::Mutex<ShutdownBarrier>,
}

impl Hypervisor {
    /// Builds a fresh hypervisor: root owns every CPU in `system` and the
    /// memory map implied by `root_config`'s regions. This is the "value
    /// threaded through operations" `spec.md` §9 describes; lifecycle and
    /// hypercall entry points take `&Hypervisor` explicitly rather than
    /// reaching for a hidden global, so embedders (and tests) can hold more
    /// than one independently.
    pub fn new(arch: Arc<dyn Arch>, system: SystemConfig, root_config: CellConfig) -> Self {
        let cpu_set = crate::cpuset::CpuSet::try_new(system.num_cpus, arch.clone())
            .expect("root cpu-set must fit the system configuration");
        let mut full = cpu_set;
        for cpu in 0..system.num_cpus {
            full.set(cpu);
        }
        let root = Cell::new(ROOT_CELL_ID, root_config, full, 0);

        let percpu = (0..system.num_cpus).map(|c| PerCpu::new(c, ROOT_CELL_ID)).collect();

        Self {
            arch,
            system,
            registry: RwLock::new(Registry::new(root)),
            percpu: RwLock::new(percpu),
            shutdown_lock: spin::Mutex::new(ShutdownBarrier::default()),
        }
    }

    pub fn caller_is_root(&self, cpu: CpuId) -> bool {
        self.percpu.read().get(cpu).map(|p| p.cell) == Some(ROOT_CELL_ID)
    }

    pub fn caller_cell(&self, cpu: CpuId) -> Option<crate::cell::CellId> {
        self.percpu.read().get(cpu).map(|p| p.cell)
    }
}

/// Convenience global slot an embedder may install its single boot-time
/// `Hypervisor` into, mirroring the teacher kernel's `lazy_static! SCHEDULER`.
/// Nothing in this crate's lifecycle/hypercall modules reads from this slot;
/// they all take `&Hypervisor` explicitly, so using it is optional.
static GLOBAL: Once<Hypervisor> = Once::new();

/// Installs `hypervisor` as the process-wide instance. Idempotent: a second
/// call is ignored and the first-installed instance is returned.
pub fn install(hypervisor: Hypervisor) -> &'static Hypervisor {
    GLOBAL.call_once(|| hypervisor)
}

/// Accesses the process-wide instance installed by [`install`].
///
/// # Panics
/// Panics if [`install`] has not been called yet.
pub fn global() -> &'static Hypervisor {
    GLOBAL.get().expect("hypervisor::install was never called")
}
