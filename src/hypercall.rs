//! Component G: hypercall dispatch, global shutdown, info queries, and panic
//! paths (`spec.md` §4.G).

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::arch::CpuId;
use crate::cell::{CellId, ROOT_CELL_ID};
use crate::comm::{send_and_wait, CellState, Message, MessageType};
use crate::config::{CpuInfoKind, HypervisorInfoKind};
use crate::error::{HvError, HvResult};
use crate::hypervisor::{Hypervisor, ShutdownDecision};
use crate::lifecycle;
use crate::percpu::{ShutdownState, STAT_HYPERCALLS};

/// The numeric hypercall codes of `spec.md` §6. `Disable` is the ABI name for
/// collective shutdown, mirroring the teacher kernel's syscall-number style
/// (`syscalls/mod.rs`'s `SyscallNumber`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum HypercallCode {
    Disable = 0,
    CellCreate = 1,
    CellStart = 2,
    CellSetLoadable = 3,
    CellDestroy = 4,
    HypervisorGetInfo = 5,
    CellGetState = 6,
    CpuGetInfo = 7,
}

impl HypercallCode {
    fn from_raw(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Disable),
            1 => Some(Self::CellCreate),
            2 => Some(Self::CellStart),
            3 => Some(Self::CellSetLoadable),
            4 => Some(Self::CellDestroy),
            5 => Some(Self::HypervisorGetInfo),
            6 => Some(Self::CellGetState),
            7 => Some(Self::CpuGetInfo),
            _ => None,
        }
    }
}

/// The single hypercall entry point: increments the caller's hypercall
/// counter, dispatches by code, and negates any error into the raw ABI
/// return word (`spec.md` §4.G, §6).
pub fn hypercall(hv: &Hypervisor, caller_cpu: CpuId, code: i64, a0: u64, a1: u64) -> i64 {
    if let Some(record) = hv.percpu.write().get_mut(caller_cpu) {
        record.increment_stat(STAT_HYPERCALLS);
    }

    let result = match HypercallCode::from_raw(code) {
        Some(HypercallCode::Disable) => shutdown(hv, caller_cpu).map(|()| 0i64),
        Some(HypercallCode::CellCreate) => lifecycle::create(hv, caller_cpu, a0).map(|id| id as i64),
        Some(HypercallCode::CellStart) => lifecycle::start(hv, caller_cpu, a0 as CellId).map(|()| 0),
        Some(HypercallCode::CellSetLoadable) => lifecycle::set_loadable(hv, caller_cpu, a0 as CellId).map(|()| 0),
        Some(HypercallCode::CellDestroy) => lifecycle::destroy(hv, caller_cpu, a0 as CellId).map(|()| 0),
        Some(HypercallCode::HypervisorGetInfo) => hypervisor_get_info(hv, a0).map(|v| v as i64),
        Some(HypercallCode::CellGetState) => lifecycle::get_state(hv, caller_cpu, a0 as CellId).map(|s| s as i64),
        Some(HypercallCode::CpuGetInfo) => cpu_get_info(hv, caller_cpu, a0 as CpuId, a1).map(|v| v as i64),
        None => Err(HvError::NoSys),
    };

    match result {
        Ok(v) => v,
        Err(e) => e.to_raw(),
    }
}

fn hypervisor_get_info(hv: &Hypervisor, kind_raw: u64) -> HvResult<u64> {
    let kind = HypervisorInfoKind::from_raw(kind_raw).ok_or(HvError::Invalid)?;
    Ok(match kind {
        HypervisorInfoKind::MemPoolSize => hv.arch.pool_pages_total() as u64,
        HypervisorInfoKind::MemPoolUsed => hv.arch.pool_pages_used() as u64,
        HypervisorInfoKind::RemapPoolSize => hv.arch.remap_pages_total() as u64,
        HypervisorInfoKind::RemapPoolUsed => hv.arch.remap_pages_used() as u64,
        HypervisorInfoKind::NumCells => hv.registry.read().num_cells() as u64,
    })
}

fn cpu_get_info(hv: &Hypervisor, caller_cpu: CpuId, target_cpu: CpuId, kind_raw: u64) -> HvResult<u64> {
    if target_cpu >= hv.system.num_cpus {
        return Err(HvError::Invalid);
    }
    if !hv.caller_is_root(caller_cpu) && hv.caller_cell(caller_cpu) != hv.caller_cell(target_cpu) {
        return Err(HvError::Perm);
    }

    let kind = CpuInfoKind::from_raw(kind_raw).ok_or(HvError::Invalid)?;
    let percpu = hv.percpu.read();
    let record = percpu.get(target_cpu).ok_or(HvError::Invalid)?;
    match kind {
        CpuInfoKind::State => Ok(if record.failed {
            CellState::Failed as u64
        } else {
            CellState::Running as u64
        }),
        CpuInfoKind::StatBase(i) => record.stats.get(i).map(|s| s.get() as u64).ok_or(HvError::Invalid),
    }
}

/// `DISABLE` / global shutdown (`spec.md` §4.G). Root-cell only. Exactly one
/// calling root CPU performs the collective decision under `shutdown_lock`;
/// every other root CPU (and this one, on its next call) observes the result
/// through its own per-CPU `shutdown_state`.
pub fn shutdown(hv: &Hypervisor, caller_cpu: CpuId) -> HvResult<()> {
    if !hv.caller_is_root(caller_cpu) {
        return Err(HvError::Perm);
    }

    let needs_decision = hv.percpu.read()[caller_cpu].shutdown_state == ShutdownState::None;
    if needs_decision {
        let decision = {
            let mut barrier = hv.shutdown_lock.lock();
            if barrier.decision.is_none() {
                barrier.decision = Some(decide_and_execute_shutdown(hv));
            }
            barrier.decision.expect("just set")
        };

        let state = match decision {
            ShutdownDecision::Started => ShutdownState::Started,
            ShutdownDecision::Denied => ShutdownState::Error(HvError::Perm),
        };

        let root_cpus: Vec<CpuId> = (0..hv.system.num_cpus).filter(|&c| hv.caller_is_root(c)).collect();
        let mut percpu = hv.percpu.write();
        for cpu in root_cpus {
            percpu[cpu].shutdown_state = state;
        }
    }

    let mut percpu = hv.percpu.write();
    let state = percpu[caller_cpu].shutdown_state;
    percpu[caller_cpu].shutdown_state = ShutdownState::None;
    match state {
        ShutdownState::Started => Ok(()),
        ShutdownState::Error(e) => Err(e),
        ShutdownState::None => Err(HvError::Perm),
    }
}

/// Polls every non-root cell for approval, then (if all approved) tears each
/// of them down and shuts the host off. Runs exactly once per shutdown,
/// guarded by the caller holding `shutdown_lock`.
fn decide_and_execute_shutdown(hv: &Hypervisor) -> ShutdownDecision {
    let all_approved = {
        let registry = hv.registry.read();
        registry.iter().filter(|c| c.id != ROOT_CELL_ID).all(|cell| {
            send_and_wait(
                hv.arch.as_ref(),
                &cell.comm_page,
                cell.config.flags,
                Message::ShutdownRequest,
                MessageType::Request,
            )
        })
    };

    if !all_approved {
        return ShutdownDecision::Denied;
    }

    {
        let registry = hv.registry.read();
        for cell in registry.iter() {
            if cell.id == ROOT_CELL_ID {
                continue;
            }
            for cpu in cell.cpu_set.iter() {
                hv.arch.suspend_cpu(cpu);
            }
            log::info!("cell {} closed for global shutdown", cell.id);
            for cpu in cell.cpu_set.iter() {
                hv.arch.shutdown_cpu(cpu);
            }
        }
    }

    hv.arch.shutdown();
    ShutdownDecision::Started
}

/// Set once the first CPU to observe a fault begins the panic sequence;
/// cleared by [`end_panic`] once that same physical CPU reaches it again
/// (`spec.md` §4.G).
static PANIC_IN_PROGRESS: AtomicBool = AtomicBool::new(false);
static PANIC_CPU: AtomicUsize = AtomicUsize::new(usize::MAX);

/// Claims the driver role for a new panic sequence. Returns `true` exactly
/// once per sequence, to the CPU that called first.
pub fn begin_panic(cpu: CpuId) -> bool {
    if PANIC_IN_PROGRESS.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok() {
        PANIC_CPU.store(cpu, Ordering::Release);
        true
    } else {
        false
    }
}

/// Whether a panic sequence is in progress; other CPUs poll this to abort
/// their own work.
pub fn panic_in_progress() -> bool {
    PANIC_IN_PROGRESS.load(Ordering::Acquire)
}

fn end_panic(cpu: CpuId) {
    if PANIC_CPU.load(Ordering::Acquire) == cpu {
        PANIC_IN_PROGRESS.store(false, Ordering::Release);
    }
}

/// `panic_stop(cpu)`: marks the CPU stopped and invokes the architectural
/// stop sequence (`spec.md` §4.G).
pub fn panic_stop(hv: &Hypervisor, cpu: CpuId) {
    if let Some(record) = hv.percpu.write().get_mut(cpu) {
        record.cpu_stopped = true;
    }
    hv.arch.panic_stop(cpu);
    end_panic(cpu);
}

/// `panic_halt(cpu)`: marks the CPU failed, and if every CPU in its cell has
/// now failed, marks the cell `FAILED` (`spec.md` §4.G).
pub fn panic_halt(hv: &Hypervisor, cpu: CpuId) {
    let cell_id = {
        let mut percpu = hv.percpu.write();
        let cell_id = percpu.get(cpu).map(|r| r.cell);
        if let Some(record) = percpu.get_mut(cpu) {
            record.failed = true;
        }
        cell_id
    };

    if let Some(cell_id) = cell_id {
        let registry = hv.registry.read();
        if let Some(cell) = registry.find_by_id(cell_id) {
            let percpu = hv.percpu.read();
            let all_failed = cell.cpu_set.iter().all(|c| percpu.get(c).map(|r| r.failed).unwrap_or(false));
            if all_failed {
                cell.comm_page.set_cell_state(CellState::Failed);
            }
        }
    }

    hv.arch.panic_halt(cpu);
    end_panic(cpu);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{CellConfig, CellFlags};
    use crate::hypervisor::SystemConfig;
    use crate::memregion::{MemoryRegion, RegionFlags};
    use crate::tests_support::MockArch;
    use alloc::sync::Arc;
    use alloc::vec;

    fn hv_with_root(num_cpus: usize) -> (Hypervisor, Arc<MockArch>) {
        let arch = Arc::new(MockArch::new(num_cpus, 64));
        let system = SystemConfig {
            num_cpus,
            root_regions: vec![MemoryRegion {
                phys_start: 0,
                virt_start: 0,
                size: 0x10_0000,
                flags: RegionFlags::READ | RegionFlags::WRITE,
            }],
        };
        let root_config = CellConfig {
            name: "root".into(),
            cpu_set_size: num_cpus,
            regions: Vec::new(),
            flags: CellFlags::empty(),
        };
        let hv = Hypervisor::new(arch.clone(), system, root_config);
        (hv, arch)
    }

    #[test]
    fn unknown_code_returns_nosys() {
        let (hv, _arch) = hv_with_root(2);
        assert_eq!(hypercall(&hv, 0, 99, 0, 0), HvError::NoSys.to_raw());
    }

    #[test]
    fn non_root_caller_is_rejected_through_dispatch() {
        let (hv, _arch) = hv_with_root(2);
        // cpu 5 owns no per-cpu record, so it is never root.
        assert_eq!(
            hypercall(&hv, 5, HypercallCode::CellCreate as i64, 0x1000, 0),
            HvError::Perm.to_raw()
        );
    }

    #[test]
    fn hypercall_counter_increments() {
        let (hv, _arch) = hv_with_root(2);
        hypercall(&hv, 0, 99, 0, 0);
        hypercall(&hv, 0, 99, 0, 0);
        assert_eq!(hv.percpu.read()[0].stats[STAT_HYPERCALLS].get(), 2);
    }

    #[test]
    fn hypervisor_get_info_reports_num_cells() {
        let (hv, _arch) = hv_with_root(2);
        let v = hypercall(&hv, 0, HypercallCode::HypervisorGetInfo as i64, 4, 0);
        assert_eq!(v, 1);
    }

    #[test]
    fn cpu_get_info_rejects_out_of_range_cpu() {
        let (hv, _arch) = hv_with_root(2);
        let v = hypercall(&hv, 0, HypercallCode::CpuGetInfo as i64, 99, 0);
        assert_eq!(v, HvError::Invalid.to_raw());
    }

    #[test]
    fn shutdown_denied_when_a_cell_refuses() {
        let (hv, _arch) = hv_with_root(4);
        {
            let mut registry = hv.registry.write();
            let cpu_set = crate::cpuset::CpuSet::try_new(4, hv.arch.clone()).unwrap();
            let config = CellConfig {
                name: "guest".into(),
                cpu_set_size: 4,
                regions: Vec::new(),
                flags: CellFlags::empty(),
            };
            let cell = crate::cell::Cell::new(1, config, cpu_set, 0);
            cell.comm_page.set_cell_state(CellState::Running);
            cell.comm_page.set_reply_from_cell(crate::comm::Reply::RequestDenied);
            registry.insert(cell);
        }

        let result = shutdown(&hv, 0);
        assert_eq!(result, Err(HvError::Perm));
    }

    #[test]
    fn panic_halt_marks_cell_failed_once_every_cpu_failed() {
        let (hv, _arch) = hv_with_root(2);
        panic_halt(&hv, 0);
        assert_eq!(hv.registry.read().root().comm_page.cell_state(), Some(CellState::ShutDown));
        panic_halt(&hv, 1);
        assert_eq!(hv.registry.read().root().comm_page.cell_state(), Some(CellState::Failed));
    }
}
