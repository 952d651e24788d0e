//! Component F: the lifecycle manager (`spec.md` §4.F) — `create`, `start`,
//! `set_loadable`, `destroy`, `get_state`, and the shared reconfiguration
//! prologue.

use alloc::vec::Vec;

use crate::arch::CpuId;
use crate::cell::{Cell, CellId, ROOT_CELL_ID};
use crate::comm::{send_and_wait, CellState, Message, MessageType};
use crate::config::{self, ConfigError};
use crate::cpuset::CpuSet;
use crate::error::{HvError, HvResult};
use crate::hypervisor::Hypervisor;
use crate::memregion::{check_mem_regions, remap_to_root, unmap_from_root, FailureMode, MemoryRegion, RegionFlags};
use crate::quiesce::QuiesceGuard;

/// Which prologue variant is running; only `Destroy` adds the
/// running-locked-sibling check (`spec.md` §4.F).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PrologueKind {
    Normal,
    Destroy,
}

/// Holds the root- and target-suspension guards for a reconfiguring
/// hypercall. Field order is significant: Rust drops struct fields in
/// declaration order, so `target_guard` (declared first) resumes the target
/// cell before `root_guard` resumes root — the "resume in reverse order" rule
/// of `spec.md` §4.F, for free, via RAII instead of a manual unwind cascade.
struct Prologue<'a> {
    target_guard: QuiesceGuard<'a>,
    root_guard: QuiesceGuard<'a>,
    pub target_id: CellId,
}

/// The shared prologue every reconfiguring entry point (other than `create`,
/// which has no target yet, and `get_state`, which needs no quiescence) runs
/// first (`spec.md` §4.F).
fn prologue<'a>(hv: &'a Hypervisor, caller_cpu: CpuId, id: CellId, kind: PrologueKind) -> HvResult<Prologue<'a>> {
    if !hv.caller_is_root(caller_cpu) {
        return Err(HvError::Perm);
    }

    let root_guard = {
        let registry = hv.registry.read();
        QuiesceGuard::suspend(hv.arch.as_ref(), registry.root(), caller_cpu)
    };

    if hv.registry.read().find_by_id(id).is_none() {
        return Err(HvError::NoEnt);
    }
    if id == ROOT_CELL_ID {
        return Err(HvError::Invalid);
    }
    if kind == PrologueKind::Destroy && hv.registry.read().any_other_running_locked(id) {
        return Err(HvError::Perm);
    }

    let approved = {
        let registry = hv.registry.read();
        let target = registry.find_by_id(id).expect("checked above");
        send_and_wait(
            hv.arch.as_ref(),
            &target.comm_page,
            target.config.flags,
            Message::ShutdownRequest,
            MessageType::Request,
        )
    };
    if !approved {
        return Err(HvError::Perm);
    }

    let target_guard = {
        let registry = hv.registry.read();
        let target = registry.find_by_id(id).expect("checked above");
        QuiesceGuard::suspend(hv.arch.as_ref(), target, caller_cpu)
    };

    Ok(Prologue {
        target_guard,
        root_guard,
        target_id: id,
    })
}

/// Notifies every non-root cell other than `exclude` that a reconfiguration
/// completed (`spec.md` §4.F).
fn broadcast_reconfig_completed(hv: &Hypervisor, exclude: CellId) {
    let registry = hv.registry.read();
    for cell in registry.iter() {
        if cell.id == ROOT_CELL_ID || cell.id == exclude {
            continue;
        }
        send_and_wait(
            hv.arch.as_ref(),
            &cell.comm_page,
            cell.config.flags,
            Message::ReconfigCompleted,
            MessageType::Information,
        );
    }
}

fn map_config_error(e: ConfigError) -> HvError {
    match e {
        ConfigError::TooBig => HvError::TooBig,
        ConfigError::Truncated | ConfigError::InvalidName => HvError::Invalid,
    }
}

/// `CELL_CREATE` (`spec.md` §4.F). Root-cell only; not part of the shared
/// prologue because it has no target cell yet.
pub fn create(hv: &Hypervisor, caller_cpu: CpuId, cfg_gpa: u64) -> HvResult<CellId> {
    if !hv.caller_is_root(caller_cpu) {
        return Err(HvError::Perm);
    }
    let _root_guard = {
        let registry = hv.registry.read();
        QuiesceGuard::suspend(hv.arch.as_ref(), registry.root(), caller_cpu)
    };

    if hv.registry.read().any_other_running_locked(ROOT_CELL_ID) {
        return Err(HvError::Perm);
    }

    let raw = hv.arch.map_temporary(cfg_gpa, config::TEMPORARY_WINDOW_BYTES)?;
    let (parsed, bitmap) = config::parse(&raw).map_err(map_config_error)?;

    if hv.registry.read().find_by_name(&parsed.name).is_some() {
        return Err(HvError::Exist);
    }

    check_mem_regions(&parsed.regions)?;

    let mut cpu_set = CpuSet::try_new(parsed.cpu_set_size, hv.arch.clone())?;
    for cpu in config::bitmap_cpu_ids(&bitmap) {
        cpu_set.set(cpu);
    }

    if cpu_set.contains(caller_cpu) {
        return Err(HvError::Busy);
    }
    if !cpu_set.is_subset_of(&hv.registry.read().root().cpu_set) {
        return Err(HvError::Busy);
    }

    let id = hv.registry.read().get_free_id();

    // Everything above this point has touched no architectural or registry
    // state, so a `?` above simply propagates: there is nothing to roll back.
    // From here on, failures must undo the architectural cell, the CPU
    // migration, and the memory-region migration already performed, in that
    // order (`spec.md` §4.F "Rollback").
    hv.arch.cell_create(id)?;

    for cpu in cpu_set.iter() {
        hv.arch.park_cpu(cpu);
        hv.registry.write().root_mut().cpu_set.clear(cpu);
        hv.percpu.write()[cpu].rehome(id);
    }

    let mut mapped: Vec<MemoryRegion> = Vec::new();
    for region in &parsed.regions {
        if region.flags.contains(RegionFlags::COMM_REGION) {
            continue;
        }
        let result = unmap_from_root(hv.arch.as_ref(), ROOT_CELL_ID, region).and_then(|()| hv.arch.map_memory_region(id, region));

        if let Err(e) = result {
            // Best-effort: put everything already migrated back onto root
            // before propagating, then undo the CPU migration and the
            // architectural cell.
            for done in mapped.iter().rev() {
                let _ = hv.arch.unmap_memory_region(id, done);
                let _ = remap_to_root(hv.arch.as_ref(), ROOT_CELL_ID, &hv.system.root_regions, done, FailureMode::WarnOnError);
            }
            for cpu in cpu_set.iter() {
                hv.percpu.write()[cpu].rehome(ROOT_CELL_ID);
                hv.registry.write().root_mut().cpu_set.set(cpu);
            }
            let _ = hv.arch.cell_destroy(id);
            return Err(e);
        }
        mapped.push(*region);
    }

    hv.arch.config_commit();

    let name_for_log = parsed.name.clone();
    let cell = Cell::new(id, parsed, cpu_set, 0);
    hv.registry.write().insert(cell);

    broadcast_reconfig_completed(hv, id);

    log::info!("cell {id} ('{name_for_log}') created");
    Ok(id)
}

/// `CELL_START` (`spec.md` §4.F).
pub fn start(hv: &Hypervisor, caller_cpu: CpuId, id: CellId) -> HvResult<()> {
    let p = prologue(hv, caller_cpu, id, PrologueKind::Normal)?;
    let target = p.target_id;

    let was_loadable = hv
        .registry
        .read()
        .find_by_id(target)
        .expect("target resolved by prologue")
        .loadable;

    if was_loadable {
        let loadable_regions: Vec<MemoryRegion> = hv
            .registry
            .read()
            .find_by_id(target)
            .expect("target resolved by prologue")
            .config
            .regions
            .iter()
            .filter(|r| r.flags.contains(RegionFlags::LOADABLE))
            .copied()
            .collect();

        for region in &loadable_regions {
            unmap_from_root(hv.arch.as_ref(), ROOT_CELL_ID, region)?;
        }
        hv.arch.config_commit();
        hv.registry
            .write()
            .find_by_id_mut(target)
            .expect("target resolved by prologue")
            .loadable = false;
    }

    {
        let registry = hv.registry.read();
        let cell = registry.find_by_id(target).expect("target resolved by prologue");
        cell.comm_page.set_cell_state(CellState::Running);
        cell.comm_page.set_msg_to_cell(Message::None);
    }

    let cpus: Vec<CpuId> = hv
        .registry
        .read()
        .find_by_id(target)
        .expect("target resolved by prologue")
        .cpu_set
        .iter()
        .collect();
    for cpu in cpus {
        hv.percpu.write()[cpu].failed = false;
        hv.arch.reset_cpu(cpu);
    }

    log::info!("cell {target} started");
    Ok(())
}

/// `CELL_SET_LOADABLE` (`spec.md` §4.F).
pub fn set_loadable(hv: &Hypervisor, caller_cpu: CpuId, id: CellId) -> HvResult<()> {
    let p = prologue(hv, caller_cpu, id, PrologueKind::Normal)?;
    let target = p.target_id;

    let cpus: Vec<CpuId> = hv
        .registry
        .read()
        .find_by_id(target)
        .expect("target resolved by prologue")
        .cpu_set
        .iter()
        .collect();
    for &cpu in &cpus {
        hv.percpu.write()[cpu].failed = false;
        hv.arch.park_cpu(cpu);
    }

    let already_loadable = hv
        .registry
        .read()
        .find_by_id(target)
        .expect("target resolved by prologue")
        .loadable;
    if already_loadable {
        // idempotent: resumes (via the prologue's guards) and returns success
        // without further side effects (`spec.md` §8).
        return Ok(());
    }

    {
        let registry = hv.registry.read();
        let cell = registry.find_by_id(target).expect("target resolved by prologue");
        cell.comm_page.set_cell_state(CellState::ShutDown);
    }
    hv.registry
        .write()
        .find_by_id_mut(target)
        .expect("target resolved by prologue")
        .loadable = true;

    let loadable_regions: Vec<MemoryRegion> = hv
        .registry
        .read()
        .find_by_id(target)
        .expect("target resolved by prologue")
        .config
        .regions
        .iter()
        .filter(|r| r.flags.contains(RegionFlags::LOADABLE))
        .copied()
        .collect();

    for region in &loadable_regions {
        remap_to_root(hv.arch.as_ref(), ROOT_CELL_ID, &hv.system.root_regions, region, FailureMode::AbortOnError)?;
    }
    hv.arch.config_commit();

    log::info!("cell {target} set loadable");
    Ok(())
}

/// `CELL_DESTROY` (`spec.md` §4.F).
pub fn destroy(hv: &Hypervisor, caller_cpu: CpuId, id: CellId) -> HvResult<()> {
    let p = prologue(hv, caller_cpu, id, PrologueKind::Destroy)?;
    let target = p.target_id;

    let cpus: Vec<CpuId> = hv
        .registry
        .read()
        .find_by_id(target)
        .expect("target resolved by prologue")
        .cpu_set
        .iter()
        .collect();

    for &cpu in &cpus {
        hv.arch.park_cpu(cpu);
        hv.percpu.write()[cpu].rehome(ROOT_CELL_ID);
    }
    {
        let mut registry = hv.registry.write();
        let root = registry.root_mut();
        for &cpu in &cpus {
            root.cpu_set.set(cpu);
        }
    }

    let regions: Vec<MemoryRegion> = hv
        .registry
        .read()
        .find_by_id(target)
        .expect("target resolved by prologue")
        .config
        .regions
        .clone();

    for region in &regions {
        let _ = hv.arch.unmap_memory_region(target, region);
        if !region.flags.contains(RegionFlags::COMM_REGION) {
            // Best effort: the cell is already torn down, there is no safe
            // alternative to logging and moving on (`spec.md` §7).
            let _ = remap_to_root(hv.arch.as_ref(), ROOT_CELL_ID, &hv.system.root_regions, region, FailureMode::WarnOnError);
        }
    }

    if let Err(e) = hv.arch.cell_destroy(target) {
        log::warn!("cell {target}: architectural teardown reported {e}, continuing best-effort");
    }
    hv.arch.config_commit();

    hv.registry.write().remove(target);

    broadcast_reconfig_completed(hv, target);

    log::info!("cell {target} destroyed");
    Ok(())
}

/// `CELL_GET_STATE` (`spec.md` §4.F). Root-cell only; no quiescence needed —
/// concurrent create/destroy are already serialized by root suspension,
/// which cannot return while this call is executing on a root CPU.
pub fn get_state(hv: &Hypervisor, caller_cpu: CpuId, id: CellId) -> HvResult<CellState> {
    if !hv.caller_is_root(caller_cpu) {
        return Err(HvError::Perm);
    }
    let registry = hv.registry.read();
    let cell = registry.find_by_id(id).ok_or(HvError::NoEnt)?;
    cell.comm_page.cell_state().ok_or(HvError::Invalid)
}
