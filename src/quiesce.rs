//! Component D: quiesce/resume (`spec.md` §4.D).
//!
//! Both directions are only safe to call from a CPU belonging to `cell`
//! (for the root-cell case: the caller must be a root CPU). Callers get that
//! guarantee from [`crate::lifecycle`]'s prologue, not from this module.

use crate::arch::{Arch, CpuId};
use crate::cell::Cell;

/// Synchronously suspends every CPU in `cell.cpu_set` except `caller_cpu`.
/// Returns only once every target has entered the suspended state (the
/// architecture layer's `suspend_cpu` is defined to be synchronous,
/// `spec.md` §4.D).
pub fn suspend(arch: &dyn Arch, cell: &Cell, caller_cpu: CpuId) {
    for cpu in cell.cpu_set.iter_except(caller_cpu) {
        arch.suspend_cpu(cpu);
    }
}

/// Inverse of [`suspend`].
pub fn resume(arch: &dyn Arch, cell: &Cell, caller_cpu: CpuId) {
    for cpu in cell.cpu_set.iter_except(caller_cpu) {
        arch.resume_cpu(cpu);
    }
}

/// RAII guard pairing a [`suspend`] with the matching [`resume`]: dropping the
/// guard resumes the cell. Holding one of these across a `?`-propagating
/// function body is how this crate gets `spec.md` §4.F's "every exit path
/// must resume" for free — resumes run in the reverse order their guards were
/// created, satisfying §4.F's "resume in reverse order" without a manual
/// unwind cascade.
pub struct QuiesceGuard<'a> {
    arch: &'a dyn Arch,
    cpus: alloc::vec::Vec<CpuId>,
}

impl<'a> QuiesceGuard<'a> {
    /// Suspends `cell` (except `caller_cpu`) and returns a guard that resumes
    /// it on drop.
    pub fn suspend(arch: &'a dyn Arch, cell: &Cell, caller_cpu: CpuId) -> Self {
        let cpus: alloc::vec::Vec<CpuId> = cell.cpu_set.iter_except(caller_cpu).collect();
        for &cpu in &cpus {
            arch.suspend_cpu(cpu);
        }
        Self { arch, cpus }
    }
}

impl Drop for QuiesceGuard<'_> {
    fn drop(&mut self) {
        for &cpu in &self.cpus {
            self.arch.resume_cpu(cpu);
        }
    }
}
