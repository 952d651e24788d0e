//! Component C: memory-region validation, unmap-from-root, remap-to-root
//! (`spec.md` §4.C).

use alloc::vec::Vec;
use bitflags::bitflags;

use crate::arch::Arch;
use crate::cell::CellId;
use crate::error::{HvError, HvResult};

pub const PAGE_SIZE: u64 = 4096;

bitflags! {
    /// Region flags; subset is enforced by [`check_mem_regions`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegionFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        /// Hypervisor-supplied; never backed by root memory, never unmapped
        /// from or remapped to root.
        const COMM_REGION = 1 << 3;
        /// Root may temporarily access this region while its owning cell is
        /// loadable, for image loading.
        const LOADABLE = 1 << 4;
    }
}

/// `{phys_start, virt_start, size, flags}`, all page-aligned (`spec.md` §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub phys_start: u64,
    pub virt_start: u64,
    pub size: u64,
    pub flags: RegionFlags,
}

impl MemoryRegion {
    fn is_page_aligned(&self) -> bool {
        self.phys_start % PAGE_SIZE == 0 && self.virt_start % PAGE_SIZE == 0 && self.size % PAGE_SIZE == 0
    }

    fn phys_end(&self) -> u64 {
        self.phys_start + self.size
    }
}

/// Validates every region's alignment and flags (`spec.md` §4.C
/// `check_mem_regions`).
pub fn check_mem_regions(regions: &[MemoryRegion]) -> HvResult<()> {
    for region in regions {
        if !region.is_page_aligned() {
            return Err(HvError::Invalid);
        }
        if RegionFlags::from_bits(region.flags.bits()).is_none() {
            return Err(HvError::Invalid);
        }
    }
    Ok(())
}

/// Unmaps `region` from root using a synthesized descriptor whose
/// `virt_start == phys_start` (root has a guaranteed identity mapping).
/// Must never be called with a `COMM_REGION` region.
pub fn unmap_from_root(arch: &dyn Arch, root: CellId, region: &MemoryRegion) -> HvResult<()> {
    debug_assert!(
        !region.flags.contains(RegionFlags::COMM_REGION),
        "comm regions are never mapped in root"
    );
    let synthetic = MemoryRegion {
        phys_start: region.phys_start,
        virt_start: region.phys_start,
        size: region.size,
        flags: region.flags,
    };
    arch.unmap_memory_region(root, &synthetic)
}

/// Governs how [`remap_to_root`] handles a mapping failure partway through
/// reassembling root's map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// Return the first error immediately.
    AbortOnError,
    /// Log and continue; used during `destroy` where best-effort reassembly of
    /// root's map is the only safe option once the cell is already torn down.
    WarnOnError,
}

/// The physical-address intersection of `root_region` (a region from root's
/// static configuration) and `region` (the region being remapped), translated
/// into root's virtual address space. `spec.md` §4.C, §9 ("the single subtle
/// piece of arithmetic in the core").
pub fn overlap(root_region: &MemoryRegion, region: &MemoryRegion) -> Option<MemoryRegion> {
    let r_end = root_region.phys_end();
    let m_end = region.phys_end();

    let (phys, size) = if region.phys_start >= root_region.phys_start && region.phys_start < r_end {
        let size = core::cmp::min(r_end - region.phys_start, region.size);
        (region.phys_start, size)
    } else if root_region.phys_start >= region.phys_start && root_region.phys_start < m_end {
        let size = core::cmp::min(m_end - root_region.phys_start, root_region.size);
        (root_region.phys_start, size)
    } else {
        return None;
    };

    if size == 0 {
        return None;
    }

    let virt = root_region.virt_start + (phys - root_region.phys_start);
    Some(MemoryRegion {
        phys_start: phys,
        virt_start: virt,
        size,
        flags: root_region.flags,
    })
}

/// For each region in root's static configuration that overlaps `region`,
/// maps the intersection back into root. Returns the number of overlaps that
/// failed to map (always `0` on success; in [`FailureMode::AbortOnError`] the
/// first failure is returned as `Err` instead of being counted, since there is
/// no "best effort, report something" ambiguity to preserve once the caller
/// asked to abort — see `DESIGN.md` for this resolution of the open question
/// in `spec.md` §9).
pub fn remap_to_root(
    arch: &dyn Arch,
    root: CellId,
    root_regions: &[MemoryRegion],
    region: &MemoryRegion,
    mode: FailureMode,
) -> HvResult<usize> {
    let mut failures = 0usize;
    for root_region in root_regions {
        let Some(piece) = overlap(root_region, region) else {
            continue;
        };
        match arch.map_memory_region(root, &piece) {
            Ok(()) => {}
            Err(e) => match mode {
                FailureMode::AbortOnError => return Err(e),
                FailureMode::WarnOnError => {
                    log::warn!(
                        "remap_to_root: failed to remap [{:#x}, {:#x}) into root: {e}",
                        piece.phys_start,
                        piece.phys_start + piece.size
                    );
                    failures += 1;
                }
            },
        }
    }
    Ok(failures)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(phys: u64, virt: u64, size: u64, flags: RegionFlags) -> MemoryRegion {
        MemoryRegion {
            phys_start: phys,
            virt_start: virt,
            size,
            flags,
        }
    }

    #[test]
    fn misaligned_region_is_invalid() {
        let regions = [region(1, 0, PAGE_SIZE, RegionFlags::READ)];
        assert_eq!(check_mem_regions(&regions), Err(HvError::Invalid));
    }

    #[test]
    fn aligned_region_is_valid() {
        let regions = [region(PAGE_SIZE, PAGE_SIZE, PAGE_SIZE, RegionFlags::READ)];
        assert_eq!(check_mem_regions(&regions), Ok(()));
    }

    #[test]
    fn no_overlap() {
        let r = region(0, 0, PAGE_SIZE, RegionFlags::READ);
        let m = region(PAGE_SIZE * 4, 0, PAGE_SIZE, RegionFlags::READ);
        assert_eq!(overlap(&r, &m), None);
    }

    #[test]
    fn region_contained_in_root() {
        let r = region(0, 0x1000_0000, PAGE_SIZE * 10, RegionFlags::READ);
        let m = region(PAGE_SIZE * 2, 0, PAGE_SIZE * 3, RegionFlags::READ);
        let o = overlap(&r, &m).unwrap();
        assert_eq!(o.phys_start, PAGE_SIZE * 2);
        assert_eq!(o.size, PAGE_SIZE * 3);
        assert_eq!(o.virt_start, 0x1000_0000 + PAGE_SIZE * 2);
    }

    #[test]
    fn root_contained_in_region() {
        let r = region(PAGE_SIZE * 2, 0x2000_0000, PAGE_SIZE * 3, RegionFlags::READ);
        let m = region(0, 0, PAGE_SIZE * 10, RegionFlags::READ);
        let o = overlap(&r, &m).unwrap();
        assert_eq!(o.phys_start, PAGE_SIZE * 2);
        assert_eq!(o.size, PAGE_SIZE * 3);
        assert_eq!(o.virt_start, 0x2000_0000);
    }

    #[test]
    fn partial_overlap_from_the_left() {
        let r = region(0, 0x3000_0000, PAGE_SIZE * 4, RegionFlags::READ);
        let m = region(PAGE_SIZE * 2, 0, PAGE_SIZE * 4, RegionFlags::READ);
        let o = overlap(&r, &m).unwrap();
        assert_eq!(o.phys_start, PAGE_SIZE * 2);
        assert_eq!(o.size, PAGE_SIZE * 2);
        assert_eq!(o.virt_start, 0x3000_0000 + PAGE_SIZE * 2);
    }

    #[test]
    fn partial_overlap_from_the_right() {
        let r = region(PAGE_SIZE * 2, 0x4000_0000, PAGE_SIZE * 4, RegionFlags::READ);
        let m = region(0, 0, PAGE_SIZE * 4, RegionFlags::READ);
        let o = overlap(&r, &m).unwrap();
        assert_eq!(o.phys_start, PAGE_SIZE * 2);
        assert_eq!(o.size, PAGE_SIZE * 2);
        assert_eq!(o.virt_start, 0x4000_0000);
    }

    #[test]
    fn identical_regions_overlap_fully() {
        let r = region(PAGE_SIZE, 0x5000_0000, PAGE_SIZE * 2, RegionFlags::READ);
        let o = overlap(&r, &r).unwrap();
        assert_eq!(o.phys_start, r.phys_start);
        assert_eq!(o.size, r.size);
        assert_eq!(o.virt_start, r.virt_start);
    }

    #[test]
    fn single_page_regions() {
        let r = region(PAGE_SIZE * 9, 0x6000_0000, PAGE_SIZE, RegionFlags::READ);
        let m = region(PAGE_SIZE * 9, 0, PAGE_SIZE, RegionFlags::READ);
        let o = overlap(&r, &m).unwrap();
        assert_eq!(o.size, PAGE_SIZE);
    }
}
