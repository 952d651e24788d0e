//! Wire formats crossing the hypercall boundary: the cell configuration blob
//! and the `HYPERVISOR_GET_INFO`/`CPU_GET_INFO` info kinds (`spec.md` §6).

use alloc::string::String;
use alloc::vec::Vec;

use crate::cell::{CellConfig, CellFlags};
use crate::memregion::{MemoryRegion, RegionFlags};

/// Bound on the hypervisor-private window `map_temporary` may use
/// (`spec.md` §4.F, §6, §7 `TOO_BIG`).
pub const NUM_TEMPORARY_PAGES: usize = 4;
pub const TEMPORARY_WINDOW_BYTES: usize = NUM_TEMPORARY_PAGES * crate::memregion::PAGE_SIZE as usize;

const NAME_LEN: usize = 64;
const HEADER_LEN: usize = NAME_LEN + 4 + 4 + 4;
const REGION_LEN: usize = 8 + 8 + 8 + 4;

/// Errors parsing a guest-supplied configuration blob. Converted into
/// [`crate::error::HvError`] at the `lifecycle::create` boundary the way
/// `utils/errors.rs::IntoErr` converts domain errors into `ErrorStatus` in the
/// teacher kernel.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("configuration blob shorter than its own header")]
    Truncated,
    #[error("cell name is not valid UTF-8")]
    InvalidName,
    #[error("configuration blob exceeds the temporary mapping window")]
    TooBig,
}

/// Parses a cell configuration blob: header, then a `cpu_set_size`-byte CPU
/// bitmap, then `num_memory_regions` region descriptors (`spec.md` §6).
pub fn parse(bytes: &[u8]) -> Result<(CellConfig, Vec<u8>), ConfigError> {
    if bytes.len() < HEADER_LEN {
        return Err(ConfigError::Truncated);
    }

    let name_bytes = &bytes[0..NAME_LEN];
    let name_len = name_bytes.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
    let name =
        String::from(core::str::from_utf8(&name_bytes[..name_len]).map_err(|_| ConfigError::InvalidName)?);

    let cpu_set_bytes = u32::from_le_bytes(bytes[64..68].try_into().unwrap()) as usize;
    let num_regions = u32::from_le_bytes(bytes[68..72].try_into().unwrap()) as usize;
    let flags = CellFlags::from_bits_truncate(u32::from_le_bytes(bytes[72..76].try_into().unwrap()));

    let total_len = HEADER_LEN + cpu_set_bytes + num_regions * REGION_LEN;
    if total_len > TEMPORARY_WINDOW_BYTES {
        return Err(ConfigError::TooBig);
    }
    if bytes.len() < total_len {
        return Err(ConfigError::Truncated);
    }

    let cpu_set_off = HEADER_LEN;
    let bitmap = bytes[cpu_set_off..cpu_set_off + cpu_set_bytes].to_vec();

    let mut regions = Vec::with_capacity(num_regions);
    let regions_off = cpu_set_off + cpu_set_bytes;
    for i in 0..num_regions {
        let base = regions_off + i * REGION_LEN;
        let phys_start = u64::from_le_bytes(bytes[base..base + 8].try_into().unwrap());
        let virt_start = u64::from_le_bytes(bytes[base + 8..base + 16].try_into().unwrap());
        let size = u64::from_le_bytes(bytes[base + 16..base + 24].try_into().unwrap());
        // Unknown bits are kept (not truncated) so `check_mem_regions` can reject
        // them; truncating here would make that validation dead code.
        let region_flags =
            RegionFlags::from_bits_retain(u32::from_le_bytes(bytes[base + 24..base + 28].try_into().unwrap()));
        regions.push(MemoryRegion {
            phys_start,
            virt_start,
            size,
            flags: region_flags,
        });
    }

    let config = CellConfig {
        name,
        cpu_set_size: cpu_set_bytes * 8,
        regions,
        flags,
    };
    Ok((config, bitmap))
}

/// Serializes a configuration back into the blob format `parse` reads, used
/// by tests to build fixtures without hand-packing bytes.
#[cfg(test)]
pub fn encode(config: &CellConfig, bitmap: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + bitmap.len() + config.regions.len() * REGION_LEN);

    let mut name_buf = [0u8; NAME_LEN];
    let name_bytes = config.name.as_bytes();
    name_buf[..name_bytes.len()].copy_from_slice(name_bytes);
    out.extend_from_slice(&name_buf);

    out.extend_from_slice(&(bitmap.len() as u32).to_le_bytes());
    out.extend_from_slice(&(config.regions.len() as u32).to_le_bytes());
    out.extend_from_slice(&config.flags.bits().to_le_bytes());

    out.extend_from_slice(bitmap);
    for region in &config.regions {
        out.extend_from_slice(&region.phys_start.to_le_bytes());
        out.extend_from_slice(&region.virt_start.to_le_bytes());
        out.extend_from_slice(&region.size.to_le_bytes());
        out.extend_from_slice(&region.flags.bits().to_le_bytes());
    }
    out
}

/// Unpacks a byte bitmap (as read from the configuration blob) into the set
/// of cpu ids it marks.
pub fn bitmap_cpu_ids(bitmap: &[u8]) -> impl Iterator<Item = usize> + '_ {
    bitmap.iter().enumerate().flat_map(|(byte_idx, &byte)| {
        (0..8).filter_map(move |bit| {
            if byte & (1 << bit) != 0 {
                Some(byte_idx * 8 + bit)
            } else {
                None
            }
        })
    })
}

/// `HYPERVISOR_GET_INFO` info kinds (`spec.md` §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypervisorInfoKind {
    MemPoolSize,
    MemPoolUsed,
    RemapPoolSize,
    RemapPoolUsed,
    NumCells,
}

impl HypervisorInfoKind {
    pub fn from_raw(raw: u64) -> Option<Self> {
        match raw {
            0 => Some(Self::MemPoolSize),
            1 => Some(Self::MemPoolUsed),
            2 => Some(Self::RemapPoolSize),
            3 => Some(Self::RemapPoolUsed),
            4 => Some(Self::NumCells),
            _ => None,
        }
    }
}

/// `CPU_GET_INFO` info kinds (`spec.md` §6). `StatBase(i)` selects statistic
/// `i` of [`crate::percpu::NUM_STATS`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuInfoKind {
    State,
    StatBase(usize),
}

impl CpuInfoKind {
    pub fn from_raw(raw: u64) -> Option<Self> {
        match raw {
            0 => Some(Self::State),
            n => Some(Self::StatBase((n - 1) as usize)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::CellFlags;

    #[test]
    fn round_trips_name_cpuset_and_regions() {
        let config = CellConfig {
            name: "alpha".into(),
            cpu_set_size: 8,
            regions: alloc::vec![MemoryRegion {
                phys_start: 0x1000,
                virt_start: 0x1000,
                size: 0x1000,
                flags: RegionFlags::READ,
            }],
            flags: CellFlags::PASSIVE_COMMREG,
        };
        let bitmap = alloc::vec![0b0000_0110u8];
        let bytes = encode(&config, &bitmap);
        let (parsed, parsed_bitmap) = parse(&bytes).unwrap();

        assert_eq!(parsed.name, "alpha");
        assert_eq!(parsed.flags, CellFlags::PASSIVE_COMMREG);
        assert_eq!(parsed.regions.len(), 1);
        assert_eq!(parsed_bitmap, bitmap);
        assert_eq!(bitmap_cpu_ids(&parsed_bitmap).collect::<Vec<_>>(), alloc::vec![1, 2]);
    }

    #[test]
    fn oversized_blob_is_rejected() {
        let config = CellConfig {
            name: "big".into(),
            cpu_set_size: 0,
            regions: Vec::new(),
            flags: CellFlags::empty(),
        };
        let bitmap = alloc::vec![0u8; TEMPORARY_WINDOW_BYTES];
        let bytes = encode(&config, &bitmap);
        assert_eq!(parse(&bytes), Err(ConfigError::TooBig));
    }

    #[test]
    fn truncated_blob_is_rejected() {
        assert_eq!(parse(&[0u8; 4]), Err(ConfigError::Truncated));
    }
}
