//! Component A: a fixed-capacity bitmap over physical CPU ids (`spec.md` §4.A).

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use crate::arch::{Arch, CpuId};
use crate::error::{HvError, HvResult};

/// Page size assumed by the heap-backed storage threshold. The core never
/// interprets page contents, only sizes against it (`spec.md` §4.A, §6).
pub const PAGE_SIZE: usize = 4096;
const BITS_PER_WORD: usize = u64::BITS as usize;
const INLINE_WORDS: usize = 2;
const INLINE_BITS: usize = INLINE_WORDS * BITS_PER_WORD;

enum Storage {
    Inline([u64; INLINE_WORDS]),
    Heap { words: Vec<u64>, pool: Arc<dyn Arch> },
}

/// A bitmap over physical CPU ids, sized once at cell-configuration time.
///
/// Small configurations (up to [`INLINE_BITS`] CPUs) are stored inline; larger
/// ones draw a single page from the architecture's memory pool, freed when the
/// `CpuSet` is dropped — which happens exactly when the owning `Cell` is freed,
/// satisfying the invariant in `spec.md` §3.
pub struct CpuSet {
    storage: Storage,
    capacity: usize,
}

impl CpuSet {
    /// Creates an empty CPU-set able to hold ids in `0..capacity`.
    ///
    /// Fails with [`HvError::TooBig`] if `capacity` needs more than one page of
    /// backing storage, or [`HvError::Oom`] if the pool has no page to spare.
    pub fn try_new(capacity: usize, pool: Arc<dyn Arch>) -> HvResult<Self> {
        if capacity <= INLINE_BITS {
            return Ok(Self {
                storage: Storage::Inline([0; INLINE_WORDS]),
                capacity,
            });
        }

        let words_needed = capacity.div_ceil(BITS_PER_WORD);
        if words_needed * 8 > PAGE_SIZE {
            return Err(HvError::TooBig);
        }
        if !pool.try_alloc_pool_page() {
            return Err(HvError::Oom);
        }
        Ok(Self {
            storage: Storage::Heap {
                words: vec![0u64; words_needed],
                pool,
            },
            capacity,
        })
    }

    /// Capacity this set was configured for; valid ids are `0..capacity()`.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn words(&self) -> &[u64] {
        match &self.storage {
            Storage::Inline(w) => w,
            Storage::Heap { words, .. } => words,
        }
    }

    fn words_mut(&mut self) -> &mut [u64] {
        match &mut self.storage {
            Storage::Inline(w) => w,
            Storage::Heap { words, .. } => words,
        }
    }

    pub fn contains(&self, cpu: CpuId) -> bool {
        if cpu >= self.capacity {
            return false;
        }
        let word = self.words()[cpu / BITS_PER_WORD];
        word & (1 << (cpu % BITS_PER_WORD)) != 0
    }

    pub fn set(&mut self, cpu: CpuId) {
        debug_assert!(cpu < self.capacity);
        if cpu >= self.capacity {
            return;
        }
        self.words_mut()[cpu / BITS_PER_WORD] |= 1 << (cpu % BITS_PER_WORD);
    }

    pub fn clear(&mut self, cpu: CpuId) {
        if cpu >= self.capacity {
            return;
        }
        self.words_mut()[cpu / BITS_PER_WORD] &= !(1 << (cpu % BITS_PER_WORD));
    }

    pub fn is_empty(&self) -> bool {
        self.words().iter().all(|w| *w == 0)
    }

    /// The next set bit strictly after `after` (or from the start, if `after`
    /// is `None`), skipping `except` if given. Ascending by cpu id.
    pub fn next(&self, after: Option<CpuId>, except: Option<CpuId>) -> Option<CpuId> {
        let start = after.map_or(0, |c| c + 1);
        (start..self.capacity).find(|&c| self.contains(c) && Some(c) != except)
    }

    /// Ascending iterator over every set bit.
    pub fn iter(&self) -> impl Iterator<Item = CpuId> + '_ {
        (0..self.capacity).filter(move |&c| self.contains(c))
    }

    /// Ascending iterator over every set bit except `cpu`.
    pub fn iter_except(&self, cpu: CpuId) -> impl Iterator<Item = CpuId> + '_ {
        self.iter().filter(move |&c| c != cpu)
    }

    /// Whether `self` is a subset of `other` (every bit set in `self` is also
    /// set in `other`).
    pub fn is_subset_of(&self, other: &CpuSet) -> bool {
        self.iter().all(|c| other.contains(c))
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }
}

impl Drop for CpuSet {
    fn drop(&mut self) {
        if let Storage::Heap { pool, .. } = &self.storage {
            pool.free_pool_page();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests_support::MockArch;

    #[test]
    fn inline_set_and_clear() {
        let mut set = CpuSet::try_new(4, Arc::new(MockArch::new(4, 1))).unwrap();
        assert!(set.is_empty());
        set.set(2);
        assert!(set.contains(2));
        assert!(!set.contains(1));
        set.clear(2);
        assert!(!set.contains(2));
    }

    #[test]
    fn ascending_iteration() {
        let mut set = CpuSet::try_new(8, Arc::new(MockArch::new(8, 1))).unwrap();
        set.set(5);
        set.set(1);
        set.set(3);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![1, 3, 5]);
        assert_eq!(set.iter_except(3).collect::<Vec<_>>(), vec![1, 5]);
    }

    #[test]
    fn too_large_configuration_is_rejected() {
        let huge = (PAGE_SIZE / 8) * BITS_PER_WORD + 1;
        let err = CpuSet::try_new(huge, Arc::new(MockArch::new(huge, 1))).unwrap_err();
        assert_eq!(err, HvError::TooBig);
    }

    #[test]
    fn heap_backed_oom_is_reported() {
        let arch = Arc::new(MockArch::new(4096, 0));
        let err = CpuSet::try_new(INLINE_BITS + 1, arch).unwrap_err();
        assert_eq!(err, HvError::Oom);
    }

    #[test]
    fn heap_backed_subset_check() {
        let pool = Arc::new(MockArch::new(512, 4));
        let mut a = CpuSet::try_new(256, pool.clone()).unwrap();
        let mut b = CpuSet::try_new(256, pool).unwrap();
        a.set(200);
        b.set(200);
        b.set(5);
        assert!(a.is_subset_of(&b));
        assert!(!b.is_subset_of(&a));
    }
}
