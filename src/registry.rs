//! Component B: the cell registry (`spec.md` §4.B).
//!
//! `spec.md` §9 admits any data structure meeting "stable identity over a
//! cell's lifetime, O(1) cpu->cell lookup, O(N) enumeration" in place of the
//! upstream hand-linked list. This implementation uses `slab::Slab`, already a
//! dependency of the teacher kernel crate: `Slab::insert`/`vacant_entry`
//! return the smallest free key, which is exactly invariant 4
//! ("`get_free_id` returns `min{i >= 0 : !exists cell.id = i}`"), and removal
//! plus lookup by id are both O(1) instead of the O(N) a linked list needs.

use slab::Slab;

use crate::cell::{Cell, CellId, ROOT_CELL_ID};
use crate::comm::CellState;

/// Ordered collection of cells, root at a fixed id, id allocation, name
/// uniqueness (`spec.md` §3, §4.B).
pub struct Registry {
    cells: Slab<Cell>,
}

impl Registry {
    /// Builds a fresh registry containing only `root`, which must have
    /// `id == ROOT_CELL_ID`.
    pub fn new(root: Cell) -> Self {
        debug_assert_eq!(root.id, ROOT_CELL_ID);
        let mut cells = Slab::with_capacity(1);
        let key = cells.insert(root);
        debug_assert_eq!(key, ROOT_CELL_ID);
        Self { cells }
    }

    /// The smallest non-negative id not currently in use (`spec.md` §4.B,
    /// §8 invariant 4).
    pub fn get_free_id(&self) -> CellId {
        self.cells.vacant_entry().key()
    }

    pub fn find_by_id(&self, id: CellId) -> Option<&Cell> {
        self.cells.get(id)
    }

    pub fn find_by_id_mut(&mut self, id: CellId) -> Option<&mut Cell> {
        self.cells.get_mut(id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Cell> {
        self.cells.iter().map(|(_, c)| c).find(|c| c.name() == name)
    }

    pub fn root(&self) -> &Cell {
        self.cells.get(ROOT_CELL_ID).expect("root cell is never removed")
    }

    pub fn root_mut(&mut self) -> &mut Cell {
        self.cells.get_mut(ROOT_CELL_ID).expect("root cell is never removed")
    }

    /// Inserts `cell` at the id it was constructed with. The caller is
    /// expected to have obtained that id from [`Registry::get_free_id`] while
    /// holding the root-suspension quiescence window (`spec.md` §4.B, §5).
    pub fn insert(&mut self, cell: Cell) {
        let id = cell.id;
        let key = self.cells.insert(cell);
        debug_assert_eq!(key, id, "cell inserted at an id other than the one it reserved");
    }

    /// Removes and returns the non-root cell with id `id`.
    pub fn remove(&mut self, id: CellId) -> Option<Cell> {
        if id == ROOT_CELL_ID {
            return None;
        }
        self.cells.try_remove(id)
    }

    pub fn num_cells(&self) -> usize {
        self.cells.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Cell> {
        self.cells.iter().map(|(_, c)| c)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Cell> {
        self.cells.iter_mut().map(|(_, c)| c)
    }

    /// Whether any *other* cell than `excluding` is `RUNNING_LOCKED`
    /// (`spec.md` §4.F: a running-locked sibling forbids reconfiguration,
    /// §3 invariant 5: a cell in `RUNNING_LOCKED` does not block its own
    /// reconfiguration).
    pub fn any_other_running_locked(&self, excluding: CellId) -> bool {
        self.iter()
            .any(|c| c.id != excluding && c.comm_page.cell_state() == Some(CellState::RunningLocked))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{CellConfig, CellFlags};
    use crate::cpuset::CpuSet;
    use crate::tests_support::MockArch;
    use alloc::sync::Arc;
    use alloc::vec::Vec;

    fn root_cell() -> Cell {
        let arch = Arc::new(MockArch::new(4, 4));
        let cpu_set = CpuSet::try_new(4, arch).unwrap();
        let config = CellConfig {
            name: "root".into(),
            cpu_set_size: 4,
            regions: Vec::new(),
            flags: CellFlags::empty(),
        };
        Cell::new(ROOT_CELL_ID, config, cpu_set, 0)
    }

    fn some_cell(id: CellId, name: &str) -> Cell {
        let arch = Arc::new(MockArch::new(4, 4));
        let cpu_set = CpuSet::try_new(4, arch).unwrap();
        let config = CellConfig {
            name: name.into(),
            cpu_set_size: 4,
            regions: Vec::new(),
            flags: CellFlags::empty(),
        };
        Cell::new(id, config, cpu_set, 0)
    }

    #[test]
    fn root_is_present_at_construction() {
        let registry = Registry::new(root_cell());
        assert_eq!(registry.num_cells(), 1);
        assert_eq!(registry.root().id, ROOT_CELL_ID);
    }

    #[test]
    fn get_free_id_is_minimal_and_insert_reuses_it() {
        let mut registry = Registry::new(root_cell());
        let id_a = registry.get_free_id();
        assert_eq!(id_a, 1);
        registry.insert(some_cell(id_a, "a"));

        let id_b = registry.get_free_id();
        assert_eq!(id_b, 2);
        registry.insert(some_cell(id_b, "b"));

        registry.remove(id_a);
        // the freed low id is reused ahead of a brand new high id.
        assert_eq!(registry.get_free_id(), id_a);
    }

    #[test]
    fn name_uniqueness_is_observable() {
        let mut registry = Registry::new(root_cell());
        registry.insert(some_cell(1, "alpha"));
        assert!(registry.find_by_name("alpha").is_some());
        assert!(registry.find_by_name("beta").is_none());
    }

    #[test]
    fn root_cannot_be_removed() {
        let mut registry = Registry::new(root_cell());
        assert!(registry.remove(ROOT_CELL_ID).is_none());
        assert_eq!(registry.num_cells(), 1);
    }

    #[test]
    fn running_locked_sibling_is_detected() {
        let mut registry = Registry::new(root_cell());
        let locked = some_cell(1, "locked");
        locked.comm_page.set_cell_state(CellState::RunningLocked);
        registry.insert(locked);

        assert!(registry.any_other_running_locked(ROOT_CELL_ID));
        assert!(!registry.any_other_running_locked(1));
    }
}
