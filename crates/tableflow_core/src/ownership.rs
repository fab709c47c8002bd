//! Per-table registry of which plugin currently owns a cell.
//!
//! A plugin claims a cell before putting it into a transient state (an open
//! editor, a pending save) and other plugins check [`CellOwnership::can_mutate`]
//! before touching it. The owner is mirrored into the cell's `data-plugin`
//! attribute for external observers.

use crate::table::{CellRef, HostTable};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Attribute carrying the owning plugin's name.
pub const OWNER_ATTRIBUTE: &str = "data-plugin";

pub struct CellOwnership {
    table: Arc<dyn HostTable>,
    owners: DashMap<CellRef, String>,
}

impl CellOwnership {
    pub fn new(table: Arc<dyn HostTable>) -> Self {
        Self {
            table,
            owners: DashMap::new(),
        }
    }

    /// Claims `cell` for `plugin`. Succeeds when the cell is free or already
    /// owned by the same plugin.
    pub fn claim(&self, cell: CellRef, plugin: &str) -> bool {
        match self.owners.entry(cell) {
            Entry::Occupied(entry) => {
                if entry.get() == plugin {
                    true
                } else {
                    warn!(%cell, owner = %entry.get(), requested_by = plugin, "Cell already owned");
                    false
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(plugin.to_string());
                if let Err(e) = self.table.set_attribute(cell, OWNER_ATTRIBUTE, plugin) {
                    debug!(%cell, error = %e, "Could not mirror cell owner");
                }
                true
            }
        }
    }

    /// Releases `cell` if `plugin` owns it.
    pub fn release(&self, cell: CellRef, plugin: &str) -> bool {
        let removed = self
            .owners
            .remove_if(&cell, |_, owner| owner == plugin)
            .is_some();
        if removed {
            self.table.remove_attribute(cell, OWNER_ATTRIBUTE);
        }
        removed
    }

    pub fn owner(&self, cell: CellRef) -> Option<String> {
        self.owners.get(&cell).map(|owner| owner.clone())
    }

    /// Whether `plugin` may change `cell`: the cell is unowned or owned by it.
    pub fn can_mutate(&self, cell: CellRef, plugin: &str) -> bool {
        self.owners
            .get(&cell)
            .map(|owner| owner.as_str() == plugin)
            .unwrap_or(true)
    }

    /// Releases every cell owned by `plugin`. Returns the number released.
    pub fn release_all(&self, plugin: &str) -> usize {
        let cells: Vec<CellRef> = self
            .owners
            .iter()
            .filter(|entry| entry.value() == plugin)
            .map(|entry| *entry.key())
            .collect();
        cells
            .into_iter()
            .filter(|cell| self.release(*cell, plugin))
            .count()
    }

    pub fn owned_by(&self, plugin: &str) -> Vec<CellRef> {
        let mut cells: Vec<CellRef> = self
            .owners
            .iter()
            .filter(|entry| entry.value() == plugin)
            .map(|entry| *entry.key())
            .collect();
        cells.sort();
        cells
    }
}

impl std::fmt::Debug for CellOwnership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellOwnership")
            .field("owned", &self.owners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{MemoryTable, TableData};

    fn ownership() -> (Arc<MemoryTable>, CellOwnership) {
        let table = Arc::new(MemoryTable::from_data(TableData {
            id: "t".into(),
            headers: vec!["a".into(), "b".into()],
            rows: vec![vec!["1".into(), "2".into()]],
        }));
        let ownership = CellOwnership::new(table.clone());
        (table, ownership)
    }

    #[test]
    fn test_claim_is_exclusive() {
        let (table, ownership) = ownership();
        let cell = CellRef::new(0, 0);

        assert!(ownership.claim(cell, "edit"));
        assert!(ownership.claim(cell, "edit"));
        assert!(!ownership.claim(cell, "sort"));
        assert!(!ownership.can_mutate(cell, "sort"));
        assert!(ownership.can_mutate(cell, "edit"));
        assert!(ownership.can_mutate(CellRef::new(0, 1), "sort"));
        assert_eq!(table.attribute(cell, OWNER_ATTRIBUTE).as_deref(), Some("edit"));
    }

    #[test]
    fn test_release_requires_owner() {
        let (table, ownership) = ownership();
        let cell = CellRef::new(0, 1);
        ownership.claim(cell, "edit");

        assert!(!ownership.release(cell, "sort"));
        assert!(ownership.release(cell, "edit"));
        assert!(ownership.owner(cell).is_none());
        assert!(table.attribute(cell, OWNER_ATTRIBUTE).is_none());
    }

    #[test]
    fn test_release_all() {
        let (_table, ownership) = ownership();
        ownership.claim(CellRef::new(0, 0), "edit");
        ownership.claim(CellRef::new(0, 1), "edit");

        assert_eq!(ownership.owned_by("edit").len(), 2);
        assert_eq!(ownership.release_all("edit"), 2);
        assert!(ownership.owned_by("edit").is_empty());
    }
}
