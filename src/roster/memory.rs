//! In-memory roster.

use crate::error::{RelayError, Result};
use crate::types::{ColleagueId, ColleaguePresence};
use parking_lot::RwLock;
use std::collections::BTreeMap;

use super::{sort_rows, PresenceStore};

/// Roster held entirely in memory.
#[derive(Default)]
pub struct MemoryRoster {
    rows: RwLock<BTreeMap<ColleagueId, ColleaguePresence>>,
}

impl MemoryRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a roster from existing rows.
    pub fn with_rows(rows: impl IntoIterator<Item = ColleaguePresence>) -> Self {
        let roster = Self::new();
        {
            let mut map = roster.rows.write();
            for row in rows {
                map.insert(row.id, row);
            }
        }
        roster
    }

    /// Insert or replace a row.
    pub fn upsert(&self, row: ColleaguePresence) {
        self.rows.write().insert(row.id, row);
    }

    /// Remove a row. Returns whether it existed.
    pub fn remove(&self, id: ColleagueId) -> bool {
        self.rows.write().remove(&id).is_some()
    }

    pub fn get(&self, id: ColleagueId) -> Option<ColleaguePresence> {
        self.rows.read().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }
}

impl PresenceStore for MemoryRoster {
    fn list_all_presence(&self) -> Result<Vec<ColleaguePresence>> {
        let mut rows: Vec<ColleaguePresence> = self.rows.read().values().cloned().collect();
        sort_rows(&mut rows);
        Ok(rows)
    }

    fn set_presence(&self, id: ColleagueId, is_at_work: bool) -> Result<()> {
        let mut rows = self.rows.write();
        let row = rows.get_mut(&id).ok_or(RelayError::ColleagueNotFound(id))?;
        row.is_at_work = is_at_work;
        Ok(())
    }
}
