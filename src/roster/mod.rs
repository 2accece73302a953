//! Persistence collaborator: the colleague presence roster.
//!
//! The streaming core only ever reads the roster (for snapshots); the
//! mutation path writes the presence flag before publishing. Two backends:
//! - `MemoryRoster`: a lock-protected map, for tests and embedding
//! - `FileRoster`: a locked directory with a checksummed MessagePack file

mod file;
mod memory;

pub use file::{FileRoster, RosterConfig};
pub use memory::MemoryRoster;

use crate::error::Result;
use crate::types::{ColleagueId, ColleaguePresence};

/// Narrow interface onto the employee records.
pub trait PresenceStore: Send + Sync {
    /// Atomic read of every row, ordered by name then id.
    fn list_all_presence(&self) -> Result<Vec<ColleaguePresence>>;

    /// Update one presence flag. Unknown ids fail with `ColleagueNotFound`.
    fn set_presence(&self, id: ColleagueId, is_at_work: bool) -> Result<()>;
}

/// Snapshot ordering shared by the backends.
pub(crate) fn sort_rows(rows: &mut [ColleaguePresence]) {
    rows.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
}
