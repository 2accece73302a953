//! Durable roster stored in a locked directory.
//!
//! Layout:
//! - `MANIFEST`: magic + format version
//! - `LOCK`: held with an exclusive lock for the lifetime of the roster
//! - `roster.bin`: magic, version, u64 length, MessagePack rows, CRC32

use crate::error::{RelayError, Result};
use crate::types::{ColleagueId, ColleaguePresence};
use fs2::FileExt;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use super::{sort_rows, PresenceStore};

/// Magic bytes for the roster manifest.
const MANIFEST_MAGIC: &[u8; 4] = b"PRL\0";

/// Magic bytes for the roster data file.
const ROSTER_MAGIC: &[u8; 4] = b"RSTR";

/// Current roster format version.
const ROSTER_VERSION: u8 = 1;

/// Sanity limit on the encoded roster size.
const MAX_ROSTER_BYTES: usize = 64 * 1024 * 1024;

const ROSTER_FILE: &str = "roster.bin";
const ROSTER_TMP_FILE: &str = "roster.bin.tmp";

/// Roster configuration.
#[derive(Clone, Debug)]
pub struct RosterConfig {
    /// Directory holding the roster files.
    pub path: PathBuf,

    /// Whether to create the roster if it doesn't exist.
    pub create_if_missing: bool,
}

impl Default for RosterConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./roster"),
            create_if_missing: true,
        }
    }
}

/// Roster persisted to disk, cached in memory.
///
/// Reads are served from the cache. Every write rewrites `roster.bin`
/// through a temp file and a rename, under the cache's write lock.
pub struct FileRoster {
    config: RosterConfig,

    /// Lock file for exclusive access.
    _lock_file: File,

    rows: RwLock<BTreeMap<ColleagueId, ColleaguePresence>>,
}

impl FileRoster {
    /// Open an existing roster or create a new one.
    pub fn open_or_create(config: RosterConfig) -> Result<Self> {
        if config.path.join("MANIFEST").exists() {
            Self::open(config)
        } else if config.create_if_missing {
            Self::create(config)
        } else {
            Err(RelayError::InvalidFormat(format!(
                "no roster at {}",
                config.path.display()
            )))
        }
    }

    /// Create a new, empty roster.
    ///
    /// Fails with `Locked` if another roster holds the directory and with
    /// `InvalidFormat` if a roster already exists there.
    pub fn create(config: RosterConfig) -> Result<Self> {
        fs::create_dir_all(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;

        if config.path.join("MANIFEST").exists() {
            return Err(RelayError::InvalidFormat(format!(
                "roster already exists at {}",
                config.path.display()
            )));
        }
        Self::write_manifest(&config.path)?;

        let roster = Self {
            config,
            _lock_file: lock_file,
            rows: RwLock::new(BTreeMap::new()),
        };
        roster.persist(&roster.rows.read())?;

        tracing::info!(path = %roster.config.path.display(), "created roster");
        Ok(roster)
    }

    /// Open an existing roster.
    pub fn open(config: RosterConfig) -> Result<Self> {
        Self::verify_manifest(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;

        let data_path = config.path.join(ROSTER_FILE);
        let rows = if data_path.exists() {
            Self::load(&data_path)?
        } else {
            BTreeMap::new()
        };

        tracing::info!(
            path = %config.path.display(),
            rows = rows.len(),
            "opened roster"
        );

        Ok(Self {
            config,
            _lock_file: lock_file,
            rows: RwLock::new(rows),
        })
    }

    /// Insert or replace a row.
    pub fn upsert(&self, row: ColleaguePresence) -> Result<()> {
        let mut rows = self.rows.write();
        let previous = rows.insert(row.id, row.clone());

        if let Err(e) = self.persist(&rows) {
            match previous {
                Some(previous) => rows.insert(row.id, previous),
                None => rows.remove(&row.id),
            };
            return Err(e);
        }
        Ok(())
    }

    /// Remove a row. Returns whether it existed.
    pub fn remove(&self, id: ColleagueId) -> Result<bool> {
        let mut rows = self.rows.write();
        let Some(previous) = rows.remove(&id) else {
            return Ok(false);
        };

        if let Err(e) = self.persist(&rows) {
            rows.insert(id, previous);
            return Err(e);
        }
        Ok(true)
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

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn persist(&self, rows: &BTreeMap<ColleagueId, ColleaguePresence>) -> Result<()> {
        let entries: Vec<&ColleaguePresence> = rows.values().collect();
        let encoded = rmp_serde::to_vec(&entries)?;
        let checksum = crc32fast::hash(&encoded);

        let tmp_path = self.config.path.join(ROSTER_TMP_FILE);
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(ROSTER_MAGIC)?;
            file.write_all(&[ROSTER_VERSION])?;
            file.write_all(&(encoded.len() as u64).to_le_bytes())?;
            file.write_all(&encoded)?;
            file.write_all(&checksum.to_le_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, self.config.path.join(ROSTER_FILE))?;
        Ok(())
    }

    fn load(path: &Path) -> Result<BTreeMap<ColleagueId, ColleaguePresence>> {
        let mut file = File::open(path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != ROSTER_MAGIC {
            return Err(RelayError::InvalidFormat("Invalid roster magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != ROSTER_VERSION {
            return Err(RelayError::InvalidFormat(format!(
                "Unsupported roster version: {}",
                version[0]
            )));
        }

        let mut len_bytes = [0u8; 8];
        file.read_exact(&mut len_bytes)?;
        let len = u64::from_le_bytes(len_bytes) as usize;
        if len > MAX_ROSTER_BYTES {
            return Err(RelayError::Corruption("roster too large".into()));
        }

        let mut encoded = vec![0u8; len];
        file.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        file.read_exact(&mut checksum_bytes)?;
        if u32::from_le_bytes(checksum_bytes) != crc32fast::hash(&encoded) {
            return Err(RelayError::Corruption("roster checksum mismatch".into()));
        }

        let entries: Vec<ColleaguePresence> = rmp_serde::from_slice(&encoded)?;
        Ok(entries.into_iter().map(|row| (row.id, row)).collect())
    }

    fn write_manifest(path: &Path) -> Result<()> {
        let mut file = File::create(path.join("MANIFEST"))?;
        file.write_all(MANIFEST_MAGIC)?;
        file.write_all(&[ROSTER_VERSION])?;
        file.sync_all()?;
        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        let mut file = File::open(path.join("MANIFEST"))?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != MANIFEST_MAGIC {
            return Err(RelayError::InvalidFormat("Invalid roster manifest".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != ROSTER_VERSION {
            return Err(RelayError::InvalidFormat(format!(
                "Unsupported roster version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join("LOCK"))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| RelayError::Locked)?;
        Ok(lock_file)
    }
}

impl PresenceStore for FileRoster {
    fn list_all_presence(&self) -> Result<Vec<ColleaguePresence>> {
        let mut rows: Vec<ColleaguePresence> = self.rows.read().values().cloned().collect();
        sort_rows(&mut rows);
        Ok(rows)
    }

    fn set_presence(&self, id: ColleagueId, is_at_work: bool) -> Result<()> {
        let mut rows = self.rows.write();
        let row = rows.get_mut(&id).ok_or(RelayError::ColleagueNotFound(id))?;
        let previous = row.is_at_work;
        if previous == is_at_work {
            return Ok(());
        }
        row.is_at_work = is_at_work;

        if let Err(e) = self.persist(&rows) {
            if let Some(row) = rows.get_mut(&id) {
                row.is_at_work = previous;
            }
            tracing::warn!(colleague = %id, error = %e, "failed to persist presence");
            return Err(e);
        }
        Ok(())
    }
}
