//! Write-Ahead Logging (WAL) and snapshot persistence for the embedded backend

use crate::core::{DbError, Result};
use chrono::Utc;
use im::OrdMap;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const WAL_FILE_NAME: &str = "rustmetadb.wal";
pub const SNAPSHOT_FILE_NAME: &str = "rustmetadb.snapshot";
const SNAPSHOT_FORMAT_VERSION: u32 = 1;

// ============================================================================
// WAL Entry Types
// ============================================================================

/// One key written by a committed transaction; `value == None` is a delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalWrite {
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

/// Write-Ahead Log entry types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalEntry {
    /// All writes of one transaction, logged before they become visible.
    Commit {
        txn_id: u64,
        commit_ts: u64,
        writes: Vec<WalWrite>,
    },
}

// ============================================================================
// Store Snapshot
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub version: u32,
    pub last_commit_ts: u64,
    pub entries: OrdMap<Vec<u8>, Vec<u8>>,
    pub metadata: SnapshotMetadata,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub created_at: i64,
    pub key_count: usize,
}

impl StoreSnapshot {
    pub fn new(entries: OrdMap<Vec<u8>, Vec<u8>>, last_commit_ts: u64) -> Self {
        let key_count = entries.len();
        Self {
            version: SNAPSHOT_FORMAT_VERSION,
            last_commit_ts,
            entries,
            metadata: SnapshotMetadata {
                created_at: Utc::now().timestamp_millis(),
                key_count,
            },
        }
    }
}

// ============================================================================
// Durability Configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DurabilityMode {
    /// fsync after every commit
    Sync,
    /// flush to the OS after every commit
    #[default]
    Async,
    /// nothing is written to disk
    None,
}

impl std::str::FromStr for DurabilityMode {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sync" => Ok(DurabilityMode::Sync),
            "async" => Ok(DurabilityMode::Async),
            "none" => Ok(DurabilityMode::None),
            other => Err(DbError::Config(format!("unknown durability mode '{}'", other))),
        }
    }
}

// ============================================================================
// WAL Manager
// ============================================================================

pub struct WalManager {
    wal_path: PathBuf,
    wal_file: Option<BufWriter<File>>,
    durability_mode: DurabilityMode,
    // End of the last complete record; appends land here.
    valid_len: u64,
    entries_since_checkpoint: usize,
    checkpoint_threshold: usize,
}

impl WalManager {
    pub fn new<P: AsRef<Path>>(wal_path: P, durability_mode: DurabilityMode) -> Result<Self> {
        let wal_path = wal_path.as_ref().to_path_buf();
        if let Some(parent) = wal_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| DbError::io("Failed to create WAL directory", e))?;
        }

        let (wal_file, valid_len) = if durability_mode != DurabilityMode::None {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&wal_path)
                .map_err(|e| DbError::io("Failed to open WAL file", e))?;
            let len = file
                .metadata()
                .map_err(|e| DbError::io("Failed to stat WAL file", e))?
                .len();
            (Some(BufWriter::new(file)), len)
        } else {
            (None, 0)
        };

        Ok(Self {
            wal_path,
            wal_file,
            durability_mode,
            valid_len,
            entries_since_checkpoint: 0,
            checkpoint_threshold: 1000,
        })
    }

    pub fn append(&mut self, entry: &WalEntry) -> Result<()> {
        if self.durability_mode == DurabilityMode::None {
            return Ok(());
        }
        let serialized = rmp_serde::to_vec(entry)?;
        let len = u32::try_from(serialized.len())
            .map_err(|_| DbError::Backend("WAL record exceeds 4 GiB".to_string()))?;
        let mut record = Vec::with_capacity(serialized.len() + 4);
        record.extend_from_slice(&len.to_le_bytes());
        record.extend_from_slice(&serialized);

        if let Err(e) = self.write_record(&record) {
            // A partial record would swallow every later append on replay.
            if let Err(rewind) = self.truncate_to(self.valid_len) {
                warn!(error = %rewind, "Failed to discard partial WAL record");
                self.wal_file = None;
            }
            return Err(e);
        }
        self.valid_len += record.len() as u64;
        self.entries_since_checkpoint += 1;
        Ok(())
    }

    fn write_record(&mut self, record: &[u8]) -> Result<()> {
        let file = self
            .wal_file
            .as_mut()
            .ok_or_else(|| DbError::Backend("WAL file not initialized".to_string()))?;
        file.write_all(record)
            .map_err(|e| DbError::io("Failed to write WAL", e))?;
        file.flush()
            .map_err(|e| DbError::io("Failed to flush WAL", e))?;
        if self.durability_mode == DurabilityMode::Sync {
            file.get_mut()
                .sync_all()
                .map_err(|e| DbError::io("Failed to sync WAL", e))?;
        }
        Ok(())
    }

    /// Cuts the log back to `len` bytes and reopens it for appending.
    fn truncate_to(&mut self, len: u64) -> Result<()> {
        // Buffered bytes are dropped without being written.
        let file = match self.wal_file.take() {
            Some(writer) => writer.into_parts().0,
            None => OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.wal_path)
                .map_err(|e| DbError::io("Failed to open WAL file", e))?,
        };
        file.set_len(len)
            .map_err(|e| DbError::io("Failed to truncate WAL", e))?;
        file.sync_all()
            .map_err(|e| DbError::io("Failed to sync WAL", e))?;
        self.wal_file = Some(BufWriter::new(file));
        self.valid_len = len;
        Ok(())
    }

    /// Reads every complete entry. A torn record at the tail (the process
    /// died mid-append) ends the log.
    pub fn read_all(&self) -> Result<Vec<WalEntry>> {
        Ok(self.read_valid()?.0)
    }

    /// Reads the log and cuts off a torn tail, so later appends follow the
    /// last complete record.
    pub fn recover_entries(&mut self) -> Result<Vec<WalEntry>> {
        let (entries, valid_len) = self.read_valid()?;
        let file_len = match fs::metadata(&self.wal_path) {
            Ok(metadata) => metadata.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(DbError::io("Failed to stat WAL file", e)),
        };
        if file_len > valid_len && self.durability_mode != DurabilityMode::None {
            warn!(
                wal = %self.wal_path.display(),
                discarded = file_len - valid_len,
                "Truncating torn WAL tail"
            );
            self.truncate_to(valid_len)?;
        }
        Ok(entries)
    }

    /// Complete entries and the byte offset just past the last of them.
    fn read_valid(&self) -> Result<(Vec<WalEntry>, u64)> {
        if !self.wal_path.exists() {
            return Ok((Vec::new(), 0));
        }
        let file = File::open(&self.wal_path)
            .map_err(|e| DbError::io("Failed to open WAL for reading", e))?;
        let mut reader = BufReader::new(file);
        let mut entries = Vec::new();
        let mut valid_len = 0u64;
        loop {
            let mut len_bytes = [0u8; 4];
            match reader.read_exact(&mut len_bytes) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(DbError::io("Failed to read WAL entry length", e)),
            }
            let len = u32::from_le_bytes(len_bytes) as usize;
            let mut data = vec![0u8; len];
            match reader.read_exact(&mut data) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    warn!(
                        wal = %self.wal_path.display(),
                        recovered = entries.len(),
                        "Ignoring torn WAL record at end of log"
                    );
                    break;
                }
                Err(e) => return Err(DbError::io("Failed to read WAL entry data", e)),
            }
            match rmp_serde::from_slice::<WalEntry>(&data) {
                Ok(entry) => {
                    entries.push(entry);
                    valid_len += 4 + len as u64;
                }
                Err(e) => {
                    warn!(
                        wal = %self.wal_path.display(),
                        recovered = entries.len(),
                        error = %e,
                        "Ignoring undecodable WAL record at end of log"
                    );
                    break;
                }
            }
        }
        Ok((entries, valid_len))
    }

    pub fn clear(&mut self) -> Result<()> {
        if self.durability_mode == DurabilityMode::None {
            return Ok(());
        }
        self.wal_file = None;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.wal_path)
            .map_err(|e| DbError::io("Failed to truncate WAL", e))?;
        drop(file);
        let file = OpenOptions::new()
            .append(true)
            .open(&self.wal_path)
            .map_err(|e| DbError::io("Failed to reopen WAL", e))?;
        self.wal_file = Some(BufWriter::new(file));
        self.valid_len = 0;
        self.entries_since_checkpoint = 0;
        Ok(())
    }

    pub fn needs_checkpoint(&self) -> bool {
        self.entries_since_checkpoint >= self.checkpoint_threshold
    }

    pub fn entries_since_checkpoint(&self) -> usize {
        self.entries_since_checkpoint
    }

    pub fn set_checkpoint_threshold(&mut self, threshold: usize) {
        self.checkpoint_threshold = threshold.max(1);
    }

    pub fn path(&self) -> &Path {
        &self.wal_path
    }

    pub fn valid_len(&self) -> u64 {
        self.valid_len
    }
}

// ============================================================================
// Snapshot Manager
// ============================================================================

pub struct SnapshotManager {
    snapshot_path: PathBuf,
}

impl SnapshotManager {
    pub fn new<P: AsRef<Path>>(snapshot_path: P) -> Self {
        Self {
            snapshot_path: snapshot_path.as_ref().to_path_buf(),
        }
    }

    /// Writes the snapshot to a temp file in the same directory and renames
    /// it over the previous one.
    pub fn save(&self, snapshot: &StoreSnapshot) -> Result<()> {
        let dir = self
            .snapshot_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&dir)
            .map_err(|e| DbError::io("Failed to create snapshot directory", e))?;
        let temp_file = tempfile::NamedTempFile::new_in(&dir)
            .map_err(|e| DbError::io("Failed to create temp file", e))?;
        let serialized = rmp_serde::to_vec(snapshot)?;
        let mut writer = BufWriter::new(temp_file);
        writer
            .write_all(&serialized)
            .map_err(|e| DbError::io("Failed to write snapshot", e))?;
        let temp_file = writer
            .into_inner()
            .map_err(|e| DbError::io("Failed to flush snapshot", e.into_error()))?;
        temp_file
            .as_file()
            .sync_all()
            .map_err(|e| DbError::io("Failed to sync snapshot", e))?;
        temp_file
            .persist(&self.snapshot_path)
            .map_err(|e| DbError::io("Failed to rename snapshot", e.error))?;
        Ok(())
    }

    pub fn load(&self) -> Result<Option<StoreSnapshot>> {
        if !self.snapshot_path.exists() {
            return Ok(None);
        }
        let mut file = File::open(&self.snapshot_path)
            .map_err(|e| DbError::io("Failed to open snapshot", e))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .map_err(|e| DbError::io("Failed to read snapshot", e))?;
        let snapshot: StoreSnapshot = rmp_serde::from_slice(&data)?;
        if snapshot.version > SNAPSHOT_FORMAT_VERSION {
            return Err(DbError::Backend(format!(
                "snapshot format {} is newer than supported {}",
                snapshot.version, SNAPSHOT_FORMAT_VERSION
            )));
        }
        Ok(Some(snapshot))
    }

    pub fn exists(&self) -> bool {
        self.snapshot_path.exists()
    }
}

// ============================================================================
// Persistence Manager
// ============================================================================

/// State rebuilt from disk on open.
#[derive(Debug, Default)]
pub struct RecoveredState {
    pub entries: OrdMap<Vec<u8>, Vec<u8>>,
    pub last_commit_ts: u64,
    pub replayed_commits: usize,
}

pub struct PersistenceManager {
    wal: WalManager,
    snapshot: SnapshotManager,
    durability_mode: DurabilityMode,
}

impl PersistenceManager {
    pub fn new<P: AsRef<Path>>(data_dir: P, durability_mode: DurabilityMode) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        let wal = WalManager::new(data_dir.join(WAL_FILE_NAME), durability_mode)?;
        let snapshot = SnapshotManager::new(data_dir.join(SNAPSHOT_FILE_NAME));
        Ok(Self {
            wal,
            snapshot,
            durability_mode,
        })
    }

    pub fn log(&mut self, entry: &WalEntry) -> Result<()> {
        self.wal.append(entry)
    }

    pub fn checkpoint(&mut self, entries: OrdMap<Vec<u8>, Vec<u8>>, last_commit_ts: u64) -> Result<()> {
        if self.durability_mode == DurabilityMode::None {
            return Ok(());
        }
        let key_count = entries.len();
        let snapshot = StoreSnapshot::new(entries, last_commit_ts);
        self.snapshot.save(&snapshot)?;
        self.wal.clear()?;
        info!(keys = key_count, last_commit_ts, "Checkpoint written");
        Ok(())
    }

    pub fn needs_checkpoint(&self) -> bool {
        self.wal.needs_checkpoint()
    }

    /// Loads the latest snapshot and replays every logged commit on top.
    /// A torn log tail is cut off on the way.
    pub fn recover(&mut self) -> Result<RecoveredState> {
        let mut state = match self.snapshot.load()? {
            Some(snapshot) => RecoveredState {
                entries: snapshot.entries,
                last_commit_ts: snapshot.last_commit_ts,
                replayed_commits: 0,
            },
            None => RecoveredState::default(),
        };

        for entry in self.wal.recover_entries()? {
            match entry {
                WalEntry::Commit {
                    commit_ts, writes, ..
                } => {
                    // Commits already folded into the snapshot are skipped.
                    if commit_ts <= state.last_commit_ts {
                        continue;
                    }
                    for write in writes {
                        match write.value {
                            Some(value) => {
                                state.entries.insert(write.key, value);
                            }
                            None => {
                                state.entries.remove(&write.key);
                            }
                        }
                    }
                    state.last_commit_ts = commit_ts;
                    state.replayed_commits += 1;
                }
            }
        }
        Ok(state)
    }

    pub fn wal(&self) -> &WalManager {
        &self.wal
    }

    pub fn wal_mut(&mut self) -> &mut WalManager {
        &mut self.wal
    }

    pub fn snapshot(&self) -> &SnapshotManager {
        &self.snapshot
    }

    pub fn durability_mode(&self) -> DurabilityMode {
        self.durability_mode
    }
}
