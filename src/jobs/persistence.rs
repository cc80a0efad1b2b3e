//! Durable snapshot of the job registry.
//!
//! The whole registry is saved as one versioned JSON blob after every mutation. Stores
//! only move bytes; [`encode_snapshot`] and [`decode_snapshot`] own the format.

use std::io;
use std::path::Path;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};

use crate::error::StorageError;
use crate::jobs::GenerationJob;

pub const SNAPSHOT_VERSION: u32 = 1;

const TREE_JOBS: &str = "genforge_jobs";
const SNAPSHOT_KEY: &[u8] = b"snapshot";

/// Byte-level persistence boundary for the job registry.
pub trait SnapshotStore: Send + Sync {
    /// The last saved blob, or `None` if nothing has been saved yet.
    fn load(&self) -> Result<Option<Vec<u8>>, StorageError>;

    fn save(&self, bytes: &[u8]) -> Result<(), StorageError>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedSnapshot {
    pub version: u32,
    #[serde(default)]
    pub active: Vec<GenerationJob>,
    #[serde(default)]
    pub settled: Vec<GenerationJob>,
}

pub fn encode_snapshot(snapshot: &PersistedSnapshot) -> Result<Vec<u8>, StorageError> {
    serde_json::to_vec(snapshot).map_err(to_storage_data)
}

/// Decode a blob, rejecting unknown versions.
pub fn decode_snapshot(bytes: &[u8]) -> Result<PersistedSnapshot, StorageError> {
    #[derive(Deserialize)]
    struct VersionHeader {
        version: u32,
    }

    let header: VersionHeader = serde_json::from_slice(bytes)
        .map_err(|e| StorageError::CorruptSnapshot(e.to_string()))?;
    if header.version != SNAPSHOT_VERSION {
        return Err(StorageError::UnsupportedVersion {
            found: header.version,
            expected: SNAPSHOT_VERSION,
        });
    }
    serde_json::from_slice(bytes).map_err(|e| StorageError::CorruptSnapshot(e.to_string()))
}

/// Snapshot kept in a sled tree under a single key.
#[derive(Clone)]
pub struct SledSnapshotStore {
    db: Db,
    tree: Tree,
}

impl SledSnapshotStore {
    pub fn new(db: Db) -> Result<Self, StorageError> {
        let tree = db.open_tree(TREE_JOBS).map_err(to_storage_io)?;
        Ok(Self { db, tree })
    }

    /// Open (or create) a sled database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(|e| {
            StorageError::IoError(io::Error::new(
                io::ErrorKind::Other,
                format!("Failed to open sled database: {}", e),
            ))
        })?;
        Self::new(db)
    }

    pub fn db(&self) -> &Db {
        &self.db
    }
}

impl SnapshotStore for SledSnapshotStore {
    fn load(&self) -> Result<Option<Vec<u8>>, StorageError> {
        let raw = self.tree.get(SNAPSHOT_KEY).map_err(to_storage_io)?;
        Ok(raw.map(|ivec| ivec.to_vec()))
    }

    fn save(&self, bytes: &[u8]) -> Result<(), StorageError> {
        self.tree.insert(SNAPSHOT_KEY, bytes).map_err(to_storage_io)?;
        self.tree.flush().map_err(to_storage_io)?;
        Ok(())
    }
}

/// In-process store, for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    blob: Mutex<Option<Vec<u8>>>,
    saves: Mutex<usize>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with an existing blob.
    pub fn with_blob(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            blob: Mutex::new(Some(bytes.into())),
            saves: Mutex::new(0),
        }
    }

    pub fn save_count(&self) -> usize {
        *self.saves.lock()
    }

    pub fn blob(&self) -> Option<Vec<u8>> {
        self.blob.lock().clone()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn load(&self) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.blob.lock().clone())
    }

    fn save(&self, bytes: &[u8]) -> Result<(), StorageError> {
        *self.blob.lock() = Some(bytes.to_vec());
        *self.saves.lock() += 1;
        Ok(())
    }
}

fn to_storage_io(err: sled::Error) -> StorageError {
    StorageError::IoError(io::Error::new(io::ErrorKind::Other, err.to_string()))
}

fn to_storage_data(err: serde_json::Error) -> StorageError {
    StorageError::IoError(io::Error::new(io::ErrorKind::InvalidData, err.to_string()))
}
