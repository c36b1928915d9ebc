//! Persistence collaborator for zones, keys, queue entries and the audit log.
//!
//! Snapshots are written whole after each mutation (temp file + rename); the
//! audit log is an append-only JSON lines file synced on every append.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::model::{AuditLogEntry, Key, SigningQueueEntry, Zone};

const SNAPSHOT_VERSION: u32 = 1;

/// Zones and keys as persisted by the key store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyStoreSnapshot {
    pub version: u32,
    pub snapshot_timestamp: i64,
    pub zones: Vec<Zone>,
    pub keys: Vec<Key>,
}

impl KeyStoreSnapshot {
    pub fn new(zones: Vec<Zone>, keys: Vec<Key>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            snapshot_timestamp: Utc::now().timestamp(),
            zones,
            keys,
        }
    }
}

/// Queue entries as persisted by the signing queue
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub version: u32,
    pub snapshot_timestamp: i64,
    pub entries: Vec<SigningQueueEntry>,
}

impl QueueSnapshot {
    pub fn new(entries: Vec<SigningQueueEntry>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            snapshot_timestamp: Utc::now().timestamp(),
            entries,
        }
    }
}

pub trait Storage: Send + Sync {
    fn save_keystore(&self, snapshot: &KeyStoreSnapshot) -> Result<()>;
    fn load_keystore(&self) -> Result<Option<KeyStoreSnapshot>>;

    fn save_queue(&self, snapshot: &QueueSnapshot) -> Result<()>;
    fn load_queue(&self) -> Result<Option<QueueSnapshot>>;

    /// Durably append one audit entry; must not return before the entry is persisted
    fn append_audit(&self, entry: &AuditLogEntry) -> Result<()>;
    fn load_audit(&self) -> Result<Vec<AuditLogEntry>>;
}

/// Storage that keeps everything in memory
#[derive(Default)]
pub struct MemoryStorage {
    keystore: Mutex<Option<KeyStoreSnapshot>>,
    queue: Mutex<Option<QueueSnapshot>>,
    audit: Mutex<Vec<AuditLogEntry>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn save_keystore(&self, snapshot: &KeyStoreSnapshot) -> Result<()> {
        *self.keystore.lock() = Some(snapshot.clone());
        Ok(())
    }

    fn load_keystore(&self) -> Result<Option<KeyStoreSnapshot>> {
        Ok(self.keystore.lock().clone())
    }

    fn save_queue(&self, snapshot: &QueueSnapshot) -> Result<()> {
        *self.queue.lock() = Some(snapshot.clone());
        Ok(())
    }

    fn load_queue(&self) -> Result<Option<QueueSnapshot>> {
        Ok(self.queue.lock().clone())
    }

    fn append_audit(&self, entry: &AuditLogEntry) -> Result<()> {
        self.audit.lock().push(entry.clone());
        Ok(())
    }

    fn load_audit(&self) -> Result<Vec<AuditLogEntry>> {
        Ok(self.audit.lock().clone())
    }
}

/// Storage backed by files in a data directory
pub struct FileStorage {
    dir: PathBuf,
    fsync: bool,
    audit_file: Mutex<File>,
}

impl FileStorage {
    pub const KEYSTORE_FILE: &'static str = "keystore.json";
    pub const QUEUE_FILE: &'static str = "queue.json";
    pub const AUDIT_FILE: &'static str = "audit.jsonl";

    pub fn open(dir: impl AsRef<Path>, fsync: bool) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let audit_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(Self::AUDIT_FILE))?;

        info!("Opened signer storage at {}", dir.display());
        Ok(Self {
            dir,
            fsync,
            audit_file: Mutex::new(audit_file),
        })
    }

    fn write_atomic<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let path = self.dir.join(name);
        let temp_path = self.dir.join(format!("{}.tmp", name));
        let data = serde_json::to_vec_pretty(value)?;

        // Write to temporary file first, then rename for atomic replacement
        {
            let mut file = File::create(&temp_path)?;
            file.write_all(&data)?;
            if self.fsync {
                file.sync_all()?;
            }
        }
        fs::rename(&temp_path, &path)?;

        debug!("Saved {} ({} bytes)", path.display(), data.len());
        Ok(())
    }

    fn read_json<T: for<'de> Deserialize<'de>>(&self, name: &str) -> Result<Option<T>> {
        let path = self.dir.join(name);
        if !path.exists() {
            debug!("{} does not exist, starting empty", path.display());
            return Ok(None);
        }
        let data = fs::read(&path)?;
        Ok(Some(serde_json::from_slice(&data)?))
    }
}

impl Storage for FileStorage {
    fn save_keystore(&self, snapshot: &KeyStoreSnapshot) -> Result<()> {
        self.write_atomic(Self::KEYSTORE_FILE, snapshot)
    }

    fn load_keystore(&self) -> Result<Option<KeyStoreSnapshot>> {
        self.read_json(Self::KEYSTORE_FILE)
    }

    fn save_queue(&self, snapshot: &QueueSnapshot) -> Result<()> {
        self.write_atomic(Self::QUEUE_FILE, snapshot)
    }

    fn load_queue(&self) -> Result<Option<QueueSnapshot>> {
        self.read_json(Self::QUEUE_FILE)
    }

    fn append_audit(&self, entry: &AuditLogEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let mut file = self.audit_file.lock();
        file.write_all(&line)?;
        if self.fsync {
            file.sync_data()?;
        }
        Ok(())
    }

    fn load_audit(&self) -> Result<Vec<AuditLogEntry>> {
        let path = self.dir.join(Self::AUDIT_FILE);
        let file = File::open(&path)?;
        let mut entries = Vec::new();

        for (number, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AuditLogEntry>(&line) {
                Ok(entry) => entries.push(entry),
                // A torn final line from a crash mid-append is skipped
                Err(e) => warn!("Skipping unreadable audit line {}: {}", number + 1, e),
            }
        }
        Ok(entries)
    }
}
