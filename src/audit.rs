use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::error::Result;
use crate::model::{AuditLogEntry, AuditOperation, ZoneId};
use crate::storage::Storage;

/// An audit entry staged by a state change, written before the change
/// is committed
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub zone_id: ZoneId,
    pub operation: AuditOperation,
    pub message: String,
    pub success: bool,
}

impl AuditRecord {
    pub fn new(
        zone_id: ZoneId,
        operation: AuditOperation,
        message: impl Into<String>,
        success: bool,
    ) -> Self {
        Self {
            zone_id,
            operation,
            message: message.into(),
            success,
        }
    }
}

/// Append-only record of key and queue state changes.
///
/// Entries are persisted before they become visible, so an operation that
/// returns after appending has its audit record on disk.
pub struct AuditLog {
    storage: Arc<dyn Storage>,
    entries: RwLock<Vec<AuditLogEntry>>,
}

impl AuditLog {
    pub fn open(storage: Arc<dyn Storage>) -> Result<Self> {
        let entries = storage.load_audit()?;
        if !entries.is_empty() {
            info!("Loaded {} audit entries", entries.len());
        }
        Ok(Self {
            storage,
            entries: RwLock::new(entries),
        })
    }

    pub fn append(
        &self,
        zone_id: ZoneId,
        operation: AuditOperation,
        message: impl Into<String>,
        success: bool,
    ) -> Result<AuditLogEntry> {
        // The write lock keeps ids and file order in step
        let mut entries = self.entries.write();
        let entry = AuditLogEntry {
            id: entries.last().map(|e| e.id + 1).unwrap_or(1),
            zone_id,
            operation,
            message: message.into(),
            success,
            timestamp: Utc::now(),
        };

        self.storage.append_audit(&entry)?;
        debug!(
            zone_id,
            operation = operation.as_str(),
            success,
            "audit: {}",
            entry.message
        );
        entries.push(entry.clone());
        Ok(entry)
    }

    /// Append staged records in order, stopping at the first failure
    pub fn append_all(&self, records: Vec<AuditRecord>) -> Result<()> {
        for record in records {
            self.append(
                record.zone_id,
                record.operation,
                record.message,
                record.success,
            )?;
        }
        Ok(())
    }

    /// Entries in append order, optionally for one zone, skipping `offset`
    /// matches and returning at most `limit`
    pub fn read(&self, zone_id: Option<ZoneId>, offset: usize, limit: usize) -> Vec<AuditLogEntry> {
        self.entries
            .read()
            .iter()
            .filter(|e| zone_id.is_none_or(|z| e.zone_id == z))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Number of entries, optionally for one zone
    pub fn count(&self, zone_id: Option<ZoneId>) -> usize {
        self.entries
            .read()
            .iter()
            .filter(|e| zone_id.is_none_or(|z| e.zone_id == z))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[test]
    fn test_append_order_and_pagination() {
        let log = AuditLog::open(Arc::new(MemoryStorage::new())).unwrap();
        for i in 0..5 {
            log.append(1, AuditOperation::SignStart, format!("start {}", i), true)
                .unwrap();
            log.append(2, AuditOperation::Enable, "other zone", true).unwrap();
        }

        assert_eq!(log.count(None), 10);
        assert_eq!(log.count(Some(1)), 5);

        let page = log.read(Some(1), 1, 2);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].message, "start 1");
        assert_eq!(page[1].message, "start 2");
        assert!(page[0].id < page[1].id);
    }

    #[test]
    fn test_entries_survive_reopen() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        {
            let log = AuditLog::open(storage.clone()).unwrap();
            log.append(7, AuditOperation::Disable, "gone", true).unwrap();
        }
        let log = AuditLog::open(storage).unwrap();
        assert_eq!(log.read(Some(7), 0, 10)[0].operation, AuditOperation::Disable);

        let next = log.append(7, AuditOperation::Enable, "back", true).unwrap();
        assert_eq!(next.id, 2);
    }
}
