//! Ordered, durable queue of zone signing work.
//!
//! Every mutation happens under one mutex, which is what makes `claim`
//! exclusive across concurrent workers. Mutations are applied to a copy of
//! the state: the audit records go out first, then the snapshot, and only
//! then does the copy replace the live state.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::audit::{AuditLog, AuditRecord};
use crate::error::{Result, SignerError};
use crate::metrics::SignerMetrics;
use crate::model::{
    AuditOperation, EntryId, QueueStatus, SigningQueueEntry, SigningReason, SigningScope, ZoneId,
};
use crate::storage::{QueueSnapshot, Storage};

/// A request to (re-)sign a zone
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub zone_id: ZoneId,
    pub origin: String,
    pub reason: SigningReason,
    pub scope: SigningScope,
    pub priority: i32,
}

impl EnqueueRequest {
    pub fn full(zone_id: ZoneId, origin: &str, reason: SigningReason, priority: i32) -> Self {
        Self {
            zone_id,
            origin: origin.to_string(),
            reason,
            scope: SigningScope::Full,
            priority,
        }
    }

    pub fn with_scope(mut self, scope: SigningScope) -> Self {
        self.scope = scope;
        self
    }
}

#[derive(Clone, Default)]
struct QueueState {
    entries: BTreeMap<EntryId, SigningQueueEntry>,
    next_id: EntryId,
}

impl QueueState {
    fn open_entry_mut(&mut self, zone_id: ZoneId) -> Option<&mut SigningQueueEntry> {
        self.entries
            .values_mut()
            .find(|e| e.zone_id == zone_id && e.status.is_open())
    }

    fn allocate_id(&mut self) -> EntryId {
        self.next_id += 1;
        self.next_id
    }

    /// Check that `claim` still owns its entry and the entry may move to `to`
    fn check_claim(&self, claim: &SigningQueueEntry, to: QueueStatus) -> Result<()> {
        let current = self
            .entries
            .get(&claim.id)
            .ok_or_else(|| SignerError::NotFound(format!("queue entry {}", claim.id)))?;

        let reclaimed = claim.status == QueueStatus::Processing
            && current.status == QueueStatus::Pending;
        if current.attempt != claim.attempt || reclaimed {
            return Err(SignerError::ClaimLost {
                id: claim.id,
                attempt: claim.attempt,
            });
        }
        if current.status != QueueStatus::Processing {
            return Err(SignerError::InvalidTransition {
                id: claim.id,
                from: current.status.as_str(),
                to: to.as_str(),
            });
        }
        Ok(())
    }
}

pub struct SigningQueue {
    state: Mutex<QueueState>,
    storage: Arc<dyn Storage>,
    audit: Arc<AuditLog>,
    metrics: Arc<SignerMetrics>,
}

impl SigningQueue {
    /// Load the queue from storage. Entries left `processing` by a previous
    /// process are returned to `pending`.
    pub fn open(
        storage: Arc<dyn Storage>,
        audit: Arc<AuditLog>,
        metrics: Arc<SignerMetrics>,
    ) -> Result<Self> {
        let mut state = QueueState::default();
        if let Some(snapshot) = storage.load_queue()? {
            for entry in snapshot.entries {
                state.next_id = state.next_id.max(entry.id);
                state.entries.insert(entry.id, entry);
            }
            info!("Loaded {} signing queue entries", state.entries.len());
        }

        let queue = Self {
            state: Mutex::new(state),
            storage,
            audit,
            metrics,
        };

        {
            let mut state = queue.state.lock();
            let interrupted = state
                .entries
                .values()
                .any(|e| e.status == QueueStatus::Processing);
            if interrupted {
                queue.update(&mut state, |next, audit| {
                    for entry in next.entries.values_mut() {
                        if entry.status != QueueStatus::Processing {
                            continue;
                        }
                        warn!(
                            "Entry {} for {} was processing at shutdown, returned to pending",
                            entry.id, entry.origin
                        );
                        entry.status = QueueStatus::Pending;
                        entry.started_at = None;
                        audit.push(AuditRecord::new(
                            entry.zone_id,
                            AuditOperation::SignReclaim,
                            format!("entry {} returned to pending at start-up", entry.id),
                            false,
                        ));
                    }
                    Ok(())
                })?;
            }
        }
        Ok(queue)
    }

    fn persist(&self, state: &QueueState) -> Result<()> {
        let entries = state.entries.values().cloned().collect();
        self.storage.save_queue(&QueueSnapshot::new(entries))
    }

    /// Apply `mutate` to a copy of `state`, append the audit records it
    /// staged, persist the copy, then publish it. Any failure leaves `state`
    /// untouched.
    fn update<T>(
        &self,
        state: &mut QueueState,
        mutate: impl FnOnce(&mut QueueState, &mut Vec<AuditRecord>) -> Result<T>,
    ) -> Result<T> {
        let mut next = state.clone();
        let mut records = Vec::new();
        let result = mutate(&mut next, &mut records)?;

        self.audit.append_all(records)?;
        self.persist(&next)?;
        *state = next;
        Ok(result)
    }

    /// Queue a zone for signing. A zone that already has a pending or
    /// processing entry is not queued twice: the existing entry takes the
    /// lower priority and the wider scope.
    pub fn enqueue(&self, request: EnqueueRequest) -> Result<SigningQueueEntry> {
        let reason = request.reason;
        let mut state = self.state.lock();

        let (entry, merged) = self.update(&mut state, |next, audit| {
            if let Some(existing) = next.open_entry_mut(request.zone_id) {
                existing.priority = existing.priority.min(request.priority);
                existing.scope = existing.scope.merge(&request.scope);
                if existing.status == QueueStatus::Processing {
                    existing.rerun = true;
                }
                audit.push(AuditRecord::new(
                    existing.zone_id,
                    AuditOperation::SignEnqueue,
                    format!(
                        "{} request merged into entry {} ({}, priority {})",
                        reason, existing.id, existing.status, existing.priority
                    ),
                    true,
                ));
                return Ok((existing.clone(), true));
            }

            let id = next.allocate_id();
            let entry = SigningQueueEntry {
                id,
                zone_id: request.zone_id,
                origin: request.origin,
                status: QueueStatus::Pending,
                reason,
                scope: request.scope,
                priority: request.priority,
                created_at: Utc::now(),
                started_at: None,
                completed_at: None,
                error_message: None,
                rerun: false,
                attempt: 0,
            };
            audit.push(AuditRecord::new(
                entry.zone_id,
                AuditOperation::SignEnqueue,
                format!(
                    "entry {} queued ({}, scope {}, priority {})",
                    id, entry.reason, entry.scope, entry.priority
                ),
                true,
            ));
            next.entries.insert(id, entry.clone());
            Ok((entry, false))
        })?;

        self.metrics.record_enqueue(reason, merged);
        if merged {
            debug!(
                "Merged {} request for {} into entry {}",
                reason, entry.origin, entry.id
            );
        } else {
            info!(
                "Queued {} for signing (entry {}, {}, priority {})",
                entry.origin, entry.id, entry.reason, entry.priority
            );
        }
        Ok(entry)
    }

    /// Take the highest-priority pending entry (lowest number, FIFO among
    /// equals) and mark it processing. The returned entry is the claim:
    /// pass it back to `settle`, `complete` or `fail`.
    pub fn claim(&self) -> Result<Option<SigningQueueEntry>> {
        let mut state = self.state.lock();

        let Some(id) = state
            .entries
            .values()
            .filter(|e| e.status == QueueStatus::Pending)
            .min_by_key(|e| (e.priority, e.created_at, e.id))
            .map(|e| e.id)
        else {
            return Ok(None);
        };

        let claimed = self.update(&mut state, |next, audit| {
            let entry = next
                .entries
                .get_mut(&id)
                .ok_or_else(|| SignerError::NotFound(format!("queue entry {}", id)))?;
            entry.status = QueueStatus::Processing;
            entry.started_at = Some(Utc::now());
            entry.attempt += 1;
            audit.push(AuditRecord::new(
                entry.zone_id,
                AuditOperation::SignStart,
                format!(
                    "entry {} claimed ({}, attempt {})",
                    id, entry.reason, entry.attempt
                ),
                true,
            ));
            Ok(entry.clone())
        })?;

        debug!(
            "Claimed entry {} for {} (attempt {})",
            id, claimed.origin, claimed.attempt
        );
        Ok(Some(claimed))
    }

    /// Move a checked claim to its final status with the lock held
    fn finish_locked(
        &self,
        state: &mut QueueState,
        id: EntryId,
        to: QueueStatus,
        message: &str,
    ) -> Result<(SigningQueueEntry, Option<SigningQueueEntry>)> {
        self.update(state, |next, audit| {
            let entry = next
                .entries
                .get_mut(&id)
                .ok_or_else(|| SignerError::NotFound(format!("queue entry {}", id)))?;
            entry.status = to;
            entry.completed_at = Some(Utc::now());
            entry.error_message = (to == QueueStatus::Failed).then(|| message.to_string());
            let rerun = std::mem::take(&mut entry.rerun);
            let finished = entry.clone();

            let (operation, success) = match to {
                QueueStatus::Failed => (AuditOperation::SignFail, false),
                _ => (AuditOperation::SignComplete, true),
            };
            audit.push(AuditRecord::new(
                finished.zone_id,
                operation,
                format!("entry {}: {}", id, message),
                success,
            ));

            // Work merged in while signing gets a fresh entry
            let follow_up = if rerun {
                let follow_id = next.allocate_id();
                let follow = SigningQueueEntry {
                    id: follow_id,
                    zone_id: finished.zone_id,
                    origin: finished.origin.clone(),
                    status: QueueStatus::Pending,
                    reason: finished.reason,
                    scope: finished.scope.clone(),
                    priority: finished.priority,
                    created_at: Utc::now(),
                    started_at: None,
                    completed_at: None,
                    error_message: None,
                    rerun: false,
                    attempt: 0,
                };
                audit.push(AuditRecord::new(
                    follow.zone_id,
                    AuditOperation::SignEnqueue,
                    format!(
                        "entry {} queued for changes made while entry {} was processing",
                        follow_id, id
                    ),
                    true,
                ));
                next.entries.insert(follow_id, follow.clone());
                Some(follow)
            } else {
                None
            };
            Ok((finished, follow_up))
        })
    }

    /// Finish a claimed entry. `publish` runs while the claim is checked
    /// and held, so a reclaimed claim never publishes: `Ok(message)`
    /// completes the entry, `Err` fails it with the error's text.
    pub fn settle(
        &self,
        claim: &SigningQueueEntry,
        publish: impl FnOnce() -> Result<String>,
    ) -> Result<SigningQueueEntry> {
        let mut state = self.state.lock();
        state.check_claim(claim, QueueStatus::Completed)?;

        let (to, message) = match publish() {
            Ok(message) => (QueueStatus::Completed, message),
            Err(e) => (QueueStatus::Failed, e.to_string()),
        };
        let (entry, follow_up) = self.finish_locked(&mut state, claim.id, to, &message)?;
        drop(state);

        match to {
            QueueStatus::Failed => warn!(
                "Signing entry {} for {} failed: {}",
                entry.id, entry.origin, message
            ),
            _ => info!(
                "Completed signing entry {} for {}: {}",
                entry.id, entry.origin, message
            ),
        }
        if let Some(follow) = follow_up {
            debug!("Re-queued {} as entry {}", follow.origin, follow.id);
        }
        Ok(entry)
    }

    /// `processing -> completed`
    pub fn complete(&self, claim: &SigningQueueEntry, message: &str) -> Result<SigningQueueEntry> {
        self.settle(claim, || Ok(message.to_string()))
    }

    /// `processing -> failed`, recording the error message
    pub fn fail(&self, claim: &SigningQueueEntry, error_message: &str) -> Result<SigningQueueEntry> {
        let mut state = self.state.lock();
        state.check_claim(claim, QueueStatus::Failed)?;
        let (entry, _) =
            self.finish_locked(&mut state, claim.id, QueueStatus::Failed, error_message)?;
        drop(state);

        warn!(
            "Signing entry {} for {} failed: {}",
            entry.id, entry.origin, error_message
        );
        Ok(entry)
    }

    /// Remove all pending entries for a zone. Processing entries are left to
    /// drain, but will not be re-queued.
    pub fn purge(&self, zone_id: ZoneId) -> Result<Vec<SigningQueueEntry>> {
        let mut state = self.state.lock();

        let purged = self.update(&mut state, |next, audit| {
            let ids: Vec<EntryId> = next
                .entries
                .values()
                .filter(|e| e.zone_id == zone_id && e.status == QueueStatus::Pending)
                .map(|e| e.id)
                .collect();
            let purged: Vec<SigningQueueEntry> = ids
                .iter()
                .filter_map(|id| next.entries.remove(id))
                .collect();
            for entry in next.entries.values_mut() {
                if entry.zone_id == zone_id && entry.status == QueueStatus::Processing {
                    entry.rerun = false;
                }
            }
            for entry in &purged {
                audit.push(AuditRecord::new(
                    zone_id,
                    AuditOperation::SignCancel,
                    format!("entry {} cancelled ({})", entry.id, entry.reason),
                    true,
                ));
            }
            Ok(purged)
        })?;

        if !purged.is_empty() {
            self.metrics.record_cancelled(purged.len());
            info!("Purged {} pending entries for zone {}", purged.len(), zone_id);
        }
        Ok(purged)
    }

    /// Return entries stuck in `processing` longer than `threshold` to
    /// `pending`. The interrupted claim is no longer valid afterwards.
    pub fn reclaim_stale(&self, threshold: Duration) -> Result<Vec<SigningQueueEntry>> {
        let Some(cutoff) = chrono::Duration::from_std(threshold)
            .ok()
            .and_then(|threshold| Utc::now().checked_sub_signed(threshold))
        else {
            return Ok(Vec::new());
        };
        let is_stale = |e: &SigningQueueEntry| {
            e.status == QueueStatus::Processing
                && e.started_at.is_some_and(|started| started <= cutoff)
        };

        let mut state = self.state.lock();
        if !state.entries.values().any(is_stale) {
            return Ok(Vec::new());
        }

        let reclaimed = self.update(&mut state, |next, audit| {
            let mut reclaimed = Vec::new();
            for entry in next.entries.values_mut() {
                if !is_stale(entry) {
                    continue;
                }
                entry.status = QueueStatus::Pending;
                entry.started_at = None;
                audit.push(AuditRecord::new(
                    entry.zone_id,
                    AuditOperation::SignReclaim,
                    format!(
                        "entry {} exceeded {}s processing timeout, returned to pending",
                        entry.id,
                        threshold.as_secs()
                    ),
                    false,
                ));
                reclaimed.push(entry.clone());
            }
            Ok(reclaimed)
        })?;

        for entry in &reclaimed {
            warn!(
                "Reclaimed entry {} for {} after exceeding the {}s processing timeout",
                entry.id,
                entry.origin,
                threshold.as_secs()
            );
        }
        self.metrics.record_reclaimed(reclaimed.len());
        Ok(reclaimed)
    }

    /// Operator re-enqueue of a failed entry. Creates a fresh entry (or
    /// merges into the zone's open entry); the failed entry is kept.
    pub fn retry(&self, id: EntryId, priority: Option<i32>) -> Result<SigningQueueEntry> {
        let failed = self
            .get(id)
            .ok_or_else(|| SignerError::NotFound(format!("queue entry {}", id)))?;
        if failed.status != QueueStatus::Failed {
            return Err(SignerError::InvalidTransition {
                id,
                from: failed.status.as_str(),
                to: QueueStatus::Pending.as_str(),
            });
        }

        self.enqueue(EnqueueRequest {
            zone_id: failed.zone_id,
            origin: failed.origin,
            reason: failed.reason,
            scope: failed.scope,
            priority: priority.unwrap_or(failed.priority),
        })
    }

    pub fn get(&self, id: EntryId) -> Option<SigningQueueEntry> {
        self.state.lock().entries.get(&id).cloned()
    }

    /// The zone's pending or processing entry, if any
    pub fn open_entry(&self, zone_id: ZoneId) -> Option<SigningQueueEntry> {
        self.state
            .lock()
            .entries
            .values()
            .find(|e| e.zone_id == zone_id && e.status.is_open())
            .cloned()
    }

    pub fn has_open_work(&self, zone_id: ZoneId) -> bool {
        self.open_entry(zone_id).is_some()
    }

    /// Entries for display: open work first in service order, then finished
    /// entries newest first
    pub fn list(&self, zone_id: Option<ZoneId>) -> Vec<SigningQueueEntry> {
        let state = self.state.lock();
        let mut entries: Vec<SigningQueueEntry> = state
            .entries
            .values()
            .filter(|e| zone_id.is_none_or(|z| e.zone_id == z))
            .cloned()
            .collect();

        entries.sort_by(|a, b| match (a.status.is_open(), b.status.is_open()) {
            (true, false) => std::cmp::Ordering::Less,
            (false, true) => std::cmp::Ordering::Greater,
            (true, true) => (a.priority, a.created_at, a.id).cmp(&(b.priority, b.created_at, b.id)),
            (false, false) => (b.created_at, b.id).cmp(&(a.created_at, a.id)),
        });
        entries
    }

    pub fn status_counts(&self) -> Vec<(QueueStatus, usize)> {
        let state = self.state.lock();
        [
            QueueStatus::Pending,
            QueueStatus::Processing,
            QueueStatus::Completed,
            QueueStatus::Failed,
        ]
        .into_iter()
        .map(|status| {
            let count = state.entries.values().filter(|e| e.status == status).count();
            (status, count)
        })
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn queue() -> SigningQueue {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let audit = Arc::new(AuditLog::open(storage.clone()).unwrap());
        SigningQueue::open(storage, audit, Arc::new(SignerMetrics::new().unwrap())).unwrap()
    }

    fn request(zone_id: ZoneId, priority: i32) -> EnqueueRequest {
        EnqueueRequest::full(
            zone_id,
            &format!("zone{}.example.", zone_id),
            SigningReason::Manual,
            priority,
        )
    }

    #[test]
    fn test_claim_order_priority_then_fifo() {
        let queue = queue();
        let a = queue.enqueue(request(1, 10)).unwrap();
        let b = queue.enqueue(request(2, 5)).unwrap();
        let c = queue.enqueue(request(3, 10)).unwrap();

        assert_eq!(queue.claim().unwrap().unwrap().id, b.id);
        assert_eq!(queue.claim().unwrap().unwrap().id, a.id);
        assert_eq!(queue.claim().unwrap().unwrap().id, c.id);
        assert!(queue.claim().unwrap().is_none());
    }

    #[test]
    fn test_complete_requires_processing() {
        let queue = queue();
        let entry = queue.enqueue(request(1, 10)).unwrap();
        let err = queue.complete(&entry, "done").unwrap_err();
        assert_eq!(
            err,
            SignerError::InvalidTransition {
                id: entry.id,
                from: "pending",
                to: "completed"
            }
        );

        let claim = queue.claim().unwrap().unwrap();
        assert_eq!(claim.attempt, 1);
        let done = queue.complete(&claim, "done").unwrap();
        assert_eq!(done.status, QueueStatus::Completed);
        assert!(done.completed_at.is_some());
        assert!(queue.fail(&claim, "late").is_err());
    }

    #[test]
    fn test_merge_into_processing_sets_rerun() {
        let queue = queue();
        let entry = queue
            .enqueue(request(1, 10).with_scope(SigningScope::rrset("a.zone1.example.", 1)))
            .unwrap();
        let claim = queue.claim().unwrap().unwrap();

        let merged = queue
            .enqueue(request(1, 3).with_scope(SigningScope::rrset("b.zone1.example.", 1)))
            .unwrap();
        assert_eq!(merged.id, entry.id);
        assert_eq!(merged.status, QueueStatus::Processing);
        assert_eq!(merged.priority, 3);
        assert_eq!(merged.scope, SigningScope::Full);
        assert!(merged.rerun);

        queue.complete(&claim, "done").unwrap();
        let follow = queue.open_entry(1).unwrap();
        assert_ne!(follow.id, entry.id);
        assert_eq!(follow.status, QueueStatus::Pending);
        assert_eq!(follow.priority, 3);
    }

    #[test]
    fn test_purge_removes_pending_only() {
        let queue = queue();
        let processing = queue.enqueue(request(1, 1)).unwrap();
        queue.claim().unwrap();
        queue.enqueue(request(1, 1)).unwrap(); // merges, sets rerun
        queue.enqueue(request(2, 1)).unwrap();

        assert!(queue.purge(1).unwrap().is_empty());
        let still = queue.get(processing.id).unwrap();
        assert_eq!(still.status, QueueStatus::Processing);
        assert!(!still.rerun);

        assert_eq!(queue.purge(2).unwrap().len(), 1);
        assert!(queue.open_entry(2).is_none());
    }

    #[test]
    fn test_reclaim_stale() {
        let queue = queue();
        let entry = queue.enqueue(request(1, 1)).unwrap();
        queue.claim().unwrap();

        assert!(queue.reclaim_stale(Duration::from_secs(3600)).unwrap().is_empty());
        let reclaimed = queue.reclaim_stale(Duration::ZERO).unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(queue.get(entry.id).unwrap().status, QueueStatus::Pending);
        assert_eq!(queue.claim().unwrap().unwrap().id, entry.id);
    }

    #[test]
    fn test_reclaimed_claim_cannot_finish() {
        let queue = queue();
        queue.enqueue(request(1, 1)).unwrap();
        let first = queue.claim().unwrap().unwrap();
        queue.reclaim_stale(Duration::ZERO).unwrap();

        // Reclaimed but not yet handed out again
        assert!(matches!(
            queue.complete(&first, "late"),
            Err(SignerError::ClaimLost { attempt: 1, .. })
        ));

        let second = queue.claim().unwrap().unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.attempt, 2);

        let mut published = false;
        let err = queue
            .settle(&first, || {
                published = true;
                Ok("late".to_string())
            })
            .unwrap_err();
        assert!(matches!(err, SignerError::ClaimLost { .. }));
        assert!(!published);
        assert!(queue.fail(&first, "late").is_err());

        let done = queue.complete(&second, "done").unwrap();
        assert_eq!(done.status, QueueStatus::Completed);
    }

    #[test]
    fn test_settle_error_fails_entry() {
        let queue = queue();
        queue.enqueue(request(1, 1)).unwrap();
        let claim = queue.claim().unwrap().unwrap();

        let failed = queue
            .settle(&claim, || Err(SignerError::Storage("disk full".to_string())))
            .unwrap();
        assert_eq!(failed.status, QueueStatus::Failed);
        assert!(failed.error_message.unwrap().contains("disk full"));
    }

    #[test]
    fn test_retry_failed_entry_creates_fresh_entry() {
        let queue = queue();
        let entry = queue.enqueue(request(1, 7)).unwrap();
        assert!(queue.retry(entry.id, None).is_err());

        let claim = queue.claim().unwrap().unwrap();
        queue.fail(&claim, "boom").unwrap();
        let retried = queue.retry(entry.id, None).unwrap();
        assert_ne!(retried.id, entry.id);
        assert_eq!(retried.priority, 7);
        assert_eq!(queue.get(entry.id).unwrap().status, QueueStatus::Failed);
    }

    #[test]
    fn test_processing_entries_recovered_on_open() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let audit = Arc::new(AuditLog::open(storage.clone()).unwrap());
        let metrics = Arc::new(SignerMetrics::new().unwrap());
        {
            let queue = SigningQueue::open(storage.clone(), audit.clone(), metrics.clone()).unwrap();
            queue.enqueue(request(1, 1)).unwrap();
            queue.claim().unwrap();
        }

        let queue = SigningQueue::open(storage, audit.clone(), metrics).unwrap();
        assert_eq!(queue.open_entry(1).unwrap().status, QueueStatus::Pending);
        let next = queue.enqueue(request(2, 1)).unwrap();
        assert_eq!(next.id, 2);
        assert_eq!(
            audit.read(Some(1), 0, 10).last().unwrap().operation,
            AuditOperation::SignReclaim
        );
    }
}
