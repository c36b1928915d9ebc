mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use common::{ORIGIN, enabled_zone, flaky_engine, signable_zone, test_engine};
use zonesign::SignerError;
use zonesign::dnssec::DnsSecAlgorithm;
use zonesign::model::{AuditOperation, NsecMode, QueueStatus, SigningReason, Zone};
use zonesign::queue::EnqueueRequest;

#[test]
fn test_manual_sign_lifecycle() {
    let t = test_engine();
    let engine = &t.engine;
    let zone = signable_zone(engine, ORIGIN, NsecMode::Nsec3, true);
    assert_eq!(zone.preferred_algorithm, Some(DnsSecAlgorithm::EcdsaP256Sha256));

    let queued = engine
        .queue()
        .enqueue(EnqueueRequest::full(
            zone.id,
            &zone.origin,
            SigningReason::Manual,
            5,
        ))
        .unwrap();

    let claimed = engine.queue().claim().unwrap().unwrap();
    assert_eq!(claimed.id, queued.id);
    assert_eq!(claimed.status, QueueStatus::Processing);
    assert!(claimed.started_at.is_some());

    let completed = engine.queue().complete(&claimed, "signed").unwrap();
    assert_eq!(completed.status, QueueStatus::Completed);
    assert!(completed.completed_at.is_some());

    let logs = engine.audit().read(Some(zone.id), 0, 100);
    let last = logs.last().unwrap();
    assert_eq!(last.operation, AuditOperation::SignComplete);
    assert!(last.success);
}

#[test]
fn test_enqueue_twice_keeps_one_entry_with_lowest_priority() {
    let t = test_engine();
    let zone = signable_zone(&t.engine, ORIGIN, NsecMode::Nsec, false);
    let queue = t.engine.queue();

    let first = queue
        .enqueue(EnqueueRequest::full(zone.id, ORIGIN, SigningReason::ScheduledRefresh, 30))
        .unwrap();
    let second = queue
        .enqueue(EnqueueRequest::full(zone.id, ORIGIN, SigningReason::Manual, 5))
        .unwrap();
    let third = queue
        .enqueue(EnqueueRequest::full(zone.id, ORIGIN, SigningReason::RecordChange, 20))
        .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(second.id, third.id);
    assert_eq!(third.priority, 5);
    assert_eq!(queue.list(Some(zone.id)).len(), 1);
}

#[test]
fn test_claim_is_exclusive_under_contention() {
    let t = test_engine();
    let zone = signable_zone(&t.engine, ORIGIN, NsecMode::Nsec, false);
    t.engine
        .queue()
        .enqueue(EnqueueRequest::full(zone.id, ORIGIN, SigningReason::Manual, 10))
        .unwrap();

    let queue = t.engine.queue().clone();
    let winners: Vec<u64> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let queue = Arc::clone(&queue);
                s.spawn(move || queue.claim().unwrap().map(|e| e.id))
            })
            .collect();
        handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect()
    });

    assert_eq!(winners.len(), 1);
}

#[test]
fn test_claims_across_zones_are_distinct() {
    let t = test_engine();
    let zones: Vec<_> = ["a.example.", "b.example.", "c.example."]
        .iter()
        .map(|origin| signable_zone(&t.engine, origin, NsecMode::Nsec, false))
        .collect();
    for zone in &zones {
        t.engine.request_sign(zone.id, None).unwrap();
    }

    let queue = t.engine.queue().clone();
    let claimed: Vec<u64> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let queue = Arc::clone(&queue);
                s.spawn(move || queue.claim().unwrap().map(|e| e.id))
            })
            .collect();
        handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect()
    });

    assert_eq!(claimed.len(), 3);
    assert_eq!(claimed.iter().collect::<HashSet<_>>().len(), 3);
}

#[test]
fn test_last_key_cannot_be_deactivated_while_work_is_queued() {
    let t = test_engine();
    let zone = signable_zone(&t.engine, ORIGIN, NsecMode::Nsec3, false);
    let ksk = t
        .engine
        .keystore()
        .active_keys(zone.id)
        .into_iter()
        .find(|k| k.is_ksk)
        .unwrap();

    t.engine.request_sign(zone.id, None).unwrap();
    let claim = t.engine.queue().claim().unwrap().unwrap();
    assert_eq!(
        t.engine.keystore().deactivate_key(ksk.id).unwrap_err(),
        SignerError::KeyInUse(ksk.id)
    );

    t.engine.queue().fail(&claim, "aborted by test").unwrap();
    assert!(!t.engine.keystore().deactivate_key(ksk.id).unwrap().active);
}

#[test]
fn test_disable_leaves_history_but_no_pending_work() {
    let t = test_engine();
    let zone = signable_zone(&t.engine, ORIGIN, NsecMode::Nsec3, false);

    let done = t.engine.request_sign(zone.id, None).unwrap();
    let claim = t.engine.queue().claim().unwrap().unwrap();
    t.engine.queue().complete(&claim, "signed").unwrap();
    t.engine.request_sign(zone.id, Some(3)).unwrap();

    let outcome = t.engine.keystore().disable_dnssec(zone.id).unwrap();
    assert_eq!(outcome.cancelled_entries.len(), 1);

    let view = t.engine.keystore().zone_view(zone.id).unwrap();
    assert!(!view.zone.dnssec_enabled);
    assert_eq!(view.active_key_count, 0);

    let entries = t.engine.queue().list(Some(zone.id));
    assert!(entries.iter().all(|e| e.status != QueueStatus::Pending));
    assert!(entries
        .iter()
        .any(|e| e.id == done.id && e.status == QueueStatus::Completed));
    assert_eq!(t.engine.keystore().keys(zone.id).len(), 2);
}

#[test]
fn test_rsa_key_below_minimum_size_is_rejected() {
    let t = test_engine();
    let zone = enabled_zone(&t.engine, ORIGIN, NsecMode::Nsec, false);

    let err = t
        .engine
        .keystore()
        .generate_key(zone.id, DnsSecAlgorithm::RsaSha256, true, Some(1024))
        .unwrap_err();
    assert!(matches!(err, SignerError::InvalidKeySize(_)));
    assert!(t.engine.keystore().keys(zone.id).is_empty());
}

#[test]
fn test_request_sign_requires_enabled_zone() {
    let t = test_engine();
    let zone = t.engine.keystore().provision_zone(ORIGIN).unwrap();
    assert!(matches!(
        t.engine.request_sign(zone.id, None).unwrap_err(),
        SignerError::NotEnabled(_)
    ));
    assert!(matches!(
        t.engine.request_sign(999, None).unwrap_err(),
        SignerError::ZoneNotFound(_)
    ));
}

#[test]
fn test_retry_creates_fresh_entry() {
    let t = test_engine();
    let zone = signable_zone(&t.engine, ORIGIN, NsecMode::Nsec, false);
    let entry = t.engine.request_sign(zone.id, None).unwrap();
    let claim = t.engine.queue().claim().unwrap().unwrap();
    t.engine.queue().fail(&claim, "boom").unwrap();

    let retried = t.engine.queue().retry(entry.id, Some(2)).unwrap();
    assert_ne!(retried.id, entry.id);
    assert_eq!(retried.status, QueueStatus::Pending);
    assert_eq!(retried.priority, 2);
    assert_eq!(
        t.engine.queue().get(entry.id).unwrap().status,
        QueueStatus::Failed
    );

    assert!(matches!(
        t.engine.queue().retry(retried.id, None).unwrap_err(),
        SignerError::InvalidTransition { .. }
    ));
}

#[test]
fn test_retry_rejected_once_zone_is_disabled() {
    let t = test_engine();
    let zone = signable_zone(&t.engine, ORIGIN, NsecMode::Nsec, false);
    let entry = t.engine.request_sign(zone.id, None).unwrap();
    let claim = t.engine.queue().claim().unwrap().unwrap();
    t.engine.queue().fail(&claim, "boom").unwrap();

    t.engine.keystore().disable_dnssec(zone.id).unwrap();
    assert!(matches!(
        t.engine.retry_entry(entry.id, None).unwrap_err(),
        SignerError::NotEnabled(_)
    ));
    assert!(t.engine.queue().open_entry(zone.id).is_none());
    assert!(matches!(
        t.engine.retry_entry(999, None).unwrap_err(),
        SignerError::NotFound(_)
    ));
}

#[test]
fn test_request_sign_waits_for_zone_lock() {
    let t = test_engine();
    let zone_id = signable_zone(&t.engine, ORIGIN, NsecMode::Nsec, false).id;
    let engine = &t.engine;

    std::thread::scope(|s| {
        let requester = engine.keystore().with_zone_lock(zone_id, || {
            let requester = s.spawn(move || engine.request_sign(zone_id, None));
            std::thread::sleep(Duration::from_millis(100));
            assert!(!requester.is_finished());
            assert!(engine.queue().open_entry(zone_id).is_none());
            requester
        });
        let entry = requester.join().unwrap().unwrap();
        assert_eq!(entry.status, QueueStatus::Pending);
    });
}

#[test]
fn test_disable_racing_requests_leaves_no_pending_work() {
    let t = test_engine();
    let zones: Vec<Zone> = (0..16)
        .map(|i| {
            signable_zone(
                &t.engine,
                &format!("zone{}.example.", i),
                NsecMode::Nsec,
                false,
            )
        })
        .collect();

    let engine = &t.engine;
    std::thread::scope(|s| {
        for zone in &zones {
            s.spawn(move || {
                let _ = engine.request_sign(zone.id, None);
            });
            s.spawn(move || {
                engine.keystore().disable_dnssec(zone.id).unwrap();
            });
        }
    });

    for zone in &zones {
        assert!(!t.engine.keystore().zone(zone.id).unwrap().dnssec_enabled);
        assert!(t.engine.queue().open_entry(zone.id).is_none());
    }
}

#[test]
fn test_failed_audit_write_leaves_state_unchanged() {
    let (t, storage) = flaky_engine();
    let zone = signable_zone(&t.engine, ORIGIN, NsecMode::Nsec, false);
    let other = signable_zone(&t.engine, "example.org.", NsecMode::Nsec, false);
    let pending = t.engine.request_sign(zone.id, None).unwrap();
    let audited = t.engine.audit().count(None);

    storage.set_fail_audit(true);
    assert!(matches!(
        t.engine.request_sign(other.id, None).unwrap_err(),
        SignerError::Storage(_)
    ));
    assert!(t.engine.queue().open_entry(other.id).is_none());

    // A merge is not applied without its audit entry either
    assert!(t.engine.request_sign(zone.id, Some(1)).is_err());
    assert_eq!(
        t.engine.queue().get(pending.id).unwrap().priority,
        pending.priority
    );
    assert!(t.engine.queue().claim().is_err());
    assert_eq!(
        t.engine.queue().get(pending.id).unwrap().status,
        QueueStatus::Pending
    );

    // Disable is all or nothing
    assert!(t.engine.keystore().disable_dnssec(zone.id).is_err());
    assert!(t.engine.keystore().zone(zone.id).unwrap().dnssec_enabled);
    assert_eq!(t.engine.keystore().active_key_count(zone.id), 2);
    assert!(t.engine.queue().open_entry(zone.id).is_some());
    assert_eq!(t.engine.audit().count(None), audited);

    storage.set_fail_audit(false);
    let outcome = t.engine.keystore().disable_dnssec(zone.id).unwrap();
    assert_eq!(outcome.deactivated_keys.len(), 2);
    assert_eq!(outcome.cancelled_entries.len(), 1);
}
