mod common;

use std::sync::Arc;

use common::{ORIGIN, engine_with_storage, signable_zone};
use tempfile::TempDir;
use zonesign::dnssec::KeySealer;
use zonesign::model::{AuditOperation, NsecMode, QueueStatus};
use zonesign::storage::{FileStorage, Storage};

const MASTER_KEY: [u8; 32] = [7; 32];

fn open(dir: &TempDir) -> common::TestEngine {
    let storage: Arc<dyn Storage> = Arc::new(FileStorage::open(dir.path(), true).unwrap());
    engine_with_storage(storage, KeySealer::new(&MASTER_KEY).unwrap())
}

#[test]
fn test_state_survives_restart() {
    let dir = TempDir::new().unwrap();

    let (zone_id, entry_id, key_ids) = {
        let t = open(&dir);
        let zone = signable_zone(&t.engine, ORIGIN, NsecMode::Nsec3, false);
        let entry = t.engine.request_sign(zone.id, Some(5)).unwrap();
        // Crash while the entry is being signed
        t.engine.queue().claim().unwrap().unwrap();
        let key_ids: Vec<u64> = t.engine.keystore().keys(zone.id).iter().map(|k| k.id).collect();
        (zone.id, entry.id, key_ids)
    };

    let t = open(&dir);
    let zone = t.engine.keystore().zone(zone_id).unwrap();
    assert!(zone.dnssec_enabled);
    assert_eq!(zone.origin, ORIGIN);

    let keys = t.engine.keystore().keys(zone_id);
    assert_eq!(keys.iter().map(|k| k.id).collect::<Vec<_>>(), key_ids);
    for key in &keys {
        assert!(!t.engine.keystore().private_key(key).unwrap().is_empty());
    }

    // Interrupted work is back in the queue
    let entry = t.engine.queue().get(entry_id).unwrap();
    assert_eq!(entry.status, QueueStatus::Pending);
    assert_eq!(entry.priority, 5);
    // The claim handed out before the restart is not honoured
    assert_eq!(entry.attempt, 1);

    let logs = t.engine.audit().read(Some(zone_id), 0, 1000);
    assert!(logs.iter().any(|l| l.operation == AuditOperation::SignReclaim));
    assert!(logs.iter().any(|l| l.operation == AuditOperation::Enable));

    // Ids keep counting from where they left off
    let other = t.engine.keystore().provision_zone("example.org").unwrap();
    assert!(other.id > zone_id);
}

#[test]
fn test_wrong_master_key_cannot_open_private_keys() {
    let dir = TempDir::new().unwrap();
    let zone_id = {
        let t = open(&dir);
        signable_zone(&t.engine, ORIGIN, NsecMode::Nsec, false).id
    };

    let storage: Arc<dyn Storage> = Arc::new(FileStorage::open(dir.path(), true).unwrap());
    let t = engine_with_storage(storage, KeySealer::new(&[9; 32]).unwrap());
    let key = t.engine.keystore().keys(zone_id).remove(0);
    assert!(t.engine.keystore().private_key(&key).is_err());
}
