//! Shared fixtures for the zonesign integration tests

#![allow(dead_code)] // Not every test file uses every helper

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use zonesign::config::SignerConfig;
use zonesign::dnssec::{
    CryptoProvider, DnsSecAlgorithm, KeySealer, RrSet, SystemCryptoProvider, rtype, wire,
};
use zonesign::engine::SigningEngine;
use zonesign::error::{Result, SignerError};
use zonesign::keystore::EnableRequest;
use zonesign::model::{AuditLogEntry, NsecMode, Zone};
use zonesign::records::MemoryRecordSource;
use zonesign::storage::{KeyStoreSnapshot, MemoryStorage, QueueSnapshot, Storage};

pub const ORIGIN: &str = "example.com.";

/// Configuration suited to in-process tests: one worker, no jitter
pub fn test_config() -> SignerConfig {
    SignerConfig {
        http_bind_addr: None,
        worker_count: 1,
        poll_interval_ms: 10,
        signature_jitter_secs: 0,
        ..Default::default()
    }
}

pub struct TestEngine {
    pub engine: Arc<SigningEngine>,
    pub records: Arc<MemoryRecordSource>,
}

/// Engine backed by in-memory storage
pub fn test_engine() -> TestEngine {
    engine_with_storage(Arc::new(MemoryStorage::new()), KeySealer::ephemeral().unwrap())
}

pub fn engine_with_storage(storage: Arc<dyn Storage>, sealer: KeySealer) -> TestEngine {
    let records = Arc::new(MemoryRecordSource::new());
    let crypto: Arc<dyn CryptoProvider> = Arc::new(SystemCryptoProvider::new());
    let engine = SigningEngine::with_components(
        test_config(),
        storage,
        records.clone(),
        crypto,
        sealer,
    )
    .unwrap();
    TestEngine {
        engine: Arc::new(engine),
        records,
    }
}

/// In-memory storage whose writes can be made to fail
#[derive(Default)]
pub struct FlakyStorage {
    inner: MemoryStorage,
    pub fail_keystore: AtomicBool,
    pub fail_audit: AtomicBool,
}

impl FlakyStorage {
    fn check(flag: &AtomicBool) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(SignerError::Storage("disk full".to_string()));
        }
        Ok(())
    }

    pub fn set_fail_keystore(&self, fail: bool) {
        self.fail_keystore.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_audit(&self, fail: bool) {
        self.fail_audit.store(fail, Ordering::SeqCst);
    }
}

impl Storage for FlakyStorage {
    fn save_keystore(&self, snapshot: &KeyStoreSnapshot) -> Result<()> {
        Self::check(&self.fail_keystore)?;
        self.inner.save_keystore(snapshot)
    }

    fn load_keystore(&self) -> Result<Option<KeyStoreSnapshot>> {
        self.inner.load_keystore()
    }

    fn save_queue(&self, snapshot: &QueueSnapshot) -> Result<()> {
        self.inner.save_queue(snapshot)
    }

    fn load_queue(&self) -> Result<Option<QueueSnapshot>> {
        self.inner.load_queue()
    }

    fn append_audit(&self, entry: &AuditLogEntry) -> Result<()> {
        Self::check(&self.fail_audit)?;
        self.inner.append_audit(entry)
    }

    fn load_audit(&self) -> Result<Vec<AuditLogEntry>> {
        self.inner.load_audit()
    }
}

/// Engine over storage that tests can break on demand
pub fn flaky_engine() -> (TestEngine, Arc<FlakyStorage>) {
    let storage = Arc::new(FlakyStorage::default());
    let t = engine_with_storage(storage.clone(), KeySealer::ephemeral().unwrap());
    (t, storage)
}

/// A small zone with a delegation and glue
pub fn example_rrsets() -> Vec<RrSet> {
    let mut soa = wire::name_to_wire("ns1.example.com.");
    soa.extend(wire::name_to_wire("hostmaster.example.com."));
    for field in [2024010101u32, 7200, 3600, 1209600, 3600] {
        soa.extend_from_slice(&field.to_be_bytes());
    }

    vec![
        RrSet::new(ORIGIN, rtype::SOA, 3600).with_rdata(soa),
        RrSet::new(ORIGIN, rtype::NS, 3600)
            .with_rdata(wire::name_to_wire("ns1.example.com."))
            .with_rdata(wire::name_to_wire("ns2.example.com.")),
        RrSet::new("ns1.example.com.", rtype::A, 3600).with_rdata(vec![192, 0, 2, 53]),
        RrSet::new("ns2.example.com.", rtype::A, 3600).with_rdata(vec![192, 0, 2, 54]),
        RrSet::new("www.example.com.", rtype::A, 300)
            .with_rdata(vec![192, 0, 2, 1])
            .with_rdata(vec![192, 0, 2, 2]),
        RrSet::new("sub.example.com.", rtype::NS, 3600)
            .with_rdata(wire::name_to_wire("ns.sub.example.com.")),
        RrSet::new("sub.example.com.", rtype::DS, 3600).with_rdata(vec![0x30, 0x39, 13, 2, 0xab]),
        RrSet::new("ns.sub.example.com.", rtype::A, 3600).with_rdata(vec![192, 0, 2, 99]),
    ]
}

/// Provision and enable a zone
pub fn enabled_zone(engine: &SigningEngine, origin: &str, nsec_mode: NsecMode, auto_sign: bool) -> Zone {
    let zone = engine.keystore().provision_zone(origin).unwrap();
    engine
        .keystore()
        .enable_dnssec(
            zone.id,
            EnableRequest::new(DnsSecAlgorithm::EcdsaP256Sha256, nsec_mode, auto_sign),
        )
        .unwrap()
}

/// Enabled zone with one active KSK and one active ZSK
pub fn signable_zone(engine: &SigningEngine, origin: &str, nsec_mode: NsecMode, auto_sign: bool) -> Zone {
    let zone = enabled_zone(engine, origin, nsec_mode, auto_sign);
    let keystore = engine.keystore();
    keystore
        .generate_key(zone.id, DnsSecAlgorithm::EcdsaP256Sha256, true, None)
        .unwrap();
    keystore
        .generate_key(zone.id, DnsSecAlgorithm::EcdsaP256Sha256, false, None)
        .unwrap();
    keystore.zone(zone.id).unwrap()
}
