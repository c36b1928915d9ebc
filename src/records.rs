//! Zone contents consumed by the signer and the signatures it produces.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use crate::dnssec::{RrSet, Rrsig, rtype, wire};
use crate::error::{Result, SignerError};
use crate::model::ZoneId;

/// Record types the signer produces itself; copies coming from a record
/// source are ignored
pub const SIGNER_OWNED_TYPES: [u16; 5] = [
    rtype::DNSKEY,
    rtype::RRSIG,
    rtype::NSEC,
    rtype::NSEC3,
    rtype::NSEC3PARAM,
];

/// Provides the RRsets of a zone to be signed
pub trait RecordSource: Send + Sync {
    fn rrsets(&self, origin: &str) -> Result<Vec<RrSet>>;
}

/// Record source holding zone contents in memory
#[derive(Default)]
pub struct MemoryRecordSource {
    /// RRsets indexed by zone origin (lowercase, fully qualified)
    zones: Arc<RwLock<HashMap<String, Vec<RrSet>>>>,
}

impl MemoryRecordSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the contents of a zone
    pub fn set_rrsets(&self, origin: &str, rrsets: Vec<RrSet>) {
        let origin = wire::fqdn(origin);
        info!("Loaded {} RRsets for {}", rrsets.len(), origin);
        self.zones.write().insert(origin, rrsets);
    }

    /// Insert or replace one RRset
    pub fn upsert_rrset(&self, origin: &str, mut rrset: RrSet) {
        rrset.name = wire::fqdn(&rrset.name);
        let mut zones = self.zones.write();
        let rrsets = zones.entry(wire::fqdn(origin)).or_default();
        match rrsets
            .iter_mut()
            .find(|r| r.name == rrset.name && r.rtype == rrset.rtype)
        {
            Some(existing) => *existing = rrset,
            None => rrsets.push(rrset),
        }
    }

    pub fn remove_rrset(&self, origin: &str, name: &str, rtype: u16) -> bool {
        let name = wire::fqdn(name);
        let mut zones = self.zones.write();
        let Some(rrsets) = zones.get_mut(&wire::fqdn(origin)) else {
            return false;
        };
        let before = rrsets.len();
        rrsets.retain(|r| !(r.name == name && r.rtype == rtype));
        rrsets.len() != before
    }
}

impl RecordSource for MemoryRecordSource {
    fn rrsets(&self, origin: &str) -> Result<Vec<RrSet>> {
        let origin = wire::fqdn(origin);
        self.zones
            .read()
            .get(&origin)
            .cloned()
            .ok_or_else(|| SignerError::RecordSource(format!("no records for zone {}", origin)))
    }
}

/// Signed output for one zone
#[derive(Debug, Clone, Default, Serialize)]
pub struct SignedZone {
    pub signed_at: Option<DateTime<Utc>>,
    pub dnskey: Option<RrSet>,
    pub denial: Vec<RrSet>,
    /// RRSIGs keyed by (owner, covered type)
    #[serde(skip)]
    pub signatures: BTreeMap<(String, u16), Vec<Rrsig>>,
}

impl SignedZone {
    pub fn signature_count(&self) -> usize {
        self.signatures.values().map(Vec::len).sum()
    }

    pub fn rrsigs(&self) -> impl Iterator<Item = &Rrsig> {
        self.signatures.values().flatten()
    }
}

/// Signatures computed by the workers, per zone
#[derive(Default)]
pub struct SignatureStore {
    zones: RwLock<HashMap<ZoneId, SignedZone>>,
}

impl SignatureStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace everything stored for a zone (full signing)
    pub fn replace(&self, zone_id: ZoneId, signed: SignedZone) {
        debug!(
            "Storing {} signatures for zone {}",
            signed.signature_count(),
            zone_id
        );
        self.zones.write().insert(zone_id, signed);
    }

    /// Replace the signatures of one RRset (incremental signing)
    pub fn update_rrset(
        &self,
        zone_id: ZoneId,
        name: &str,
        rtype: u16,
        rrsigs: Vec<Rrsig>,
        signed_at: DateTime<Utc>,
    ) {
        let mut zones = self.zones.write();
        let zone = zones.entry(zone_id).or_default();
        let key = (wire::fqdn(name), rtype);
        if rrsigs.is_empty() {
            zone.signatures.remove(&key);
        } else {
            zone.signatures.insert(key, rrsigs);
        }
        zone.signed_at = Some(signed_at);
    }

    pub fn remove(&self, zone_id: ZoneId) -> Option<SignedZone> {
        self.zones.write().remove(&zone_id)
    }

    pub fn get(&self, zone_id: ZoneId) -> Option<SignedZone> {
        self.zones.read().get(&zone_id).cloned()
    }

    pub fn signature_count(&self, zone_id: ZoneId) -> usize {
        self.zones
            .read()
            .get(&zone_id)
            .map(SignedZone::signature_count)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_and_remove() {
        let source = MemoryRecordSource::new();
        source.set_rrsets("example.com", vec![]);
        source.upsert_rrset(
            "example.com.",
            RrSet::new("www.example.com", rtype::A, 300).with_rdata(vec![192, 0, 2, 1]),
        );
        source.upsert_rrset(
            "example.com.",
            RrSet::new("WWW.example.com.", rtype::A, 60).with_rdata(vec![192, 0, 2, 2]),
        );

        let rrsets = source.rrsets("example.com").unwrap();
        assert_eq!(rrsets.len(), 1);
        assert_eq!(rrsets[0].ttl, 60);

        assert!(source.remove_rrset("example.com", "www.example.com", rtype::A));
        assert!(source.rrsets("example.com").unwrap().is_empty());
    }

    #[test]
    fn test_unknown_zone_is_error() {
        let source = MemoryRecordSource::new();
        assert!(matches!(
            source.rrsets("missing.example."),
            Err(SignerError::RecordSource(_))
        ));
    }

    #[test]
    fn test_signature_store_counts() {
        let store = SignatureStore::new();
        assert_eq!(store.signature_count(1), 0);
        store.update_rrset(1, "example.com", rtype::SOA, vec![], Utc::now());
        assert_eq!(store.signature_count(1), 0);
        assert!(store.get(1).unwrap().signed_at.is_some());
        store.remove(1);
        assert!(store.get(1).is_none());
    }
}
