use std::collections::{BTreeSet, HashMap};

use ring::digest;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{RrSet, rtype, wire};

/// NSEC3 hash algorithm number for SHA-1 (RFC 5155 Section 11)
pub const NSEC3_HASH_SHA1: u8 = 1;

/// NSEC3 chain parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nsec3Params {
    pub iterations: u16,
    #[serde(with = "hex_salt")]
    pub salt: Vec<u8>,
}

impl Nsec3Params {
    pub fn new(iterations: u16, salt: Vec<u8>) -> Self {
        Self { iterations, salt }
    }

    /// IH(salt, x, k) from RFC 5155 Section 5
    pub fn hash(&self, name: &str) -> Vec<u8> {
        let mut input = wire::name_to_wire(name);
        input.extend_from_slice(&self.salt);
        let mut hash = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, &input);

        for _ in 0..self.iterations {
            let mut next = hash.as_ref().to_vec();
            next.extend_from_slice(&self.salt);
            hash = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, &next);
        }
        hash.as_ref().to_vec()
    }

    /// Hashed owner label in lowercase base32hex without padding
    pub fn hashed_label(&self, name: &str) -> String {
        encode_base32hex(&self.hash(name))
    }

    /// NSEC3PARAM RDATA
    pub fn param_rdata(&self) -> Vec<u8> {
        let mut rdata = Vec::with_capacity(5 + self.salt.len());
        rdata.push(NSEC3_HASH_SHA1);
        rdata.push(0);
        rdata.extend_from_slice(&self.iterations.to_be_bytes());
        rdata.push(self.salt.len() as u8);
        rdata.extend_from_slice(&self.salt);
        rdata
    }

    fn record_rdata(&self, next_hash: &[u8], types: &[u16]) -> Vec<u8> {
        let mut rdata = self.param_rdata();
        rdata.push(next_hash.len() as u8);
        rdata.extend_from_slice(next_hash);
        rdata.extend_from_slice(&wire::type_bitmap(types));
        rdata
    }
}

fn encode_base32hex(data: &[u8]) -> String {
    base32::encode(base32::Alphabet::Rfc4648Hex { padding: false }, data).to_lowercase()
}

mod hex_salt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(salt: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        if salt.is_empty() {
            serializer.serialize_str("-")
        } else {
            serializer.serialize_str(&hex::encode(salt))
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s == "-" {
            return Ok(Vec::new());
        }
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

/// Authenticated denial-of-existence chain builder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenialChain {
    Nsec,
    Nsec3(Nsec3Params),
}

impl DenialChain {
    /// Build the NSEC or NSEC3 records (plus NSEC3PARAM) for the given zone
    /// contents. `rrsets` must already include the apex DNSKEY RRset.
    pub fn build(&self, origin: &str, rrsets: &[RrSet], ttl: u32) -> Vec<RrSet> {
        let origin = wire::fqdn(origin);
        let names = authoritative_types(&origin, rrsets);

        let records = match self {
            Self::Nsec => build_nsec(&names, ttl),
            Self::Nsec3(params) => build_nsec3(&origin, names, params, ttl),
        };
        debug!(
            "Built {} denial records for {} ({})",
            records.len(),
            origin,
            match self {
                Self::Nsec => "NSEC",
                Self::Nsec3(_) => "NSEC3",
            }
        );
        records
    }
}

/// Owner names in the zone mapped to the types present there. Names below a
/// delegation point (glue) are not authoritative and are left out.
fn authoritative_types(origin: &str, rrsets: &[RrSet]) -> HashMap<String, BTreeSet<u16>> {
    let cuts: Vec<String> = rrsets
        .iter()
        .filter(|set| set.rtype == rtype::NS)
        .map(|set| wire::fqdn(&set.name))
        .filter(|name| name != origin)
        .collect();

    let mut names: HashMap<String, BTreeSet<u16>> = HashMap::new();
    for set in rrsets {
        let name = wire::fqdn(&set.name);
        if !wire::is_in_zone(&name, origin) {
            continue;
        }
        let occluded = cuts
            .iter()
            .any(|cut| name != *cut && wire::is_in_zone(&name, cut));
        if occluded {
            continue;
        }
        if matches!(set.rtype, rtype::RRSIG | rtype::NSEC | rtype::NSEC3) {
            continue;
        }
        names.entry(name).or_default().insert(set.rtype);
    }
    names
}

fn build_nsec(names: &HashMap<String, BTreeSet<u16>>, ttl: u32) -> Vec<RrSet> {
    let mut ordered: Vec<&String> = names.keys().collect();
    ordered.sort_by(|a, b| wire::canonical_cmp(a, b));

    let mut records = Vec::with_capacity(ordered.len());
    for (i, name) in ordered.iter().enumerate() {
        let next = ordered[(i + 1) % ordered.len()];
        let mut types: Vec<u16> = names[*name].iter().copied().collect();
        types.push(rtype::RRSIG);
        types.push(rtype::NSEC);

        let mut rdata = wire::name_to_wire(next);
        rdata.extend_from_slice(&wire::type_bitmap(&types));
        records.push(RrSet::new(name, rtype::NSEC, ttl).with_rdata(rdata));
    }
    records
}

fn build_nsec3(
    origin: &str,
    mut names: HashMap<String, BTreeSet<u16>>,
    params: &Nsec3Params,
    ttl: u32,
) -> Vec<RrSet> {
    // Empty non-terminals get NSEC3 records with an empty bitmap (RFC 5155 Section 7.1)
    let existing: Vec<String> = names.keys().cloned().collect();
    for name in existing {
        let mut parent = name.as_str();
        while let Some((_, rest)) = parent.split_once('.') {
            if rest.is_empty() || !wire::is_in_zone(rest, origin) {
                break;
            }
            names.entry(rest.to_string()).or_default();
            if rest == origin {
                break;
            }
            parent = rest;
        }
    }

    if let Some(apex) = names.get_mut(origin) {
        apex.insert(rtype::NSEC3PARAM);
    }

    let mut hashed: Vec<(Vec<u8>, Vec<u16>)> = names
        .iter()
        .map(|(name, types)| {
            let mut types: Vec<u16> = types.iter().copied().collect();
            if !types.is_empty() {
                types.push(rtype::RRSIG);
            }
            (params.hash(name), types)
        })
        .collect();
    hashed.sort_by(|a, b| a.0.cmp(&b.0));
    hashed.dedup_by(|a, b| a.0 == b.0);

    let mut records = Vec::with_capacity(hashed.len() + 1);
    for (i, (hash, types)) in hashed.iter().enumerate() {
        let next = &hashed[(i + 1) % hashed.len()].0;
        let owner = format!("{}.{}", encode_base32hex(hash), origin);
        records.push(
            RrSet::new(&owner, rtype::NSEC3, ttl).with_rdata(params.record_rdata(next, types)),
        );
    }
    records.push(RrSet::new(origin, rtype::NSEC3PARAM, 0).with_rdata(params.param_rdata()));
    records
}
