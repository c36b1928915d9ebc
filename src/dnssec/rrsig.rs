use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{CLASS_IN, CryptoProvider, DnsSecAlgorithm, wire};
use crate::error::Result;
use crate::model::{base64_bytes, base64_list};

/// A set of records sharing owner, type and class
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RrSet {
    pub name: String,
    pub rtype: u16,
    #[serde(default = "default_class")]
    pub class: u16,
    pub ttl: u32,
    #[serde(with = "base64_list")]
    pub rdata: Vec<Vec<u8>>,
}

fn default_class() -> u16 {
    CLASS_IN
}

impl RrSet {
    pub fn new(name: &str, rtype: u16, ttl: u32) -> Self {
        Self {
            name: wire::fqdn(name),
            rtype,
            class: CLASS_IN,
            ttl,
            rdata: Vec::new(),
        }
    }

    pub fn with_rdata(mut self, rdata: Vec<u8>) -> Self {
        self.rdata.push(rdata);
        self
    }

    /// RDATA in canonical order with duplicates removed (RFC 4034 Section 6.3)
    pub fn canonical_rdata(&self) -> Vec<&[u8]> {
        let mut sorted: Vec<&[u8]> = self.rdata.iter().map(|r| r.as_slice()).collect();
        sorted.sort();
        sorted.dedup();
        sorted
    }
}

/// RRSIG fields that are fixed before the signature is computed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RrsigTemplate {
    pub type_covered: u16,
    pub algorithm: DnsSecAlgorithm,
    pub labels: u8,
    pub original_ttl: u32,
    pub expiration: u32,
    pub inception: u32,
    pub key_tag: u16,
    pub signer_name: String,
}

impl RrsigTemplate {
    pub fn for_rrset(
        rrset: &RrSet,
        algorithm: DnsSecAlgorithm,
        key_tag: u16,
        signer_name: &str,
        inception: DateTime<Utc>,
        expiration: DateTime<Utc>,
    ) -> Self {
        Self {
            type_covered: rrset.rtype,
            algorithm,
            labels: wire::label_count(&rrset.name),
            original_ttl: rrset.ttl,
            // RRSIG times are 32-bit serial numbers (RFC 4034 Section 3.1.5)
            expiration: expiration.timestamp() as u32,
            inception: inception.timestamp() as u32,
            key_tag,
            signer_name: wire::fqdn(signer_name),
        }
    }

    /// RRSIG RDATA up to, not including, the signature field
    pub fn rdata_prefix(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(18 + self.signer_name.len() + 2);
        data.extend_from_slice(&self.type_covered.to_be_bytes());
        data.push(self.algorithm.to_u8());
        data.push(self.labels);
        data.extend_from_slice(&self.original_ttl.to_be_bytes());
        data.extend_from_slice(&self.expiration.to_be_bytes());
        data.extend_from_slice(&self.inception.to_be_bytes());
        data.extend_from_slice(&self.key_tag.to_be_bytes());
        data.extend_from_slice(&wire::name_to_wire(&self.signer_name));
        data
    }

    /// Data covered by the signature (RFC 4034 Section 3.1.8.1)
    pub fn signing_data(&self, rrset: &RrSet) -> Vec<u8> {
        let mut data = self.rdata_prefix();
        let owner = wire::name_to_wire(&rrset.name);

        for rdata in rrset.canonical_rdata() {
            data.extend_from_slice(&owner);
            data.extend_from_slice(&rrset.rtype.to_be_bytes());
            data.extend_from_slice(&rrset.class.to_be_bytes());
            data.extend_from_slice(&self.original_ttl.to_be_bytes());
            data.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
            data.extend_from_slice(rdata);
        }
        data
    }

    /// Compute the signature with the given (decrypted) private key
    pub fn sign(
        self,
        rrset: &RrSet,
        crypto: &dyn CryptoProvider,
        private_key: &[u8],
    ) -> Result<Rrsig> {
        let signature = crypto.sign(self.algorithm, private_key, &self.signing_data(rrset))?;
        Ok(Rrsig {
            owner: rrset.name.clone(),
            ttl: rrset.ttl,
            template: self,
            signature,
        })
    }
}

/// A computed RRSIG record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rrsig {
    pub owner: String,
    pub ttl: u32,
    #[serde(flatten)]
    pub template: RrsigTemplate,
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,
}

impl Rrsig {
    /// Presentation format, e.g. for zone file export
    pub fn to_zone_format(&self) -> String {
        let t = &self.template;
        format!(
            "{} {} IN RRSIG {} {} {} {} {} {} {} {} {}",
            self.owner,
            self.ttl,
            t.type_covered,
            t.algorithm.to_u8(),
            t.labels,
            t.original_ttl,
            format_rrsig_time(t.expiration),
            format_rrsig_time(t.inception),
            t.key_tag,
            t.signer_name,
            base64::engine::general_purpose::STANDARD.encode(&self.signature)
        )
    }
}

fn format_rrsig_time(secs: u32) -> String {
    DateTime::<Utc>::from_timestamp(i64::from(secs), 0)
        .map(|t| t.format("%Y%m%d%H%M%S").to_string())
        .unwrap_or_else(|| secs.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dnssec::{SystemCryptoProvider, rtype};
    use chrono::TimeZone;

    fn sample_rrset() -> RrSet {
        RrSet::new("www.Example.com", rtype::A, 300)
            .with_rdata(vec![192, 0, 2, 2])
            .with_rdata(vec![192, 0, 2, 1])
            .with_rdata(vec![192, 0, 2, 1])
    }

    #[test]
    fn test_canonical_rdata_sorted_and_deduplicated() {
        let rrset = sample_rrset();
        assert_eq!(
            rrset.canonical_rdata(),
            vec![&[192u8, 0, 2, 1][..], &[192u8, 0, 2, 2][..]]
        );
    }

    #[test]
    fn test_template_fields() {
        let inception = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let expiration = Utc.with_ymd_and_hms(2024, 1, 31, 0, 0, 0).unwrap();
        let template = RrsigTemplate::for_rrset(
            &sample_rrset(),
            DnsSecAlgorithm::EcdsaP256Sha256,
            12345,
            "example.com",
            inception,
            expiration,
        );
        assert_eq!(template.labels, 3);
        assert_eq!(template.signer_name, "example.com.");
        let prefix = template.rdata_prefix();
        assert_eq!(&prefix[0..2], &rtype::A.to_be_bytes());
        assert_eq!(prefix[2], 13);
        assert_eq!(&prefix[16..18], &12345u16.to_be_bytes());
        assert!(prefix.ends_with(b"\x07example\x03com\x00"));
    }

    #[test]
    fn test_sign_and_verify_rrset() {
        let crypto = SystemCryptoProvider::new();
        let key = crypto.generate(DnsSecAlgorithm::Ed25519, None).unwrap();
        let now = Utc::now();
        let rrset = sample_rrset();
        let template = RrsigTemplate::for_rrset(
            &rrset,
            DnsSecAlgorithm::Ed25519,
            1,
            "example.com.",
            now,
            now + chrono::Duration::days(30),
        );
        let data = template.signing_data(&rrset);
        let rrsig = template.sign(&rrset, &crypto, &key.private_key).unwrap();

        assert!(crypto
            .verify(DnsSecAlgorithm::Ed25519, &key.public_key, &data, &rrsig.signature)
            .unwrap());
        assert!(rrsig.to_zone_format().contains(" IN RRSIG 1 15 3 300 "));
    }
}
