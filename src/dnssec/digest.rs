use serde::{Deserialize, Serialize};
use std::fmt;

use super::{dnskey_rdata, wire};

/// DS digest type algorithms (RFC 4034, 4509, 6605)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum DigestType {
    /// SHA-1 (RFC 3658)
    Sha1 = 1,
    /// SHA-256 (RFC 4509)
    Sha256 = 2,
    /// SHA-384 (RFC 6605)
    Sha384 = 4,
}

impl DigestType {
    /// Create from digest type number
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Sha1),
            2 => Some(Self::Sha256),
            4 => Some(Self::Sha384),
            _ => None,
        }
    }

    /// Convert to digest type number
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Get the expected digest length in bytes
    pub fn digest_len(&self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha256 => 32,
            Self::Sha384 => 48,
        }
    }

    /// Calculate digest of data using this algorithm
    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        use ring::digest;
        let algorithm = match self {
            Self::Sha1 => &digest::SHA1_FOR_LEGACY_USE_ONLY,
            Self::Sha256 => &digest::SHA256,
            Self::Sha384 => &digest::SHA384,
        };
        digest::digest(algorithm, data).as_ref().to_vec()
    }
}

impl From<DigestType> for u8 {
    fn from(digest: DigestType) -> Self {
        digest.to_u8()
    }
}

impl TryFrom<u8> for DigestType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::from_u8(value).ok_or_else(|| format!("unsupported digest type {}", value))
    }
}

impl fmt::Display for DigestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sha1 => write!(f, "SHA1"),
            Self::Sha256 => write!(f, "SHA256"),
            Self::Sha384 => write!(f, "SHA384"),
        }
    }
}

/// DS (Delegation Signer) record for submission to the parent zone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DsRecord {
    pub owner: String,
    pub key_tag: u16,
    pub algorithm: u8,
    pub digest_type: DigestType,
    #[serde(with = "hex_bytes")]
    pub digest: Vec<u8>,
}

impl DsRecord {
    /// DS digest = digest(owner name in wire format || DNSKEY RDATA)
    pub fn from_dnskey(
        owner: &str,
        key_tag: u16,
        flags: u16,
        algorithm: u8,
        public_key: &[u8],
        digest_type: DigestType,
    ) -> Self {
        let mut data = wire::name_to_wire(owner);
        data.extend_from_slice(&dnskey_rdata(flags, algorithm, public_key));

        Self {
            owner: wire::fqdn(owner),
            key_tag,
            algorithm,
            digest_type,
            digest: digest_type.digest(&data),
        }
    }

    /// Format as zone file record
    pub fn to_zone_format(&self) -> String {
        format!(
            "{} IN DS {} {} {} {}",
            self.owner,
            self.key_tag,
            self.algorithm,
            self.digest_type.to_u8(),
            hex::encode_upper(&self.digest)
        )
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode_upper(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
