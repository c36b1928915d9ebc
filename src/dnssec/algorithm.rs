use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// DNSSEC Algorithm numbers (RFC 4034, 5155, 5702, 5933, 6605, 8080, 8624)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum DnsSecAlgorithm {
    /// RSA/MD5 (deprecated)
    RsaMd5 = 1,
    /// DSA/SHA1 (RFC 2536)
    Dsa = 3,
    /// RSA/SHA-1 (RFC 3110)
    RsaSha1 = 5,
    /// DSA-NSEC3-SHA1 (RFC 5155)
    DsaNsec3Sha1 = 6,
    /// RSASHA1-NSEC3-SHA1 (RFC 5155)
    RsaSha1Nsec3Sha1 = 7,
    /// RSA/SHA-256 (RFC 5702)
    RsaSha256 = 8,
    /// RSA/SHA-512 (RFC 5702)
    RsaSha512 = 10,
    /// GOST R 34.10-2001 (RFC 5933)
    EccGost = 12,
    /// ECDSA Curve P-256 with SHA-256 (RFC 6605)
    EcdsaP256Sha256 = 13,
    /// ECDSA Curve P-384 with SHA-384 (RFC 6605)
    EcdsaP384Sha384 = 14,
    /// Ed25519 (RFC 8080)
    Ed25519 = 15,
    /// Ed448 (RFC 8080)
    Ed448 = 16,
}

/// RSA modulus sizes accepted for key generation
pub const RSA_KEY_SIZES: [u32; 3] = [2048, 3072, 4096];

impl DnsSecAlgorithm {
    /// Create from algorithm number
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::RsaMd5),
            3 => Some(Self::Dsa),
            5 => Some(Self::RsaSha1),
            6 => Some(Self::DsaNsec3Sha1),
            7 => Some(Self::RsaSha1Nsec3Sha1),
            8 => Some(Self::RsaSha256),
            10 => Some(Self::RsaSha512),
            12 => Some(Self::EccGost),
            13 => Some(Self::EcdsaP256Sha256),
            14 => Some(Self::EcdsaP384Sha384),
            15 => Some(Self::Ed25519),
            16 => Some(Self::Ed448),
            _ => None,
        }
    }

    /// Convert to algorithm number
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Check if zones may be signed with this algorithm
    pub fn is_supported(&self) -> bool {
        matches!(
            self,
            Self::RsaSha256
                | Self::RsaSha512
                | Self::EcdsaP256Sha256
                | Self::EcdsaP384Sha384
                | Self::Ed25519
                | Self::Ed448
        )
    }

    /// RSA algorithms need an explicit modulus size
    pub fn is_rsa(&self) -> bool {
        matches!(
            self,
            Self::RsaMd5 | Self::RsaSha1 | Self::RsaSha1Nsec3Sha1 | Self::RsaSha256 | Self::RsaSha512
        )
    }

    /// Validate the requested key size for this algorithm.
    ///
    /// RSA requires one of [`RSA_KEY_SIZES`]; every other algorithm has a
    /// fixed size and rejects an explicit one.
    pub fn check_key_size(&self, key_size: Option<u32>) -> Result<(), String> {
        match (self.is_rsa(), key_size) {
            (true, Some(bits)) if RSA_KEY_SIZES.contains(&bits) => Ok(()),
            (true, Some(bits)) => Err(format!(
                "{} requires a key size in {:?}, got {}",
                self, RSA_KEY_SIZES, bits
            )),
            (true, None) => Err(format!(
                "{} requires an explicit key size in {:?}",
                self, RSA_KEY_SIZES
            )),
            (false, None) => Ok(()),
            (false, Some(bits)) => Err(format!(
                "{} has a fixed key size and does not accept key_size={}",
                self, bits
            )),
        }
    }
}

impl From<DnsSecAlgorithm> for u8 {
    fn from(alg: DnsSecAlgorithm) -> Self {
        alg.to_u8()
    }
}

impl TryFrom<u8> for DnsSecAlgorithm {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::from_u8(value).ok_or_else(|| format!("unknown DNSSEC algorithm {}", value))
    }
}

impl FromStr for DnsSecAlgorithm {
    type Err = String;

    /// Accepts the mnemonic (`ECDSAP256SHA256`) or the number (`13`)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(number) = s.parse::<u8>() {
            return Self::try_from(number);
        }
        match s.to_uppercase().as_str() {
            "RSAMD5" => Ok(Self::RsaMd5),
            "DSA" => Ok(Self::Dsa),
            "RSASHA1" => Ok(Self::RsaSha1),
            "DSA-NSEC3-SHA1" => Ok(Self::DsaNsec3Sha1),
            "RSASHA1-NSEC3-SHA1" => Ok(Self::RsaSha1Nsec3Sha1),
            "RSASHA256" => Ok(Self::RsaSha256),
            "RSASHA512" => Ok(Self::RsaSha512),
            "ECC-GOST" => Ok(Self::EccGost),
            "ECDSAP256SHA256" => Ok(Self::EcdsaP256Sha256),
            "ECDSAP384SHA384" => Ok(Self::EcdsaP384Sha384),
            "ED25519" => Ok(Self::Ed25519),
            "ED448" => Ok(Self::Ed448),
            other => Err(format!("unknown DNSSEC algorithm {}", other)),
        }
    }
}

impl fmt::Display for DnsSecAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RsaMd5 => write!(f, "RSAMD5"),
            Self::Dsa => write!(f, "DSA"),
            Self::RsaSha1 => write!(f, "RSASHA1"),
            Self::DsaNsec3Sha1 => write!(f, "DSA-NSEC3-SHA1"),
            Self::RsaSha1Nsec3Sha1 => write!(f, "RSASHA1-NSEC3-SHA1"),
            Self::RsaSha256 => write!(f, "RSASHA256"),
            Self::RsaSha512 => write!(f, "RSASHA512"),
            Self::EccGost => write!(f, "ECC-GOST"),
            Self::EcdsaP256Sha256 => write!(f, "ECDSAP256SHA256"),
            Self::EcdsaP384Sha384 => write!(f, "ECDSAP384SHA384"),
            Self::Ed25519 => write!(f, "ED25519"),
            Self::Ed448 => write!(f, "ED448"),
        }
    }
}
