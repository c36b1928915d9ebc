//! Records owned by the signing core: zones, keys, queue entries and audit
//! entries, plus the read-only projections served over HTTP.

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dnssec::{self, DigestType, DnsSecAlgorithm, DsRecord, FLAGS_KSK, FLAGS_ZSK};

pub type ZoneId = u64;
pub type KeyId = u64;
pub type EntryId = u64;

/// Denial-of-existence mode for a zone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum NsecMode {
    #[serde(rename = "NSEC", alias = "nsec")]
    Nsec,
    #[default]
    #[serde(rename = "NSEC3", alias = "nsec3")]
    Nsec3,
    #[serde(rename = "none", alias = "NONE")]
    None,
}

impl NsecMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nsec => "NSEC",
            Self::Nsec3 => "NSEC3",
            Self::None => "none",
        }
    }

    /// Operator guidance surfaced with the zone's policy
    pub fn description(&self) -> &'static str {
        match self {
            Self::Nsec => "NSEC proves non-existence with plain names; the zone can be walked",
            Self::Nsec3 => "NSEC3 hashes owner names to prevent zone enumeration",
            Self::None => "no authenticated denial of existence",
        }
    }
}

impl FromStr for NsecMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nsec" => Ok(Self::Nsec),
            "nsec3" => Ok(Self::Nsec3),
            "none" | "off" => Ok(Self::None),
            other => Err(format!("unknown NSEC mode: {}", other)),
        }
    }
}

impl fmt::Display for NsecMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A zone as known to the signing core
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    pub id: ZoneId,
    /// Fully-qualified origin, lowercase with trailing dot
    pub origin: String,
    pub dnssec_enabled: bool,
    pub nsec_mode: NsecMode,
    pub preferred_algorithm: Option<DnsSecAlgorithm>,
    pub auto_sign: bool,
    pub signature_validity_secs: u32,
    pub signature_refresh_secs: u32,
    pub nsec3_iterations: u16,
    /// NSEC3 salt as lowercase hex, empty for no salt
    #[serde(default)]
    pub nsec3_salt: String,
    pub created_at: DateTime<Utc>,
    pub last_signed_at: Option<DateTime<Utc>>,
}

/// Zone plus its derived projections
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneView {
    #[serde(flatten)]
    pub zone: Zone,
    pub active_key_count: usize,
    pub signature_count: usize,
}

/// A DNSSEC key. `private_key` is sealed and never leaves the core.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    pub id: KeyId,
    pub zone_id: ZoneId,
    pub algorithm: DnsSecAlgorithm,
    pub key_tag: u16,
    pub is_ksk: bool,
    pub key_size: Option<u32>,
    #[serde(with = "base64_bytes")]
    pub public_key: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub private_key: Vec<u8>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deactivated_at: Option<DateTime<Utc>>,
}

impl Key {
    pub fn flags(&self) -> u16 {
        if self.is_ksk { FLAGS_KSK } else { FLAGS_ZSK }
    }

    pub fn role(&self) -> &'static str {
        if self.is_ksk { "KSK" } else { "ZSK" }
    }

    pub fn dnskey_rdata(&self) -> Vec<u8> {
        dnssec::dnskey_rdata(self.flags(), self.algorithm.to_u8(), &self.public_key)
    }

    pub fn ds_record(&self, origin: &str, digest_type: DigestType) -> DsRecord {
        DsRecord::from_dnskey(
            origin,
            self.key_tag,
            self.flags(),
            self.algorithm.to_u8(),
            &self.public_key,
            digest_type,
        )
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn view(&self) -> KeyView {
        KeyView {
            id: self.id,
            zone_id: self.zone_id,
            algorithm: self.algorithm,
            algorithm_name: self.algorithm.to_string(),
            key_tag: self.key_tag,
            is_ksk: self.is_ksk,
            flags: self.flags(),
            key_size: self.key_size,
            public_key: base64::engine::general_purpose::STANDARD.encode(&self.public_key),
            active: self.active,
            created_at: self.created_at,
            activated_at: self.activated_at,
            expires_at: self.expires_at,
            deactivated_at: self.deactivated_at,
        }
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Key")
            .field("id", &self.id)
            .field("zone_id", &self.zone_id)
            .field("algorithm", &self.algorithm)
            .field("key_tag", &self.key_tag)
            .field("is_ksk", &self.is_ksk)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

/// Public view of a key, safe to return from the API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyView {
    pub id: KeyId,
    pub zone_id: ZoneId,
    pub algorithm: DnsSecAlgorithm,
    pub algorithm_name: String,
    pub key_tag: u16,
    pub is_ksk: bool,
    pub flags: u16,
    pub key_size: Option<u32>,
    pub public_key: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub deactivated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Pending and processing entries count as queued work for the zone
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::Processing)
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a zone was queued for signing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SigningReason {
    Manual,
    KeyRotation,
    RecordChange,
    ScheduledRefresh,
}

impl SigningReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::KeyRotation => "key-rotation",
            Self::RecordChange => "record-change",
            Self::ScheduledRefresh => "scheduled-refresh",
        }
    }

    /// Priority used by automatic triggers; manual requests use the
    /// configured default
    pub fn default_priority(&self) -> i32 {
        match self {
            Self::Manual => 10,
            Self::KeyRotation => 1,
            Self::RecordChange => 20,
            Self::ScheduledRefresh => 50,
        }
    }
}

impl fmt::Display for SigningReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What part of the zone an entry re-signs
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SigningScope {
    #[default]
    Full,
    Rrset { name: String, rtype: u16 },
}

impl SigningScope {
    pub fn rrset(name: &str, rtype: u16) -> Self {
        Self::Rrset {
            name: dnssec::wire::fqdn(name),
            rtype,
        }
    }

    /// Combined scope of two requests for the same zone
    pub fn merge(&self, other: &SigningScope) -> SigningScope {
        if self == other {
            self.clone()
        } else {
            SigningScope::Full
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, Self::Full)
    }
}

impl fmt::Display for SigningScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => f.write_str("full"),
            Self::Rrset { name, rtype } => write!(f, "{}/{}", name, rtype),
        }
    }
}

/// A unit of (re-)signing work for one zone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningQueueEntry {
    pub id: EntryId,
    pub zone_id: ZoneId,
    pub origin: String,
    pub status: QueueStatus,
    pub reason: SigningReason,
    #[serde(default)]
    pub scope: SigningScope,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    /// Set when work was merged in while the entry was processing
    #[serde(default)]
    pub rerun: bool,
    /// Number of times the entry has been claimed. A claim is only valid
    /// for the attempt it was handed out with.
    #[serde(default)]
    pub attempt: u32,
}

/// Closed vocabulary of audited operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditOperation {
    Enable,
    Disable,
    KeyGenerate,
    KeyDeactivate,
    SignEnqueue,
    SignStart,
    SignComplete,
    SignFail,
    SignReclaim,
    SignCancel,
}

impl AuditOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enable => "enable",
            Self::Disable => "disable",
            Self::KeyGenerate => "key-generate",
            Self::KeyDeactivate => "key-deactivate",
            Self::SignEnqueue => "sign-enqueue",
            Self::SignStart => "sign-start",
            Self::SignComplete => "sign-complete",
            Self::SignFail => "sign-fail",
            Self::SignReclaim => "sign-reclaim",
            Self::SignCancel => "sign-cancel",
        }
    }
}

impl fmt::Display for AuditOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: u64,
    pub zone_id: ZoneId,
    pub operation: AuditOperation,
    pub message: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

/// Serialize raw bytes as standard base64
pub(crate) mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(serde::de::Error::custom)
    }
}

/// Serialize a list of byte strings as a list of base64 strings
pub(crate) mod base64_list {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer, ser::SerializeSeq};

    pub fn serialize<S: Serializer>(items: &[Vec<u8>], serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(items.len()))?;
        for item in items {
            seq.serialize_element(&base64::engine::general_purpose::STANDARD.encode(item))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<Vec<u8>>, D::Error> {
        let items = Vec::<String>::deserialize(deserializer)?;
        items
            .into_iter()
            .map(|s| {
                base64::engine::general_purpose::STANDARD
                    .decode(s)
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}
