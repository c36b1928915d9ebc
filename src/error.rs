use thiserror::Error;

/// Errors returned by the signing core.
///
/// Validation and state errors are returned synchronously to the caller.
/// Crypto, storage and record-source failures raised while signing are
/// caught by the worker and recorded on the queue entry instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignerError {
    #[error("DNSSEC is already enabled for zone {0}")]
    AlreadyEnabled(String),

    #[error("DNSSEC is not enabled for zone {0}")]
    NotEnabled(String),

    #[error("Invalid or unsupported DNSSEC algorithm: {0}")]
    InvalidAlgorithm(String),

    #[error("Invalid key size: {0}")]
    InvalidKeySize(String),

    #[error("Could not generate a key with a unique key tag after {0} attempts")]
    KeyTagExhausted(u32),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Key {0} is already inactive")]
    AlreadyInactive(u64),

    #[error("Key {0} is the last active key of its role and the zone has signing work in flight")]
    KeyInUse(u64),

    #[error("Zone cannot be signed: {0}")]
    ZoneNotSignable(String),

    #[error("Invalid queue transition for entry {id}: {from} -> {to}")]
    InvalidTransition {
        id: u64,
        from: &'static str,
        to: &'static str,
    },

    #[error("Claim on queue entry {id} (attempt {attempt}) is no longer held")]
    ClaimLost { id: u64, attempt: u32 },

    #[error("Zone not found: {0}")]
    ZoneNotFound(String),

    #[error("Invalid zone name: {0}")]
    InvalidZoneName(String),

    #[error("Invalid signature window: refresh {refresh}s must be less than validity {validity}s")]
    InvalidSignatureWindow { validity: u32, refresh: u32 },

    #[error("Cryptography error: {0}")]
    Crypto(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Record source error: {0}")]
    RecordSource(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SignerError {
    /// Stable machine-readable kind, used by the HTTP boundary.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AlreadyEnabled(_) => "already_enabled",
            Self::NotEnabled(_) => "not_enabled",
            Self::InvalidAlgorithm(_) => "invalid_algorithm",
            Self::InvalidKeySize(_) => "invalid_key_size",
            Self::KeyTagExhausted(_) => "key_tag_exhausted",
            Self::NotFound(_) => "not_found",
            Self::AlreadyInactive(_) => "already_inactive",
            Self::KeyInUse(_) => "key_in_use",
            Self::ZoneNotSignable(_) => "zone_not_signable",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::ClaimLost { .. } => "claim_lost",
            Self::ZoneNotFound(_) => "zone_not_found",
            Self::InvalidZoneName(_) => "invalid_zone_name",
            Self::InvalidSignatureWindow { .. } => "invalid_signature_window",
            Self::Crypto(_) => "crypto",
            Self::Storage(_) => "storage",
            Self::RecordSource(_) => "record_source",
            Self::Config(_) => "config",
        }
    }

    /// Whether the error is a caller mistake rather than an internal failure
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidAlgorithm(_)
                | Self::InvalidKeySize(_)
                | Self::InvalidZoneName(_)
                | Self::InvalidSignatureWindow { .. }
                | Self::InvalidTransition { .. }
        )
    }
}

impl From<std::io::Error> for SignerError {
    fn from(err: std::io::Error) -> Self {
        SignerError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for SignerError {
    fn from(err: serde_json::Error) -> Self {
        SignerError::Storage(err.to_string())
    }
}

impl From<ConfigError> for SignerError {
    fn from(err: ConfigError) -> Self {
        SignerError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SignerError>;

#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("Invalid HTTP bind address: {0}")]
    InvalidHttpBindAddress(String),

    #[error("Invalid worker count: {0}")]
    InvalidWorkerCount(String),

    #[error("Invalid duration: {0}")]
    InvalidDuration(String),

    #[error("Invalid master key: {0}")]
    InvalidMasterKey(String),

    #[error("Invalid signature window: {0}")]
    InvalidSignatureWindow(String),

    #[error("Configuration parse error: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err.to_string())
    }
}
