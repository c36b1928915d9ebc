use crate::dnssec::wire;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignerConfig {
    /// HTTP API bind address (None = disabled)
    pub http_bind_addr: Option<SocketAddr>,

    /// Directory for durable state (None = in-memory only)
    pub data_dir: Option<PathBuf>,

    /// fsync audit and state writes before an operation returns
    pub fsync: bool,

    /// Hex-encoded 32-byte key used to seal private keys at rest
    pub master_key: Option<String>,

    /// Number of concurrent signing workers
    pub worker_count: usize,

    /// How long an idle worker sleeps before polling the queue again
    pub poll_interval_ms: u64,

    /// Entries processing longer than this are reclaimed by the reaper
    pub processing_timeout_secs: u64,

    /// How often the reaper scans for stale entries
    pub reaper_interval_secs: u64,

    /// How often the refresh scheduler runs
    pub scheduler_interval_secs: u64,

    /// Priority for manual sign requests
    pub default_priority: i32,

    /// Default RRSIG validity for newly enabled zones
    pub signature_validity_secs: u32,

    /// Re-sign when less than this much validity remains
    pub signature_refresh_secs: u32,

    /// Maximum random reduction of each signature's expiration
    pub signature_jitter_secs: u32,

    /// TTL for generated DNSKEY and denial records
    pub default_ttl: u32,

    /// NSEC3 extra iterations (RFC 9276 recommends 0)
    pub nsec3_iterations: u16,

    /// NSEC3 salt length in bytes (0 = no salt)
    pub nsec3_salt_length: u8,

    /// Key lifetimes; expired keys are retired by the scheduler once a
    /// successor of the same role is active
    pub ksk_lifetime_days: Option<u32>,
    pub zsk_lifetime_days: Option<u32>,

    /// Attempts to find a key whose tag does not collide with an active key
    pub max_key_tag_attempts: u32,

    /// Zones provisioned at start-up
    pub zones: Vec<String>,
}

impl Default for SignerConfig {
    fn default() -> Self {
        Self {
            http_bind_addr: Some(SocketAddr::from(([127, 0, 0, 1], 8053))),
            data_dir: None,
            fsync: true,
            master_key: None,
            worker_count: 2,
            poll_interval_ms: 500,
            processing_timeout_secs: 300,
            reaper_interval_secs: 30,
            scheduler_interval_secs: 300,
            default_priority: 10,
            signature_validity_secs: 30 * 86400, // 30 days
            signature_refresh_secs: 7 * 86400,   // 7 days
            signature_jitter_secs: 12 * 3600,    // 12 hours
            default_ttl: 3600,
            nsec3_iterations: 0,
            nsec3_salt_length: 0,
            ksk_lifetime_days: None,
            zsk_lifetime_days: None,
            max_key_tag_attempts: 5,
            zones: vec![],
        }
    }
}

impl SignerConfig {
    /// Create a SignerConfig from defaults and environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_overrides()
    }

    /// Load a TOML configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config: SignerConfig = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseError(format!("{}: {}", path.as_ref().display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `ZONESIGN_*` environment variables on top of this configuration
    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Ok(http_bind_addr) = std::env::var("ZONESIGN_HTTP_BIND_ADDR") {
            if http_bind_addr.to_lowercase() == "disabled" || http_bind_addr.is_empty() {
                self.http_bind_addr = None;
            } else {
                self.http_bind_addr = Some(
                    http_bind_addr
                        .parse()
                        .map_err(|_| ConfigError::InvalidHttpBindAddress(http_bind_addr))?,
                );
            }
        }

        if let Ok(data_dir) = std::env::var("ZONESIGN_DATA_DIR") {
            self.data_dir = if data_dir.is_empty() {
                None
            } else {
                Some(PathBuf::from(data_dir))
            };
        }

        if let Ok(fsync) = std::env::var("ZONESIGN_FSYNC") {
            self.fsync = parse_bool(&fsync, true);
        }

        if let Ok(master_key) = std::env::var("ZONESIGN_MASTER_KEY") {
            if !master_key.is_empty() {
                self.master_key = Some(master_key);
            }
        }

        if let Ok(workers) = std::env::var("ZONESIGN_WORKERS") {
            self.worker_count = workers
                .parse::<usize>()
                .map_err(|_| ConfigError::InvalidWorkerCount(workers))?;
        }

        if let Ok(poll) = std::env::var("ZONESIGN_POLL_INTERVAL_MS") {
            self.poll_interval_ms = parse_duration(&poll)?;
        }

        if let Ok(timeout) = std::env::var("ZONESIGN_PROCESSING_TIMEOUT") {
            self.processing_timeout_secs = parse_duration(&timeout)?;
        }

        if let Ok(interval) = std::env::var("ZONESIGN_REAPER_INTERVAL") {
            self.reaper_interval_secs = parse_duration(&interval)?;
        }

        if let Ok(interval) = std::env::var("ZONESIGN_SCHEDULER_INTERVAL") {
            self.scheduler_interval_secs = parse_duration(&interval)?;
        }

        if let Ok(priority) = std::env::var("ZONESIGN_DEFAULT_PRIORITY") {
            self.default_priority = priority.parse::<i32>().map_err(|_| {
                ConfigError::ParseError(format!("Invalid default priority: {}", priority))
            })?;
        }

        if let Ok(validity) = std::env::var("ZONESIGN_SIGNATURE_VALIDITY") {
            self.signature_validity_secs = parse_seconds(&validity)?;
        }

        if let Ok(refresh) = std::env::var("ZONESIGN_SIGNATURE_REFRESH") {
            self.signature_refresh_secs = parse_seconds(&refresh)?;
        }

        if let Ok(jitter) = std::env::var("ZONESIGN_SIGNATURE_JITTER") {
            self.signature_jitter_secs = parse_seconds(&jitter)?;
        }

        if let Ok(ttl) = std::env::var("ZONESIGN_DEFAULT_TTL") {
            self.default_ttl = ttl
                .parse::<u32>()
                .map_err(|_| ConfigError::ParseError(format!("Invalid default TTL: {}", ttl)))?;
        }

        if let Ok(iterations) = std::env::var("ZONESIGN_NSEC3_ITERATIONS") {
            self.nsec3_iterations = iterations.parse::<u16>().map_err(|_| {
                ConfigError::ParseError(format!("Invalid NSEC3 iterations: {}", iterations))
            })?;
        }

        if let Ok(salt_length) = std::env::var("ZONESIGN_NSEC3_SALT_LENGTH") {
            self.nsec3_salt_length = salt_length.parse::<u8>().map_err(|_| {
                ConfigError::ParseError(format!("Invalid NSEC3 salt length: {}", salt_length))
            })?;
        }

        if let Ok(days) = std::env::var("ZONESIGN_KSK_LIFETIME_DAYS") {
            self.ksk_lifetime_days = parse_lifetime(&days)?;
        }

        if let Ok(days) = std::env::var("ZONESIGN_ZSK_LIFETIME_DAYS") {
            self.zsk_lifetime_days = parse_lifetime(&days)?;
        }

        if let Ok(attempts) = std::env::var("ZONESIGN_MAX_KEY_TAG_ATTEMPTS") {
            self.max_key_tag_attempts = attempts.parse::<u32>().map_err(|_| {
                ConfigError::ParseError(format!("Invalid key tag attempts: {}", attempts))
            })?;
        }

        if let Ok(zones) = std::env::var("ZONESIGN_ZONES") {
            self.zones = zones
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        self.validate()?;
        Ok(self)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 || self.worker_count > 64 {
            return Err(ConfigError::InvalidWorkerCount(format!(
                "{} (must be between 1 and 64)",
                self.worker_count
            )));
        }

        if self.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidDuration(
                "Poll interval must be greater than 0".to_string(),
            ));
        }

        if self.processing_timeout_secs == 0 || self.reaper_interval_secs == 0 {
            return Err(ConfigError::InvalidDuration(
                "Processing timeout and reaper interval must be greater than 0".to_string(),
            ));
        }

        if self.scheduler_interval_secs == 0 {
            return Err(ConfigError::InvalidDuration(
                "Scheduler interval must be greater than 0".to_string(),
            ));
        }

        if self.signature_refresh_secs >= self.signature_validity_secs {
            return Err(ConfigError::InvalidSignatureWindow(format!(
                "refresh {}s must be less than validity {}s",
                self.signature_refresh_secs, self.signature_validity_secs
            )));
        }

        // Signatures must outlive the point at which the scheduler re-signs
        if self.signature_jitter_secs >= self.signature_refresh_secs {
            return Err(ConfigError::InvalidSignatureWindow(format!(
                "jitter {}s must be less than refresh {}s",
                self.signature_jitter_secs, self.signature_refresh_secs
            )));
        }

        if self.nsec3_iterations > 150 {
            return Err(ConfigError::ParseError(
                "NSEC3 iterations too large (max 150)".to_string(),
            ));
        }

        if self.max_key_tag_attempts == 0 {
            return Err(ConfigError::ParseError(
                "Key tag attempts must be at least 1".to_string(),
            ));
        }

        if let Some(zone) = self.zones.iter().find(|z| !wire::is_valid_name(z)) {
            return Err(ConfigError::ParseError(format!("Invalid zone name: {}", zone)));
        }

        self.master_key_bytes()?;
        Ok(())
    }

    /// Decode the configured master key
    pub fn master_key_bytes(&self) -> Result<Option<Vec<u8>>, ConfigError> {
        let Some(hex_key) = &self.master_key else {
            return Ok(None);
        };
        let bytes = hex::decode(hex_key.trim())
            .map_err(|_| ConfigError::InvalidMasterKey("not valid hex".to_string()))?;
        if bytes.len() != 32 {
            return Err(ConfigError::InvalidMasterKey(format!(
                "expected 32 bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Some(bytes))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn processing_timeout(&self) -> Duration {
        Duration::from_secs(self.processing_timeout_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler_interval_secs)
    }
}

fn parse_duration(value: &str) -> Result<u64, ConfigError> {
    value
        .parse::<u64>()
        .map_err(|_| ConfigError::InvalidDuration(value.to_string()))
}

fn parse_seconds(value: &str) -> Result<u32, ConfigError> {
    value
        .parse::<u32>()
        .map_err(|_| ConfigError::InvalidDuration(value.to_string()))
}

fn parse_lifetime(value: &str) -> Result<Option<u32>, ConfigError> {
    if value.is_empty() || value == "0" {
        return Ok(None);
    }
    value
        .parse::<u32>()
        .map(Some)
        .map_err(|_| ConfigError::ParseError(format!("Invalid key lifetime: {}", value)))
}

/// Parse a boolean from a string, with a default value for invalid input
fn parse_bool(s: &str, default: bool) -> bool {
    match s.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => true,
        "false" | "0" | "no" | "off" => false,
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = SignerConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_refresh_must_be_below_validity() {
        let config = SignerConfig {
            signature_validity_secs: 3600,
            signature_refresh_secs: 3600,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSignatureWindow(_))
        ));
    }

    #[test]
    fn test_invalid_worker_count() {
        let config = SignerConfig {
            worker_count: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_master_key_validation() {
        let short = SignerConfig {
            master_key: Some("abcd".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            short.validate(),
            Err(ConfigError::InvalidMasterKey(_))
        ));

        let good = SignerConfig {
            master_key: Some("00".repeat(32)),
            ..Default::default()
        };
        assert_eq!(good.master_key_bytes().unwrap().unwrap().len(), 32);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
worker_count = 4
signature_validity_secs = 1209600
signature_refresh_secs = 259200
signature_jitter_secs = 3600
zones = ["example.com.", "example.org"]
"#
        )
        .unwrap();

        let config = SignerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.signature_validity_secs, 1_209_600);
        assert_eq!(config.zones.len(), 2);
        // Unset fields keep their defaults
        assert_eq!(config.max_key_tag_attempts, 5);
    }

    #[test]
    fn test_from_file_rejects_garbage() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "worker_count = \"many\"").unwrap();
        assert!(matches!(
            SignerConfig::from_file(file.path()),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("true", false));
        assert!(parse_bool("TRUE", false));
        assert!(parse_bool("1", false));
        assert!(parse_bool("yes", false));
        assert!(parse_bool("on", false));

        assert!(!parse_bool("false", true));
        assert!(!parse_bool("0", true));
        assert!(!parse_bool("no", true));
        assert!(!parse_bool("off", true));

        assert!(parse_bool("invalid", true));
        assert!(!parse_bool("invalid", false));
    }

    #[test]
    fn test_parse_lifetime() {
        assert_eq!(parse_lifetime("0").unwrap(), None);
        assert_eq!(parse_lifetime("90").unwrap(), Some(90));
        assert!(parse_lifetime("ninety").is_err());
    }
}
