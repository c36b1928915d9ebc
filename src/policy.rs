use std::time::Duration;

use serde::Serialize;

use crate::dnssec::{DenialChain, DnsSecAlgorithm, Nsec3Params};
use crate::error::{Result, SignerError};
use crate::model::{Key, NsecMode, ZoneView};

/// Algorithm used when a zone has no preferred algorithm recorded
pub const DEFAULT_ALGORITHM: DnsSecAlgorithm = DnsSecAlgorithm::EcdsaP256Sha256;

/// Signing parameters derived from a zone
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SigningPolicy {
    pub algorithm: DnsSecAlgorithm,
    pub nsec_mode: NsecMode,
    pub validity_window: Duration,
    pub refresh_window: Duration,
    pub jitter: Duration,
    pub auto_sign: bool,
    pub nsec3: Option<Nsec3Params>,
    pub denial_note: &'static str,
}

impl SigningPolicy {
    /// The denial chain builder for this policy, if any
    pub fn denial_chain(&self) -> Option<DenialChain> {
        match self.nsec_mode {
            NsecMode::Nsec => Some(DenialChain::Nsec),
            NsecMode::Nsec3 => Some(DenialChain::Nsec3(self.nsec3.clone().unwrap_or_else(
                || Nsec3Params::new(0, Vec::new()),
            ))),
            NsecMode::None => None,
        }
    }

    /// Active KSKs and ZSKs of the policy algorithm. Both roles must be
    /// present for the zone to be signable.
    pub fn select_keys<'a>(&self, keys: &'a [Key]) -> Result<(Vec<&'a Key>, Vec<&'a Key>)> {
        let (ksks, zsks): (Vec<&Key>, Vec<&Key>) = keys
            .iter()
            .filter(|k| k.active && k.algorithm == self.algorithm)
            .partition(|k| k.is_ksk);

        if ksks.is_empty() || zsks.is_empty() {
            return Err(SignerError::ZoneNotSignable(format!(
                "need an active {} KSK and ZSK (have {} KSK, {} ZSK)",
                self.algorithm,
                ksks.len(),
                zsks.len()
            )));
        }
        Ok((ksks, zsks))
    }
}

/// Derives signing parameters from zone state. Stateless apart from the
/// configured jitter; safe to share between workers.
#[derive(Debug, Clone, Default)]
pub struct SigningPolicyResolver {
    jitter: Duration,
}

impl SigningPolicyResolver {
    pub fn new(jitter: Duration) -> Self {
        Self { jitter }
    }

    pub fn resolve(&self, view: &ZoneView) -> Result<SigningPolicy> {
        let zone = &view.zone;
        if view.active_key_count == 0 {
            return Err(SignerError::ZoneNotSignable(format!(
                "{} has no active keys",
                zone.origin
            )));
        }
        if !zone.dnssec_enabled {
            return Err(SignerError::NotEnabled(zone.origin.clone()));
        }
        if zone.signature_refresh_secs >= zone.signature_validity_secs {
            return Err(SignerError::InvalidSignatureWindow {
                validity: zone.signature_validity_secs,
                refresh: zone.signature_refresh_secs,
            });
        }

        let nsec3 = if zone.nsec_mode == NsecMode::Nsec3 {
            let salt = hex::decode(&zone.nsec3_salt).map_err(|_| {
                SignerError::Storage(format!("corrupt NSEC3 salt for {}", zone.origin))
            })?;
            Some(Nsec3Params::new(zone.nsec3_iterations, salt))
        } else {
            None
        };

        let validity_window = Duration::from_secs(u64::from(zone.signature_validity_secs));
        let refresh_window = Duration::from_secs(u64::from(zone.signature_refresh_secs));

        Ok(SigningPolicy {
            algorithm: zone.preferred_algorithm.unwrap_or(DEFAULT_ALGORITHM),
            nsec_mode: zone.nsec_mode,
            validity_window,
            refresh_window,
            // Jitter never eats into the refresh margin
            jitter: self.jitter.min(refresh_window / 2),
            auto_sign: zone.auto_sign,
            nsec3,
            denial_note: zone.nsec_mode.description(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Zone;
    use chrono::Utc;

    fn view(active_key_count: usize) -> ZoneView {
        ZoneView {
            zone: Zone {
                id: 1,
                origin: "example.com.".to_string(),
                dnssec_enabled: true,
                nsec_mode: NsecMode::Nsec3,
                preferred_algorithm: Some(DnsSecAlgorithm::Ed25519),
                auto_sign: true,
                signature_validity_secs: 86400 * 14,
                signature_refresh_secs: 86400 * 3,
                nsec3_iterations: 0,
                nsec3_salt: "aabbccdd".to_string(),
                created_at: Utc::now(),
                last_signed_at: None,
            },
            active_key_count,
            signature_count: 0,
        }
    }

    #[test]
    fn test_no_active_keys_is_not_signable() {
        let resolver = SigningPolicyResolver::default();
        assert!(matches!(
            resolver.resolve(&view(0)),
            Err(SignerError::ZoneNotSignable(_))
        ));
    }

    #[test]
    fn test_resolves_zone_parameters() {
        let resolver = SigningPolicyResolver::new(Duration::from_secs(3600));
        let policy = resolver.resolve(&view(2)).unwrap();
        assert_eq!(policy.algorithm, DnsSecAlgorithm::Ed25519);
        assert_eq!(policy.validity_window, Duration::from_secs(86400 * 14));
        assert_eq!(policy.jitter, Duration::from_secs(3600));
        assert_eq!(
            policy.nsec3,
            Some(Nsec3Params::new(0, vec![0xaa, 0xbb, 0xcc, 0xdd]))
        );
        assert!(matches!(policy.denial_chain(), Some(DenialChain::Nsec3(_))));
    }

    #[test]
    fn test_jitter_capped_by_refresh() {
        let resolver = SigningPolicyResolver::new(Duration::from_secs(86400 * 10));
        let policy = resolver.resolve(&view(2)).unwrap();
        assert_eq!(policy.jitter, Duration::from_secs(86400 * 3 / 2));
    }

    #[test]
    fn test_disabled_zone_is_rejected() {
        let mut view = view(2);
        view.zone.dnssec_enabled = false;
        assert!(matches!(
            SigningPolicyResolver::default().resolve(&view),
            Err(SignerError::NotEnabled(_))
        ));
    }
}
