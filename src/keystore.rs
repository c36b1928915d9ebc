//! DNSSEC key material and zone DNSSEC state.
//!
//! Mutations on a zone are serialised through a per-zone lock so that two
//! concurrent key generations cannot both pass the key tag uniqueness check.
//! State changes are applied copy-on-write: the audit records and the new
//! state are persisted first and only then does the state become visible.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::audit::{AuditLog, AuditRecord};
use crate::config::SignerConfig;
use crate::dnssec::{
    CryptoProvider, DigestType, DnsSecAlgorithm, DsRecord, FLAGS_KSK, FLAGS_ZSK, KeySealer, wire,
    zone_key_tag,
};
use crate::error::{Result, SignerError};
use crate::metrics::SignerMetrics;
use crate::model::{
    AuditOperation, Key, KeyId, NsecMode, SigningQueueEntry, SigningReason, Zone, ZoneId,
    ZoneView,
};
use crate::policy::DEFAULT_ALGORITHM;
use crate::queue::{EnqueueRequest, SigningQueue};
use crate::records::SignatureStore;
use crate::storage::{KeyStoreSnapshot, Storage};

/// Key store behaviour taken from configuration
#[derive(Debug, Clone)]
pub struct KeyStoreSettings {
    pub signature_validity_secs: u32,
    pub signature_refresh_secs: u32,
    pub nsec3_iterations: u16,
    pub nsec3_salt_length: u8,
    pub ksk_lifetime_days: Option<u32>,
    pub zsk_lifetime_days: Option<u32>,
    pub max_key_tag_attempts: u32,
}

impl Default for KeyStoreSettings {
    fn default() -> Self {
        Self::from(&SignerConfig::default())
    }
}

impl From<&SignerConfig> for KeyStoreSettings {
    fn from(config: &SignerConfig) -> Self {
        Self {
            signature_validity_secs: config.signature_validity_secs,
            signature_refresh_secs: config.signature_refresh_secs,
            nsec3_iterations: config.nsec3_iterations,
            nsec3_salt_length: config.nsec3_salt_length,
            ksk_lifetime_days: config.ksk_lifetime_days,
            zsk_lifetime_days: config.zsk_lifetime_days,
            max_key_tag_attempts: config.max_key_tag_attempts,
        }
    }
}

/// Parameters for `EnableDNSSEC`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnableRequest {
    pub algorithm: DnsSecAlgorithm,
    pub nsec_mode: NsecMode,
    pub auto_sign: bool,
    #[serde(default)]
    pub signature_validity_secs: Option<u32>,
    #[serde(default)]
    pub signature_refresh_secs: Option<u32>,
}

impl EnableRequest {
    pub fn new(algorithm: DnsSecAlgorithm, nsec_mode: NsecMode, auto_sign: bool) -> Self {
        Self {
            algorithm,
            nsec_mode,
            auto_sign,
            signature_validity_secs: None,
            signature_refresh_secs: None,
        }
    }
}

/// What `DisableDNSSEC` tore down
#[derive(Debug, Clone, Serialize)]
pub struct DisableOutcome {
    pub zone: Zone,
    pub deactivated_keys: Vec<KeyId>,
    pub cancelled_entries: Vec<SigningQueueEntry>,
}

#[derive(Debug, Clone, Default)]
struct KeyStoreState {
    zones: BTreeMap<ZoneId, Zone>,
    keys: BTreeMap<KeyId, Key>,
    next_zone_id: ZoneId,
    next_key_id: KeyId,
}

impl KeyStoreState {
    fn zone(&self, zone_id: ZoneId) -> Result<&Zone> {
        self.zones
            .get(&zone_id)
            .ok_or_else(|| SignerError::ZoneNotFound(zone_id.to_string()))
    }

    fn active_keys(&self, zone_id: ZoneId) -> impl Iterator<Item = &Key> {
        self.keys
            .values()
            .filter(move |k| k.zone_id == zone_id && k.active)
    }

    fn snapshot(&self) -> KeyStoreSnapshot {
        KeyStoreSnapshot::new(
            self.zones.values().cloned().collect(),
            self.keys.values().cloned().collect(),
        )
    }
}

pub struct KeyStore {
    state: RwLock<KeyStoreState>,
    zone_locks: DashMap<ZoneId, Arc<Mutex<()>>>,
    storage: Arc<dyn Storage>,
    audit: Arc<AuditLog>,
    queue: Arc<SigningQueue>,
    signatures: Arc<SignatureStore>,
    crypto: Arc<dyn CryptoProvider>,
    sealer: KeySealer,
    metrics: Arc<SignerMetrics>,
    settings: KeyStoreSettings,
    rng: SystemRandom,
}

impl KeyStore {
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        storage: Arc<dyn Storage>,
        audit: Arc<AuditLog>,
        queue: Arc<SigningQueue>,
        signatures: Arc<SignatureStore>,
        crypto: Arc<dyn CryptoProvider>,
        sealer: KeySealer,
        metrics: Arc<SignerMetrics>,
        settings: KeyStoreSettings,
    ) -> Result<Self> {
        let mut state = KeyStoreState::default();
        if let Some(snapshot) = storage.load_keystore()? {
            for zone in snapshot.zones {
                state.next_zone_id = state.next_zone_id.max(zone.id);
                state.zones.insert(zone.id, zone);
            }
            for key in snapshot.keys {
                state.next_key_id = state.next_key_id.max(key.id);
                state.keys.insert(key.id, key);
            }
            info!(
                "Loaded {} zones and {} keys",
                state.zones.len(),
                state.keys.len()
            );
        }

        Ok(Self {
            state: RwLock::new(state),
            zone_locks: DashMap::new(),
            storage,
            audit,
            queue,
            signatures,
            crypto,
            sealer,
            metrics,
            settings,
            rng: SystemRandom::new(),
        })
    }

    fn zone_lock(&self, zone_id: ZoneId) -> Arc<Mutex<()>> {
        self.zone_locks
            .entry(zone_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run `f` while holding the zone's lock. Enqueueing and publishing go
    /// through here so they cannot interleave with a disable.
    pub fn with_zone_lock<T>(&self, zone_id: ZoneId, f: impl FnOnce() -> T) -> T {
        let lock = self.zone_lock(zone_id);
        let _guard = lock.lock();
        f()
    }

    /// Apply `mutate` to a copy of the state, write the audit records it
    /// staged, persist the copy, then publish it
    fn update<T>(
        &self,
        mutate: impl FnOnce(&mut KeyStoreState, &mut Vec<AuditRecord>) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.state.write();
        let mut next = state.clone();
        let mut records = Vec::new();
        let result = mutate(&mut next, &mut records)?;
        self.audit.append_all(records)?;
        self.storage.save_keystore(&next.snapshot())?;
        *state = next;
        Ok(result)
    }

    /// Register a zone with the signer; returns the existing zone if the
    /// origin is already known
    pub fn provision_zone(&self, origin: &str) -> Result<Zone> {
        if !wire::is_valid_name(origin) {
            return Err(SignerError::InvalidZoneName(origin.to_string()));
        }
        let origin = wire::fqdn(origin);
        if let Some(zone) = self.zone_by_origin(&origin) {
            return Ok(zone);
        }

        let settings = &self.settings;
        let zone = self.update(|state, _| {
            if let Some(existing) = state.zones.values().find(|z| z.origin == origin) {
                return Ok(existing.clone());
            }
            state.next_zone_id += 1;
            let zone = Zone {
                id: state.next_zone_id,
                origin: origin.clone(),
                dnssec_enabled: false,
                nsec_mode: NsecMode::default(),
                preferred_algorithm: None,
                auto_sign: false,
                signature_validity_secs: settings.signature_validity_secs,
                signature_refresh_secs: settings.signature_refresh_secs,
                nsec3_iterations: settings.nsec3_iterations,
                nsec3_salt: String::new(),
                created_at: Utc::now(),
                last_signed_at: None,
            };
            state.zones.insert(zone.id, zone.clone());
            Ok(zone)
        })?;
        info!("Provisioned zone {} (id {})", zone.origin, zone.id);
        Ok(zone)
    }

    pub fn enable_dnssec(&self, zone_id: ZoneId, request: EnableRequest) -> Result<Zone> {
        let lock = self.zone_lock(zone_id);
        let _guard = lock.lock();

        let current = self.zone(zone_id)?;
        if current.dnssec_enabled {
            return Err(SignerError::AlreadyEnabled(current.origin));
        }
        if !request.algorithm.is_supported() {
            return Err(SignerError::InvalidAlgorithm(format!(
                "{} ({})",
                request.algorithm,
                request.algorithm.to_u8()
            )));
        }

        let validity = request
            .signature_validity_secs
            .unwrap_or(self.settings.signature_validity_secs);
        let refresh = request
            .signature_refresh_secs
            .unwrap_or(self.settings.signature_refresh_secs);
        if refresh >= validity {
            return Err(SignerError::InvalidSignatureWindow { validity, refresh });
        }

        let salt = if request.nsec_mode == NsecMode::Nsec3 {
            self.random_salt()?
        } else {
            String::new()
        };

        let zone = self.update(|state, audit| {
            let zone = state
                .zones
                .get_mut(&zone_id)
                .ok_or_else(|| SignerError::ZoneNotFound(zone_id.to_string()))?;
            zone.dnssec_enabled = true;
            zone.nsec_mode = request.nsec_mode;
            zone.preferred_algorithm = Some(request.algorithm);
            zone.auto_sign = request.auto_sign;
            zone.signature_validity_secs = validity;
            zone.signature_refresh_secs = refresh;
            zone.nsec3_iterations = self.settings.nsec3_iterations;
            zone.nsec3_salt = salt;
            audit.push(AuditRecord::new(
                zone_id,
                AuditOperation::Enable,
                format!(
                    "DNSSEC enabled: algorithm {}, {}, auto-sign {}",
                    request.algorithm, request.nsec_mode, request.auto_sign
                ),
                true,
            ));
            Ok(zone.clone())
        })?;

        info!(
            "Enabled DNSSEC for {} ({}, {})",
            zone.origin, request.algorithm, request.nsec_mode
        );
        Ok(zone)
    }

    fn random_salt(&self) -> Result<String> {
        let mut salt = vec![0u8; self.settings.nsec3_salt_length as usize];
        self.rng
            .fill(&mut salt)
            .map_err(|_| SignerError::Crypto("random source unavailable".to_string()))?;
        Ok(hex::encode(salt))
    }

    /// Turn DNSSEC off: deactivate every key, cancel pending work and drop
    /// stored signatures. Processing entries drain on their own.
    pub fn disable_dnssec(&self, zone_id: ZoneId) -> Result<DisableOutcome> {
        let lock = self.zone_lock(zone_id);
        let _guard = lock.lock();

        let current = self.zone(zone_id)?;
        if !current.dnssec_enabled {
            return Err(SignerError::NotEnabled(current.origin));
        }

        // Once the zone is disabled nothing new can be queued for it, so the
        // purge below only has to catch what was already pending
        let now = Utc::now();
        let (zone, deactivated_keys) = self.update(|state, audit| {
            let deactivated: Vec<KeyId> = state.active_keys(zone_id).map(|k| k.id).collect();
            for id in &deactivated {
                if let Some(key) = state.keys.get_mut(id) {
                    key.active = false;
                    key.deactivated_at = Some(now);
                }
                audit.push(AuditRecord::new(
                    zone_id,
                    AuditOperation::KeyDeactivate,
                    format!("key {} deactivated by DNSSEC disable", id),
                    true,
                ));
            }
            let zone = state
                .zones
                .get_mut(&zone_id)
                .ok_or_else(|| SignerError::ZoneNotFound(zone_id.to_string()))?;
            zone.dnssec_enabled = false;
            zone.auto_sign = false;
            zone.last_signed_at = None;
            audit.push(AuditRecord::new(
                zone_id,
                AuditOperation::Disable,
                format!("DNSSEC disabled: {} keys deactivated", deactivated.len()),
                true,
            ));
            Ok((zone.clone(), deactivated))
        })?;
        self.metrics.record_key_deactivated(deactivated_keys.len());

        let cancelled_entries = self.queue.purge(zone_id)?;
        self.signatures.remove(zone_id);
        info!(
            "Disabled DNSSEC for {} ({} keys deactivated, {} entries cancelled)",
            zone.origin,
            deactivated_keys.len(),
            cancelled_entries.len()
        );

        Ok(DisableOutcome {
            zone,
            deactivated_keys,
            cancelled_entries,
        })
    }

    /// Generate and activate a key. Key material is generated without the
    /// zone lock held; the key tag uniqueness check and the insert happen
    /// under it.
    pub fn generate_key(
        &self,
        zone_id: ZoneId,
        algorithm: DnsSecAlgorithm,
        is_ksk: bool,
        key_size: Option<u32>,
    ) -> Result<Key> {
        let zone = self.zone(zone_id)?;
        if !zone.dnssec_enabled {
            return Err(SignerError::NotEnabled(zone.origin));
        }
        if !algorithm.is_supported() {
            return Err(SignerError::InvalidAlgorithm(format!(
                "{} ({})",
                algorithm,
                algorithm.to_u8()
            )));
        }
        algorithm
            .check_key_size(key_size)
            .map_err(SignerError::InvalidKeySize)?;

        let flags = if is_ksk { FLAGS_KSK } else { FLAGS_ZSK };
        let role = if is_ksk { "KSK" } else { "ZSK" };
        let attempts = self.settings.max_key_tag_attempts;
        let lifetime = if is_ksk {
            self.settings.ksk_lifetime_days
        } else {
            self.settings.zsk_lifetime_days
        };

        for attempt in 1..=attempts {
            let material = self.crypto.generate(algorithm, key_size)?;
            let key_tag = zone_key_tag(flags, algorithm.to_u8(), &material.public_key);
            let sealed = self.sealer.seal(&material.private_key)?;

            let lock = self.zone_lock(zone_id);
            let _guard = lock.lock();

            let zone = self.zone(zone_id)?;
            if !zone.dnssec_enabled {
                return Err(SignerError::NotEnabled(zone.origin));
            }
            let collides = self
                .state
                .read()
                .active_keys(zone_id)
                .any(|k| k.algorithm == algorithm && k.key_tag == key_tag);
            if collides {
                warn!(
                    "Key tag {} collides with an active key in {} (attempt {}/{})",
                    key_tag, zone.origin, attempt, attempts
                );
                continue;
            }

            let now = Utc::now();
            let key = self.update(|state, audit| {
                state.next_key_id += 1;
                let key = Key {
                    id: state.next_key_id,
                    zone_id,
                    algorithm,
                    key_tag,
                    is_ksk,
                    key_size,
                    public_key: material.public_key,
                    private_key: sealed,
                    active: true,
                    created_at: now,
                    activated_at: Some(now),
                    expires_at: lifetime.map(|days| now + chrono::Duration::days(i64::from(days))),
                    deactivated_at: None,
                };
                audit.push(AuditRecord::new(
                    zone_id,
                    AuditOperation::KeyGenerate,
                    format!(
                        "{} {} generated (id {}, tag {})",
                        algorithm, role, key.id, key.key_tag
                    ),
                    true,
                ));
                state.keys.insert(key.id, key.clone());
                Ok(key)
            })?;

            self.metrics
                .record_key_generated(&algorithm.to_string(), is_ksk);
            info!(
                "Generated {} {} for {} (tag {})",
                algorithm, role, zone.origin, key.key_tag
            );

            self.enqueue_rotation(zone_id)?;
            return Ok(key);
        }

        self.audit.append(
            zone_id,
            AuditOperation::KeyGenerate,
            format!(
                "{} {} generation failed: no unique key tag after {} attempts",
                algorithm, role, attempts
            ),
            false,
        )?;
        Err(SignerError::KeyTagExhausted(attempts))
    }

    pub fn deactivate_key(&self, key_id: KeyId) -> Result<Key> {
        let zone_id = self
            .key(key_id)
            .ok_or_else(|| SignerError::NotFound(format!("key {}", key_id)))?
            .zone_id;
        let lock = self.zone_lock(zone_id);
        let _guard = lock.lock();

        let key = self.deactivate_locked(key_id, "deactivated")?;
        self.enqueue_rotation(zone_id)?;
        Ok(key)
    }

    /// Deactivate with the zone lock held
    fn deactivate_locked(&self, key_id: KeyId, note: &str) -> Result<Key> {
        let (key, last_of_role) = {
            let state = self.state.read();
            let key = state
                .keys
                .get(&key_id)
                .cloned()
                .ok_or_else(|| SignerError::NotFound(format!("key {}", key_id)))?;
            if !key.active {
                return Err(SignerError::AlreadyInactive(key_id));
            }
            // Only keys of the signing algorithm are used by queued work
            let signing_algorithm = state
                .zone(key.zone_id)?
                .preferred_algorithm
                .unwrap_or(DEFAULT_ALGORITHM);
            let same_role = state
                .active_keys(key.zone_id)
                .filter(|k| k.is_ksk == key.is_ksk && k.algorithm == signing_algorithm)
                .count();
            let last = key.algorithm == signing_algorithm && same_role == 1;
            (key, last)
        };

        if last_of_role && self.queue.has_open_work(key.zone_id) {
            return Err(SignerError::KeyInUse(key_id));
        }

        let now = Utc::now();
        let key = self.update(|state, audit| {
            let key = state
                .keys
                .get_mut(&key_id)
                .ok_or_else(|| SignerError::NotFound(format!("key {}", key_id)))?;
            key.active = false;
            key.deactivated_at = Some(now);
            audit.push(AuditRecord::new(
                key.zone_id,
                AuditOperation::KeyDeactivate,
                format!("{} {} tag {} {}", key.algorithm, key.role(), key.key_tag, note),
                true,
            ));
            Ok(key.clone())
        })?;

        self.metrics.record_key_deactivated(1);
        info!("Deactivated key {} (tag {}): {}", key.id, key.key_tag, note);
        Ok(key)
    }

    /// Queue key-rotation signing for auto-sign zones that can be signed
    fn enqueue_rotation(&self, zone_id: ZoneId) -> Result<()> {
        let Some(zone) = self.zone(zone_id).ok() else {
            return Ok(());
        };
        if !(zone.dnssec_enabled && zone.auto_sign && self.has_both_roles(zone_id)) {
            return Ok(());
        }
        let reason = SigningReason::KeyRotation;
        self.queue.enqueue(EnqueueRequest::full(
            zone_id,
            &zone.origin,
            reason,
            reason.default_priority(),
        ))?;
        Ok(())
    }

    fn has_both_roles(&self, zone_id: ZoneId) -> bool {
        let state = self.state.read();
        let mut ksk = false;
        let mut zsk = false;
        for key in state.active_keys(zone_id) {
            ksk |= key.is_ksk;
            zsk |= !key.is_ksk;
        }
        ksk && zsk
    }

    /// Retire expired keys that have an active, unexpired successor of the
    /// same role and algorithm
    pub fn retire_expired_keys(&self, now: DateTime<Utc>) -> Result<Vec<Key>> {
        let candidates: Vec<Key> = {
            let state = self.state.read();
            state
                .keys
                .values()
                .filter(|k| k.active && k.is_expired(now))
                .filter(|k| {
                    state.active_keys(k.zone_id).any(|other| {
                        other.id != k.id
                            && other.is_ksk == k.is_ksk
                            && other.algorithm == k.algorithm
                            && !other.is_expired(now)
                    })
                })
                .cloned()
                .collect()
        };

        let mut retired = Vec::new();
        for key in candidates {
            let lock = self.zone_lock(key.zone_id);
            let _guard = lock.lock();
            match self.deactivate_locked(key.id, "retired after expiry") {
                Ok(key) => retired.push(key),
                Err(SignerError::AlreadyInactive(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let mut zones: Vec<ZoneId> = retired.iter().map(|k| k.zone_id).collect();
        zones.sort_unstable();
        zones.dedup();
        for zone_id in zones {
            self.with_zone_lock(zone_id, || self.enqueue_rotation(zone_id))?;
        }
        Ok(retired)
    }

    /// Record a successful signing run
    pub fn mark_signed(&self, zone_id: ZoneId, at: DateTime<Utc>) -> Result<()> {
        self.update(|state, _| {
            if let Some(zone) = state.zones.get_mut(&zone_id) {
                zone.last_signed_at = Some(at);
            }
            Ok(())
        })
    }

    /// Decrypt a key's private material for signing
    pub fn private_key(&self, key: &Key) -> Result<Vec<u8>> {
        self.sealer.open(&key.private_key)
    }

    pub fn zone(&self, zone_id: ZoneId) -> Result<Zone> {
        self.state.read().zone(zone_id).cloned()
    }

    pub fn zone_by_origin(&self, origin: &str) -> Option<Zone> {
        let origin = wire::fqdn(origin);
        self.state
            .read()
            .zones
            .values()
            .find(|z| z.origin == origin)
            .cloned()
    }

    pub fn zones(&self) -> Vec<Zone> {
        self.state.read().zones.values().cloned().collect()
    }

    pub fn zone_view(&self, zone_id: ZoneId) -> Result<ZoneView> {
        let zone = self.zone(zone_id)?;
        Ok(self.view_of(zone))
    }

    pub fn zone_views(&self) -> Vec<ZoneView> {
        self.zones().into_iter().map(|z| self.view_of(z)).collect()
    }

    fn view_of(&self, zone: Zone) -> ZoneView {
        let active_key_count = self.active_key_count(zone.id);
        let signature_count = self.signatures.signature_count(zone.id);
        ZoneView {
            zone,
            active_key_count,
            signature_count,
        }
    }

    pub fn key(&self, key_id: KeyId) -> Option<Key> {
        self.state.read().keys.get(&key_id).cloned()
    }

    /// All keys of a zone, active and retired
    pub fn keys(&self, zone_id: ZoneId) -> Vec<Key> {
        self.state
            .read()
            .keys
            .values()
            .filter(|k| k.zone_id == zone_id)
            .cloned()
            .collect()
    }

    pub fn active_keys(&self, zone_id: ZoneId) -> Vec<Key> {
        self.state.read().active_keys(zone_id).cloned().collect()
    }

    pub fn active_key_count(&self, zone_id: ZoneId) -> usize {
        self.state.read().active_keys(zone_id).count()
    }

    pub fn total_active_keys(&self) -> usize {
        self.state.read().keys.values().filter(|k| k.active).count()
    }

    /// DS records for the zone's active KSKs, SHA-256 and SHA-384
    pub fn ds_records(&self, zone_id: ZoneId) -> Result<Vec<DsRecord>> {
        let zone = self.zone(zone_id)?;
        if !zone.dnssec_enabled {
            return Err(SignerError::NotEnabled(zone.origin));
        }
        let records = self
            .active_keys(zone_id)
            .iter()
            .filter(|k| k.is_ksk)
            .flat_map(|k| {
                [DigestType::Sha256, DigestType::Sha384]
                    .into_iter()
                    .map(|digest| k.ds_record(&zone.origin, digest))
            })
            .collect::<Vec<_>>();
        debug!("Built {} DS records for {}", records.len(), zone.origin);
        Ok(records)
    }
}
