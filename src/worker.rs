//! Background tasks: signing workers, the stale-entry reaper and the
//! refresh scheduler.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tracing::{debug, error, info, warn};

use crate::dnssec::{RrSet, Rrsig, RrsigTemplate, rtype, wire};
use crate::engine::SigningEngine;
use crate::error::{Result, SignerError};
use crate::model::{
    Key, KeyId, QueueStatus, SigningQueueEntry, SigningReason, SigningScope, Zone,
};
use crate::policy::SigningPolicy;
use crate::queue::EnqueueRequest;
use crate::records::{SIGNER_OWNED_TYPES, SignedZone};

/// Signatures are valid from one hour in the past to absorb clock skew
const INCEPTION_BACKDATE: Duration = Duration::from_secs(3600);

/// Result of signing one queue entry, before it is published
#[derive(Debug)]
pub struct SignedOutput {
    pub zone: Zone,
    pub scope: SigningScope,
    pub signed_at: DateTime<Utc>,
    pub payload: SignedPayload,
    pub rrsets: usize,
    pub signatures: usize,
}

#[derive(Debug)]
pub enum SignedPayload {
    Full(SignedZone),
    Rrset {
        name: String,
        rtype: u16,
        rrsigs: Vec<Rrsig>,
    },
}

/// Consumes the signing queue
#[derive(Clone)]
pub struct SigningWorker {
    id: usize,
    engine: Arc<SigningEngine>,
}

impl SigningWorker {
    pub fn new(id: usize, engine: Arc<SigningEngine>) -> Self {
        Self { id, engine }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let poll_interval = self.engine.config().poll_interval();
        info!("Signing worker {} started", self.id);

        loop {
            let worked = match self.process_next().await {
                Ok(entry) => entry.is_some(),
                Err(e) => {
                    error!("Signing worker {} error: {}", self.id, e);
                    false
                }
            };

            if worked {
                match shutdown.try_recv() {
                    Err(TryRecvError::Empty) => continue,
                    _ => break,
                }
            }

            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
        info!("Signing worker {} stopped", self.id);
    }

    /// Claim and process one entry. Returns the finished entry, or None if
    /// the queue had no pending work.
    pub async fn process_next(&self) -> Result<Option<SigningQueueEntry>> {
        let engine = self.engine.clone();
        let claimed = tokio::task::spawn_blocking(move || engine.queue().claim())
            .await
            .map_err(|e| SignerError::Storage(format!("claim task failed: {}", e)))??;
        let Some(entry) = claimed else {
            return Ok(None);
        };
        debug!(
            "Worker {} processing entry {} for {}",
            self.id, entry.id, entry.origin
        );

        let started = Instant::now();
        let engine = self.engine.clone();
        let job = entry.clone();
        let outcome = match tokio::task::spawn_blocking(move || sign_entry(&engine, &job)).await {
            Ok(result) => result,
            Err(e) => Err(SignerError::Crypto(format!(
                "internal error: signing task aborted ({})",
                e
            ))),
        };

        let engine = self.engine.clone();
        let finished = tokio::task::spawn_blocking(move || {
            finish_entry(&engine, &entry, outcome, started.elapsed())
        })
        .await
        .map_err(|e| SignerError::Storage(format!("completion task failed: {}", e)))??;
        Ok(Some(finished))
    }
}

/// Compute signatures for a claimed entry. Nothing is published here.
pub fn sign_entry(engine: &SigningEngine, entry: &SigningQueueEntry) -> Result<SignedOutput> {
    let keystore = engine.keystore();
    let view = keystore.zone_view(entry.zone_id)?;
    let policy = engine.policy().resolve(&view)?;
    let zone = view.zone;

    let keys = keystore.active_keys(zone.id);
    let (ksks, zsks) = policy.select_keys(&keys)?;
    let private_keys = ksks
        .iter()
        .chain(zsks.iter())
        .map(|key| Ok((key.id, keystore.private_key(key)?)))
        .collect::<Result<HashMap<KeyId, Vec<u8>>>>()?;

    let signer = ZoneSigner {
        engine,
        policy: &policy,
        origin: &zone.origin,
        ksks: &ksks,
        zsks: &zsks,
        private_keys: &private_keys,
        now: Utc::now(),
    };

    let source: Vec<RrSet> = engine
        .records()
        .rrsets(&zone.origin)?
        .into_iter()
        .map(|mut set| {
            set.name = wire::fqdn(&set.name);
            set
        })
        .filter(|set| wire::is_in_zone(&set.name, &zone.origin))
        .filter(|set| !SIGNER_OWNED_TYPES.contains(&set.rtype))
        .collect();
    let dnskey = dnskey_rrset(&zone.origin, &keys, engine.config().default_ttl);

    // An RRset-scoped request that adds or removes an owner/type needs the
    // denial chain rebuilt, so it is signed as a full zone
    let scope = match &entry.scope {
        SigningScope::Rrset { name, rtype } => {
            let exists = source.iter().any(|s| s.name == *name && s.rtype == *rtype);
            let was_signed = engine
                .signatures()
                .get(zone.id)
                .is_some_and(|signed| signed.signatures.contains_key(&(name.clone(), *rtype)));
            if exists == was_signed && *rtype != rtype::DNSKEY {
                entry.scope.clone()
            } else {
                SigningScope::Full
            }
        }
        SigningScope::Full => SigningScope::Full,
    };

    let (payload, rrsets) = match &scope {
        SigningScope::Full => {
            let (signed, rrsets) = signer.sign_full(source, dnskey)?;
            (SignedPayload::Full(signed), rrsets)
        }
        SigningScope::Rrset { name, rtype } => {
            let cuts = delegation_cuts(&source, &zone.origin);
            let rrsigs = match source.iter().find(|s| s.name == *name && s.rtype == *rtype) {
                Some(rrset) if is_signed_authoritatively(rrset, &cuts) => {
                    signer.sign_rrset(rrset)?
                }
                _ => Vec::new(),
            };
            let payload = SignedPayload::Rrset {
                name: name.clone(),
                rtype: *rtype,
                rrsigs,
            };
            (payload, 1)
        }
    };

    let signed_at = signer.now;
    Ok(SignedOutput {
        zone,
        scope,
        signed_at,
        signatures: payload.signature_count(),
        payload,
        rrsets,
    })
}

impl SignedPayload {
    pub fn signature_count(&self) -> usize {
        match self {
            SignedPayload::Full(signed) => signed.signature_count(),
            SignedPayload::Rrset { rrsigs, .. } => rrsigs.len(),
        }
    }
}

struct ZoneSigner<'a> {
    engine: &'a SigningEngine,
    policy: &'a SigningPolicy,
    origin: &'a str,
    ksks: &'a [&'a Key],
    zsks: &'a [&'a Key],
    private_keys: &'a HashMap<KeyId, Vec<u8>>,
    now: DateTime<Utc>,
}

impl ZoneSigner<'_> {
    fn window(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        let jitter_secs = self.policy.jitter.as_secs();
        let jitter = if jitter_secs > 0 {
            rand::rng().random_range(0..=jitter_secs)
        } else {
            0
        };
        let inception = self.now - chrono::Duration::seconds(INCEPTION_BACKDATE.as_secs() as i64);
        let expiration = self.now
            + chrono::Duration::seconds(self.policy.validity_window.as_secs() as i64)
            - chrono::Duration::seconds(jitter as i64);
        (inception, expiration)
    }

    /// Sign one RRset with every ZSK, or every KSK for the DNSKEY RRset
    fn sign_rrset(&self, rrset: &RrSet) -> Result<Vec<Rrsig>> {
        let keys = if rrset.rtype == rtype::DNSKEY {
            self.ksks
        } else {
            self.zsks
        };
        let (inception, expiration) = self.window();
        let crypto = self.engine.crypto();

        keys.iter()
            .map(|key| {
                let private_key = self.private_keys.get(&key.id).ok_or_else(|| {
                    SignerError::Crypto(format!("private key {} unavailable", key.id))
                })?;
                RrsigTemplate::for_rrset(
                    rrset,
                    key.algorithm,
                    key.key_tag,
                    self.origin,
                    inception,
                    expiration,
                )
                .sign(rrset, crypto.as_ref(), private_key)
            })
            .collect()
    }

    /// Sign every authoritative RRset plus the DNSKEY RRset and denial chain.
    /// Returns the signed zone and the number of RRsets signed.
    fn sign_full(&self, source: Vec<RrSet>, dnskey: RrSet) -> Result<(SignedZone, usize)> {
        let cuts = delegation_cuts(&source, self.origin);

        let mut zone_rrsets = source;
        zone_rrsets.push(dnskey.clone());

        let denial = match self.policy.denial_chain() {
            Some(chain) => chain.build(self.origin, &zone_rrsets, self.engine.config().default_ttl),
            None => Vec::new(),
        };

        let mut signatures: BTreeMap<(String, u16), Vec<Rrsig>> = BTreeMap::new();
        let mut rrsets = 0;
        for rrset in zone_rrsets.iter().chain(denial.iter()) {
            if !is_signed_authoritatively(rrset, &cuts) {
                continue;
            }
            let rrsigs = self.sign_rrset(rrset)?;
            rrsets += 1;
            signatures
                .entry((rrset.name.clone(), rrset.rtype))
                .or_default()
                .extend(rrsigs);
        }

        let signed = SignedZone {
            signed_at: Some(self.now),
            dnskey: Some(dnskey),
            denial,
            signatures,
        };
        Ok((signed, rrsets))
    }
}

/// Owner names of delegations below the apex
fn delegation_cuts(rrsets: &[RrSet], origin: &str) -> Vec<String> {
    rrsets
        .iter()
        .filter(|s| s.rtype == rtype::NS && s.name != origin)
        .map(|s| s.name.clone())
        .collect()
}

/// Delegation NS records and glue below a cut are not signed by the parent;
/// DS and NSEC at the cut are
fn is_signed_authoritatively(rrset: &RrSet, cuts: &[String]) -> bool {
    cuts.iter().all(|cut| {
        if rrset.name == *cut {
            matches!(rrset.rtype, rtype::DS | rtype::NSEC)
        } else {
            !wire::is_in_zone(&rrset.name, cut)
        }
    })
}

/// DNSKEY RRset published at the apex: every active key of the zone
pub fn dnskey_rrset(origin: &str, keys: &[Key], ttl: u32) -> RrSet {
    keys.iter()
        .filter(|k| k.active)
        .fold(RrSet::new(origin, rtype::DNSKEY, ttl), |set, key| {
            set.with_rdata(key.dnskey_rdata())
        })
}

/// Publish a signing result and move the entry to its final state.
/// Errors from signing become a failed entry; they are not returned. A claim
/// that was reclaimed while signing returns `ClaimLost` and publishes nothing.
pub fn finish_entry(
    engine: &SigningEngine,
    entry: &SigningQueueEntry,
    outcome: Result<SignedOutput>,
    elapsed: Duration,
) -> Result<SigningQueueEntry> {
    let metrics = engine.metrics();
    let output = match outcome {
        Ok(output) => output,
        Err(e) => {
            let failed = engine.queue().fail(entry, &e.to_string())?;
            metrics.record_failed();
            return Ok(failed);
        }
    };

    let SignedOutput {
        zone,
        scope,
        signed_at,
        payload,
        rrsets,
        signatures,
    } = output;

    let keystore = engine.keystore();
    let mut published = false;
    let finished = keystore.with_zone_lock(entry.zone_id, || {
        engine.queue().settle(entry, || {
            let enabled = keystore
                .zone(entry.zone_id)
                .is_ok_and(|z| z.dnssec_enabled);
            if !enabled {
                warn!(
                    "Zone {} was disabled while entry {} was processing; signatures discarded",
                    entry.origin, entry.id
                );
                return Ok("zone no longer DNSSEC-enabled, signatures discarded".to_string());
            }

            // The zone record is written first so a storage failure leaves
            // the previous signatures in place
            keystore.mark_signed(entry.zone_id, signed_at)?;
            match payload {
                SignedPayload::Full(signed) => engine.signatures().replace(entry.zone_id, signed),
                SignedPayload::Rrset {
                    name,
                    rtype,
                    rrsigs,
                } => engine
                    .signatures()
                    .update_rrset(entry.zone_id, &name, rtype, rrsigs, signed_at),
            }
            published = true;
            Ok(format!(
                "signed {} RRsets ({} signatures, scope {}) for {}",
                rrsets, signatures, scope, zone.origin
            ))
        })
    })?;

    if finished.status == QueueStatus::Failed {
        metrics.record_failed();
    } else {
        metrics.record_completed(
            if scope.is_full() { "full" } else { "rrset" },
            elapsed,
            if published { signatures } else { 0 },
        );
    }
    Ok(finished)
}

/// Returns entries stuck in `processing` to `pending`
pub struct Reaper {
    engine: Arc<SigningEngine>,
}

impl Reaper {
    pub fn new(engine: Arc<SigningEngine>) -> Self {
        Self { engine }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.engine.config().reaper_interval());
        let threshold = self.engine.config().processing_timeout();
        info!(
            "Reaper started (timeout {}s, interval {}s)",
            threshold.as_secs(),
            self.engine.config().reaper_interval_secs
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = interval.tick() => {
                    let engine = self.engine.clone();
                    let result =
                        tokio::task::spawn_blocking(move || engine.queue().reclaim_stale(threshold))
                            .await;
                    match result {
                        Ok(Ok(reclaimed)) if !reclaimed.is_empty() => {
                            info!("Reaper reclaimed {} stale entries", reclaimed.len());
                        }
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => error!("Reaper failed: {}", e),
                        Err(e) => error!("Reaper task failed: {}", e),
                    }
                }
            }
        }
        info!("Reaper stopped");
    }
}

/// Queues scheduled re-signing and retires expired keys
pub struct RefreshScheduler {
    engine: Arc<SigningEngine>,
}

impl RefreshScheduler {
    pub fn new(engine: Arc<SigningEngine>) -> Self {
        Self { engine }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.engine.config().scheduler_interval());
        info!(
            "Refresh scheduler started (interval {}s)",
            self.engine.config().scheduler_interval_secs
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = interval.tick() => {
                    let engine = self.engine.clone();
                    let result = tokio::task::spawn_blocking(move || {
                        Self::run_once(&engine, Utc::now())
                    })
                    .await;
                    match result {
                        Ok(Ok(queued)) if !queued.is_empty() => {
                            info!("Scheduled {} zones for refresh", queued.len());
                        }
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => error!("Refresh scheduler failed: {}", e),
                        Err(e) => error!("Refresh scheduler task failed: {}", e),
                    }
                }
            }
        }
        info!("Refresh scheduler stopped");
    }

    /// One scheduling pass at `now`
    pub fn run_once(engine: &SigningEngine, now: DateTime<Utc>) -> Result<Vec<SigningQueueEntry>> {
        let retired = engine.keystore().retire_expired_keys(now)?;
        if !retired.is_empty() {
            info!("Retired {} expired keys", retired.len());
        }

        let reason = SigningReason::ScheduledRefresh;
        let keystore = engine.keystore();
        let mut queued = Vec::new();
        for zone in keystore.zones() {
            // Re-read under the zone lock so a concurrent disable is seen
            let entry = keystore.with_zone_lock(zone.id, || {
                let zone = keystore.zone(zone.id)?;
                if !(zone.dnssec_enabled && zone.auto_sign) {
                    return Ok(None);
                }
                if keystore.active_key_count(zone.id) == 0 {
                    return Ok(None);
                }
                let due = match zone.last_signed_at {
                    None => true,
                    Some(last) => {
                        let age = now.signed_duration_since(last).num_seconds();
                        let margin = i64::from(zone.signature_validity_secs)
                            - i64::from(zone.signature_refresh_secs);
                        age >= margin
                    }
                };
                if !due {
                    return Ok(None);
                }
                debug!("Zone {} is due for re-signing", zone.origin);
                engine
                    .queue()
                    .enqueue(EnqueueRequest::full(
                        zone.id,
                        &zone.origin,
                        reason,
                        reason.default_priority(),
                    ))
                    .map(Some)
            })?;
            queued.extend(entry);
        }
        Ok(queued)
    }
}
