//! Wiring of the signing core: storage, audit log, queue, key store,
//! policy resolver and the background tasks that drive them.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::audit::AuditLog;
use crate::config::SignerConfig;
use crate::dnssec::{CryptoProvider, KeySealer, SystemCryptoProvider};
use crate::error::{Result, SignerError};
use crate::graceful_shutdown::GracefulShutdown;
use crate::keystore::{KeyStore, KeyStoreSettings};
use crate::metrics::SignerMetrics;
use crate::model::{EntryId, SigningQueueEntry, SigningReason, SigningScope, ZoneId};
use crate::policy::SigningPolicyResolver;
use crate::queue::{EnqueueRequest, SigningQueue};
use crate::records::{RecordSource, SignatureStore};
use crate::storage::{FileStorage, MemoryStorage, Storage};
use crate::worker::{Reaper, RefreshScheduler, SigningWorker};

pub struct SigningEngine {
    config: SignerConfig,
    audit: Arc<AuditLog>,
    queue: Arc<SigningQueue>,
    keystore: Arc<KeyStore>,
    signatures: Arc<SignatureStore>,
    records: Arc<dyn RecordSource>,
    crypto: Arc<dyn CryptoProvider>,
    policy: SigningPolicyResolver,
    metrics: Arc<SignerMetrics>,
}

impl SigningEngine {
    /// Open the engine from configuration, using durable storage when a
    /// data directory is configured
    pub fn open(config: SignerConfig, records: Arc<dyn RecordSource>) -> Result<Self> {
        config.validate()?;

        let storage: Arc<dyn Storage> = match &config.data_dir {
            Some(dir) => {
                info!("Using durable state in {}", dir.display());
                Arc::new(FileStorage::open(dir, config.fsync)?)
            }
            None => {
                warn!("No data directory configured; state will not survive a restart");
                Arc::new(MemoryStorage::new())
            }
        };

        let sealer = match config.master_key_bytes()? {
            Some(key) => KeySealer::new(&key)?,
            None => {
                warn!(
                    "No master key configured; private keys are sealed with an ephemeral key \
                     and cannot be recovered after a restart"
                );
                KeySealer::ephemeral()?
            }
        };

        Self::with_components(
            config,
            storage,
            records,
            Arc::new(SystemCryptoProvider::new()),
            sealer,
        )
    }

    /// Assemble the engine from explicit components
    pub fn with_components(
        config: SignerConfig,
        storage: Arc<dyn Storage>,
        records: Arc<dyn RecordSource>,
        crypto: Arc<dyn CryptoProvider>,
        sealer: KeySealer,
    ) -> Result<Self> {
        let metrics = Arc::new(
            SignerMetrics::new()
                .map_err(|e| SignerError::Config(format!("metrics registry: {}", e)))?,
        );
        let audit = Arc::new(AuditLog::open(storage.clone())?);
        let queue = Arc::new(SigningQueue::open(
            storage.clone(),
            audit.clone(),
            metrics.clone(),
        )?);
        let signatures = Arc::new(SignatureStore::new());
        let keystore = Arc::new(KeyStore::open(
            storage,
            audit.clone(),
            queue.clone(),
            signatures.clone(),
            crypto.clone(),
            sealer,
            metrics.clone(),
            KeyStoreSettings::from(&config),
        )?);
        let policy = SigningPolicyResolver::new(std::time::Duration::from_secs(u64::from(
            config.signature_jitter_secs,
        )));

        Ok(Self {
            config,
            audit,
            queue,
            keystore,
            signatures,
            records,
            crypto,
            policy,
            metrics,
        })
    }

    pub fn config(&self) -> &SignerConfig {
        &self.config
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub fn queue(&self) -> &Arc<SigningQueue> {
        &self.queue
    }

    pub fn keystore(&self) -> &Arc<KeyStore> {
        &self.keystore
    }

    pub fn signatures(&self) -> &Arc<SignatureStore> {
        &self.signatures
    }

    pub fn records(&self) -> &Arc<dyn RecordSource> {
        &self.records
    }

    pub fn crypto(&self) -> &Arc<dyn CryptoProvider> {
        &self.crypto
    }

    pub fn policy(&self) -> &SigningPolicyResolver {
        &self.policy
    }

    pub fn metrics(&self) -> &Arc<SignerMetrics> {
        &self.metrics
    }

    /// Provision the zones listed in configuration
    pub fn provision_configured_zones(&self) -> Result<()> {
        for origin in &self.config.zones {
            self.keystore.provision_zone(origin)?;
        }
        Ok(())
    }

    /// Queue a manual full re-sign of a DNSSEC-enabled zone
    pub fn request_sign(&self, zone_id: ZoneId, priority: Option<i32>) -> Result<SigningQueueEntry> {
        let zone_id = self.keystore.zone(zone_id)?.id;
        self.keystore.with_zone_lock(zone_id, || {
            let zone = self.keystore.zone(zone_id)?;
            if !zone.dnssec_enabled {
                return Err(SignerError::NotEnabled(zone.origin));
            }
            self.queue.enqueue(EnqueueRequest::full(
                zone.id,
                &zone.origin,
                SigningReason::Manual,
                priority.unwrap_or(self.config.default_priority),
            ))
        })
    }

    /// Zone contents changed. Auto-sign zones get a record-change entry;
    /// other zones are left alone.
    pub fn notify_records_changed(
        &self,
        zone_id: ZoneId,
        scope: SigningScope,
    ) -> Result<Option<SigningQueueEntry>> {
        let zone_id = self.keystore.zone(zone_id)?.id;
        self.keystore.with_zone_lock(zone_id, || {
            let zone = self.keystore.zone(zone_id)?;
            if !(zone.dnssec_enabled && zone.auto_sign) {
                return Ok(None);
            }
            let reason = SigningReason::RecordChange;
            let entry = self.queue.enqueue(
                EnqueueRequest::full(zone.id, &zone.origin, reason, reason.default_priority())
                    .with_scope(scope),
            )?;
            Ok(Some(entry))
        })
    }

    /// Re-queue a failed entry. The zone must still be DNSSEC-enabled.
    pub fn retry_entry(&self, id: EntryId, priority: Option<i32>) -> Result<SigningQueueEntry> {
        let failed = self
            .queue
            .get(id)
            .ok_or_else(|| SignerError::NotFound(format!("queue entry {}", id)))?;
        self.keystore.with_zone_lock(failed.zone_id, || {
            let zone = self.keystore.zone(failed.zone_id)?;
            if !zone.dnssec_enabled {
                return Err(SignerError::NotEnabled(zone.origin));
            }
            self.queue.retry(id, priority)
        })
    }

    /// Refresh gauges that are derived from current state
    pub fn refresh_metrics(&self) {
        let dnssec_zones = self
            .keystore
            .zones()
            .iter()
            .filter(|z| z.dnssec_enabled)
            .count();
        self.metrics.update_state(
            &self.queue.status_counts(),
            self.keystore.total_active_keys(),
            dnssec_zones,
        );
    }

    /// Start signing workers, the reaper and the refresh scheduler
    pub fn spawn_background(self: &Arc<Self>, shutdown: &GracefulShutdown) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.config.worker_count + 2);
        for id in 0..self.config.worker_count {
            let worker = SigningWorker::new(id, self.clone());
            handles.push(tokio::spawn(worker.run(shutdown.subscribe())));
        }
        handles.push(tokio::spawn(
            Reaper::new(self.clone()).run(shutdown.subscribe()),
        ));
        handles.push(tokio::spawn(
            RefreshScheduler::new(self.clone()).run(shutdown.subscribe()),
        ));
        info!(
            "Started {} signing workers, reaper and refresh scheduler",
            self.config.worker_count
        );
        handles
    }
}
