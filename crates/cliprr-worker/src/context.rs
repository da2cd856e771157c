//! Shared worker context.
//!
//! One explicit coordinator object owns every handle the stages need: the
//! stores, the broker, the progress bus, the decode semaphore, and the
//! shutdown signal. Tests build it against an in-memory database and a local
//! bus.

use std::sync::Arc;

use tokio::sync::watch;

use cliprr_detect::SeasonDetector;
use cliprr_queue::{DecodeSemaphore, ProgressBus, QueueBroker};
use cliprr_store::{CatalogStore, Database, FingerprintStore, JobStore, SettingsStore};

use crate::config::WorkerConfig;
use crate::error::WorkerResult;

/// Everything a stage processor needs.
pub struct WorkerContext {
    pub config: WorkerConfig,
    pub jobs: JobStore,
    pub fingerprints: FingerprintStore,
    pub catalog: CatalogStore,
    pub settings: SettingsStore,
    pub detector: SeasonDetector,
    pub broker: QueueBroker,
    pub bus: ProgressBus,
    pub semaphore: DecodeSemaphore,
    shutdown_tx: watch::Sender<bool>,
}

impl WorkerContext {
    /// Wire the context against live backing services.
    pub fn new(config: WorkerConfig, database: &Database) -> WorkerResult<Arc<Self>> {
        let pool = database.pool().clone();
        let jobs = JobStore::new(pool.clone());
        let fingerprints = FingerprintStore::new(pool.clone());
        let settings = SettingsStore::new(pool.clone());
        let detector = SeasonDetector::new(fingerprints.clone(), jobs.clone(), settings.clone());

        let broker = QueueBroker::new(&config.redis_url)?;
        let bus = ProgressBus::with_redis(&config.redis_url)?;
        let semaphore = DecodeSemaphore::new(&config.redis_url, config.decode_capacity)?;
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            catalog: CatalogStore::new(pool),
            jobs,
            fingerprints,
            settings,
            detector,
            broker,
            bus,
            semaphore,
            config,
            shutdown_tx,
        }))
    }

    /// Signal every loop and in-flight stage to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn shutdown_requested(&self) -> bool {
        *self.shutdown_tx.subscribe().borrow()
    }

    /// A receiver stages pass into cancellation-aware operations.
    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }
}
