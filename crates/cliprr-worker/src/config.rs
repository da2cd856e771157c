//! Worker configuration.

use std::path::PathBuf;
use std::time::Duration;

use cliprr_store::SettingsStore;

use crate::error::WorkerResult;

/// Worker configuration: connection strings from the environment, runtime
/// limits from the settings store.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Coordination store URL
    pub redis_url: String,
    /// Relational store URL
    pub database_url: String,
    /// Concurrency of CPU-bound queues
    pub cpu_worker_limit: usize,
    /// Concurrency of the trimming queue
    pub gpu_worker_limit: usize,
    /// Global cap on simultaneous decodes: min(host CPUs, cpu limit)
    pub decode_capacity: usize,
    /// Base directory for decode output and chunks
    pub temp_dir: PathBuf,
    /// Broker keep-alive cadence while a job runs (must stay under 30 s)
    pub keep_alive_interval: Duration,
    /// Idle poll cadence when a queue is empty
    pub reserve_poll_interval: Duration,
    /// Cadence for promoting due delayed jobs
    pub promote_interval: Duration,
    /// Recovery supervisor cadence
    pub recovery_interval: Duration,
    /// Active broker entries older than this are returned to waiting
    pub stale_active_age: Duration,
    /// Grace window for in-flight jobs at shutdown
    pub shutdown_timeout: Duration,
}

impl WorkerConfig {
    /// Read connection strings from the environment and runtime limits from
    /// the settings store.
    pub async fn load(settings: &SettingsStore) -> WorkerResult<Self> {
        let cpu_worker_limit = settings.cpu_worker_limit().await?;
        let gpu_worker_limit = settings.gpu_worker_limit().await?;
        let temp_dir = settings.temp_dir().await?;

        Ok(Self {
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            database_url: default_database_url(),
            cpu_worker_limit,
            gpu_worker_limit,
            decode_capacity: num_cpus::get().min(cpu_worker_limit).max(1),
            temp_dir,
            keep_alive_interval: Duration::from_secs(25),
            reserve_poll_interval: Duration::from_millis(500),
            promote_interval: Duration::from_secs(5),
            recovery_interval: Duration::from_secs(300),
            stale_active_age: Duration::from_secs(30 * 60),
            shutdown_timeout: Duration::from_secs(30),
        })
    }
}

/// The database URL the binary connects to before settings exist.
pub fn default_database_url() -> String {
    std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://cliprr.db".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cliprr_store::Database;

    #[tokio::test]
    async fn limits_come_from_settings() {
        let db = Database::in_memory().await.unwrap();
        let settings = SettingsStore::new(db.pool().clone());
        settings.set("cpu_worker_limit", "3").await.unwrap();

        let config = WorkerConfig::load(&settings).await.unwrap();
        assert_eq!(config.cpu_worker_limit, 3);
        assert_eq!(config.gpu_worker_limit, 1);
        assert!(config.decode_capacity <= 3);
        assert!(config.decode_capacity >= 1);
        assert!(config.keep_alive_interval < Duration::from_secs(30));
    }
}
