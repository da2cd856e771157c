//! Typed runtime settings backed by the settings table.

use std::path::PathBuf;

use sqlx::{Row, SqlitePool};

use crate::error::{StoreError, StoreResult};

// Setting key constants
/// Concurrency of CPU-bound queues (integer ≥ 1)
pub const SETTING_CPU_WORKER_LIMIT: &str = "cpu_worker_limit";

/// Concurrency of the trimming queue (integer ≥ 1)
pub const SETTING_GPU_WORKER_LIMIT: &str = "gpu_worker_limit";

/// Auto-approval confidence gate (float 0..1)
pub const SETTING_MIN_CONFIDENCE_THRESHOLD: &str = "min_confidence_threshold";

/// Enables auto-approval of detections (bool)
pub const SETTING_AUTO_PROCESS_DETECTIONS: &str = "auto_process_detections";

/// Base directory for decode output and chunks (path)
pub const SETTING_TEMP_DIR: &str = "temp_dir";

/// External import policy ("auto" | "import" | "none")
pub const SETTING_IMPORT_MODE: &str = "import_mode";

/// External poller cadence in seconds (60..86400)
pub const SETTING_POLLING_INTERVAL: &str = "polling_interval";

/// External import policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImportMode {
    Auto,
    Import,
    #[default]
    None,
}

impl ImportMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportMode::Auto => "auto",
            ImportMode::Import => "import",
            ImportMode::None => "none",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(ImportMode::Auto),
            "import" => Some(ImportMode::Import),
            "none" => Some(ImportMode::None),
            _ => None,
        }
    }
}

/// Store for typed key/value settings.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    pool: SqlitePool,
}

impl SettingsStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn get_raw(&self, key: &str) -> StoreResult<Option<String>> {
        let row = sqlx::query("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.try_get("value")).transpose()?)
    }

    async fn set_raw(&self, key: &str, value: &str) -> StoreResult<()> {
        sqlx::query("INSERT OR REPLACE INTO settings (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Validate and persist a setting. Invalid values are rejected, never
    /// clamped.
    pub async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        validate(key, value)?;
        self.set_raw(key, value).await
    }

    pub async fn cpu_worker_limit(&self) -> StoreResult<usize> {
        self.int_setting(SETTING_CPU_WORKER_LIMIT, 2).await
    }

    pub async fn gpu_worker_limit(&self) -> StoreResult<usize> {
        self.int_setting(SETTING_GPU_WORKER_LIMIT, 1).await
    }

    pub async fn min_confidence_threshold(&self) -> StoreResult<f64> {
        match self.get_raw(SETTING_MIN_CONFIDENCE_THRESHOLD).await? {
            Some(v) => v.parse().map_err(|_| {
                StoreError::invalid_setting(SETTING_MIN_CONFIDENCE_THRESHOLD, "not a float")
            }),
            None => Ok(0.8),
        }
    }

    pub async fn auto_process_detections(&self) -> StoreResult<bool> {
        match self.get_raw(SETTING_AUTO_PROCESS_DETECTIONS).await? {
            Some(v) => Ok(v == "true" || v == "1"),
            None => Ok(false),
        }
    }

    /// Base temp directory; defaults to the OS temp dir plus `cliprr`.
    pub async fn temp_dir(&self) -> StoreResult<PathBuf> {
        match self.get_raw(SETTING_TEMP_DIR).await? {
            Some(v) if !v.is_empty() => Ok(PathBuf::from(v)),
            _ => Ok(std::env::temp_dir().join("cliprr")),
        }
    }

    pub async fn import_mode(&self) -> StoreResult<ImportMode> {
        match self.get_raw(SETTING_IMPORT_MODE).await? {
            Some(v) => ImportMode::parse(&v)
                .ok_or_else(|| StoreError::invalid_setting(SETTING_IMPORT_MODE, "unknown mode")),
            None => Ok(ImportMode::None),
        }
    }

    pub async fn polling_interval_secs(&self) -> StoreResult<u64> {
        match self.get_raw(SETTING_POLLING_INTERVAL).await? {
            Some(v) => v.parse().map_err(|_| {
                StoreError::invalid_setting(SETTING_POLLING_INTERVAL, "not an integer")
            }),
            None => Ok(3600),
        }
    }

    async fn int_setting(&self, key: &str, default: usize) -> StoreResult<usize> {
        match self.get_raw(key).await? {
            Some(v) => v
                .parse()
                .map_err(|_| StoreError::invalid_setting(key, "not an integer")),
            None => Ok(default),
        }
    }
}

/// Validate a value against its key's type and bounds.
pub fn validate(key: &str, value: &str) -> StoreResult<()> {
    match key {
        SETTING_CPU_WORKER_LIMIT | SETTING_GPU_WORKER_LIMIT => {
            match value.parse::<i64>() {
                Ok(n) if n >= 1 => Ok(()),
                Ok(_) => Err(StoreError::invalid_setting(key, "must be >= 1")),
                Err(_) => Err(StoreError::invalid_setting(key, "not an integer")),
            }
        }
        SETTING_MIN_CONFIDENCE_THRESHOLD => match value.parse::<f64>() {
            Ok(f) if (0.0..=1.0).contains(&f) => Ok(()),
            Ok(_) => Err(StoreError::invalid_setting(key, "must be within 0..1")),
            Err(_) => Err(StoreError::invalid_setting(key, "not a float")),
        },
        SETTING_AUTO_PROCESS_DETECTIONS => match value {
            "true" | "false" | "1" | "0" => Ok(()),
            _ => Err(StoreError::invalid_setting(key, "not a boolean")),
        },
        SETTING_TEMP_DIR => {
            if value.is_empty() {
                Err(StoreError::invalid_setting(key, "empty path"))
            } else {
                Ok(())
            }
        }
        SETTING_IMPORT_MODE => ImportMode::parse(value)
            .map(|_| ())
            .ok_or_else(|| StoreError::invalid_setting(key, "expected auto, import, or none")),
        SETTING_POLLING_INTERVAL => match value.parse::<i64>() {
            Ok(n) if (60..=86_400).contains(&n) => Ok(()),
            Ok(_) => Err(StoreError::invalid_setting(key, "must be within 60..86400")),
            Err(_) => Err(StoreError::invalid_setting(key, "not an integer")),
        },
        _ => Err(StoreError::invalid_setting(key, "unknown setting key")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;

    #[tokio::test]
    async fn seeded_defaults_are_readable() {
        let db = Database::in_memory().await.unwrap();
        let settings = SettingsStore::new(db.pool().clone());

        assert_eq!(settings.cpu_worker_limit().await.unwrap(), 2);
        assert_eq!(settings.gpu_worker_limit().await.unwrap(), 1);
        assert!((settings.min_confidence_threshold().await.unwrap() - 0.8).abs() < 1e-9);
        assert!(!settings.auto_process_detections().await.unwrap());
        assert_eq!(settings.import_mode().await.unwrap(), ImportMode::None);
        assert_eq!(settings.polling_interval_secs().await.unwrap(), 3600);
    }

    #[tokio::test]
    async fn temp_dir_defaults_to_os_temp() {
        let db = Database::in_memory().await.unwrap();
        let settings = SettingsStore::new(db.pool().clone());
        assert_eq!(
            settings.temp_dir().await.unwrap(),
            std::env::temp_dir().join("cliprr")
        );

        settings.set(SETTING_TEMP_DIR, "/data/tmp").await.unwrap();
        assert_eq!(settings.temp_dir().await.unwrap(), PathBuf::from("/data/tmp"));
    }

    #[tokio::test]
    async fn invalid_values_are_rejected_not_clamped() {
        let db = Database::in_memory().await.unwrap();
        let settings = SettingsStore::new(db.pool().clone());

        assert!(settings.set(SETTING_CPU_WORKER_LIMIT, "0").await.is_err());
        assert!(settings.set(SETTING_CPU_WORKER_LIMIT, "two").await.is_err());
        assert!(settings
            .set(SETTING_MIN_CONFIDENCE_THRESHOLD, "1.5")
            .await
            .is_err());
        assert!(settings.set(SETTING_POLLING_INTERVAL, "10").await.is_err());
        assert!(settings.set(SETTING_IMPORT_MODE, "maybe").await.is_err());
        assert!(settings.set("unknown_key", "x").await.is_err());

        // Still at defaults after the failed writes.
        assert_eq!(settings.cpu_worker_limit().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn valid_updates_stick() {
        let db = Database::in_memory().await.unwrap();
        let settings = SettingsStore::new(db.pool().clone());

        settings.set(SETTING_CPU_WORKER_LIMIT, "8").await.unwrap();
        settings
            .set(SETTING_AUTO_PROCESS_DETECTIONS, "true")
            .await
            .unwrap();
        settings
            .set(SETTING_MIN_CONFIDENCE_THRESHOLD, "0.75")
            .await
            .unwrap();

        assert_eq!(settings.cpu_worker_limit().await.unwrap(), 8);
        assert!(settings.auto_process_detections().await.unwrap());
        assert!((settings.min_confidence_threshold().await.unwrap() - 0.75).abs() < 1e-9);
    }
}
