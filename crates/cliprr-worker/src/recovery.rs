//! Recovery supervisor: keep the store and the broker agreed on which jobs
//! exist.
//!
//! The broker is authoritative for dispatch, the store for content; neither
//! is trusted alone. Every tick re-enqueues store jobs the broker lost,
//! evicts broker orphans the store no longer knows, and returns stale active
//! entries to waiting. Failures are logged and the next tick retries.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use cliprr_models::{JobStatus, QueueName};
use cliprr_queue::{EpisodeJob, JobState, QueuedJob};

use crate::context::WorkerContext;
use crate::error::WorkerResult;

/// The recovery supervisor.
pub struct RecoverySupervisor {
    ctx: Arc<WorkerContext>,
}

/// Counts of one reconciliation pass.
#[derive(Debug, Default, Clone)]
pub struct RecoveryPass {
    pub reenqueued: usize,
    pub orphans_removed: usize,
    pub stale_requeued: usize,
}

impl RecoverySupervisor {
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        Self { ctx }
    }

    /// Run at startup and then on the configured cadence until shutdown.
    pub async fn run(&self) {
        if let Err(e) = self.run_once().await {
            error!("startup recovery failed: {e:#}");
        }

        let mut shutdown_rx = self.ctx.shutdown_rx();
        let mut ticker = tokio::time::interval(self.ctx.config.recovery_interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!("recovery tick failed: {e:#}");
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// One full reconciliation pass. Errors never propagate past `run`.
    pub async fn run_once(&self) -> anyhow::Result<RecoveryPass> {
        let mut pass = RecoveryPass::default();

        // Interrupt recovery + state synchronization share the same
        // machinery: D is the store side, R the broker side.
        let store_ids = self.store_pending_ids().await?;
        let broker_ids: BTreeSet<i64> = self
            .ctx
            .broker
            .episode_store_job_ids(&[JobState::Waiting, JobState::Active, JobState::Delayed])
            .await?
            .into_iter()
            .collect();

        // D \ R: store jobs the broker lost (includes jobs interrupted by a
        // restart; the stable broker id absorbs duplicates).
        for (store_job_id, episode_file_id) in &store_ids {
            if !broker_ids.contains(store_job_id) {
                self.ctx
                    .broker
                    .enqueue(QueuedJob::EpisodeProcessing(EpisodeJob {
                        store_job_id: *store_job_id,
                        episode_file_id: *episode_file_id,
                    }))
                    .await?;
                pass.reenqueued += 1;
            }
        }

        // R \ D: broker orphans.
        let store_id_set: BTreeSet<i64> = store_ids.iter().map(|(id, _)| *id).collect();
        for broker_held in &broker_ids {
            if !store_id_set.contains(broker_held) {
                let broker_id = cliprr_models::broker_job_id(*broker_held);
                warn!(%broker_id, "removing broker orphan");
                self.ctx.broker.remove(&broker_id).await?;
                pass.orphans_removed += 1;
            }
        }

        // Stale job eviction.
        let stale = self
            .ctx
            .broker
            .requeue_stale(self.ctx.config.stale_active_age)
            .await?;
        pass.stale_requeued = stale.len();

        if pass.reenqueued > 0 || pass.orphans_removed > 0 || pass.stale_requeued > 0 {
            info!(
                reenqueued = pass.reenqueued,
                orphans = pass.orphans_removed,
                stale = pass.stale_requeued,
                "recovery pass applied changes"
            );
        }
        Ok(pass)
    }

    /// Store jobs the broker should be holding: scanning or processing.
    async fn store_pending_ids(&self) -> WorkerResult<Vec<(i64, i64)>> {
        let mut out = Vec::new();
        for status in [JobStatus::Scanning, JobStatus::Processing] {
            for job in self.ctx.jobs.list_by_status(status).await? {
                out.push((job.id, job.media_file_id));
            }
        }
        Ok(out)
    }

    /// The read-only recovery status contract.
    pub async fn recovery_status(&self) -> RecoveryStatusReport {
        let mut issues: Vec<RecoveryIssue> = Vec::new();

        let (total, by_status) = match self.ctx.jobs.status_counts().await {
            Ok(counts) => counts,
            Err(e) => {
                issues.push(RecoveryIssue::SyncError {
                    message: e.to_string(),
                });
                (0, BTreeMap::new())
            }
        };

        let mut queues = BTreeMap::new();
        for queue in QueueName::ALL {
            let entry = match self.ctx.broker.snapshot(queue).await {
                Ok(snap) => QueueStatusEntry::Counts {
                    waiting: snap.waiting,
                    active: snap.active,
                    delayed: snap.delayed,
                    completed: snap.completed,
                    failed: snap.failed,
                    total: snap.total(),
                },
                Err(e) => {
                    issues.push(RecoveryIssue::QueueError {
                        queue: queue.as_str().to_string(),
                        message: e.to_string(),
                    });
                    QueueStatusEntry::Error {
                        error: "unreachable".to_string(),
                    }
                }
            };
            queues.insert(queue.as_str().to_string(), entry);
        }

        // Dry-run reconciliation for the issue list.
        match self.reconcile_preview().await {
            Ok((missing, orphaned)) => {
                for store_job_id in missing {
                    issues.push(RecoveryIssue::MissingInRedis { store_job_id });
                }
                for store_job_id in orphaned {
                    issues.push(RecoveryIssue::OrphanedInRedis { store_job_id });
                }
            }
            Err(e) => issues.push(RecoveryIssue::SyncError {
                message: e.to_string(),
            }),
        }

        if let Ok(stale) = self
            .ctx
            .broker
            .episode_store_job_ids(&[JobState::Active])
            .await
        {
            // Active entries are reported; the eviction itself happens on
            // the mutating pass.
            for store_job_id in stale {
                if let Ok(Some(record)) = self
                    .ctx
                    .broker
                    .get_by_broker_id(&cliprr_models::broker_job_id(store_job_id))
                    .await
                {
                    let age_ms = record
                        .started_at_ms
                        .map(|started| Utc::now().timestamp_millis() - started)
                        .unwrap_or(0);
                    if age_ms > self.ctx.config.stale_active_age.as_millis() as i64 {
                        issues.push(RecoveryIssue::StaleJob { store_job_id });
                    }
                }
            }
        }

        RecoveryStatusReport {
            database: DatabaseCounts { total, by_status },
            queues,
            issues,
            recovery_active: !self.ctx.shutdown_requested(),
            timestamp: Utc::now(),
        }
    }

    /// The read-only processing status contract.
    pub async fn processing_status(&self) -> WorkerResult<ProcessingStatusReport> {
        let (total, by_status) = self.ctx.jobs.status_counts().await?;

        let mut queues = BTreeMap::new();
        let mut summary = ProcessingSummary::default();
        for queue in QueueName::ALL {
            let snap = self.ctx.broker.snapshot(queue).await?;
            summary.total_waiting += snap.waiting;
            summary.total_active += snap.active;
            summary.total_completed += snap.completed;
            summary.total_failed += snap.failed;
            queues.insert(
                queue.as_str().to_string(),
                ProcessingQueueCounts {
                    waiting: snap.waiting,
                    active: snap.active,
                    completed: snap.completed,
                    failed: snap.failed,
                },
            );
        }

        Ok(ProcessingStatusReport {
            database: DatabaseCounts { total, by_status },
            queues,
            summary,
            timestamp: Utc::now(),
        })
    }

    async fn reconcile_preview(&self) -> WorkerResult<(Vec<i64>, Vec<i64>)> {
        let store_ids: BTreeSet<i64> = self
            .store_pending_ids()
            .await?
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        let broker_ids: BTreeSet<i64> = self
            .ctx
            .broker
            .episode_store_job_ids(&[JobState::Waiting, JobState::Active, JobState::Delayed])
            .await?
            .into_iter()
            .collect();

        let missing = store_ids.difference(&broker_ids).cloned().collect();
        let orphaned = broker_ids.difference(&store_ids).cloned().collect();
        Ok((missing, orphaned))
    }
}

// ---------------------------------------------------------------------------
// Read-only status contracts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseCounts {
    pub total: i64,
    pub by_status: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum QueueStatusEntry {
    Counts {
        waiting: u64,
        active: u64,
        delayed: u64,
        completed: u64,
        failed: u64,
        total: u64,
    },
    Error {
        error: String,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecoveryIssue {
    #[serde(rename_all = "camelCase")]
    StaleJob { store_job_id: i64 },
    #[serde(rename_all = "camelCase")]
    MissingInRedis { store_job_id: i64 },
    #[serde(rename_all = "camelCase")]
    OrphanedInRedis { store_job_id: i64 },
    SyncError { message: String },
    QueueError { queue: String, message: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryStatusReport {
    pub database: DatabaseCounts,
    pub queues: BTreeMap<String, QueueStatusEntry>,
    pub issues: Vec<RecoveryIssue>,
    pub recovery_active: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessingQueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingSummary {
    pub total_active: u64,
    pub total_waiting: u64,
    pub total_completed: u64,
    pub total_failed: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingStatusReport {
    pub database: DatabaseCounts,
    pub queues: BTreeMap<String, ProcessingQueueCounts>,
    pub summary: ProcessingSummary,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_wire_shapes() {
        let issue = RecoveryIssue::MissingInRedis { store_job_id: 7 };
        let json = serde_json::to_string(&issue).unwrap();
        assert!(json.contains("\"type\":\"missing_in_redis\""));
        assert!(json.contains("\"storeJobId\":7"));

        let issue = RecoveryIssue::QueueError {
            queue: "trimming".into(),
            message: "down".into(),
        };
        let json = serde_json::to_string(&issue).unwrap();
        assert!(json.contains("\"type\":\"queue_error\""));
    }

    #[test]
    fn queue_entry_error_shape() {
        let entry = QueueStatusEntry::Error {
            error: "unreachable".into(),
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert_eq!(json, "{\"error\":\"unreachable\"}");
    }

    #[test]
    fn processing_report_shape() {
        let report = ProcessingStatusReport {
            database: DatabaseCounts {
                total: 2,
                by_status: BTreeMap::from([("scanning".to_string(), 2)]),
            },
            queues: BTreeMap::new(),
            summary: ProcessingSummary::default(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"byStatus\":{\"scanning\":2}"));
        assert!(json.contains("\"totalActive\":0"));
    }
}
