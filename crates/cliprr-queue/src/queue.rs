//! Priority FIFO queues in Redis.
//!
//! Each queue keeps five sorted sets (`waiting`, `active`, `delayed`,
//! `completed`, `failed`) of broker ids plus one shared hash holding the job
//! records. The waiting score encodes (priority, enqueue sequence) so a
//! single `ZPOPMIN` yields priority-then-FIFO order. Broker ids are stable
//! functions of the payload, which lets the recovery supervisor reconcile
//! against the relational store and makes repeated enqueues collapse into
//! one entry.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use cliprr_models::QueueName;

use crate::error::QueueResult;
use crate::job::QueuedJob;

/// Key prefix for everything the broker owns.
const KEY_PREFIX: &str = "cliprr:queue";

/// Span reserved for the FIFO sequence inside a waiting score. Priorities
/// stay exact in an f64 score as long as `priority * SEQ_SPAN + seq < 2^53`.
const SEQ_SPAN: f64 = (1u64 << 40) as f64;

/// Highest priority any queue uses.
const MAX_PRIORITY: i64 = 15;

/// Lifecycle state of a broker entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Active,
    Delayed,
    Completed,
    Failed,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Waiting,
        JobState::Active,
        JobState::Delayed,
        JobState::Completed,
        JobState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Delayed => "delayed",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    /// States that count as "held by the broker" for reconciliation.
    pub fn is_pending(&self) -> bool {
        matches!(self, JobState::Waiting | JobState::Active | JobState::Delayed)
    }
}

/// One broker entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerRecord {
    pub broker_id: String,
    pub queue: QueueName,
    pub job: QueuedJob,
    pub state: JobState,
    pub attempts: u32,
    pub priority: i64,
    pub enqueued_at_ms: i64,
    pub started_at_ms: Option<i64>,
    pub finished_at_ms: Option<i64>,
    pub last_error: Option<String>,
}

/// Counters for one queue across all five states.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub waiting: u64,
    pub active: u64,
    pub delayed: u64,
    pub completed: u64,
    pub failed: u64,
}

impl QueueSnapshot {
    pub fn total(&self) -> u64 {
        self.waiting + self.active + self.delayed + self.completed + self.failed
    }
}

/// Compute a waiting score so that higher priority pops first and equal
/// priorities pop in enqueue order.
fn waiting_score(priority: i64, seq: u64) -> f64 {
    let inverted = (MAX_PRIORITY - priority.clamp(0, MAX_PRIORITY)) as f64;
    inverted * SEQ_SPAN + seq as f64
}

fn state_key(queue: QueueName, state: JobState) -> String {
    format!("{KEY_PREFIX}:{}:{}", queue.as_str(), state.as_str())
}

fn paused_key(queue: QueueName) -> String {
    format!("{KEY_PREFIX}:{}:paused", queue.as_str())
}

fn jobs_key() -> String {
    format!("{KEY_PREFIX}:jobs")
}

fn seq_key() -> String {
    format!("{KEY_PREFIX}:seq")
}

/// The queue broker adapter.
#[derive(Clone)]
pub struct QueueBroker {
    client: redis::Client,
}

impl QueueBroker {
    pub fn new(redis_url: &str) -> QueueResult<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client })
    }

    pub fn from_env() -> QueueResult<Self> {
        let url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
        Self::new(&url)
    }

    async fn conn(&self) -> QueueResult<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    /// Enqueue a validated job. Re-enqueueing a job whose broker entry is
    /// still pending is absorbed: the existing entry wins and its id is
    /// returned.
    pub async fn enqueue(&self, job: QueuedJob) -> QueueResult<String> {
        let mut conn = self.conn().await?;
        let broker_id = job.broker_id();
        let queue = job.queue();

        if let Some(existing) = self.get_by_broker_id(&broker_id).await? {
            if existing.state.is_pending() {
                debug!(%broker_id, "duplicate enqueue absorbed");
                return Ok(broker_id);
            }
            // Terminal entries are superseded by the fresh enqueue.
            self.remove(&broker_id).await?;
        }

        let seq: u64 = conn.incr(seq_key(), 1).await?;
        let priority = queue.spec().priority;
        let record = BrokerRecord {
            broker_id: broker_id.clone(),
            queue,
            job,
            state: JobState::Waiting,
            attempts: 0,
            priority,
            enqueued_at_ms: Utc::now().timestamp_millis(),
            started_at_ms: None,
            finished_at_ms: None,
            last_error: None,
        };

        let payload = serde_json::to_string(&record)?;
        redis::pipe()
            .hset(jobs_key(), &broker_id, payload)
            .ignore()
            .zadd(
                state_key(queue, JobState::Waiting),
                &broker_id,
                waiting_score(priority, seq),
            )
            .ignore()
            .exec_async(&mut conn)
            .await?;

        info!(%broker_id, queue = %queue, "enqueued job");
        Ok(broker_id)
    }

    /// Validate a raw payload for a queue and enqueue it (the surface the
    /// external API calls). Nothing is written when validation fails.
    pub async fn enqueue_payload(
        &self,
        queue: QueueName,
        payload: serde_json::Value,
    ) -> QueueResult<String> {
        let job = QueuedJob::from_payload(queue, payload)?;
        self.enqueue(job).await
    }

    pub async fn get_by_broker_id(&self, broker_id: &str) -> QueueResult<Option<BrokerRecord>> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn.hget(jobs_key(), broker_id).await?;
        Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
    }

    async fn put_record(&self, record: &BrokerRecord) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let payload = serde_json::to_string(record)?;
        conn.hset::<_, _, _, ()>(jobs_key(), &record.broker_id, payload)
            .await?;
        Ok(())
    }

    /// Remove a broker entry from every state. A missing id is a benign race
    /// (deleted concurrently) and reports `false`.
    pub async fn remove(&self, broker_id: &str) -> QueueResult<bool> {
        let record = match self.get_by_broker_id(broker_id).await? {
            Some(r) => r,
            None => return Ok(false),
        };
        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        for state in JobState::ALL {
            pipe.zrem(state_key(record.queue, state), broker_id).ignore();
        }
        pipe.hdel(jobs_key(), broker_id).ignore();
        pipe.exec_async(&mut conn).await?;
        Ok(true)
    }

    /// Pause a queue. With `drain_active`, in-flight entries are pushed back
    /// to waiting (their processes are being killed by the caller).
    pub async fn pause(&self, queue: QueueName, drain_active: bool) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        conn.set::<_, _, ()>(paused_key(queue), 1).await?;

        if drain_active {
            let ids: Vec<String> = conn
                .zrange(state_key(queue, JobState::Active), 0, -1)
                .await?;
            for broker_id in ids {
                self.move_to_waiting(&broker_id).await?;
            }
        }
        info!(queue = %queue, "paused queue");
        Ok(())
    }

    pub async fn resume(&self, queue: QueueName) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        conn.del::<_, ()>(paused_key(queue)).await?;
        info!(queue = %queue, "resumed queue");
        Ok(())
    }

    pub async fn is_paused(&self, queue: QueueName) -> QueueResult<bool> {
        let mut conn = self.conn().await?;
        Ok(conn.exists(paused_key(queue)).await?)
    }

    /// Counters across all five states of one queue.
    pub async fn snapshot(&self, queue: QueueName) -> QueueResult<QueueSnapshot> {
        let mut conn = self.conn().await?;
        let mut counts = [0u64; 5];
        for (i, state) in JobState::ALL.iter().enumerate() {
            counts[i] = conn.zcard(state_key(queue, *state)).await?;
        }
        Ok(QueueSnapshot {
            waiting: counts[0],
            active: counts[1],
            delayed: counts[2],
            completed: counts[3],
            failed: counts[4],
        })
    }

    /// Reserve the next waiting job, or `None` when the queue is empty or
    /// paused.
    pub async fn reserve(&self, queue: QueueName) -> QueueResult<Option<BrokerRecord>> {
        if self.is_paused(queue).await? {
            return Ok(None);
        }
        let mut conn = self.conn().await?;

        let popped: Vec<(String, f64)> = redis::cmd("ZPOPMIN")
            .arg(state_key(queue, JobState::Waiting))
            .arg(1)
            .query_async(&mut conn)
            .await?;

        let Some((broker_id, _)) = popped.into_iter().next() else {
            return Ok(None);
        };

        let mut record = match self.get_by_broker_id(&broker_id).await? {
            Some(r) => r,
            None => {
                warn!(%broker_id, "waiting entry had no record, dropping");
                return Ok(None);
            }
        };

        let now = Utc::now().timestamp_millis();
        record.state = JobState::Active;
        record.started_at_ms = Some(now);
        record.attempts += 1;
        self.put_record(&record).await?;
        conn.zadd::<_, _, _, ()>(state_key(queue, JobState::Active), &broker_id, now as f64)
            .await?;

        Ok(Some(record))
    }

    /// Finalize a successful job.
    pub async fn complete(&self, broker_id: &str) -> QueueResult<()> {
        self.finish(broker_id, JobState::Completed, None).await
    }

    /// Apply the retry policy to a failed job: back off and re-deliver while
    /// attempts remain, otherwise park it in `failed`.
    pub async fn fail(&self, broker_id: &str, error: &str) -> QueueResult<JobState> {
        let record = match self.get_by_broker_id(broker_id).await? {
            Some(r) => r,
            None => {
                debug!(%broker_id, "fail on missing entry ignored");
                return Ok(JobState::Failed);
            }
        };

        let spec = record.queue.spec();
        if record.attempts < spec.attempts {
            let delay_ms = spec.backoff_for_attempt(record.attempts);
            let visible_at = Utc::now().timestamp_millis() + delay_ms as i64;

            let mut updated = record;
            updated.state = JobState::Delayed;
            updated.last_error = Some(error.to_string());
            self.put_record(&updated).await?;

            let mut conn = self.conn().await?;
            redis::pipe()
                .zrem(state_key(updated.queue, JobState::Active), broker_id)
                .ignore()
                .zadd(
                    state_key(updated.queue, JobState::Delayed),
                    broker_id,
                    visible_at as f64,
                )
                .ignore()
                .exec_async(&mut conn)
                .await?;

            info!(
                broker_id,
                attempt = updated.attempts,
                delay_ms,
                "job failed, retry scheduled"
            );
            Ok(JobState::Delayed)
        } else {
            self.finish(broker_id, JobState::Failed, Some(error)).await?;
            Ok(JobState::Failed)
        }
    }

    /// Park a job in `failed` without consulting the retry policy. Used for
    /// cancellations and guard breaches, which are never retried.
    pub async fn discard(&self, broker_id: &str, reason: &str) -> QueueResult<()> {
        self.finish(broker_id, JobState::Failed, Some(reason)).await
    }

    async fn finish(
        &self,
        broker_id: &str,
        state: JobState,
        error: Option<&str>,
    ) -> QueueResult<()> {
        let record = match self.get_by_broker_id(broker_id).await? {
            Some(r) => r,
            None => {
                debug!(%broker_id, "finish on missing entry ignored");
                return Ok(());
            }
        };

        let now = Utc::now().timestamp_millis();
        let mut updated = record;
        updated.state = state;
        updated.finished_at_ms = Some(now);
        if let Some(e) = error {
            updated.last_error = Some(e.to_string());
        }
        self.put_record(&updated).await?;

        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        for s in [JobState::Waiting, JobState::Active, JobState::Delayed] {
            pipe.zrem(state_key(updated.queue, s), broker_id).ignore();
        }
        pipe.zadd(state_key(updated.queue, state), broker_id, now as f64)
            .ignore();
        pipe.exec_async(&mut conn).await?;
        Ok(())
    }

    async fn move_to_waiting(&self, broker_id: &str) -> QueueResult<()> {
        let record = match self.get_by_broker_id(broker_id).await? {
            Some(r) => r,
            None => return Ok(()),
        };
        let mut conn = self.conn().await?;
        let seq: u64 = conn.incr(seq_key(), 1).await?;

        let mut updated = record;
        updated.state = JobState::Waiting;
        updated.started_at_ms = None;
        self.put_record(&updated).await?;

        let mut pipe = redis::pipe();
        for s in [JobState::Active, JobState::Delayed] {
            pipe.zrem(state_key(updated.queue, s), broker_id).ignore();
        }
        pipe.zadd(
            state_key(updated.queue, JobState::Waiting),
            broker_id,
            waiting_score(updated.priority, seq),
        )
        .ignore();
        pipe.exec_async(&mut conn).await?;
        Ok(())
    }

    /// Promote delayed entries whose backoff has elapsed. Returns how many
    /// became visible.
    pub async fn promote_due(&self) -> QueueResult<usize> {
        let mut conn = self.conn().await?;
        let now = Utc::now().timestamp_millis() as f64;
        let mut moved = 0usize;

        for queue in QueueName::ALL {
            let due: Vec<String> = conn
                .zrangebyscore(state_key(queue, JobState::Delayed), 0f64, now)
                .await?;
            for broker_id in due {
                self.move_to_waiting(&broker_id).await?;
                moved += 1;
            }
        }

        if moved > 0 {
            debug!(count = moved, "promoted delayed jobs");
        }
        Ok(moved)
    }

    /// Refresh the visibility of an active job so it is not treated as
    /// stale. Missing entries are benign after a delete-all.
    pub async fn keep_alive(&self, broker_id: &str) -> QueueResult<()> {
        let record = match self.get_by_broker_id(broker_id).await? {
            Some(r) => r,
            None => {
                debug!(%broker_id, "keep-alive for missing entry suppressed");
                return Ok(());
            }
        };
        if record.state != JobState::Active {
            return Ok(());
        }
        let now = Utc::now().timestamp_millis();
        let mut updated = record;
        updated.started_at_ms = Some(now);
        self.put_record(&updated).await?;

        let mut conn = self.conn().await?;
        conn.zadd::<_, _, _, ()>(
            state_key(updated.queue, JobState::Active),
            broker_id,
            now as f64,
        )
        .await?;
        Ok(())
    }

    /// Return active entries older than `max_age` to waiting. Returns the
    /// ids that were requeued.
    pub async fn requeue_stale(&self, max_age: Duration) -> QueueResult<Vec<String>> {
        let mut conn = self.conn().await?;
        let cutoff = (Utc::now().timestamp_millis() - max_age.as_millis() as i64) as f64;
        let mut requeued = Vec::new();

        for queue in QueueName::ALL {
            let stale: Vec<String> = conn
                .zrangebyscore(state_key(queue, JobState::Active), 0f64, cutoff)
                .await?;
            for broker_id in stale {
                warn!(%broker_id, queue = %queue, "returning stale active job to waiting");
                self.move_to_waiting(&broker_id).await?;
                requeued.push(broker_id);
            }
        }
        Ok(requeued)
    }

    /// Broker ids currently in a given state of a queue.
    pub async fn state_ids(&self, queue: QueueName, state: JobState) -> QueueResult<Vec<String>> {
        let mut conn = self.conn().await?;
        Ok(conn.zrange(state_key(queue, state), 0, -1).await?)
    }

    /// Remove expired entries of one state, mirroring the upstream broker's
    /// `clean` operation.
    pub async fn clean(
        &self,
        queue: QueueName,
        older_than: Duration,
        state: JobState,
    ) -> QueueResult<usize> {
        let mut conn = self.conn().await?;
        let cutoff = (Utc::now().timestamp_millis() - older_than.as_millis() as i64) as f64;
        let ids: Vec<String> = conn
            .zrangebyscore(state_key(queue, state), 0f64, cutoff)
            .await?;
        for broker_id in &ids {
            let mut pipe = redis::pipe();
            pipe.zrem(state_key(queue, state), broker_id).ignore();
            pipe.hdel(jobs_key(), broker_id).ignore();
            pipe.exec_async(&mut conn).await?;
        }
        Ok(ids.len())
    }

    /// Drain every state of one queue, deleting the entries. Returns how
    /// many entries were removed.
    pub async fn drain_queue(&self, queue: QueueName) -> QueueResult<usize> {
        let mut conn = self.conn().await?;
        let mut removed = 0usize;
        for state in JobState::ALL {
            let ids: Vec<String> = conn.zrange(state_key(queue, state), 0, -1).await?;
            for broker_id in &ids {
                let mut pipe = redis::pipe();
                pipe.zrem(state_key(queue, state), broker_id).ignore();
                pipe.hdel(jobs_key(), broker_id).ignore();
                pipe.exec_async(&mut conn).await?;
            }
            removed += ids.len();
        }
        Ok(removed)
    }

    /// Store job ids of episode-processing entries in the given states.
    /// This is the broker side of the recovery reconciliation.
    pub async fn episode_store_job_ids(&self, states: &[JobState]) -> QueueResult<Vec<i64>> {
        let mut conn = self.conn().await?;
        let all: HashMap<String, String> = conn.hgetall(jobs_key()).await?;
        let mut ids = Vec::new();
        for raw in all.values() {
            let Ok(record) = serde_json::from_str::<BrokerRecord>(raw) else {
                continue;
            };
            if record.queue == QueueName::EpisodeProcessing && states.contains(&record.state) {
                ids.push(record.job.store_job_id());
            }
        }
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    /// Remove every broker entry whose payload references one of the given
    /// store job ids, regardless of queue.
    pub async fn remove_by_store_job_ids(&self, store_job_ids: &[i64]) -> QueueResult<usize> {
        if store_job_ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn().await?;
        let all: HashMap<String, String> = conn.hgetall(jobs_key()).await?;
        let mut removed = 0usize;
        for (broker_id, raw) in all {
            let Ok(record) = serde_json::from_str::<BrokerRecord>(&raw) else {
                continue;
            };
            if store_job_ids.contains(&record.job.store_job_id()) {
                self.remove(&broker_id).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Delete every broker key. Used by the delete-everything cleanup path.
    pub async fn flush_all(&self) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        for queue in QueueName::ALL {
            for state in JobState::ALL {
                pipe.del(state_key(queue, state)).ignore();
            }
            pipe.del(paused_key(queue)).ignore();
        }
        pipe.del(jobs_key()).ignore();
        pipe.del(seq_key()).ignore();
        pipe.exec_async(&mut conn).await?;
        info!("flushed all broker state");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::EpisodeJob;

    #[test]
    fn waiting_score_orders_priority_then_fifo() {
        // Higher priority pops first (lower score).
        assert!(waiting_score(10, 100) < waiting_score(5, 1));
        // Same priority: earlier sequence pops first.
        assert!(waiting_score(10, 1) < waiting_score(10, 2));
        // FIFO gap never outweighs a priority step.
        assert!(waiting_score(10, u64::MAX >> 25) < waiting_score(9, 0));
    }

    #[test]
    fn snapshot_total_sums_states() {
        let snap = QueueSnapshot {
            waiting: 1,
            active: 2,
            delayed: 3,
            completed: 4,
            failed: 5,
        };
        assert_eq!(snap.total(), 15);
    }

    #[test]
    fn broker_record_serde_round_trip() {
        let record = BrokerRecord {
            broker_id: "epjob-1".into(),
            queue: QueueName::EpisodeProcessing,
            job: QueuedJob::EpisodeProcessing(EpisodeJob {
                store_job_id: 1,
                episode_file_id: 2,
            }),
            state: JobState::Waiting,
            attempts: 0,
            priority: 10,
            enqueued_at_ms: 1000,
            started_at_ms: None,
            finished_at_ms: None,
            last_error: None,
        };
        let json = serde_json::to_string(&record).unwrap();
        let back: BrokerRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.broker_id, "epjob-1");
        assert_eq!(back.state, JobState::Waiting);
    }

    // Integration cycle against a live Redis. Run with:
    //   REDIS_URL=redis://localhost:6379 cargo test -- --ignored
    #[tokio::test]
    #[ignore]
    async fn enqueue_reserve_complete_cycle() {
        let broker = QueueBroker::from_env().unwrap();
        broker.flush_all().await.unwrap();

        let job = QueuedJob::EpisodeProcessing(EpisodeJob {
            store_job_id: 9001,
            episode_file_id: 1,
        });
        let id = broker.enqueue(job.clone()).await.unwrap();
        assert_eq!(id, "epjob-9001");

        // Duplicate enqueue is absorbed.
        let dup = broker.enqueue(job).await.unwrap();
        assert_eq!(dup, id);
        assert_eq!(broker.snapshot(QueueName::EpisodeProcessing).await.unwrap().waiting, 1);

        let reserved = broker
            .reserve(QueueName::EpisodeProcessing)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reserved.broker_id, id);

        broker.complete(&id).await.unwrap();
        let snap = broker.snapshot(QueueName::EpisodeProcessing).await.unwrap();
        assert_eq!(snap.active, 0);
        assert_eq!(snap.completed, 1);

        broker.flush_all().await.unwrap();
    }
}
