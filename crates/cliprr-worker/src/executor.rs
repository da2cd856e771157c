//! Worker pool: per-queue loops with bounded concurrency.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use cliprr_models::{BusMessage, JobUpdateStatus, QueueName};
use cliprr_queue::BrokerRecord;

use crate::context::WorkerContext;
use crate::error::{WorkerError, WorkerResult};
use crate::processor;

/// The worker pool. One loop per queue reserves jobs and spawns them onto
/// the runtime, capped by the queue's concurrency.
pub struct WorkerPool {
    ctx: Arc<WorkerContext>,
}

impl WorkerPool {
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        Self { ctx }
    }

    /// Run every queue loop plus the delayed-job promoter until shutdown.
    pub async fn run(&self) -> WorkerResult<()> {
        let cpu = self.ctx.config.cpu_worker_limit;
        let gpu = self.ctx.config.gpu_worker_limit;

        let mut handles = Vec::new();
        for queue in QueueName::ALL {
            let concurrency = queue.spec().resolve_concurrency(cpu, gpu);
            info!(queue = %queue, concurrency, "starting queue worker");
            handles.push(tokio::spawn(queue_loop(Arc::clone(&self.ctx), queue, concurrency)));
        }
        handles.push(tokio::spawn(promoter_loop(Arc::clone(&self.ctx))));

        let mut shutdown_rx = self.ctx.shutdown_rx();
        while !*shutdown_rx.borrow() {
            if shutdown_rx.changed().await.is_err() {
                break;
            }
        }

        info!("shutdown requested, draining workers");
        let drain = self.ctx.config.shutdown_timeout;
        for handle in handles {
            if tokio::time::timeout(drain, handle).await.is_err() {
                warn!("worker loop did not drain in time");
            }
        }
        info!("worker pool stopped");
        Ok(())
    }
}

/// Reserve-dispatch loop for one queue.
async fn queue_loop(ctx: Arc<WorkerContext>, queue: QueueName, concurrency: usize) {
    let slots = Arc::new(Semaphore::new(concurrency));
    let mut shutdown_rx = ctx.shutdown_rx();

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let permit = match slots.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => break,
        };

        let reserved = match ctx.broker.reserve(queue).await {
            Ok(r) => r,
            Err(e) => {
                warn!(queue = %queue, "reserve failed: {e}");
                None
            }
        };

        match reserved {
            Some(record) => {
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    let _permit = permit;
                    execute_job(ctx, record).await;
                });
            }
            None => {
                drop(permit);
                let idle = ctx.config.reserve_poll_interval;
                tokio::select! {
                    _ = tokio::time::sleep(idle) => {}
                    _ = shutdown_rx.changed() => {}
                }
            }
        }
    }

    // Let in-flight jobs finish before the loop exits.
    let _ = slots.acquire_many(concurrency as u32).await;
    debug!(queue = %queue, "queue loop drained");
}

/// Periodically make due delayed jobs visible again.
async fn promoter_loop(ctx: Arc<WorkerContext>) {
    let mut shutdown_rx = ctx.shutdown_rx();
    let mut ticker = tokio::time::interval(ctx.config.promote_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = ctx.broker.promote_due().await {
                    warn!("delayed promotion failed: {e}");
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

/// Run one reserved job: keep-alive pings while it runs, then the terminal
/// event and broker finalization.
async fn execute_job(ctx: Arc<WorkerContext>, record: BrokerRecord) {
    let broker_id = record.broker_id.clone();
    let store_job_id = record.job.store_job_id();
    let timeout = Duration::from_millis(record.queue.spec().timeout_ms);

    info!(%broker_id, queue = %record.queue, "executing job");
    ctx.bus
        .publish(BusMessage::job_terminal(
            &broker_id,
            store_job_id,
            JobUpdateStatus::Active,
            None,
        ))
        .await;

    // Keep the broker lock fresh while the stage runs. Missing-key errors
    // are benign after a delete-all and stay quiet.
    let keep_alive = {
        let ctx = Arc::clone(&ctx);
        let broker_id = broker_id.clone();
        let interval = ctx.config.keep_alive_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = ctx.broker.keep_alive(&broker_id).await {
                    debug!(%broker_id, "keep-alive suppressed: {e}");
                }
            }
        })
    };

    // Per-job timeout behaves exactly like cancellation.
    let cancel_rx = ctx.shutdown_rx();
    let result = match tokio::time::timeout(
        timeout,
        processor::process_job(&ctx, &record, cancel_rx),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(WorkerError::Media(cliprr_media::MediaError::Timeout(
            timeout.as_secs(),
        ))),
    };

    keep_alive.abort();

    match result {
        Ok(()) => {
            info!(%broker_id, "job completed");
            ctx.bus
                .publish(BusMessage::job_terminal(
                    &broker_id,
                    store_job_id,
                    JobUpdateStatus::Completed,
                    None,
                ))
                .await;
            if let Err(e) = ctx.broker.complete(&broker_id).await {
                error!(%broker_id, "failed to finalize job: {e}");
            }
        }
        Err(e) if e.is_cancellation() => {
            // A distinct terminal state: never retried, never shown as a
            // plain failure.
            info!(%broker_id, "job canceled");
            ctx.bus
                .publish(BusMessage::job_terminal(
                    &broker_id,
                    store_job_id,
                    JobUpdateStatus::Error,
                    Some("canceled".to_string()),
                ))
                .await;
            if let Err(err) = ctx.broker.discard(&broker_id, "canceled").await {
                debug!(%broker_id, "discard suppressed: {err}");
            }
        }
        Err(e) if e.is_terminal() => {
            // Guard breach: fail the store row, drop the broker entry.
            error!(%broker_id, "job hit a guard breach: {e}");
            if let Err(err) = ctx.jobs.fail(store_job_id, &e.to_string()).await {
                warn!(%broker_id, "could not mark job failed: {err}");
            }
            ctx.bus
                .publish(BusMessage::job_terminal(
                    &broker_id,
                    store_job_id,
                    JobUpdateStatus::Failed,
                    Some(e.to_string()),
                ))
                .await;
            if let Err(err) = ctx.broker.discard(&broker_id, &e.to_string()).await {
                debug!(%broker_id, "discard suppressed: {err}");
            }
        }
        Err(e) => {
            error!(%broker_id, "job failed: {e}");
            ctx.bus
                .publish(BusMessage::job_terminal(
                    &broker_id,
                    store_job_id,
                    JobUpdateStatus::Failed,
                    Some(e.to_string()),
                ))
                .await;

            let final_state = ctx.broker.fail(&broker_id, &e.to_string()).await;
            match final_state {
                Ok(cliprr_queue::JobState::Failed) => {
                    // Out of attempts: surface the failure on the store row.
                    if let Err(err) = ctx.jobs.fail(store_job_id, &e.to_string()).await {
                        debug!(%broker_id, "could not mark job failed: {err}");
                    }
                }
                Ok(_) => debug!(%broker_id, "job scheduled for retry"),
                Err(err) => error!(%broker_id, "retry policy failed: {err}"),
            }
        }
    }
}
