//! Fair decode semaphore in the coordination store.
//!
//! Caps concurrent decode processes across every worker process on the host.
//! Waiters take a monotonic ticket and are granted strictly in ticket order
//! (FIFO); a holder entry carries a lease deadline so slots held by crashed
//! processes are reclaimed instead of leaking.

use std::time::Duration;

use redis::AsyncCommands;
use tokio::sync::watch;
use tracing::debug;

use crate::error::{QueueError, QueueResult};

const WAITERS_KEY: &str = "cliprr:semaphore:decode:waiters";
const HOLDERS_KEY: &str = "cliprr:semaphore:decode:holders";
const SEQ_KEY: &str = "cliprr:semaphore:decode:seq";

/// How long a granted slot survives without release before reclaim. Longer
/// than any decode timeout, so only a dead process loses its slot.
const LEASE: Duration = Duration::from_secs(15 * 60);

/// How often a waiter re-checks its position.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Atomically: reclaim expired holders, then grant the calling ticket iff it
/// sits within the free capacity counted from the front of the queue.
const TRY_ACQUIRE_SCRIPT: &str = r#"
redis.call('ZREMRANGEBYSCORE', KEYS[2], '-inf', ARGV[3])
local rank = redis.call('ZRANK', KEYS[1], ARGV[1])
if rank == false then
    return -1
end
local holders = redis.call('ZCARD', KEYS[2])
local capacity = tonumber(ARGV[2])
if rank < capacity - holders then
    redis.call('ZREM', KEYS[1], ARGV[1])
    redis.call('ZADD', KEYS[2], ARGV[4], ARGV[1])
    return 1
end
return 0
"#;

/// A granted semaphore slot. Release it explicitly on every exit path.
#[derive(Debug)]
pub struct DecodePermit {
    ticket: u64,
}

/// Handle to the shared decode semaphore.
#[derive(Clone)]
pub struct DecodeSemaphore {
    client: redis::Client,
    capacity: usize,
}

impl DecodeSemaphore {
    pub fn new(redis_url: &str, capacity: usize) -> QueueResult<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            capacity: capacity.max(1),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Acquire a slot, waiting fairly behind earlier tickets. This is a
    /// suspension point: flipping `cancel_rx` to true abandons the wait.
    pub async fn acquire(
        &self,
        mut cancel_rx: Option<watch::Receiver<bool>>,
    ) -> QueueResult<DecodePermit> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let ticket: u64 = conn.incr(SEQ_KEY, 1).await?;
        conn.zadd::<_, _, _, ()>(WAITERS_KEY, ticket, ticket as f64)
            .await?;
        debug!(ticket, "waiting for decode slot");

        let script = redis::Script::new(TRY_ACQUIRE_SCRIPT);

        loop {
            if let Some(rx) = cancel_rx.as_mut() {
                if *rx.borrow() {
                    conn.zrem::<_, _, ()>(WAITERS_KEY, ticket).await?;
                    return Err(QueueError::Canceled);
                }
            }

            let now_ms = chrono::Utc::now().timestamp_millis();
            let deadline_ms = now_ms + LEASE.as_millis() as i64;

            let granted: i64 = script
                .key(WAITERS_KEY)
                .key(HOLDERS_KEY)
                .arg(ticket)
                .arg(self.capacity)
                .arg(now_ms)
                .arg(deadline_ms)
                .invoke_async(&mut conn)
                .await?;

            match granted {
                1 => {
                    debug!(ticket, "decode slot granted");
                    return Ok(DecodePermit { ticket });
                }
                -1 => {
                    // Our waiter entry vanished (semaphore was reset).
                    conn.zadd::<_, _, _, ()>(WAITERS_KEY, ticket, ticket as f64)
                        .await?;
                }
                _ => {}
            }

            let sleep = tokio::time::sleep(POLL_INTERVAL);
            match cancel_rx.as_mut() {
                Some(rx) => {
                    tokio::select! {
                        _ = sleep => {}
                        changed = rx.changed() => {
                            if changed.is_ok() && *rx.borrow() {
                                conn.zrem::<_, _, ()>(WAITERS_KEY, ticket).await?;
                                return Err(QueueError::Canceled);
                            }
                        }
                    }
                }
                None => sleep.await,
            }
        }
    }

    /// Release a granted slot.
    pub async fn release(&self, permit: DecodePermit) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.zrem::<_, _, ()>(HOLDERS_KEY, permit.ticket).await?;
        debug!(ticket = permit.ticket, "decode slot released");
        Ok(())
    }

    /// Drop every waiter and holder. Used by the delete-everything cleanup.
    pub async fn reset(&self) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::pipe()
            .del(WAITERS_KEY)
            .ignore()
            .del(HOLDERS_KEY)
            .ignore()
            .del(SEQ_KEY)
            .ignore()
            .exec_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Current number of held slots.
    pub async fn held(&self) -> QueueResult<u64> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        Ok(conn.zcard(HOLDERS_KEY).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Fairness and bounded concurrency against a live Redis. Run with:
    //   REDIS_URL=redis://localhost:6379 cargo test -- --ignored
    #[tokio::test]
    #[ignore]
    async fn bounded_and_fair() {
        let url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
        let sem = DecodeSemaphore::new(&url, 2).unwrap();
        sem.reset().await.unwrap();

        let a = sem.acquire(None).await.unwrap();
        let b = sem.acquire(None).await.unwrap();
        assert_eq!(sem.held().await.unwrap(), 2);

        // Third acquire must wait until a slot is released.
        let sem2 = sem.clone();
        let waiter = tokio::spawn(async move { sem2.acquire(None).await });
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!waiter.is_finished());

        sem.release(a).await.unwrap();
        let c = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        sem.release(b).await.unwrap();
        sem.release(c).await.unwrap();
        sem.reset().await.unwrap();
    }
}
