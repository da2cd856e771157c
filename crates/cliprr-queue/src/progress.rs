//! Progress bus: in-process fan-out plus cross-process broadcast.
//!
//! Delivery is at-most-once, best-effort. Local subscribers hang off a tokio
//! broadcast channel; while nobody is subscribed, up to
//! [`PENDING_BUFFER_CAPACITY`] messages are buffered and replayed to the
//! next subscriber. Cross-process fan-out publishes the JSON-encoded message
//! on the coordination store channel `ws:broadcast`.

use std::collections::VecDeque;
use std::sync::Mutex;

use futures_util::StreamExt;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use cliprr_models::BusMessage;

use crate::error::QueueResult;

/// Coordination store channel carrying bus messages between processes.
pub const BROADCAST_CHANNEL: &str = "ws:broadcast";

/// How many messages are held for a late subscriber.
pub const PENDING_BUFFER_CAPACITY: usize = 256;

/// Local broadcast channel depth.
const LOCAL_CHANNEL_CAPACITY: usize = 1024;

/// In-process progress bus with optional Redis fan-out.
pub struct ProgressBus {
    tx: broadcast::Sender<BusMessage>,
    pending: Mutex<VecDeque<BusMessage>>,
    redis: Option<redis::Client>,
}

impl ProgressBus {
    /// A bus that fans out locally only (tests, tools).
    pub fn local() -> Self {
        let (tx, _) = broadcast::channel(LOCAL_CHANNEL_CAPACITY);
        Self {
            tx,
            pending: Mutex::new(VecDeque::new()),
            redis: None,
        }
    }

    /// A bus that also publishes to the coordination store.
    pub fn with_redis(redis_url: &str) -> QueueResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let (tx, _) = broadcast::channel(LOCAL_CHANNEL_CAPACITY);
        Ok(Self {
            tx,
            pending: Mutex::new(VecDeque::new()),
            redis: Some(client),
        })
    }

    /// Publish a message. Never fails: an unreachable coordination store or
    /// absent subscribers degrade to best-effort.
    pub async fn publish(&self, message: BusMessage) {
        if self.tx.receiver_count() == 0 {
            let mut pending = self.pending.lock().expect("pending buffer poisoned");
            if pending.len() == PENDING_BUFFER_CAPACITY {
                pending.pop_front();
            }
            pending.push_back(message.clone());
        } else if self.tx.send(message.clone()).is_err() {
            debug!("no live subscriber took the message");
        }

        if let Some(client) = &self.redis {
            match client.get_multiplexed_async_connection().await {
                Ok(mut conn) => {
                    let payload = match serde_json::to_string(&message) {
                        Ok(p) => p,
                        Err(e) => {
                            warn!("failed to encode bus message: {e}");
                            return;
                        }
                    };
                    if let Err(e) = redis::cmd("PUBLISH")
                        .arg(BROADCAST_CHANNEL)
                        .arg(payload)
                        .query_async::<()>(&mut conn)
                        .await
                    {
                        warn!("broadcast publish failed: {e}");
                    }
                }
                Err(e) => warn!("broadcast connection failed: {e}"),
            }
        }
    }

    /// Subscribe locally. Returns the welcome message, any messages buffered
    /// while nobody was listening (welcome-replay), and the live receiver.
    pub fn subscribe(&self) -> (Vec<BusMessage>, broadcast::Receiver<BusMessage>) {
        let rx = self.tx.subscribe();
        let mut replay = vec![BusMessage::welcome("connected to cliprr progress bus")];
        {
            let mut pending = self.pending.lock().expect("pending buffer poisoned");
            replay.extend(pending.drain(..));
        }
        (replay, rx)
    }

    /// Subscribe to the cross-process channel. Yields messages published by
    /// other processes on the coordination store.
    pub async fn subscribe_remote(
        &self,
    ) -> QueueResult<std::pin::Pin<Box<dyn futures_util::Stream<Item = BusMessage> + Send>>> {
        let client = self.redis.as_ref().ok_or_else(|| {
            crate::error::QueueError::ConnectionFailed(
                "progress bus has no coordination store attached".to_string(),
            )
        })?;
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(BROADCAST_CHANNEL).await?;

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let payload: String = msg.get_payload().ok()?;
            serde_json::from_str(&payload).ok()
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cliprr_models::JobUpdateStatus;

    #[tokio::test]
    async fn messages_reach_live_subscriber() {
        let bus = ProgressBus::local();
        let (replay, mut rx) = bus.subscribe();
        assert_eq!(replay.len(), 1); // welcome only

        bus.publish(BusMessage::job_progress("epjob-1", 1, 10, None))
            .await;
        let msg = rx.recv().await.unwrap();
        assert!(matches!(msg, BusMessage::JobUpdate { .. }));
    }

    #[tokio::test]
    async fn unsubscribed_messages_replay_to_next_subscriber() {
        let bus = ProgressBus::local();
        bus.publish(BusMessage::job_progress("epjob-1", 1, 10, None))
            .await;
        bus.publish(BusMessage::job_terminal(
            "epjob-1",
            1,
            JobUpdateStatus::Completed,
            None,
        ))
        .await;

        let (replay, _rx) = bus.subscribe();
        // welcome + the two buffered messages
        assert_eq!(replay.len(), 3);
        assert!(matches!(replay[0], BusMessage::Welcome { .. }));

        // Buffer drains on replay.
        let (replay2, _rx2) = bus.subscribe();
        assert_eq!(replay2.len(), 1);
    }

    #[tokio::test]
    async fn pending_buffer_is_bounded() {
        let bus = ProgressBus::local();
        for i in 0..(PENDING_BUFFER_CAPACITY + 50) {
            bus.publish(BusMessage::job_progress("epjob-1", 1, (i % 100) as u8, None))
                .await;
        }
        let (replay, _rx) = bus.subscribe();
        assert_eq!(replay.len(), PENDING_BUFFER_CAPACITY + 1);
    }
}
