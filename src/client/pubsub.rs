//! # Bus Publisher and Subscriber
//!
//! [`Publisher`] is a cheap, cloneable handle. Publishing only enqueues the
//! frame; a background task owns the bus connection, reconnects when it is
//! lost, and writes frames in order. Delivery is fire-and-forget: frames are
//! dropped when the queue is full or the link fails mid-write.
//!
//! [`Subscriber`] owns one subscriber link and yields `(topic, payload)`
//! pairs for the prefixes it subscribed to.

use anyhow::Result;
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::common::connection::Connection;
use crate::common::messages::BusFrame;

/// Frames buffered while the bus link is down or slow.
const PUBLISH_QUEUE: usize = 1024;

/// Wait between bus reconnect attempts.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct Publisher {
    tx: mpsc::Sender<BusFrame>,
}

impl Publisher {
    /// Create a publisher whose frames are written to the bus at `addr`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(addr: impl Into<String>) -> Self {
        let (publisher, rx) = Self::channel(PUBLISH_QUEUE);
        tokio::spawn(forward_to_bus(addr.into(), rx));
        publisher
    }

    /// Create a publisher backed by a plain channel. The receiver sees every
    /// frame that would have gone to the bus.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<BusFrame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Enqueue `payload` under `topic`. Returns whether it was queued.
    pub fn publish<T: Serialize>(&self, topic: &str, payload: &T) -> bool {
        let payload = match serde_json::to_value(payload) {
            Ok(value) => value,
            Err(e) => {
                error!("❌ Failed to encode publication on '{}': {}", topic, e);
                return false;
            }
        };

        let frame = BusFrame::Publish {
            topic: topic.to_string(),
            payload,
        };
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("⚠️  Bus queue full, dropping publication on '{}'", topic);
                false
            }
            Err(TrySendError::Closed(_)) => {
                warn!("⚠️  Bus publisher stopped, dropping publication on '{}'", topic);
                false
            }
        }
    }
}

/// Owns the bus link for one [`Publisher`]. Runs until every handle is dropped.
async fn forward_to_bus(addr: String, mut rx: mpsc::Receiver<BusFrame>) {
    loop {
        let mut conn = match Connection::connect(&addr).await {
            Ok(conn) => {
                info!("📡 Publisher connected to bus at {}", addr);
                conn
            }
            Err(e) => {
                debug!("❌ Bus at {} unreachable: {}", addr, e);
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }
        };

        loop {
            let Some(frame) = rx.recv().await else {
                return;
            };
            if let Err(e) = conn.write_message(&frame).await {
                warn!("⚠️  Lost bus connection at {}: {}", addr, e);
                break;
            }
        }
    }
}

pub struct Subscriber {
    conn: Connection,
}

impl Subscriber {
    /// Connect to the bus subscriber endpoint and subscribe to `topics`
    /// (prefix match; `""` receives everything).
    pub async fn connect(addr: &str, topics: &[String]) -> Result<Self> {
        let conn = Connection::connect(addr).await?;
        let mut subscriber = Self { conn };
        subscriber.subscribe(topics).await?;
        Ok(subscriber)
    }

    /// Add more topic prefixes to this link.
    pub async fn subscribe(&mut self, topics: &[String]) -> Result<()> {
        let frame = BusFrame::Subscribe {
            topics: topics.to_vec(),
        };
        self.conn.write_message(&frame).await
    }

    /// Next publication, or `None` once the bus closes the link.
    pub async fn recv(&mut self) -> Result<Option<(String, Value)>> {
        loop {
            match self.conn.read_message::<BusFrame>().await? {
                Some(BusFrame::Publish { topic, payload }) => return Ok(Some((topic, payload))),
                Some(BusFrame::Subscribe { .. }) => continue,
                None => return Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn channel_publisher_exposes_frames() {
        let (publisher, mut rx) = Publisher::channel(4);
        assert!(publisher.publish("general", &json!({"clock": 1})));

        let frame = rx.recv().await.unwrap();
        assert_eq!(
            frame,
            BusFrame::Publish {
                topic: "general".into(),
                payload: json!({"clock": 1})
            }
        );
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let (publisher, _rx) = Publisher::channel(1);
        assert!(publisher.publish("a", &1));
        assert!(!publisher.publish("a", &2));
    }
}
