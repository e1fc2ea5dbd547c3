//! Broker-facing contracts: deliveries, acknowledgment and receiving

use crate::{AckError, SourceError};
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// One delivery attempt of a serialized batch message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Broker tag bound to this attempt; settling uses it exactly once
    pub tag: u64,

    pub payload: Bytes,

    /// 1 on first delivery, incremented by the broker on each redelivery
    pub attempt: u32,
}

impl Delivery {
    pub fn new(tag: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            tag,
            payload: payload.into(),
            attempt: 1,
        }
    }

    pub fn is_redelivery(&self) -> bool {
        self.attempt > 1
    }
}

/// Terminal decision for a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    Ack,

    /// `redeliver = false` asks the broker to drop or dead-letter instead
    Requeue { redeliver: bool },
}

impl AckDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckDecision::Ack => "ack",
            AckDecision::Requeue { redeliver: true } => "requeue",
            AckDecision::Requeue { redeliver: false } => "reject",
        }
    }
}

impl fmt::Display for AckDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Acknowledgment channel of the broker
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Remove the delivery from the queue permanently
    async fn ack(&self, tag: u64) -> Result<(), AckError>;

    /// Return the delivery to the broker; redelivery timing is the broker's
    async fn requeue(&self, tag: u64, redeliver: bool) -> Result<(), AckError>;
}

#[async_trait]
impl<T: Acknowledger + ?Sized> Acknowledger for Arc<T> {
    async fn ack(&self, tag: u64) -> Result<(), AckError> {
        (**self).ack(tag).await
    }

    async fn requeue(&self, tag: u64, redeliver: bool) -> Result<(), AckError> {
        (**self).requeue(tag, redeliver).await
    }
}

/// Where consumer workers pull deliveries from
#[async_trait]
pub trait DeliverySource: Send + Sync {
    /// Wait for the next delivery; `Ok(None)` once the source is drained and closed
    async fn next_delivery(&self) -> Result<Option<Delivery>, SourceError>;
}

/// Delivery source over a tokio channel, shared by all workers of a pool
pub struct ChannelSource {
    rx: Mutex<mpsc::Receiver<Delivery>>,
}

impl ChannelSource {
    pub fn channel(capacity: usize) -> (mpsc::Sender<Delivery>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self { rx: Mutex::new(rx) })
    }
}

#[async_trait]
impl DeliverySource for ChannelSource {
    async fn next_delivery(&self) -> Result<Option<Delivery>, SourceError> {
        let mut rx = self.rx.lock().await;
        Ok(rx.recv().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_labels() {
        assert_eq!(AckDecision::Ack.to_string(), "ack");
        assert_eq!(AckDecision::Requeue { redeliver: true }.to_string(), "requeue");
        assert_eq!(AckDecision::Requeue { redeliver: false }.to_string(), "reject");
    }

    #[tokio::test]
    async fn test_channel_source_drains_then_closes() {
        let (tx, source) = ChannelSource::channel(4);
        tx.send(Delivery::new(1, &b"{}"[..])).await.unwrap();
        drop(tx);

        let first = source.next_delivery().await.unwrap().unwrap();
        assert_eq!(first.tag, 1);
        assert!(!first.is_redelivery());
        assert!(source.next_delivery().await.unwrap().is_none());
    }
}
