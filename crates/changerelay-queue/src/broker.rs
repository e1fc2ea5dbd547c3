//! In-process broker with ack/requeue bookkeeping

use crate::{AckError, Acknowledger, Delivery, DeliverySource, SourceError};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tokio::sync::Notify;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub published: u64,
    pub acked: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
}

struct InFlight {
    payload: Bytes,
    attempt: u32,
}

#[derive(Default)]
struct BrokerState {
    ready: VecDeque<Delivery>,
    in_flight: HashMap<u64, InFlight>,
    dead_letters: Vec<Bytes>,
    next_tag: u64,
    closed: bool,
    stats: BrokerStats,
}

impl BrokerState {
    fn enqueue(&mut self, payload: Bytes, attempt: u32) {
        self.next_tag += 1;
        self.ready.push_back(Delivery {
            tag: self.next_tag,
            payload,
            attempt,
        });
    }
}

/// A single queue held in memory.
///
/// Every delivery gets a fresh tag; settling a tag twice, or a tag that was
/// never handed out, fails with [`AckError::UnknownDeliveryTag`]. Requeued
/// deliveries go to the back of the queue until `max_attempts` is reached,
/// after which they are dead-lettered.
pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
    notify: Notify,
    max_attempts: u32,
}

impl InMemoryBroker {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            state: Mutex::new(BrokerState::default()),
            notify: Notify::new(),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Enqueue a message; refused once the broker is closed
    pub fn publish(&self, payload: impl Into<Bytes>) -> Result<(), AckError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                warn!("Publish refused, broker closed");
                return Err(AckError::ChannelClosed);
            }
            state.stats.published += 1;
            state.enqueue(payload.into(), 1);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// Stop accepting work; receivers end once nothing is ready or in flight
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn stats(&self) -> BrokerStats {
        self.state.lock().stats
    }

    pub fn dead_letters(&self) -> Vec<Bytes> {
        self.state.lock().dead_letters.clone()
    }

    pub fn pending(&self) -> usize {
        let state = self.state.lock();
        state.ready.len() + state.in_flight.len()
    }

    fn settle(&self, tag: u64) -> Result<InFlight, AckError> {
        let mut state = self.state.lock();
        if state.closed && state.ready.is_empty() && state.in_flight.is_empty() {
            return Err(AckError::ChannelClosed);
        }
        state.in_flight.remove(&tag).ok_or(AckError::UnknownDeliveryTag(tag))
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(5)
    }
}

#[async_trait]
impl DeliverySource for InMemoryBroker {
    async fn next_delivery(&self) -> Result<Option<Delivery>, SourceError> {
        loop {
            // Registered before inspecting state so a concurrent notify is not missed.
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                if let Some(delivery) = state.ready.pop_front() {
                    state.in_flight.insert(
                        delivery.tag,
                        InFlight {
                            payload: delivery.payload.clone(),
                            attempt: delivery.attempt,
                        },
                    );
                    return Ok(Some(delivery));
                }
                if state.closed && state.in_flight.is_empty() {
                    return Ok(None);
                }
            }
            notified.await;
        }
    }
}

#[async_trait]
impl Acknowledger for InMemoryBroker {
    async fn ack(&self, tag: u64) -> Result<(), AckError> {
        self.settle(tag)?;
        self.state.lock().stats.acked += 1;
        debug!(tag, "Delivery acked");
        self.notify.notify_waiters();
        Ok(())
    }

    async fn requeue(&self, tag: u64, redeliver: bool) -> Result<(), AckError> {
        let in_flight = self.settle(tag)?;
        {
            let mut state = self.state.lock();
            state.stats.requeued += 1;
            if redeliver && in_flight.attempt < self.max_attempts {
                state.enqueue(in_flight.payload, in_flight.attempt + 1);
            } else {
                warn!(tag, attempt = in_flight.attempt, "Delivery dead-lettered");
                state.stats.dead_lettered += 1;
                state.dead_letters.push(in_flight.payload);
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_double_ack_is_rejected() {
        let broker = InMemoryBroker::default();
        broker.publish(&b"a"[..]).unwrap();

        let delivery = broker.next_delivery().await.unwrap().unwrap();
        tokio_test::assert_ok!(broker.ack(delivery.tag).await);
        assert_eq!(
            broker.ack(delivery.tag).await,
            Err(AckError::UnknownDeliveryTag(delivery.tag))
        );
        assert_eq!(broker.stats().acked, 1);
    }

    #[tokio::test]
    async fn test_requeue_redelivers_with_new_tag() {
        let broker = InMemoryBroker::new(2);
        broker.publish(&b"a"[..]).unwrap();

        let first = broker.next_delivery().await.unwrap().unwrap();
        broker.requeue(first.tag, true).await.unwrap();

        let second = broker.next_delivery().await.unwrap().unwrap();
        assert_ne!(first.tag, second.tag);
        assert_eq!(second.attempt, 2);
        assert!(second.is_redelivery());

        // Attempts exhausted: dead-lettered instead of redelivered.
        broker.requeue(second.tag, true).await.unwrap();
        assert_eq!(broker.pending(), 0);
        assert_eq!(broker.dead_letters(), vec![Bytes::from_static(b"a")]);
    }

    #[tokio::test]
    async fn test_close_ends_receivers_after_drain() {
        let broker = std::sync::Arc::new(InMemoryBroker::default());
        broker.publish(&b"a"[..]).unwrap();
        broker.close();

        let delivery = broker.next_delivery().await.unwrap().unwrap();

        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.next_delivery().await })
        };
        tokio::task::yield_now().await;
        broker.ack(delivery.tag).await.unwrap();

        assert!(waiter.await.unwrap().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_publish_after_close_is_refused() {
        let broker = InMemoryBroker::default();
        broker.close();

        tokio_test::assert_err!(broker.publish(&b"late"[..]));
        assert_eq!(broker.stats().published, 0);
        assert_eq!(broker.pending(), 0);
        assert!(broker.next_delivery().await.unwrap().is_none());
    }
}
