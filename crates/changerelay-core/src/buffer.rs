//! Handler that buffers events and writes them to a sink in groups

use crate::{ChangeEvent, ChangeHandler, CollectionSet, RelayError, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Destination a [`BufferedHandler`] writes into
#[async_trait]
pub trait ProjectionSink: Send + Sync {
    async fn write(&self, events: &[ChangeEvent]) -> Result<()>;
}

/// Buffers events for a fixed set of collections and writes them to the sink
/// once `capacity` events have accumulated or on `flush()`.
///
/// When the sink fails the buffer is kept intact and retried on the next
/// write, so a checkpoint taken after a failed flush would lose nothing that
/// is still in memory. The buffer never holds more than `capacity` events:
/// while it is full and the sink still refuses, new events are rejected with
/// an error and counted.
pub struct BufferedHandler<S> {
    name: String,
    collections: CollectionSet,
    capacity: usize,
    buffer: Mutex<Vec<ChangeEvent>>,
    rejected: AtomicU64,
    sink: S,
}

impl<S: ProjectionSink> BufferedHandler<S> {
    pub fn new(name: impl Into<String>, collections: CollectionSet, capacity: usize, sink: S) -> Self {
        let capacity = capacity.max(1);
        Self {
            name: name.into(),
            collections,
            capacity,
            buffer: Mutex::new(Vec::with_capacity(capacity)),
            rejected: AtomicU64::new(0),
            sink,
        }
    }

    pub async fn buffered(&self) -> usize {
        self.buffer.lock().await.len()
    }

    /// Events refused because the buffer was full and the sink unavailable
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    async fn push(&self, event: &ChangeEvent) -> Result<()> {
        let mut buffer = self.buffer.lock().await;
        if buffer.len() >= self.capacity {
            if let Err(e) = self.write_out(&mut buffer).await {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(RelayError::Sink(format!(
                    "buffer full with {} events, rejected event {}: {}",
                    buffer.len(),
                    event.id,
                    e
                )));
            }
        }

        buffer.push(event.clone());
        if buffer.len() >= self.capacity {
            self.write_out(&mut buffer).await?;
        }
        Ok(())
    }

    async fn write_out(&self, buffer: &mut Vec<ChangeEvent>) -> Result<()> {
        if buffer.is_empty() {
            return Ok(());
        }

        match self.sink.write(buffer).await {
            Ok(()) => {
                debug!(handler = %self.name, events = buffer.len(), "Buffered events written");
                buffer.clear();
                Ok(())
            }
            Err(e) => {
                warn!(handler = %self.name, retained = buffer.len(), error = %e, "Sink write failed, keeping buffer");
                Err(e)
            }
        }
    }
}

#[async_trait]
impl<S: ProjectionSink> ChangeHandler for BufferedHandler<S> {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports(&self, collection: &str) -> bool {
        self.collections.contains(collection)
    }

    async fn handle_insert(&self, _collection: &str, event: &ChangeEvent) -> Result<()> {
        self.push(event).await
    }

    async fn handle_update(&self, _collection: &str, event: &ChangeEvent) -> Result<()> {
        self.push(event).await
    }

    async fn handle_delete(&self, _collection: &str, event: &ChangeEvent) -> Result<()> {
        self.push(event).await
    }

    async fn handle_replace(&self, _collection: &str, event: &ChangeEvent) -> Result<()> {
        self.push(event).await
    }

    async fn flush(&self) -> Result<()> {
        let mut buffer = self.buffer.lock().await;
        self.write_out(&mut buffer).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;

    #[derive(Default)]
    struct RecordingSink {
        writes: SyncMutex<Vec<usize>>,
        offline: AtomicBool,
    }

    #[async_trait]
    impl ProjectionSink for RecordingSink {
        async fn write(&self, events: &[ChangeEvent]) -> Result<()> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(RelayError::Sink("offline".to_string()));
            }
            self.writes.lock().push(events.len());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_writes_when_capacity_reached() {
        let handler = BufferedHandler::new("orders-sink", CollectionSet::of(["orders"]), 3, RecordingSink::default());

        for i in 0..4 {
            handler
                .handle_insert("orders", &ChangeEvent::insert("orders", json!({"id": i})))
                .await
                .unwrap();
        }

        assert_eq!(*handler.sink().writes.lock(), [3]);
        assert_eq!(handler.buffered().await, 1);

        handler.flush().await.unwrap();
        assert_eq!(*handler.sink().writes.lock(), [3, 1]);
        assert_eq!(handler.buffered().await, 0);
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_buffer() {
        let handler = BufferedHandler::new("orders-sink", CollectionSet::All, 10, RecordingSink::default());
        handler
            .handle_replace("orders", &ChangeEvent::replace("orders", json!({"id": 1})))
            .await
            .unwrap();

        handler.sink().offline.store(true, Ordering::SeqCst);
        tokio_test::assert_err!(handler.flush().await);
        assert_eq!(handler.buffered().await, 1);

        handler.sink().offline.store(false, Ordering::SeqCst);
        tokio_test::assert_ok!(handler.flush().await);
        assert_eq!(handler.buffered().await, 0);
    }

    #[tokio::test]
    async fn test_buffer_is_bounded_while_sink_is_down() {
        let handler = BufferedHandler::new("orders-sink", CollectionSet::All, 2, RecordingSink::default());
        handler.sink().offline.store(true, Ordering::SeqCst);

        let mut failures = 0;
        for i in 0..1_000 {
            let event = ChangeEvent::insert("orders", json!({"id": i}));
            if handler.handle_insert("orders", &event).await.is_err() {
                failures += 1;
            }
        }

        assert_eq!(handler.buffered().await, 2);
        assert_eq!(handler.rejected(), 998);
        // The second event filled the buffer and its write failed too.
        assert_eq!(failures, 999);

        handler.sink().offline.store(false, Ordering::SeqCst);
        tokio_test::assert_ok!(handler.flush().await);
        assert_eq!(*handler.sink().writes.lock(), [2]);
        assert_eq!(handler.buffered().await, 0);

        tokio_test::assert_ok!(
            handler
                .handle_insert("orders", &ChangeEvent::insert("orders", json!({"id": "next"})))
                .await
        );
        assert_eq!(handler.buffered().await, 1);
    }

    #[tokio::test]
    async fn test_empty_flush_does_not_touch_sink() {
        let handler = BufferedHandler::new("idle", CollectionSet::All, 10, RecordingSink::default());
        handler.flush().await.unwrap();
        assert!(handler.sink().writes.lock().is_empty());
    }
}
