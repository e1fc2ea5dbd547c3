//! Escalation of handler failures beyond the log line

use crate::OperationType;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

/// Where in the handler lifecycle the failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Dispatch,
    Flush,
}

/// A handler failure isolated by the router
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerFailure {
    pub handler: String,
    pub stage: FailureStage,

    /// Set for dispatch failures
    pub collection: Option<String>,
    pub operation: Option<OperationType>,
    pub event_id: Option<String>,

    pub error: String,
    pub failed_at: DateTime<Utc>,
}

impl HandlerFailure {
    pub fn dispatch(
        handler: impl Into<String>,
        collection: impl Into<String>,
        operation: OperationType,
        event_id: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            handler: handler.into(),
            stage: FailureStage::Dispatch,
            collection: Some(collection.into()),
            operation: Some(operation),
            event_id: Some(event_id.into()),
            error: error.into(),
            failed_at: Utc::now(),
        }
    }

    pub fn flush(handler: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            handler: handler.into(),
            stage: FailureStage::Flush,
            collection: None,
            operation: None,
            event_id: None,
            error: error.into(),
            failed_at: Utc::now(),
        }
    }
}

/// Receives every failure the router isolated, after it has been logged.
///
/// Must not block: it runs on the dispatching task.
pub trait FailureEscalation: Send + Sync {
    fn escalate(&self, failure: HandlerFailure);
}

/// Default: the router's own log line is the only trace
#[derive(Debug, Default, Clone, Copy)]
pub struct LogOnly;

impl FailureEscalation for LogOnly {
    fn escalate(&self, _failure: HandlerFailure) {}
}

/// Bounded in-memory dead-letter buffer; the oldest failure is evicted when full
pub struct DeadLetterBuffer {
    capacity: usize,
    failures: Mutex<VecDeque<HandlerFailure>>,
    evicted: AtomicU64,
}

impl DeadLetterBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            failures: Mutex::new(VecDeque::with_capacity(capacity)),
            evicted: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.failures.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take all buffered failures, oldest first
    pub fn drain(&self) -> Vec<HandlerFailure> {
        self.failures.lock().drain(..).collect()
    }

    pub fn evicted_count(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl FailureEscalation for DeadLetterBuffer {
    fn escalate(&self, failure: HandlerFailure) {
        let mut failures = self.failures.lock();
        if failures.len() == self.capacity {
            failures.pop_front();
            let count = self.evicted.fetch_add(1, Ordering::Relaxed) + 1;
            if count % 100 == 1 {
                warn!(evicted = count, capacity = self.capacity, "Dead-letter buffer full, evicting oldest failures");
            }
        }
        failures.push_back(failure);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dead_letter_buffer_evicts_oldest() {
        let buffer = DeadLetterBuffer::new(2);
        for i in 0..3 {
            buffer.escalate(HandlerFailure::dispatch(
                "search",
                "orders",
                OperationType::Insert,
                format!("evt-{i}"),
                "boom",
            ));
        }

        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.evicted_count(), 1);

        let drained = buffer.drain();
        assert_eq!(drained[0].event_id.as_deref(), Some("evt-1"));
        assert_eq!(drained[1].event_id.as_deref(), Some("evt-2"));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_flush_failure_record() {
        let failure = HandlerFailure::flush("cache", "sink offline");
        assert_eq!(failure.stage, FailureStage::Flush);
        assert!(failure.operation.is_none());
        assert!(failure.collection.is_none());
    }
}
