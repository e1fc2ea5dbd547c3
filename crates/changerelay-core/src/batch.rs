//! Batch message wire format carried by the queue

use crate::{OperationType, RelayError, Result};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

/// Upper bound on items per batch; larger bursts are split by the producer.
pub const MAX_BATCH_ITEMS: usize = 1000;

/// A batch of domain records sharing one operation type and collection.
///
/// The batch is the unit of acknowledgment: one message gets exactly one
/// ack or requeue, however many items it holds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct BatchMessage<T = serde_json::Value> {
    pub operation_type: OperationType,

    /// Routing key
    pub collection_name: String,

    /// Producer clock, epoch millis
    pub timestamp: i64,

    #[serde(default, deserialize_with = "null_as_empty")]
    pub items: Vec<T>,
}

fn null_as_empty<'de, D, T>(deserializer: D) -> std::result::Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

impl<T> BatchMessage<T> {
    pub fn new(operation_type: OperationType, collection_name: impl Into<String>, items: Vec<T>) -> Self {
        Self {
            operation_type,
            collection_name: collection_name.into(),
            timestamp: Utc::now().timestamp_millis(),
            items,
        }
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Split a change burst into messages of at most `max_items` each,
    /// preserving item order. An empty burst yields no messages.
    pub fn split(
        operation_type: OperationType,
        collection_name: &str,
        timestamp: i64,
        items: Vec<T>,
        max_items: usize,
    ) -> Result<Vec<Self>> {
        if max_items == 0 {
            return Err(RelayError::InvalidBatch("max_items must be positive".to_string()));
        }

        let mut batches = Vec::with_capacity(items.len().div_ceil(max_items));
        let mut iter = items.into_iter().peekable();
        while iter.peek().is_some() {
            let chunk: Vec<T> = iter.by_ref().take(max_items).collect();
            batches.push(Self {
                operation_type,
                collection_name: collection_name.to_string(),
                timestamp,
                items: chunk,
            });
        }

        Ok(batches)
    }

    pub fn validate(&self, max_items: usize) -> Result<()> {
        if self.collection_name.is_empty() {
            return Err(RelayError::InvalidBatch("collection name is empty".to_string()));
        }
        if self.items.len() > max_items {
            return Err(RelayError::InvalidBatch(format!(
                "{} items exceeds the limit of {}",
                self.items.len(),
                max_items
            )));
        }
        Ok(())
    }
}

impl<T: Serialize> BatchMessage<T> {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl<T: DeserializeOwned> BatchMessage<T> {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}
