//! Change-feed driving: pumps feed signals through the router and
//! checkpoints only after handlers have been flushed

use crate::{ChangeEvent, EventRouter, RelayError, Result, RouteOutcome};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{error, info, instrument, warn};

/// Item delivered by a change feed
#[derive(Debug, Clone)]
pub enum FeedSignal {
    Event(ChangeEvent),

    /// The feed wants to persist its resume position
    Checkpoint(String),
}

/// Persistent resume position of the change feed
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, token: &str) -> Result<()>;
    async fn load(&self) -> Result<Option<String>>;
}

#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    token: Mutex<Option<String>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, token: &str) -> Result<()> {
        *self.token.lock() = Some(token.to_string());
        Ok(())
    }

    async fn load(&self) -> Result<Option<String>> {
        Ok(self.token.lock().clone())
    }
}

/// What a driver run did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedSummary {
    pub events: u64,
    pub unhandled: u64,
    pub checkpoints_saved: u64,
    pub checkpoints_skipped: u64,
}

/// Reads feed signals on a single task and routes them in order.
///
/// Before a checkpoint is saved every handler is flushed; if any flush fails
/// the checkpoint is skipped so the feed resumes from the previous position
/// after a restart.
pub struct ChangeFeedDriver<C> {
    router: Arc<EventRouter>,
    checkpoints: C,
}

impl<C: CheckpointStore> ChangeFeedDriver<C> {
    pub fn new(router: Arc<EventRouter>, checkpoints: C) -> Self {
        Self { router, checkpoints }
    }

    pub fn checkpoints(&self) -> &C {
        &self.checkpoints
    }

    /// Consume the feed until it ends, then flush once more
    #[instrument(skip(self, feed))]
    pub async fn run<S>(&self, feed: S) -> Result<FeedSummary>
    where
        S: Stream<Item = FeedSignal> + Send,
    {
        let mut feed = std::pin::pin!(feed);
        let mut summary = FeedSummary::default();

        if let Some(token) = self.checkpoints.load().await? {
            info!(resume_token = %token, "Resuming change feed");
        }

        while let Some(signal) = feed.next().await {
            match signal {
                FeedSignal::Event(event) => {
                    summary.events += 1;
                    if self.router.dispatch(&event).await == RouteOutcome::NoHandler {
                        summary.unhandled += 1;
                    }
                }
                FeedSignal::Checkpoint(token) => {
                    if self.checkpoint(&token).await {
                        summary.checkpoints_saved += 1;
                    } else {
                        summary.checkpoints_skipped += 1;
                    }
                }
            }
        }

        let report = self.router.flush_all().await;
        if !report.is_clean() {
            warn!(failed = ?report.failed, "Final flush incomplete");
        }

        info!(
            events = summary.events,
            checkpoints = summary.checkpoints_saved,
            "Change feed ended"
        );
        Ok(summary)
    }

    async fn checkpoint(&self, token: &str) -> bool {
        let report = self.router.flush_all().await;
        if !report.is_clean() {
            warn!(
                token = %token,
                failed = ?report.failed,
                "Skipping checkpoint, not every handler flushed"
            );
            return false;
        }

        match self.checkpoints.save(token).await {
            Ok(()) => true,
            Err(e) => {
                error!(token = %token, error = %e, "Failed to save checkpoint");
                false
            }
        }
    }
}

/// In-process change feed backed by a broadcast channel
pub struct InMemoryChangeFeed {
    tx: broadcast::Sender<FeedSignal>,
}

impl InMemoryChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, signal: FeedSignal) -> Result<()> {
        self.tx
            .send(signal)
            .map_err(|_| RelayError::Feed("no subscriber on change feed".into()))?;
        Ok(())
    }

    /// Subscribe from now on; the stream ends when the feed is dropped
    pub fn subscribe(&self) -> impl Stream<Item = FeedSignal> + Send + 'static {
        BroadcastStream::new(self.tx.subscribe()).filter_map(|result| async move {
            match result {
                Ok(signal) => Some(signal),
                Err(e) => {
                    error!("Change feed subscriber lagged: {}", e);
                    None
                }
            }
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
