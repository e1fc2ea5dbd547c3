//! Change handler capability trait

use crate::{ChangeEvent, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use tracing::info;

/// A pluggable component applying change events for one or more collections
/// to a downstream projection.
///
/// `supports` must be pure: the router may call it once per event per handler.
/// Handlers must not depend on their order relative to other handlers.
#[async_trait]
pub trait ChangeHandler: Send + Sync {
    /// Name used in diagnostics
    fn name(&self) -> &str;

    fn supports(&self, collection: &str) -> bool;

    async fn handle_insert(&self, collection: &str, event: &ChangeEvent) -> Result<()>;

    async fn handle_update(&self, collection: &str, event: &ChangeEvent) -> Result<()>;

    async fn handle_delete(&self, collection: &str, event: &ChangeEvent) -> Result<()>;

    async fn handle_replace(&self, collection: &str, event: &ChangeEvent) -> Result<()>;

    /// Force out anything buffered. Handlers without a buffer keep the default.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Set of collections a handler claims
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionSet {
    All,
    Named(HashSet<String>),
}

impl CollectionSet {
    pub fn of<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CollectionSet::Named(names.into_iter().map(Into::into).collect())
    }

    pub fn contains(&self, collection: &str) -> bool {
        match self {
            CollectionSet::All => true,
            CollectionSet::Named(names) => names.contains(collection),
        }
    }
}

/// Handler that logs every event it receives; useful as a catch-all tap
pub struct LoggingHandler {
    collections: CollectionSet,
}

impl LoggingHandler {
    pub fn new(collections: CollectionSet) -> Self {
        Self { collections }
    }

    fn log(&self, collection: &str, event: &ChangeEvent) {
        info!(
            event_id = %event.id,
            collection = %collection,
            operation = %event.operation,
            "Change event observed"
        );
    }
}

impl Default for LoggingHandler {
    fn default() -> Self {
        Self::new(CollectionSet::All)
    }
}

#[async_trait]
impl ChangeHandler for LoggingHandler {
    fn name(&self) -> &str {
        "logging"
    }

    fn supports(&self, collection: &str) -> bool {
        self.collections.contains(collection)
    }

    async fn handle_insert(&self, collection: &str, event: &ChangeEvent) -> Result<()> {
        self.log(collection, event);
        Ok(())
    }

    async fn handle_update(&self, collection: &str, event: &ChangeEvent) -> Result<()> {
        self.log(collection, event);
        Ok(())
    }

    async fn handle_delete(&self, collection: &str, event: &ChangeEvent) -> Result<()> {
        self.log(collection, event);
        Ok(())
    }

    async fn handle_replace(&self, collection: &str, event: &ChangeEvent) -> Result<()> {
        self.log(collection, event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_set() {
        let named = CollectionSet::of(["orders", "users"]);
        assert!(named.contains("orders"));
        assert!(!named.contains("invoices"));
        assert!(CollectionSet::All.contains("anything"));
    }

    #[tokio::test]
    async fn test_logging_handler_accepts_everything() {
        let handler = LoggingHandler::default();
        let event = ChangeEvent::delete("orders", serde_json::json!({"id": 1}));

        assert!(handler.supports("orders"));
        tokio_test::assert_ok!(handler.handle_delete("orders", &event).await);
        tokio_test::assert_ok!(handler.flush().await);
    }
}
