//! Copy-on-write handler registry

use crate::ChangeHandler;
use parking_lot::RwLock;
use std::ops::Deref;
use std::sync::Arc;
use tracing::debug;

pub type HandlerRef = Arc<dyn ChangeHandler>;

/// Immutable view of the registered handlers at one point in time.
///
/// Later registrations never show up in a snapshot already taken.
#[derive(Clone)]
pub struct HandlerSnapshot(Arc<Vec<HandlerRef>>);

impl Deref for HandlerSnapshot {
    type Target = [HandlerRef];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Live set of handlers.
///
/// Registration swaps in a fresh list under a short write lock; readers only
/// clone the current `Arc`, so no lock is held while handler callbacks run and
/// a callback may itself register a handler.
pub struct HandlerRegistry {
    handlers: RwLock<Arc<Vec<HandlerRef>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Add a handler; visible to dispatches that start after this returns
    pub fn register(&self, handler: HandlerRef) {
        let mut current = self.handlers.write();
        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().cloned());
        debug!(handler = %handler.name(), position = next.len(), "Registering change handler");
        next.push(handler);
        *current = Arc::new(next);
    }

    pub fn all(&self) -> HandlerSnapshot {
        HandlerSnapshot(self.handlers.read().clone())
    }

    pub fn count(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChangeEvent, CollectionSet, Result};
    use async_trait::async_trait;

    struct NamedHandler {
        name: String,
        collections: CollectionSet,
    }

    impl NamedHandler {
        fn arc(name: impl Into<String>, collections: CollectionSet) -> HandlerRef {
            Arc::new(Self {
                name: name.into(),
                collections,
            })
        }
    }

    #[async_trait]
    impl ChangeHandler for NamedHandler {
        fn name(&self) -> &str {
            &self.name
        }

        fn supports(&self, collection: &str) -> bool {
            self.collections.contains(collection)
        }

        async fn handle_insert(&self, _: &str, _: &ChangeEvent) -> Result<()> {
            Ok(())
        }

        async fn handle_update(&self, _: &str, _: &ChangeEvent) -> Result<()> {
            Ok(())
        }

        async fn handle_delete(&self, _: &str, _: &ChangeEvent) -> Result<()> {
            Ok(())
        }

        async fn handle_replace(&self, _: &str, _: &ChangeEvent) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_register_preserves_order() {
        let registry = HandlerRegistry::new();
        assert!(registry.is_empty());

        registry.register(NamedHandler::arc("a", CollectionSet::All));
        registry.register(NamedHandler::arc("b", CollectionSet::of(["orders"])));
        registry.register(NamedHandler::arc("c", CollectionSet::of(["users"])));

        assert_eq!(registry.count(), 3);
        let names: Vec<_> = registry.all().iter().map(|h| h.name().to_string()).collect();
        assert_eq!(names, ["a", "b", "c"]);

        let orders: Vec<_> = registry
            .all()
            .iter()
            .filter(|h| h.supports("orders"))
            .map(|h| h.name().to_string())
            .collect();
        assert_eq!(orders, ["a", "b"]);
    }

    #[test]
    fn test_snapshot_ignores_later_registrations() {
        let registry = HandlerRegistry::new();
        registry.register(NamedHandler::arc("first", CollectionSet::All));

        let snapshot = registry.all();
        registry.register(NamedHandler::arc("second", CollectionSet::All));

        assert_eq!(snapshot.len(), 1);
        assert_eq!(registry.count(), 2);
    }

    #[test]
    fn test_concurrent_registration_while_iterating() {
        let registry = Arc::new(HandlerRegistry::new());
        for i in 0..2_000 {
            registry.register(NamedHandler::arc(format!("initial-{i}"), CollectionSet::All));
        }

        let snapshot = registry.all();

        std::thread::scope(|scope| {
            let writer = {
                let registry = registry.clone();
                scope.spawn(move || {
                    for i in 0..500 {
                        registry.register(NamedHandler::arc(format!("late-{i}"), CollectionSet::All));
                    }
                })
            };

            for _ in 0..20 {
                let mut seen = 0;
                for (i, handler) in snapshot.iter().enumerate() {
                    assert_eq!(handler.name(), format!("initial-{i}"));
                    seen += 1;
                }
                assert_eq!(seen, 2_000);
            }

            writer.join().unwrap();
        });

        assert_eq!(snapshot.len(), 2_000);
        assert_eq!(registry.count(), 2_500);
    }
}
