//! `changerelay`: convenience façade over `changerelay-core`, `changerelay-queue`
//! and `changerelay-shared`, plus config-driven assembly of consumers.

#![deny(missing_docs)]

mod assembly;

pub use assembly::*;

/// Events, registry, router and change-feed driver.
pub use changerelay_core as core;

/// Queue deliveries, batch consumers, projections and worker pools.
pub use changerelay_queue as queue;

/// Configuration, observability, retry and health.
pub use changerelay_shared as shared;

/// The types most applications need, for `use changerelay::prelude::*;`.
pub mod prelude {
    pub use crate::assembly::{init_observability, Backends};
    pub use changerelay_core::{
        BatchMessage, ChangeEvent, ChangeHandler, CollectionSet, EventRouter, HandlerRegistry,
        OperationType, RouteOutcome,
    };
    pub use changerelay_queue::{
        Acknowledger, BatchConsumer, ConsumerPool, DeliverySource, Projection, Settlement,
    };
    pub use changerelay_shared::{ConsumerConfig, ProjectionKind, RelayConfig};
}
