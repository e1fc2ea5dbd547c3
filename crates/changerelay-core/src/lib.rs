//! Change events, handler registry and routing for changerelay
//!
//! A change event observed on a source collection is broadcast by the
//! [`EventRouter`] to every [`ChangeHandler`] in the [`HandlerRegistry`] that
//! supports the collection. Handler failures are isolated per handler.
//! [`BatchMessage`] is the wire format downstream queue consumers receive.

pub mod batch;
pub mod buffer;
pub mod error;
pub mod escalation;
pub mod event;
pub mod feed;
pub mod handler;
pub mod registry;
pub mod router;

pub use batch::*;
pub use buffer::*;
pub use error::*;
pub use escalation::*;
pub use event::*;
pub use feed::*;
pub use handler::*;
pub use registry::*;
pub use router::*;
