//! Batch queue consumers with ack/requeue discipline for changerelay

pub mod broker;
pub mod consumer;
pub mod delivery;
pub mod error;
pub mod pool;
pub mod projection;

pub use broker::*;
pub use consumer::*;
pub use delivery::*;
pub use error::*;
pub use pool::*;
pub use projection::*;
