//! Shared utilities and common logic for changerelay

pub mod config;
pub mod observability;
pub mod retry;
pub mod health;

pub use config::*;
pub use observability::*;
pub use retry::*;
pub use health::*;
