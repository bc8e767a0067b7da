//! CLI command implementations.

pub mod common;
pub mod plan;
pub mod queues;
pub mod script;
pub mod version;
