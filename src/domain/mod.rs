//! Domain layer types and invariants.

pub mod catalog;
pub mod chunks;
pub mod error;
pub mod series;
pub mod stats;
pub mod types;
