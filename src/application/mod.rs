//! Application services: refresh orchestration, rollups and the read API.

pub mod aggregate;
pub mod error;
pub mod jobs;
pub mod refresh;
pub mod stats;
pub mod tools;
pub mod upstream;
