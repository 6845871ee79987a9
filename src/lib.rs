//! Download and repository statistics cache.
//!
//! npm download history is fetched in fixed date chunks that become
//! immutable once closed, GitHub metrics are fetched per repository and per
//! org, and both are rolled up into library and org totals served by a read
//! API that never reaches upstream.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
