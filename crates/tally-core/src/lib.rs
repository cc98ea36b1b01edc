//! tally-core: vote reconciliation and score caching for entity pages.
//!
//! This crate owns the vote model, the system-of-record and counter-store
//! contracts with their SQLite, Redis and in-memory backends, the
//! reconciliation job and score aggregation.

pub mod config;
pub mod core;
pub mod counter;
pub mod model;
pub mod notify;
pub mod record;
pub mod scoring;
