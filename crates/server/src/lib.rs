//! Metrics server: receives agent reports, aggregates them in a pluggable
//! store and serves lookups.

pub mod aggregator;
pub mod api;
pub mod app;
pub mod config;
