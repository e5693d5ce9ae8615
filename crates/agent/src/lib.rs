//! Metrics agent: samples the host, accumulates readings locally and ships
//! them to the server on a fixed interval.

pub mod app;
pub mod collector;
pub mod config;
pub mod dispatch;
pub mod pool;
pub mod transport;
