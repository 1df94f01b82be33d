//! plow: a single-target HTTP(S) load generator.
//!
//! The crate drives a configured level of concurrent request load against
//! one URL, measures per-request latency and throughput as a stream, and
//! renders live terminal and web-chart reports. See the `requester` module
//! for the load pipeline and `report` for the statistics engine.

pub mod charts;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod histogram;
pub mod limiter;
pub mod printer;
pub mod quantile;
pub mod record;
pub mod report;
pub mod requester;
pub mod stats;
pub mod transport;
pub mod utils;
