//! Wireless sensor base station to time-series bridge.
//!
//! Streams radio packets into a time-series sink through a bounded queue,
//! reconciles node and host clocks, and backfills on-device datalogs
//! without duplicating what was already written.

pub mod agent;
pub mod backfill;
pub mod config;
pub mod export;
pub mod model;
pub mod observability;
pub mod offset;
pub mod retry;
pub mod sink;
pub mod stream;
pub mod transport;
