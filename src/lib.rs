//! Passive memcached and Redis key activity analysis.
//!
//! Reassembled TCP directions are paired into conversations by
//! [`assembly`], parsed into events by [`protocol`], and aggregated per key
//! by [`analysis`].

pub mod agent;
pub mod analysis;
pub mod assembly;
pub mod config;
pub mod export;
pub mod protocol;
pub mod stream;
