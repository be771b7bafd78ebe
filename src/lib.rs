//! # leaseq
//!
//! Lease-based work queue on Postgres.
//!
//! One atomic conditional update is the only synchronization primitive:
//! claiming, renewing, and completing a task each run as a single SQL
//! statement, so any number of consumers can poll the same queue without
//! ever receiving the same task twice from one claim. A task that is
//! never renewed or acknowledged becomes claimable again once its lease
//! lapses, bounded by the queue's retry policy.

pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod queue;
pub mod telemetry;
