//! # Mirror Sync Library
//!
//! Synchronization job subsystem that keeps one source repository mirrored
//! across several Git hosting providers: the durable job record, the
//! database-backed queue and worker pool, the provider adapters each job
//! drives, and the retry and failover bookkeeping around job outcomes.

pub mod adapters;
pub mod config;
pub mod db;
pub mod error;
pub mod failover;
pub mod models;
pub mod orchestrator;
pub mod processor;
pub mod queue;
pub mod repositories;
pub mod telemetry;
pub mod worker;
pub use migration;
