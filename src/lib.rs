//! # workqueue
//!
//! Background work queue for the order-processing backend.
//!
//! Producers enqueue typed work items; workers allocate them under a lease,
//! run the registered handler and report the outcome. Status is never stored:
//! it is derived from timestamps ([`status::derive_status`]), so an abandoned
//! lease turns `FAILED` on its own. Failures with retry budget spawn a linked
//! successor instead of being re-run in place.
//!
//! Storage is pluggable behind [`store::WorkStore`]: Postgres via [`db::Db`],
//! or [`store::InMemoryWorkStore`] for tests and single-process use.

pub mod clock;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod model;
pub mod registry;
pub mod status;
pub mod store;
pub mod telemetry;
