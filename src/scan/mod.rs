//! The scan orchestrator.
//!
//! A push (or manual request) becomes a `Trigger`. The `guard` decides in one
//! transaction whether it may start a run, the `scheduler` queues the run for
//! a worker, and the `controller` drives it through its stages with the
//! `executor` applying timeouts and retries. Every state change goes through
//! the `ledger`, backed by SQLite in `db`.
//!
//! - `models`: triggers, runs, findings and the run state machine
//! - `db`: SQLite persistence and the async `DbHandle`
//! - `ledger`: validated state transitions and run queries
//! - `guard`: loop prevention and idempotency leases
//! - `executor`: one stage under a timeout and retry policy
//! - `controller`: the per-run pipeline
//! - `scheduler`: bounded queue and worker pool
//! - `api`, `server`: webhook intake, manual trigger and the query surface

pub mod api;
pub mod controller;
pub mod db;
pub mod executor;
pub mod guard;
pub mod ledger;
pub mod models;
pub mod scheduler;
pub mod server;
