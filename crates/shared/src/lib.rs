#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Praxis shared plumbing
//!
//! Pieces every Praxis binary needs before the billing engine can run:
//! Postgres pool construction, tracing setup and typed environment lookups.

pub mod db;
pub mod env;
pub mod telemetry;

pub use db::{create_pool, PoolSettings};
pub use env::{env_opt, env_or, env_parse, EnvError};
pub use telemetry::init_tracing;
