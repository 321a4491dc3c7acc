//! Durable store for the task/batch/state-log/proof-log schema: pool
//! creation, migrations (with the verified-backup contract), and the
//! query layer consumed by `foreman-core`.

pub mod config;
pub mod migration;
pub mod models;
pub mod pool;
pub mod queries;
