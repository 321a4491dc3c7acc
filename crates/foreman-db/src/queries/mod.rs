//! Query layer, one module per table.

pub mod batches;
pub mod proof_logs;
pub mod state_log;
pub mod tasks;
