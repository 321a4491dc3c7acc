//! `foreman log` command: show the state-log and proof-log history for
//! a single task -- the audit trail the idempotent-pulse testable
//! property (spec §8.6) is checked against.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use foreman_db::queries::{proof_logs, state_log, tasks as task_db};

pub async fn run_log(pool: &SqlitePool, task_id: &str) -> Result<()> {
    let task = task_db::get_task(pool, task_id)
        .await?
        .with_context(|| format!("task {task_id} not found"))?;

    println!("Task: {} ({})", task.id, task.description);
    println!("Status: {}", task.status);
    if let Some(err) = &task.error {
        println!("Error: {err}");
    }
    println!();

    let transitions = state_log::list_for_task(pool, task_id).await?;
    println!("State log ({}):", transitions.len());
    for entry in &transitions {
        let from = entry.from_state.as_deref().unwrap_or("-");
        println!(
            "  [{}] {} -> {}{}",
            entry.created_at.format("%Y-%m-%d %H:%M:%S"),
            from,
            entry.to_state,
            entry.reason.as_deref().map(|r| format!(" ({r})")).unwrap_or_default(),
        );
    }

    let proofs = proof_logs::list_for_task(pool, task_id).await?;
    if proofs.is_empty() {
        return Ok(());
    }
    println!();
    println!("Proof log ({}):", proofs.len());
    for entry in &proofs {
        println!(
            "  [{}] {}/{} decided by {}: {}{}",
            entry.created_at.format("%Y-%m-%d %H:%M:%S"),
            entry.stage,
            entry.event,
            entry.decided_by,
            entry.decision.as_deref().unwrap_or("-"),
            entry.pr_url.as_deref().map(|u| format!(" ({u})")).unwrap_or_default(),
        );
    }

    Ok(())
}
