//! `foreman status` command: a fleet-wide snapshot -- per-status task
//! counts plus the active batches, each with its progress summary.

use anyhow::Result;
use sqlx::SqlitePool;

use foreman_db::models::TaskStatus;
use foreman_db::queries::{batches as batch_db, tasks as task_db};

const ALL_STATUSES: &[TaskStatus] = &[
    TaskStatus::Queued,
    TaskStatus::Dispatched,
    TaskStatus::Running,
    TaskStatus::Evaluating,
    TaskStatus::Complete,
    TaskStatus::Retrying,
    TaskStatus::Blocked,
    TaskStatus::Failed,
    TaskStatus::PrReview,
    TaskStatus::ReviewTriage,
    TaskStatus::ReviewWaiting,
    TaskStatus::Merging,
    TaskStatus::Merged,
    TaskStatus::Deploying,
    TaskStatus::Deployed,
    TaskStatus::Verifying,
    TaskStatus::Verified,
    TaskStatus::VerifyFailed,
    TaskStatus::Cancelled,
];

pub async fn run_status(pool: &SqlitePool) -> Result<()> {
    let counts = task_db::list_tasks_by_status(pool, ALL_STATUSES).await?;
    let mut by_status: std::collections::BTreeMap<String, usize> = std::collections::BTreeMap::new();
    for task in &counts {
        *by_status.entry(task.status.to_string()).or_default() += 1;
    }

    println!("Tasks by status:");
    if by_status.is_empty() {
        println!("  (none)");
    }
    for (status, count) in &by_status {
        println!("  {status:<15} {count}");
    }
    println!();

    let batches = batch_db::list_batches(pool).await?;
    if batches.is_empty() {
        println!("No batches.");
        return Ok(());
    }

    println!("Batches:");
    for batch in &batches {
        let progress = batch_db::get_batch_progress(pool, &batch.id).await?;
        println!(
            "  {:<20} {:<10} {}/{} complete, {} failed/blocked, {} in flight",
            batch.id, batch.status, progress.complete_or_better, progress.total, progress.failed_or_blocked, progress.in_flight,
        );
    }

    Ok(())
}
