//! Database query functions for the `batches` and `batch_tasks` tables.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::models::{Batch, BatchStatus, BatchTask, ReleaseType, Task};

/// Fields required to seed a new batch. Counters and timestamps start at
/// schema defaults.
pub struct NewBatch<'a> {
    pub id: &'a str,
    pub name: &'a str,
    pub base_concurrency: i32,
    pub hard_ceiling: Option<i32>,
    pub release_on_complete: bool,
    pub release_type: Option<ReleaseType>,
    pub skip_quality_gate: bool,
}

/// Insert a new batch row in `active` status.
pub async fn insert_batch(pool: &SqlitePool, new: &NewBatch<'_>) -> Result<Batch> {
    sqlx::query(
        "INSERT INTO batches (id, name, base_concurrency, hard_ceiling, release_on_complete, \
         release_type, skip_quality_gate, status, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(new.id)
    .bind(new.name)
    .bind(new.base_concurrency)
    .bind(new.hard_ceiling)
    .bind(new.release_on_complete)
    .bind(new.release_type)
    .bind(new.skip_quality_gate)
    .bind(BatchStatus::Active)
    .bind(chrono::Utc::now())
    .execute(pool)
    .await
    .context("failed to insert batch")?;

    get_batch(pool, new.id)
        .await?
        .context("inserted batch vanished before it could be read back")
}

/// Fetch a single batch by ID.
pub async fn get_batch(pool: &SqlitePool, id: &str) -> Result<Option<Batch>> {
    sqlx::query_as::<_, Batch>("SELECT * FROM batches WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch batch")
}

/// List all batches, newest first.
pub async fn list_batches(pool: &SqlitePool) -> Result<Vec<Batch>> {
    sqlx::query_as::<_, Batch>("SELECT * FROM batches ORDER BY created_at DESC")
        .fetch_all(pool)
        .await
        .context("failed to list batches")
}

/// Add a task to a batch at the given position.
pub async fn add_task_to_batch(pool: &SqlitePool, batch_id: &str, task_id: &str, position: i32) -> Result<()> {
    sqlx::query("INSERT INTO batch_tasks (batch_id, task_id, position) VALUES (?, ?, ?)")
        .bind(batch_id)
        .bind(task_id)
        .bind(position)
        .execute(pool)
        .await
        .context("failed to add task to batch")?;
    Ok(())
}

/// List the join rows for a batch, ordered by position.
pub async fn list_batch_tasks(pool: &SqlitePool, batch_id: &str) -> Result<Vec<BatchTask>> {
    sqlx::query_as::<_, BatchTask>(
        "SELECT * FROM batch_tasks WHERE batch_id = ? ORDER BY position ASC",
    )
    .bind(batch_id)
    .fetch_all(pool)
    .await
    .context("failed to list batch tasks")
}

/// List the full task rows belonging to a batch, ordered by position.
pub async fn list_tasks_in_batch(pool: &SqlitePool, batch_id: &str) -> Result<Vec<Task>> {
    sqlx::query_as::<_, Task>(
        "SELECT t.* FROM tasks t \
         JOIN batch_tasks bt ON bt.task_id = t.id \
         WHERE bt.batch_id = ? \
         ORDER BY bt.position ASC",
    )
    .bind(batch_id)
    .fetch_all(pool)
    .await
    .context("failed to list tasks in batch")
}

/// Progress summary for a batch: total tasks and how many are in each of
/// the terminal-or-not buckets the CLI `batches` command reports.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchProgress {
    pub total: i64,
    pub complete_or_better: i64,
    pub failed_or_blocked: i64,
    pub in_flight: i64,
}

/// Compute a batch's progress summary by joining `batch_tasks` to `tasks`.
pub async fn get_batch_progress(pool: &SqlitePool, batch_id: &str) -> Result<BatchProgress> {
    let tasks = list_tasks_in_batch(pool, batch_id).await?;
    let mut progress = BatchProgress {
        total: tasks.len() as i64,
        ..Default::default()
    };

    use crate::models::TaskStatus::*;
    for task in &tasks {
        match task.status {
            Deployed | Verified | Merged | Complete => progress.complete_or_better += 1,
            Failed | Blocked | VerifyFailed | Cancelled => progress.failed_or_blocked += 1,
            _ => progress.in_flight += 1,
        }
    }
    Ok(progress)
}

/// Whether every task in a batch has reached a terminal status.
pub async fn is_batch_complete(pool: &SqlitePool, batch_id: &str) -> Result<bool> {
    let tasks = list_tasks_in_batch(pool, batch_id).await?;
    if tasks.is_empty() {
        return Ok(false);
    }
    Ok(tasks.iter().all(|t| t.status.is_terminal()))
}

/// Update a batch's status.
pub async fn update_batch_status(pool: &SqlitePool, id: &str, status: BatchStatus) -> Result<()> {
    let result = sqlx::query("UPDATE batches SET status = ? WHERE id = ?")
        .bind(status)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to update batch status")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("batch {id} not found");
    }
    Ok(())
}
