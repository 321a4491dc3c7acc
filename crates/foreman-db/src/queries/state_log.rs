//! Database query functions for the append-only `state_log` table.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::models::StateLogEntry;

/// Append a state-transition record. Never updates or deletes -- the log
/// is the audit trail the idempotent-pulse property is checked against.
pub async fn append(
    pool: &SqlitePool,
    task_id: &str,
    from_state: Option<&str>,
    to_state: &str,
    reason: Option<&str>,
) -> Result<StateLogEntry> {
    let id = sqlx::query(
        "INSERT INTO state_log (task_id, from_state, to_state, reason, created_at) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(task_id)
    .bind(from_state)
    .bind(to_state)
    .bind(reason)
    .bind(chrono::Utc::now())
    .execute(pool)
    .await
    .context("failed to append state log entry")?
    .last_insert_rowid();

    sqlx::query_as::<_, StateLogEntry>("SELECT * FROM state_log WHERE id = ?")
        .bind(id)
        .fetch_one(pool)
        .await
        .context("failed to read back state log entry")
}

/// List every recorded transition for a task, oldest first.
pub async fn list_for_task(pool: &SqlitePool, task_id: &str) -> Result<Vec<StateLogEntry>> {
    sqlx::query_as::<_, StateLogEntry>(
        "SELECT * FROM state_log WHERE task_id = ? ORDER BY id ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list state log entries")
}

/// Count state-log rows created at or after a given row id. Used to detect
/// whether a pulse produced any new transitions (the idempotent-pulse
/// testable property: a pulse over an unchanged task set appends nothing).
pub async fn count_since(pool: &SqlitePool, since_id: i64) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM state_log WHERE id > ?")
        .bind(since_id)
        .fetch_one(pool)
        .await
        .context("failed to count state log entries")?;
    Ok(count)
}

/// The id of the most recently appended state-log row, or 0 if the log is
/// empty. Pair with `count_since` to bracket a pulse's writes.
pub async fn max_id(pool: &SqlitePool) -> Result<i64> {
    let (max,): (Option<i64>,) = sqlx::query_as("SELECT MAX(id) FROM state_log")
        .fetch_one(pool)
        .await
        .context("failed to read max state log id")?;
    Ok(max.unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool;
    use crate::queries::tasks::{insert_task, NewTask};

    async fn test_pool() -> SqlitePool {
        let p = sqlx::SqlitePool::connect_with(pool::connect_options(
            std::path::Path::new(":memory:"),
            std::time::Duration::from_secs(5),
        ))
        .await
        .expect("connect");
        pool::run_migrations(&p).await.expect("migrate");
        p
    }

    async fn seed_task(pool: &SqlitePool) {
        insert_task(
            pool,
            &NewTask {
                id: "t1",
                repo_path: "/repo",
                description: "x",
                max_retries: 3,
                max_escalation: 2,
                model: None,
                diagnostic_of: None,
                parent_issue_url: None,
            },
        )
        .await
        .expect("insert task");
    }

    #[tokio::test]
    async fn append_and_list_round_trip() {
        let pool = test_pool().await;
        seed_task(&pool).await;

        append(&pool, "t1", None, "queued", Some("created")).await.expect("append");
        append(&pool, "t1", Some("queued"), "dispatched", None)
            .await
            .expect("append");

        let entries = list_for_task(&pool, "t1").await.expect("list");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].to_state, "queued");
        assert_eq!(entries[1].from_state.as_deref(), Some("queued"));
    }

    #[tokio::test]
    async fn idempotent_pulse_produces_no_new_rows() {
        let pool = test_pool().await;
        seed_task(&pool).await;
        append(&pool, "t1", None, "queued", None).await.expect("append");

        let watermark = max_id(&pool).await.expect("max id");
        // Simulate a pulse that makes no transitions.
        let added = count_since(&pool, watermark).await.expect("count since");
        assert_eq!(added, 0);
    }
}
