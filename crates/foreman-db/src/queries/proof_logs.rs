//! Database query functions for the append-only `proof_logs` table.
//!
//! Every terminal transition and PR-lifecycle decision writes a proof-log
//! row; this is the evidence trail referenced by the spec's
//! round-trip/audit testable properties.

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::SqlitePool;

use crate::models::ProofLogEntry;

/// Fields for a new proof-log row.
pub struct NewProofLog<'a> {
    pub task_id: &'a str,
    pub event: &'a str,
    pub stage: &'a str,
    pub decision: Option<&'a str>,
    pub evidence: Option<Value>,
    pub decided_by: &'a str,
    pub pr_url: Option<&'a str>,
    pub duration_ms: Option<i64>,
    pub metadata: Option<Value>,
}

/// Append a proof-log record.
pub async fn append(pool: &SqlitePool, new: &NewProofLog<'_>) -> Result<ProofLogEntry> {
    let id = sqlx::query(
        "INSERT INTO proof_logs \
         (task_id, event, stage, decision, evidence, decided_by, pr_url, duration_ms, metadata, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(new.task_id)
    .bind(new.event)
    .bind(new.stage)
    .bind(new.decision)
    .bind(new.evidence.as_ref())
    .bind(new.decided_by)
    .bind(new.pr_url)
    .bind(new.duration_ms)
    .bind(new.metadata.as_ref())
    .bind(chrono::Utc::now())
    .execute(pool)
    .await
    .context("failed to append proof log entry")?
    .last_insert_rowid();

    sqlx::query_as::<_, ProofLogEntry>("SELECT * FROM proof_logs WHERE id = ?")
        .bind(id)
        .fetch_one(pool)
        .await
        .context("failed to read back proof log entry")
}

/// List every proof-log entry for a task, oldest first.
pub async fn list_for_task(pool: &SqlitePool, task_id: &str) -> Result<Vec<ProofLogEntry>> {
    sqlx::query_as::<_, ProofLogEntry>(
        "SELECT * FROM proof_logs WHERE task_id = ? ORDER BY id ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list proof log entries")
}

/// List proof-log entries for a task at a given lifecycle stage (e.g.
/// `"pr_lifecycle"`, `"evaluation"`), oldest first.
pub async fn list_for_task_stage(pool: &SqlitePool, task_id: &str, stage: &str) -> Result<Vec<ProofLogEntry>> {
    sqlx::query_as::<_, ProofLogEntry>(
        "SELECT * FROM proof_logs WHERE task_id = ? AND stage = ? ORDER BY id ASC",
    )
    .bind(task_id)
    .bind(stage)
    .fetch_all(pool)
    .await
    .context("failed to list proof log entries by stage")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool;
    use crate::queries::tasks::{insert_task, NewTask};
    use serde_json::json;

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

    #[tokio::test]
    async fn append_and_list_round_trip() {
        let pool = test_pool().await;
        insert_task(
            &pool,
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

        append(
            &pool,
            &NewProofLog {
                task_id: "t1",
                event: "evaluation_verdict",
                stage: "evaluation",
                decision: Some("complete"),
                evidence: Some(json!({"tier": 1, "tests_passed": true})),
                decided_by: "evaluator",
                pr_url: None,
                duration_ms: Some(42),
                metadata: None,
            },
        )
        .await
        .expect("append");

        let entries = list_for_task(&pool, "t1").await.expect("list");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].decision.as_deref(), Some("complete"));
        assert_eq!(
            entries[0].evidence.as_ref().unwrap()["tier"],
            json!(1)
        );

        let by_stage = list_for_task_stage(&pool, "t1", "evaluation")
            .await
            .expect("list by stage");
        assert_eq!(by_stage.len(), 1);
    }
}
