//! Bidirectional DB<->task-file reconciliation (spec §4.9), covering
//! the four gap types named there:
//!
//! 1. DB `failed`/`blocked` but file unannotated -> annotate the file.
//! 2. DB `cancelled` but file still open -> mark `[-]` in the file.
//! 3. File `[x]` but DB non-terminal -> transition the DB to `complete`
//!    (only when the state graph actually allows it from the task's
//!    current status; otherwise this is logged, not forced).
//! 4. DB rows with no file entry -> logged as orphans, never
//!    auto-removed.

use anyhow::Result;
use chrono::Utc;
use sqlx::SqlitePool;
use tracing::{info, warn};

use foreman_db::models::TaskStatus;
use foreman_db::queries::tasks as db;

use crate::state::{TaskStateMachine, TransitionContext};
use crate::taskfile::{CompletionProof, TaskFile, TaskFileState};

#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub annotated: usize,
    pub marked_cancelled_in_file: usize,
    pub marked_complete_in_file: usize,
    pub completed_in_db: usize,
    pub orphans: Vec<String>,
}

/// Recover the PR number from a task's recorded URL for a completion
/// proof annotation; falls back to `CompletionProof::Verified` when the
/// URL is absent or not a recognisable `.../pull/<n>` shape.
fn completion_proof(pr_url: Option<&str>) -> CompletionProof {
    pr_url
        .and_then(|url| url.rsplit('/').next())
        .and_then(|tail| tail.parse::<u64>().ok())
        .map(CompletionProof::Pr)
        .unwrap_or(CompletionProof::Verified)
}

pub async fn reconcile(pool: &SqlitePool, repo_path: &str, file: &mut TaskFile) -> Result<ReconcileReport> {
    let mut report = ReconcileReport::default();
    let tasks = db::list_tasks_for_repo(pool, repo_path).await?;

    for task in &tasks {
        let Some(line) = file.find(&task.id).cloned() else {
            report.orphans.push(task.id.clone());
            continue;
        };

        match task.status {
            TaskStatus::Failed | TaskStatus::Blocked if line.annotation("status").is_none() => {
                let reason = task.error.as_deref().unwrap_or("no reason recorded");
                match file.annotate_status(&task.id, &task.status.to_string(), reason, Utc::now()) {
                    Ok(()) => report.annotated += 1,
                    Err(err) => warn!(task_id = %task.id, %err, "failed to annotate task file"),
                }
            }
            TaskStatus::Cancelled if line.state != TaskFileState::Cancelled => {
                match file.mark_cancelled(&task.id, Utc::now()) {
                    Ok(()) => report.marked_cancelled_in_file += 1,
                    Err(err) => warn!(task_id = %task.id, %err, "failed to mark task cancelled in task file"),
                }
            }
            TaskStatus::Verified if line.state != TaskFileState::Done => {
                let proof = completion_proof(task.pr_url.as_deref());
                match file.mark_complete(&task.id, proof, Utc::now()) {
                    Ok(()) => report.marked_complete_in_file += 1,
                    Err(err) => warn!(task_id = %task.id, %err, "failed to mark task complete in task file"),
                }
            }
            _ => {}
        }

        if line.state == TaskFileState::Done && !task.status.is_terminal() {
            if TaskStateMachine::is_valid_transition(task.status, TaskStatus::Complete) {
                let from = task.status;
                match TaskStateMachine::transition(pool, &task.id, from, TaskStatus::Complete, TransitionContext {
                    reason: Some("task file marked complete"),
                    ..Default::default()
                })
                .await
                {
                    Ok(()) => report.completed_in_db += 1,
                    Err(err) => warn!(task_id = %task.id, %err, "failed to complete task from task-file reconciliation"),
                }
            } else {
                warn!(
                    task_id = %task.id,
                    status = %task.status,
                    "task file marks task complete but its DB status cannot transition directly to complete"
                );
            }
        }
    }

    for id in &report.orphans {
        info!(task_id = %id, "task row has no corresponding task-file entry");
    }

    Ok(report)
}
