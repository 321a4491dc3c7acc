//! Convenience transition helpers that wrap [`super::TaskStateMachine`]
//! with semantic names matching the pulse phases.

use anyhow::Result;
use sqlx::SqlitePool;

use foreman_db::models::TaskStatus;

use super::{TaskStateMachine, TransitionContext};

/// Dispatch a queued task into a worktree: `queued -> dispatched`.
pub async fn dispatch_task(
    pool: &SqlitePool,
    task_id: &str,
    worktree: &str,
    branch: &str,
    log_file: &str,
) -> Result<()> {
    TaskStateMachine::transition(
        pool,
        task_id,
        TaskStatus::Queued,
        TaskStatus::Dispatched,
        TransitionContext {
            worktree: Some(worktree),
            branch: Some(branch),
            log_file: Some(log_file),
            ..Default::default()
        },
    )
    .await
}

/// Record a spawned worker session: `dispatched -> running`.
pub async fn start_task(pool: &SqlitePool, task_id: &str, session: &str) -> Result<()> {
    TaskStateMachine::transition(
        pool,
        task_id,
        TaskStatus::Dispatched,
        TaskStatus::Running,
        TransitionContext {
            session: Some(session),
            ..Default::default()
        },
    )
    .await
}

/// Begin evaluating a worker's output: `running -> evaluating`.
pub async fn begin_evaluation(pool: &SqlitePool, task_id: &str) -> Result<()> {
    TaskStateMachine::transition(
        pool,
        task_id,
        TaskStatus::Running,
        TaskStatus::Evaluating,
        TransitionContext::default(),
    )
    .await
}

/// Mark a task complete: `evaluating -> complete`.
pub async fn complete_task(pool: &SqlitePool, task_id: &str, reason: &str) -> Result<()> {
    TaskStateMachine::transition(
        pool,
        task_id,
        TaskStatus::Evaluating,
        TaskStatus::Complete,
        TransitionContext {
            reason: Some(reason),
            ..Default::default()
        },
    )
    .await
}

/// Queue a retry: `evaluating -> retrying`.
pub async fn retry_task(pool: &SqlitePool, task_id: &str, reason: &str) -> Result<()> {
    TaskStateMachine::transition(
        pool,
        task_id,
        TaskStatus::Evaluating,
        TaskStatus::Retrying,
        TransitionContext {
            reason: Some(reason),
            ..Default::default()
        },
    )
    .await
}

/// Fail a task: `evaluating -> failed`, or `queued -> failed` when the
/// Dispatcher's retry-budget gate rejects it before a worker ever runs.
pub async fn fail_task(pool: &SqlitePool, task_id: &str, from: TaskStatus, error: &str) -> Result<()> {
    TaskStateMachine::transition(
        pool,
        task_id,
        from,
        TaskStatus::Failed,
        TransitionContext {
            error: Some(error),
            ..Default::default()
        },
    )
    .await
}

/// Block a task pending operator attention: `evaluating -> blocked`, or
/// `queued -> blocked` when the Dispatcher's health gate finds the
/// provider key invalid before a worker ever runs.
pub async fn block_task(pool: &SqlitePool, task_id: &str, from: TaskStatus, reason: &str) -> Result<()> {
    TaskStateMachine::transition(
        pool,
        task_id,
        from,
        TaskStatus::Blocked,
        TransitionContext {
            reason: Some(reason),
            ..Default::default()
        },
    )
    .await
}

/// Re-queue a retrying task for dispatch: `retrying -> queued`.
pub async fn requeue_task(pool: &SqlitePool, task_id: &str) -> Result<()> {
    TaskStateMachine::transition(
        pool,
        task_id,
        TaskStatus::Retrying,
        TaskStatus::Queued,
        TransitionContext::default(),
    )
    .await
}

/// Operator recovery: resume a failed or blocked task. Delegates to
/// [`TaskStateMachine::retry_transition`] for the retry-budget check and
/// counter increment.
pub async fn resume_task(pool: &SqlitePool, task_id: &str) -> Result<()> {
    TaskStateMachine::retry_transition(pool, task_id).await
}

/// Cancel a task from any non-terminal state (or from `complete`, where a
/// PR is still outstanding).
pub async fn cancel_task(pool: &SqlitePool, task_id: &str, from: TaskStatus, reason: &str) -> Result<()> {
    TaskStateMachine::transition(
        pool,
        task_id,
        from,
        TaskStatus::Cancelled,
        TransitionContext {
            reason: Some(reason),
            ..Default::default()
        },
    )
    .await
}

// ---------------------------------------------------------------------------
// PR lifecycle transitions (spec §4.8): complete -> pr_review -> review_triage
// -> {merging, blocked, review_waiting} -> merging -> {merged, blocked} ->
// merged -> deploying -> {deployed, blocked} -> deployed -> verifying ->
// {verified, verify_failed}.
// ---------------------------------------------------------------------------

/// Hand a completed, PR-bearing task to the PR lifecycle: `complete -> pr_review`.
pub async fn enter_pr_review(pool: &SqlitePool, task_id: &str, pr_url: &str) -> Result<()> {
    TaskStateMachine::transition(
        pool,
        task_id,
        TaskStatus::Complete,
        TaskStatus::PrReview,
        TransitionContext { pr_url: Some(pr_url), ..Default::default() },
    )
    .await
}

/// Gather/decide complete, ready to execute: `pr_review -> review_triage`.
pub async fn begin_review_triage(pool: &SqlitePool, task_id: &str, reason: &str) -> Result<()> {
    TaskStateMachine::transition(
        pool,
        task_id,
        TaskStatus::PrReview,
        TaskStatus::ReviewTriage,
        TransitionContext { reason: Some(reason), ..Default::default() },
    )
    .await
}

/// Begin merging: `review_triage -> merging`, or `review_waiting -> merging`
/// once the merge gate (GitHub review decision `APPROVED`) is satisfied.
pub async fn begin_merging(pool: &SqlitePool, task_id: &str, from: TaskStatus) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, from, TaskStatus::Merging, TransitionContext::default()).await
}

/// Park a task pending an approving review: `review_triage -> review_waiting`.
pub async fn park_review_waiting(pool: &SqlitePool, task_id: &str, reason: &str) -> Result<()> {
    TaskStateMachine::transition(
        pool,
        task_id,
        TaskStatus::ReviewTriage,
        TaskStatus::ReviewWaiting,
        TransitionContext { reason: Some(reason), ..Default::default() },
    )
    .await
}

/// Record a successful merge: `merging -> merged`.
pub async fn mark_merged(pool: &SqlitePool, task_id: &str) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::Merging, TaskStatus::Merged, TransitionContext::default())
        .await
}

/// Start the post-merge deploy: `merged -> deploying`.
pub async fn begin_deploying(pool: &SqlitePool, task_id: &str) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::Merged, TaskStatus::Deploying, TransitionContext::default())
        .await
}

/// Record a successful deploy: `deploying -> deployed`.
pub async fn mark_deployed(pool: &SqlitePool, task_id: &str) -> Result<()> {
    TaskStateMachine::transition(
        pool,
        task_id,
        TaskStatus::Deploying,
        TaskStatus::Deployed,
        TransitionContext::default(),
    )
    .await
}

/// Start post-deploy verification: `deployed -> verifying`.
pub async fn begin_verifying(pool: &SqlitePool, task_id: &str) -> Result<()> {
    TaskStateMachine::transition(
        pool,
        task_id,
        TaskStatus::Deployed,
        TaskStatus::Verifying,
        TransitionContext::default(),
    )
    .await
}

/// Record a passed verification: `verifying -> verified`.
pub async fn mark_verified(pool: &SqlitePool, task_id: &str) -> Result<()> {
    TaskStateMachine::transition(
        pool,
        task_id,
        TaskStatus::Verifying,
        TaskStatus::Verified,
        TransitionContext::default(),
    )
    .await
}

/// Record a failed verification: `verifying -> verify_failed`.
pub async fn mark_verify_failed(pool: &SqlitePool, task_id: &str, reason: &str) -> Result<()> {
    TaskStateMachine::transition(
        pool,
        task_id,
        TaskStatus::Verifying,
        TaskStatus::VerifyFailed,
        TransitionContext { reason: Some(reason), ..Default::default() },
    )
    .await
}

/// Block a PR-bearing task pending operator attention, from any PR-lifecycle
/// state the matrix allows (`review_triage`, `merging`, `deploying`).
pub async fn block_pr_task(pool: &SqlitePool, task_id: &str, from: TaskStatus, reason: &str) -> Result<()> {
    TaskStateMachine::transition(
        pool,
        task_id,
        from,
        TaskStatus::Blocked,
        TransitionContext { reason: Some(reason), ..Default::default() },
    )
    .await
}
