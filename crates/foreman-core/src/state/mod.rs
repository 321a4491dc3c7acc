//! Task state machine transitions.
//!
//! Validates and executes state transitions for tasks, enforcing the
//! allowed transition graph, optimistic locking, timestamp management,
//! retry budgets, and the append-only state log.

pub mod dispatch;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;

use foreman_db::models::TaskStatus;
use foreman_db::queries::{state_log, tasks as db};

/// Auxiliary fields a transition may set alongside the status change.
/// Every field is optional; `None` leaves the existing column untouched
/// (see the `COALESCE` pattern in `foreman_db::queries::tasks::transition_task_status`).
#[derive(Debug, Clone, Default)]
pub struct TransitionContext<'a> {
    pub reason: Option<&'a str>,
    pub error: Option<&'a str>,
    pub pr_url: Option<&'a str>,
    pub worktree: Option<&'a str>,
    pub branch: Option<&'a str>,
    pub log_file: Option<&'a str>,
    pub session: Option<&'a str>,
}

/// The task state machine.
///
/// Enforces the transition graph named in the spec:
///
/// ```text
/// queued      -> dispatched
/// queued      -> failed    (Dispatcher retry-budget gate rejection)
/// queued      -> blocked   (Dispatcher provider-key-blocked rejection)
/// dispatched  -> running
/// running     -> evaluating
/// evaluating  -> complete | retrying | blocked | failed
/// retrying    -> queued
/// complete    -> pr_review
/// pr_review   -> review_triage
/// review_triage -> merging | blocked | review_waiting
/// review_waiting -> merging
/// merging     -> merged | blocked
/// merged      -> deploying
/// deploying   -> deployed | blocked
/// deployed    -> verifying
/// verifying   -> verified | verify_failed
/// failed      -> queued   (operator recovery)
/// blocked     -> queued   (operator recovery)
/// *           -> cancelled (any non-terminal state, operator override)
/// ```
pub struct TaskStateMachine;

impl TaskStateMachine {
    /// Check whether a transition from `from` to `to` is a valid edge in
    /// the state graph.
    pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
        use TaskStatus::*;

        if to == Cancelled {
            return !from.is_terminal() || from == Complete;
        }

        matches!(
            (from, to),
            (Queued, Dispatched)
                | (Queued, Failed)
                | (Queued, Blocked)
                | (Dispatched, Running)
                | (Running, Evaluating)
                | (Evaluating, Complete)
                | (Evaluating, Retrying)
                | (Evaluating, Blocked)
                | (Evaluating, Failed)
                | (Retrying, Queued)
                | (Complete, PrReview)
                | (PrReview, ReviewTriage)
                | (ReviewTriage, Merging)
                | (ReviewTriage, Blocked)
                | (ReviewTriage, ReviewWaiting)
                | (ReviewWaiting, Merging)
                | (Merging, Merged)
                | (Merging, Blocked)
                | (Merged, Deploying)
                | (Deploying, Deployed)
                | (Deploying, Blocked)
                | (Deployed, Verifying)
                | (Verifying, Verified)
                | (Verifying, VerifyFailed)
                | (Failed, Queued)
                | (Blocked, Queued)
        )
    }

    /// Execute a state transition with optimistic locking, appending a
    /// `state_log` row on success.
    ///
    /// - Sets `started_at` on `dispatched -> running`.
    /// - Sets `completed_at` on transitions into a terminal state.
    /// - For `retrying -> queued` and `failed|blocked -> queued`, the
    ///   caller is expected to have already updated the retry/escalation
    ///   counters via `foreman_db::queries::tasks::increment_retry` or
    ///   `escalate_model` -- this method only moves the status.
    pub async fn transition(
        pool: &SqlitePool,
        task_id: &str,
        from: TaskStatus,
        to: TaskStatus,
        ctx: TransitionContext<'_>,
    ) -> Result<()> {
        if !Self::is_valid_transition(from, to) {
            bail!("invalid state transition: {from} -> {to} for task {task_id}");
        }

        let started_at = (from == TaskStatus::Dispatched && to == TaskStatus::Running)
            .then(Utc::now);
        let completed_at = to.is_terminal().then(Utc::now);

        let rows = db::transition_task_status(
            pool,
            task_id,
            from,
            to,
            ctx.error,
            ctx.pr_url,
            ctx.worktree,
            ctx.branch,
            ctx.log_file,
            ctx.session,
            started_at,
            completed_at,
        )
        .await
        .with_context(|| format!("failed to transition task {task_id} from {from} to {to}"))?;

        if rows == 0 {
            let task = db::get_task(pool, task_id).await?;
            return match task {
                None => bail!("task {task_id} not found"),
                Some(t) => bail!(
                    "optimistic lock failed: task {task_id} has status {}, expected {from}",
                    t.status
                ),
            };
        }

        state_log::append(pool, task_id, Some(&from.to_string()), &to.to_string(), ctx.reason)
            .await
            .context("failed to append state log entry")?;

        Ok(())
    }

    /// Handle the `failed|blocked -> queued` retry transition: validates
    /// the retry budget, increments the retry counter, and appends the
    /// state log row.
    pub async fn retry_transition(pool: &SqlitePool, task_id: &str) -> Result<()> {
        let task = db::get_task(pool, task_id)
            .await?
            .with_context(|| format!("task {task_id} not found"))?;

        if !matches!(task.status, TaskStatus::Failed | TaskStatus::Blocked) {
            bail!(
                "cannot retry task {task_id}: current status is {}, expected failed or blocked",
                task.status
            );
        }

        if task.retries >= task.max_retries {
            bail!(
                "cannot retry task {task_id}: retries {} >= max_retries {}",
                task.retries,
                task.max_retries
            );
        }

        let from = task.status;
        let rows = db::increment_retry(pool, task_id, task.retries).await?;
        if rows == 0 {
            bail!(
                "optimistic lock failed on retry for task {task_id} (retries {})",
                task.retries
            );
        }

        state_log::append(pool, task_id, Some(&from.to_string()), "queued", Some("retry"))
            .await
            .context("failed to append state log entry")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_db::pool;
    use foreman_db::queries::tasks::{insert_task, NewTask};

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

    #[test]
    fn valid_transitions_match_spec_graph() {
        use TaskStatus::*;
        assert!(TaskStateMachine::is_valid_transition(Queued, Dispatched));
        assert!(TaskStateMachine::is_valid_transition(Evaluating, Retrying));
        assert!(TaskStateMachine::is_valid_transition(ReviewTriage, ReviewWaiting));
        assert!(TaskStateMachine::is_valid_transition(ReviewWaiting, Merging));
        assert!(TaskStateMachine::is_valid_transition(Verifying, VerifyFailed));
        assert!(!TaskStateMachine::is_valid_transition(Queued, Merging));
        assert!(!TaskStateMachine::is_valid_transition(Verified, Queued));
    }

    #[test]
    fn cancellation_allowed_from_any_non_terminal_state() {
        use TaskStatus::*;
        assert!(TaskStateMachine::is_valid_transition(Running, Cancelled));
        assert!(TaskStateMachine::is_valid_transition(PrReview, Cancelled));
        assert!(!TaskStateMachine::is_valid_transition(Verified, Cancelled));
        assert!(!TaskStateMachine::is_valid_transition(Failed, Cancelled));
    }

    #[tokio::test]
    async fn transition_appends_state_log_and_sets_timestamps() {
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
        .unwrap();

        TaskStateMachine::transition(
            &pool,
            "t1",
            TaskStatus::Queued,
            TaskStatus::Dispatched,
            TransitionContext {
                worktree: Some("/tmp/wt"),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        TaskStateMachine::transition(
            &pool,
            "t1",
            TaskStatus::Dispatched,
            TaskStatus::Running,
            TransitionContext {
                session: Some("12345"),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let task = db::get_task(&pool, "t1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert!(task.started_at.is_some());

        let log = state_log::list_for_task(&pool, "t1").await.unwrap();
        assert_eq!(log.len(), 2);
    }

    #[tokio::test]
    async fn retry_transition_rejects_exhausted_budget() {
        let pool = test_pool().await;
        insert_task(
            &pool,
            &NewTask {
                id: "t1",
                repo_path: "/repo",
                description: "x",
                max_retries: 0,
                max_escalation: 2,
                model: None,
                diagnostic_of: None,
                parent_issue_url: None,
            },
        )
        .await
        .unwrap();

        TaskStateMachine::transition(
            &pool,
            "t1",
            TaskStatus::Queued,
            TaskStatus::Dispatched,
            TransitionContext::default(),
        )
        .await
        .unwrap();
        TaskStateMachine::transition(
            &pool,
            "t1",
            TaskStatus::Dispatched,
            TaskStatus::Running,
            TransitionContext::default(),
        )
        .await
        .unwrap();
        TaskStateMachine::transition(
            &pool,
            "t1",
            TaskStatus::Running,
            TaskStatus::Evaluating,
            TransitionContext::default(),
        )
        .await
        .unwrap();
        TaskStateMachine::transition(
            &pool,
            "t1",
            TaskStatus::Evaluating,
            TaskStatus::Failed,
            TransitionContext::default(),
        )
        .await
        .unwrap();

        let err = TaskStateMachine::retry_transition(&pool, "t1")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("max_retries"));
    }
}
