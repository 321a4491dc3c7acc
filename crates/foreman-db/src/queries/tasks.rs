//! Database query functions for the `tasks` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::models::{Task, TaskStatus};

/// Fields required to seed a new task. Every other column starts at its
/// schema default (zero counters, `queued` status, timestamps now).
pub struct NewTask<'a> {
    pub id: &'a str,
    pub repo_path: &'a str,
    pub description: &'a str,
    pub max_retries: i32,
    pub max_escalation: i32,
    pub model: Option<&'a str>,
    pub diagnostic_of: Option<&'a str>,
    pub parent_issue_url: Option<&'a str>,
}

/// Insert a new task row in `queued` status.
pub async fn insert_task(pool: &SqlitePool, new: &NewTask<'_>) -> Result<Task> {
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO tasks (id, repo_path, description, status, model, max_retries, \
         max_escalation, diagnostic_of, parent_issue_url, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(new.id)
    .bind(new.repo_path)
    .bind(new.description)
    .bind(TaskStatus::Queued)
    .bind(new.model)
    .bind(new.max_retries)
    .bind(new.max_escalation)
    .bind(new.diagnostic_of)
    .bind(new.parent_issue_url)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await
    .context("failed to insert task")?;

    get_task(pool, new.id)
        .await?
        .context("inserted task vanished before it could be read back")
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &SqlitePool, id: &str) -> Result<Option<Task>> {
    sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")
}

/// List all tasks for a repository, most recently created first.
pub async fn list_tasks_for_repo(pool: &SqlitePool, repo_path: &str) -> Result<Vec<Task>> {
    sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE repo_path = ? ORDER BY created_at DESC")
        .bind(repo_path)
        .fetch_all(pool)
        .await
        .context("failed to list tasks for repo")
}

/// List every task currently in one of the given statuses.
pub async fn list_tasks_by_status(pool: &SqlitePool, statuses: &[TaskStatus]) -> Result<Vec<Task>> {
    let mut tasks = Vec::new();
    for status in statuses {
        let mut rows = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE status = ?")
            .bind(*status)
            .fetch_all(pool)
            .await
            .context("failed to list tasks by status")?;
        tasks.append(&mut rows);
    }
    Ok(tasks)
}

/// Tasks eligible for dispatch this pulse: `queued`, ordered oldest first.
/// Deliberately does not cap by concurrency -- the Dispatcher is the sole
/// enforcer of the concurrency budget (see `dispatch` module), avoiding a
/// TOCTOU window between selection and spawn.
pub async fn get_dispatch_candidates(pool: &SqlitePool) -> Result<Vec<Task>> {
    sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE status = ? ORDER BY created_at ASC",
    )
    .bind(TaskStatus::Queued)
    .fetch_all(pool)
    .await
    .context("failed to get dispatch candidates")
}

/// Count tasks currently occupying a concurrency slot (dispatched or
/// running) for a repository.
pub async fn count_active_for_repo(pool: &SqlitePool, repo_path: &str) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM tasks \
         WHERE repo_path = ? AND status IN ('dispatched', 'running')",
    )
    .bind(repo_path)
    .fetch_one(pool)
    .await
    .context("failed to count active tasks")?;
    Ok(count)
}

/// Atomically transition a task's status, with optimistic locking on the
/// current status, auxiliary field updates, and the state-log append done
/// by the caller (`state::machine::transition`) in the same logical
/// operation.
#[allow(clippy::too_many_arguments)]
pub async fn transition_task_status(
    pool: &SqlitePool,
    task_id: &str,
    from: TaskStatus,
    to: TaskStatus,
    error: Option<&str>,
    pr_url: Option<&str>,
    worktree: Option<&str>,
    branch: Option<&str>,
    log_file: Option<&str>,
    session: Option<&str>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
) -> Result<u64> {
    let now = Utc::now();
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = ?, \
             error = COALESCE(?, error), \
             pr_url = COALESCE(?, pr_url), \
             worktree = COALESCE(?, worktree), \
             branch = COALESCE(?, branch), \
             log_file = COALESCE(?, log_file), \
             session = COALESCE(?, session), \
             started_at = COALESCE(?, started_at), \
             completed_at = COALESCE(?, completed_at), \
             updated_at = ? \
         WHERE id = ? AND status = ?",
    )
    .bind(to)
    .bind(error)
    .bind(pr_url)
    .bind(worktree)
    .bind(branch)
    .bind(log_file)
    .bind(session)
    .bind(started_at)
    .bind(completed_at)
    .bind(now)
    .bind(task_id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition task status")?;

    Ok(result.rows_affected())
}

/// Increment the retry counter and reset to `queued`, with optimistic
/// locking on the current retry count.
pub async fn increment_retry(pool: &SqlitePool, task_id: &str, current_retries: i32) -> Result<u64> {
    let now = Utc::now();
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = ?, retries = retries + 1, updated_at = ? \
         WHERE id = ? AND retries = ?",
    )
    .bind(TaskStatus::Queued)
    .bind(now)
    .bind(task_id)
    .bind(current_retries)
    .execute(pool)
    .await
    .context("failed to increment retry counter")?;

    Ok(result.rows_affected())
}

/// Increment the escalation depth and switch to a new model tier,
/// re-queuing the task. Optimistic locking on current escalation depth.
pub async fn escalate_model(
    pool: &SqlitePool,
    task_id: &str,
    current_depth: i32,
    new_model: &str,
) -> Result<u64> {
    let now = Utc::now();
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = ?, escalation_depth = escalation_depth + 1, model = ?, updated_at = ? \
         WHERE id = ? AND escalation_depth = ?",
    )
    .bind(TaskStatus::Queued)
    .bind(new_model)
    .bind(now)
    .bind(task_id)
    .bind(current_depth)
    .execute(pool)
    .await
    .context("failed to escalate task model tier")?;

    Ok(result.rows_affected())
}

/// List every other task sharing a dotted-ID parent with `task_id` (e.g.
/// `t46.2` is a sibling of `t46.1`, both children of `t46`), excluding
/// `task_id` itself. Used by the PR lifecycle's post-merge sibling rebase
/// and serial-merge guarantee. A task with no `.` in its ID has no
/// siblings by this convention.
pub async fn list_siblings(pool: &SqlitePool, task_id: &str) -> Result<Vec<Task>> {
    let Some(parent) = task_id.split('.').next().filter(|_| task_id.contains('.')) else {
        return Ok(Vec::new());
    };
    let prefix = format!("{parent}.%");
    sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE (id LIKE ? OR id = ?) AND id != ? ORDER BY id ASC",
    )
    .bind(&prefix)
    .bind(parent)
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list sibling tasks")
}

/// Increment the rebase-attempt counter (post-merge sibling rebase,
/// spec §4.8). Not status-gated: this counter is advisory bookkeeping,
/// not a state-machine edge.
pub async fn increment_rebase_attempts(pool: &SqlitePool, task_id: &str) -> Result<()> {
    sqlx::query("UPDATE tasks SET rebase_attempts = rebase_attempts + 1, updated_at = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(task_id)
        .execute(pool)
        .await
        .context("failed to increment rebase attempts")?;
    Ok(())
}

/// Increment the deploy-recovery-attempt counter.
pub async fn increment_deploy_recovery_attempts(pool: &SqlitePool, task_id: &str) -> Result<()> {
    sqlx::query("UPDATE tasks SET deploy_recovery_attempts = deploy_recovery_attempts + 1, updated_at = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(task_id)
        .execute(pool)
        .await
        .context("failed to increment deploy recovery attempts")?;
    Ok(())
}

/// Record (or clear) the external claim annotation mirrored from the task
/// file.
pub async fn set_claim(
    pool: &SqlitePool,
    task_id: &str,
    owner: Option<&str>,
    claimed_at: Option<DateTime<Utc>>,
) -> Result<()> {
    sqlx::query("UPDATE tasks SET claim_owner = ?, claim_at = ?, updated_at = ? WHERE id = ?")
        .bind(owner)
        .bind(claimed_at)
        .bind(Utc::now())
        .bind(task_id)
        .execute(pool)
        .await
        .context("failed to set task claim")?;
    Ok(())
}

/// Reset tasks stuck in an in-flight state (dispatched, running,
/// evaluating) back to `failed` so the next pulse's RetryController can
/// decide whether to retry or escalate. Used for restart recovery after an
/// unclean process exit.
pub async fn reset_orphaned_tasks(pool: &SqlitePool) -> Result<Vec<Task>> {
    let now = Utc::now();
    sqlx::query(
        "UPDATE tasks \
         SET status = 'failed', error = 'orphaned: no active session after restart', \
             completed_at = ?, updated_at = ? \
         WHERE status IN ('dispatched', 'running', 'evaluating')",
    )
    .bind(now)
    .bind(now)
    .execute(pool)
    .await
    .context("failed to reset orphaned tasks")?;

    list_tasks_by_status(pool, &[TaskStatus::Failed]).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool;

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
    async fn insert_and_fetch_round_trip() {
        let pool = test_pool().await;
        let new = NewTask {
            id: "t1",
            repo_path: "/repo",
            description: "add retries",
            max_retries: 3,
            max_escalation: 2,
            model: None,
            diagnostic_of: None,
            parent_issue_url: None,
        };
        let task = insert_task(&pool, &new).await.expect("insert");
        assert_eq!(task.status, TaskStatus::Queued);

        let fetched = get_task(&pool, "t1").await.expect("fetch").expect("exists");
        assert_eq!(fetched.id, "t1");
    }

    #[tokio::test]
    async fn transition_rejects_stale_from_state() {
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
        .expect("insert");

        let rows = transition_task_status(
            &pool,
            "t1",
            TaskStatus::Running,
            TaskStatus::Evaluating,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
        )
        .await
        .expect("query ok");
        assert_eq!(rows, 0, "task is queued, not running -- lock should fail");

        let rows = transition_task_status(
            &pool,
            "t1",
            TaskStatus::Queued,
            TaskStatus::Dispatched,
            None,
            None,
            Some("/tmp/wt"),
            Some("foreman/t1"),
            Some("/tmp/log"),
            None,
            None,
            None,
        )
        .await
        .expect("query ok");
        assert_eq!(rows, 1);

        let task = get_task(&pool, "t1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Dispatched);
        assert_eq!(task.worktree.as_deref(), Some("/tmp/wt"));
    }

    #[tokio::test]
    async fn reset_orphaned_marks_in_flight_failed() {
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
        .expect("insert");
        transition_task_status(
            &pool,
            "t1",
            TaskStatus::Queued,
            TaskStatus::Dispatched,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
        )
        .await
        .unwrap();
        transition_task_status(
            &pool,
            "t1",
            TaskStatus::Dispatched,
            TaskStatus::Running,
            None,
            None,
            None,
            None,
            None,
            Some("12345"),
            Some(Utc::now()),
            None,
        )
        .await
        .unwrap();

        let reset = reset_orphaned_tasks(&pool).await.expect("reset");
        assert_eq!(reset.len(), 1);
        assert_eq!(reset[0].status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn list_siblings_finds_dotted_children_only() {
        let pool = test_pool().await;
        for id in ["t46", "t46.1", "t46.2", "t47.1"] {
            insert_task(
                &pool,
                &NewTask {
                    id,
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
        }

        let siblings = list_siblings(&pool, "t46.1").await.unwrap();
        let ids: Vec<&str> = siblings.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["t46.2"]);

        assert!(list_siblings(&pool, "t46").await.unwrap().is_empty());
    }
}
