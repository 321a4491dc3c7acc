//! `foreman tasks show`/`foreman tasks cancel`: operator inspection and
//! cancellation of a single task.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use foreman_core::state::dispatch::cancel_task;
use foreman_db::queries::tasks as task_db;

pub async fn run_show(pool: &SqlitePool, task_id: &str) -> Result<()> {
    let task = task_db::get_task(pool, task_id)
        .await?
        .with_context(|| format!("task {task_id} not found"))?;

    println!("Task:          {}", task.id);
    println!("Description:   {}", task.description);
    println!("Repo:          {}", task.repo_path);
    println!("Status:        {}", task.status);
    println!("Model:         {}", task.model.as_deref().unwrap_or("(unassigned)"));
    println!("Retries:       {}/{}", task.retries, task.max_retries);
    println!("Escalation:    {}/{}", task.escalation_depth, task.max_escalation);
    if let Some(branch) = &task.branch {
        println!("Branch:        {branch}");
    }
    if let Some(pr_url) = &task.pr_url {
        println!("PR:            {pr_url}");
    }
    if let Some(worktree) = &task.worktree {
        println!("Worktree:      {worktree}");
    }
    if let Some(claim_owner) = &task.claim_owner {
        println!("Claimed by:    {claim_owner}");
    }
    if let Some(error) = &task.error {
        println!("Error:         {error}");
    }
    println!("Created:       {}", task.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("Updated:       {}", task.updated_at.format("%Y-%m-%d %H:%M:%S UTC"));

    Ok(())
}

pub async fn run_cancel(pool: &SqlitePool, task_id: &str, reason: &str) -> Result<()> {
    let task = task_db::get_task(pool, task_id)
        .await?
        .with_context(|| format!("task {task_id} not found"))?;

    if task.status.is_terminal() && task.status != foreman_db::models::TaskStatus::Complete {
        anyhow::bail!("task {task_id} is already terminal ({})", task.status);
    }

    cancel_task(pool, task_id, task.status, reason).await?;
    println!("Task {task_id} cancelled.");
    Ok(())
}
