//! Dispatcher (spec §4.5): the ten-step preflight for spawning a
//! worker.
//!
//! Grounded on `orchestrator::run_orchestrator`'s semaphore-gated spawn
//! loop (the concurrency gate) and `lifecycle::run_agent_lifecycle`'s
//! ordered assign -> spawn -> start sequence, generalized with the
//! additional claim / prior-completion / verify-mode / health /
//! repo-shape steps spec.md adds. `DispatchOutcome` is a tagged-variant
//! result replacing the source's magic exit codes; mapping variants to
//! process exit codes (0/2/3/75/1) happens only at the `foreman-cli`
//! boundary (Design Notes §9).

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;

use foreman_db::models::{Task, TaskStatus};
use foreman_db::queries::tasks as db;

use crate::router::{self, HealthStatus, Tier, TierResolutionInput};
use crate::state::dispatch as state_dispatch;
use crate::supervisor::{ProcessSupervisor, WorkerCommand};
use crate::vcs::VcsHost;
use crate::worker::WorkerInvocation;

/// The outcome of a single dispatch attempt for one task, replacing the
/// source system's magic exit codes with a tagged variant the caller
/// (`foreman-cli`'s pulse command) maps to an exit code only at the
/// process boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Step 10 completed: the worker is running.
    Spawned { session_pid: u32 },
    /// Step 4: running-count is already at the effective concurrency cap.
    ConcurrencyLimit,
    /// Step 1: claimed by another orchestrator instance and the claim
    /// isn't stale yet.
    ClaimConflict,
    /// Step 2: merged evidence already exists; task was cancelled.
    AlreadyComplete,
    /// Step 5: retry budget exhausted; task was transitioned to failed.
    RetriesExhausted,
    /// Step 6: health probe says the provider is down (transient; defer).
    ProviderUnavailable,
    /// Step 6: health probe says the key is invalid or credits are
    /// exhausted (terminal; human action required).
    ProviderKeyBlocked,
    /// Step 6: provider is rate-limiting; defer without consuming retry.
    RateLimited,
    /// Step 8: worktree creation failed.
    WorktreeCreationFailed(String),
    /// The resolved tier was the `CONTEST` sentinel; handed to the
    /// out-of-core contest subsystem instead of being spawned here.
    DeferredToContest,
}

/// Everything the Dispatcher needs about the surrounding world to run
/// the preflight for one task. Constructed once per pulse and reused
/// across tasks.
pub struct DispatchContext<'a> {
    pub pool: &'a SqlitePool,
    pub vcs: &'a dyn VcsHost,
    pub supervisor: &'a ProcessSupervisor,
    pub health: &'a router::HealthChecker,
    pub repo_path: &'a Path,
    pub base_branch: &'a str,
    pub worker_binary: &'a str,
    pub api_base: &'a str,
    pub api_key: &'a str,
    /// The effective concurrency cap for this task's batch (spec's
    /// "adaptive effective concurrency": base scaled by load, capped by
    /// batch/global max -- computed by the caller since it depends on
    /// batch configuration and live system load this module doesn't
    /// own).
    pub effective_concurrency: i64,
    /// Claims older than this are eligible for auto-unclaim (spec: "2
    /// hours").
    pub stale_claim_age: Duration,
}

fn tier_to_model(tier: Tier) -> &'static str {
    match tier {
        Tier::Haiku => "haiku",
        Tier::Sonnet => "sonnet",
        Tier::Opus => "opus",
        Tier::Contest => "CONTEST",
    }
}

/// Run the ten-step preflight and, on success, spawn the worker.
pub async fn dispatch_task(ctx: &DispatchContext<'_>, task: &Task, tags: &[String]) -> Result<DispatchOutcome> {
    // 1. Claim.
    if let Some(claim_at) = task.claim_at {
        let age = Utc::now().signed_duration_since(claim_at);
        let stale = age.to_std().map(|d| d > ctx.stale_claim_age).unwrap_or(false);
        if !stale {
            return Ok(DispatchOutcome::ClaimConflict);
        }
        db::set_claim(ctx.pool, &task.id, None, None).await.context("auto-unclaim failed")?;
    }

    // 2. Prior-completion guard.
    if let Some(pr_url) = ctx
        .vcs
        .merged_evidence_for(ctx.repo_path, &task.id)
        .await
        .context("prior-completion scan failed")?
    {
        state_dispatch::cancel_task(
            ctx.pool,
            &task.id,
            task.status,
            &format!("prior-completion guard: already merged as {pr_url}"),
        )
        .await?;
        return Ok(DispatchOutcome::AlreadyComplete);
    }

    // 3. Verify-mode detection: a prior failure/dead worker, and the
    // prior error doesn't already say "no prior work found" (which
    // would mean a verify dispatch already ran and concluded nothing
    // needs verifying -- redispatching verify mode again would loop).
    let verify_mode = task.retries > 0
        && !task
            .error
            .as_deref()
            .map(|e| e.contains("VERIFY_NOT_STARTED"))
            .unwrap_or(false);

    // 4. Concurrency gate.
    let active = db::count_active_for_repo(ctx.pool, &task.repo_path)
        .await
        .context("failed to count active tasks")?;
    if active >= ctx.effective_concurrency {
        return Ok(DispatchOutcome::ConcurrencyLimit);
    }

    // 5. Retry-budget gate.
    if task.retries >= task.max_retries {
        state_dispatch::fail_task(ctx.pool, &task.id, TaskStatus::Queued, "retry budget exhausted").await?;
        return Ok(DispatchOutcome::RetriesExhausted);
    }

    // Resolve tier (verify-mode prefers a cheaper tier) and model health.
    let requested_tier = task.model.as_deref().and_then(parse_tier);
    let mut tier = router::resolve_tier(&TierResolutionInput {
        explicit_override: requested_tier,
        description: &task.description,
        tags,
        ..Default::default()
    });
    if verify_mode {
        tier = cheaper_tier(tier);
    }

    if tier == Tier::Contest {
        return Ok(DispatchOutcome::DeferredToContest);
    }

    let model = tier_to_model(tier);

    // 6. Health gate.
    match ctx.health.check(model, ctx.api_base, ctx.api_key).await {
        HealthStatus::Healthy => {}
        HealthStatus::RateLimited => return Ok(DispatchOutcome::RateLimited),
        HealthStatus::Unavailable => return Ok(DispatchOutcome::ProviderUnavailable),
        HealthStatus::KeyInvalidOrCreditsExhausted => {
            state_dispatch::block_task(
                ctx.pool,
                &task.id,
                TaskStatus::Queued,
                "provider key invalid or credits exhausted",
            )
            .await?;
            return Ok(DispatchOutcome::ProviderKeyBlocked);
        }
    }

    // 7. Repo-shape preflight: SSH->HTTPS rewrite happens lazily inside
    // `VcsHost::push_branch`; here we only need a worktree, which
    // doesn't touch the remote, so there's nothing further to check
    // before step 8.

    // 8. Worktree acquisition.
    let branch = format!("foreman/{}", task.id);
    let worktree_path = match ctx.vcs.create_worktree(&branch) {
        Ok(path) => path,
        Err(e) => return Ok(DispatchOutcome::WorktreeCreationFailed(e.to_string())),
    };
    if !worktree_path.is_dir() {
        return Ok(DispatchOutcome::WorktreeCreationFailed(format!(
            "worktree path {worktree_path:?} is not a directory"
        )));
    }

    // 9. Log and transition to dispatched.
    let timestamp = Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
    let log_path = ctx.supervisor.log_path(&task.id, &timestamp);
    state_dispatch::dispatch_task(
        ctx.pool,
        &task.id,
        &worktree_path.to_string_lossy(),
        &branch,
        &log_path.to_string_lossy(),
    )
    .await
    .context("failed to transition to dispatched")?;

    // 10. Spawn.
    let invocation = WorkerInvocation {
        task_id: task.id.clone(),
        description: task.description.clone(),
        model: model.to_string(),
        working_dir: worktree_path.clone(),
        verify_mode,
        env_vars: Default::default(),
    };
    let isolated_config_dir = worktree_path.join(".foreman-config");
    let cmd = WorkerCommand {
        task_id: task.id.clone(),
        program: ctx.worker_binary.to_string(),
        args: vec![invocation.prompt()],
        working_dir: worktree_path,
        env: invocation.env(&isolated_config_dir).into_iter().collect(),
    };

    let session = ctx.supervisor.spawn(&cmd).context("spawn failed")?;

    state_dispatch::start_task(ctx.pool, &task.id, &session.pid.to_string())
        .await
        .context("failed to transition to running")?;

    Ok(DispatchOutcome::Spawned { session_pid: session.pid })
}

fn parse_tier(s: &str) -> Option<Tier> {
    match s {
        "haiku" | "flash" => Some(Tier::Haiku),
        "sonnet" | "pro" => Some(Tier::Sonnet),
        "opus" => Some(Tier::Opus),
        "CONTEST" => Some(Tier::Contest),
        _ => None,
    }
}

fn cheaper_tier(tier: Tier) -> Tier {
    match tier {
        Tier::Opus => Tier::Sonnet,
        Tier::Sonnet | Tier::Haiku | Tier::Contest => Tier::Haiku,
    }
}
