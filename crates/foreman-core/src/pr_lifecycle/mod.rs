//! PRLifecycleEngine (spec §4.8): drives a completed, PR-bearing task from
//! `complete` through `merging`, `deploying`, and `verifying` to a rest
//! state.
//!
//! New component -- no teacher analogue (the teacher's `merge_cmd` is a
//! synchronous, non-AI-advised `git`/`gh` wrapper with no PR concept at
//! all: the teacher merges local task branches directly into its base
//! branch). Grounded on `merge_cmd`'s dependency-ordered merge loop for the
//! *mechanics* of merging and on the `Advisor` trait for the decide step.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{info, warn};

use foreman_db::models::{Task, TaskStatus};
use foreman_db::queries::{proof_logs, tasks as db};

use crate::advisor::{Advisor, PrAction, PrDecision};
use crate::state::dispatch as state_dispatch;
use crate::supervisor::{ProcessSupervisor, WorkerCommand};
use crate::taskfile::verify_queue::{checks_for_changed_files, VerifyQueue};
use crate::vcs::{PrSnapshot, RebaseOutcome, ReviewDecision, VcsHost};
use crate::worker::WorkerInvocation;

/// Deploy/verify capability. spec.md leaves the concrete deploy mechanism
/// unspecified beyond "run post-flight; deploy; run verification", so this
/// is a pluggable seam mirroring the `Advisor` trait + deterministic
/// fallback shape rather than a hard-coded deploy script.
#[async_trait]
pub trait Deployer: Send + Sync {
    async fn deploy(&self, repo_path: &Path, task: &Task) -> Result<DeployOutcome>;
    async fn verify(&self, repo_path: &Path, task: &Task) -> Result<VerifyOutcome>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployOutcome {
    Deployed,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Verified,
    Failed(String),
}

/// A deployer that accepts every deploy/verify immediately, for use when no
/// deploy pipeline is configured (and by default in CI), matching
/// `DeterministicAdvisor`'s role for the decide step.
pub struct NoopDeployer;

#[async_trait]
impl Deployer for NoopDeployer {
    async fn deploy(&self, _repo_path: &Path, _task: &Task) -> Result<DeployOutcome> {
        Ok(DeployOutcome::Deployed)
    }

    async fn verify(&self, _repo_path: &Path, _task: &Task) -> Result<VerifyOutcome> {
        Ok(VerifyOutcome::Verified)
    }
}

/// Everything one pulse's worth of PR-lifecycle work needs.
pub struct PrLifecycleContext<'a> {
    pub pool: &'a SqlitePool,
    pub vcs: &'a dyn VcsHost,
    pub advisor: &'a dyn Advisor,
    pub deployer: &'a dyn Deployer,
    pub supervisor: &'a ProcessSupervisor,
    pub repo_path: &'a Path,
    pub base_branch: &'a str,
    pub worker_binary: &'a str,
    /// Post-deploy verification queue file (spec §4.9); a successful
    /// deploy appends `check:` directives derived from the PR's changed
    /// files here for a later pulse to run.
    pub verify_queue_path: &'a Path,
    /// Explicit per-process opt-in bypassing the `APPROVED`-review merge
    /// gate (spec §4.8 "Merge gate").
    pub skip_merge_review_gate: bool,
    /// Bounded work per pulse (spec §4.8 "Bounded work per pulse").
    pub max_actions_per_pulse: usize,
}

/// The structured snapshot submitted to the Advisor's decide step (spec
/// §4.8 step 1).
#[derive(Debug, Serialize)]
struct PrLifecycleSnapshot<'a> {
    task_id: &'a str,
    status: String,
    description: &'a str,
    retries: i32,
    max_retries: i32,
    pr: &'a PrSnapshot,
    worker_alive: bool,
    worktree_exists: bool,
    recent_transitions: Vec<String>,
}

/// Outcome of driving one task through this pulse's PR-lifecycle pass, for
/// the caller (`PulseDriver`) to log/aggregate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrLifecycleOutcome {
    Executed { action: PrAction },
    ParkedReviewWaiting,
    Blocked(String),
    Deferred,
    NoPr,
}

/// Report for one pulse's PR-lifecycle phase.
#[derive(Debug, Default)]
pub struct PrLifecycleReport {
    pub actions_taken: usize,
    pub deferred: usize,
}

/// Run the PR-lifecycle phase over every task in a PR-bearing state,
/// bounded by `max_actions_per_pulse` and enforcing the serial-merge
/// guarantee for siblings.
pub async fn run_pr_lifecycle(ctx: &PrLifecycleContext<'_>) -> Result<PrLifecycleReport> {
    let mut report = PrLifecycleReport::default();
    let mut merged_parents_this_pulse: HashSet<String> = HashSet::new();

    // Tasks freshly completed with a PR attached enter the lifecycle; this
    // bookkeeping step doesn't count against the action budget.
    for task in db::list_tasks_by_status(ctx.pool, &[TaskStatus::Complete]).await? {
        if let Some(pr_url) = task.pr_url.clone() {
            state_dispatch::enter_pr_review(ctx.pool, &task.id, &pr_url)
                .await
                .with_context(|| format!("failed to enter pr_review for {}", task.id))?;
        }
    }

    let mut tasks = db::list_tasks_by_status(
        ctx.pool,
        &[TaskStatus::PrReview, TaskStatus::ReviewWaiting, TaskStatus::Merging, TaskStatus::Deploying, TaskStatus::Verifying],
    )
    .await?;
    tasks.sort_by(|a, b| a.id.cmp(&b.id));

    for task in tasks {
        if report.actions_taken >= ctx.max_actions_per_pulse {
            report.deferred += 1;
            continue;
        }

        let outcome = advance_task(ctx, &task, &mut merged_parents_this_pulse).await?;
        match outcome {
            PrLifecycleOutcome::Executed { .. } => report.actions_taken += 1,
            PrLifecycleOutcome::Deferred => report.deferred += 1,
            _ => {}
        }
    }

    Ok(report)
}

/// The `tN` parent of a dotted sibling ID `tN.M`, or `None` if `id` has no
/// dot (spec §4.8 "siblings sharing a parent task ID").
fn parent_task_id(id: &str) -> Option<String> {
    id.contains('.').then(|| id.split('.').next().unwrap().to_string())
}

/// Advance one task one step through the lifecycle: gather, decide (for
/// `pr_review`/`review_waiting`), execute.
///
/// `merged_parents_this_pulse` enforces the serial-merge guarantee (spec
/// §4.8 scenario S6, "only one sibling merges per pulse"): it is threaded
/// through every path that can reach an actual merge within this single
/// call -- `pr_review`/`review_waiting` can fall all the way through to a
/// merge in one pass, not just tasks already sitting in `merging`.
async fn advance_task(
    ctx: &PrLifecycleContext<'_>,
    task: &Task,
    merged_parents_this_pulse: &mut HashSet<String>,
) -> Result<PrLifecycleOutcome> {
    match task.status {
        TaskStatus::PrReview | TaskStatus::ReviewWaiting => advance_pr_review(ctx, task, merged_parents_this_pulse).await,
        TaskStatus::Merging => advance_merging(ctx, task, merged_parents_this_pulse).await,
        TaskStatus::Deploying => advance_deploying(ctx, task).await,
        TaskStatus::Verifying => advance_verifying(ctx, task).await,
        _ => Ok(PrLifecycleOutcome::Deferred),
    }
}

fn pr_number_from_task(task: &Task) -> Option<u64> {
    let url = task.pr_url.as_deref()?;
    url.rsplit('/').next()?.parse().ok()
}

/// Gather + decide + execute for a task sitting in `pr_review` or
/// `review_waiting` (spec §4.8 steps 1-3).
async fn advance_pr_review(
    ctx: &PrLifecycleContext<'_>,
    task: &Task,
    merged_parents_this_pulse: &mut HashSet<String>,
) -> Result<PrLifecycleOutcome> {
    let Some(pr_number) = pr_number_from_task(task) else {
        warn!(task_id = %task.id, "task in pr_review has no parseable PR number");
        return Ok(PrLifecycleOutcome::NoPr);
    };

    let pr = ctx
        .vcs
        .pr_snapshot(ctx.repo_path, pr_number)
        .await
        .with_context(|| format!("failed to fetch pr snapshot for {}", task.id))?;

    if task.status == TaskStatus::PrReview {
        state_dispatch::begin_review_triage(ctx.pool, &task.id, "gathered pr snapshot").await?;
    }

    let recent_transitions = foreman_db::queries::state_log::list_for_task(ctx.pool, &task.id)
        .await?
        .into_iter()
        .rev()
        .take(5)
        .map(|e| format!("{} -> {}", e.from_state.as_deref().unwrap_or("-"), e.to_state))
        .collect();

    let worker_alive = task.session.as_deref().and_then(|s| s.parse::<u32>().ok()).is_some_and(|pid| ctx.supervisor.is_alive(pid));
    let worktree_exists = task.worktree.as_deref().map(|w| Path::new(w).is_dir()).unwrap_or(false);

    let snapshot = PrLifecycleSnapshot {
        task_id: &task.id,
        status: task.status.to_string(),
        description: &task.description,
        retries: task.retries,
        max_retries: task.max_retries,
        pr: &pr,
        worker_alive,
        worktree_exists,
        recent_transitions,
    };
    let snapshot_json = serde_json::to_string(&snapshot).context("failed to serialize pr lifecycle snapshot")?;

    let decision = ctx.advisor.decide_pr_action(&snapshot_json).await;

    proof_logs::append(
        ctx.pool,
        &proof_logs::NewProofLog {
            task_id: &task.id,
            event: "pr_lifecycle_decision",
            stage: "pr_lifecycle",
            decision: Some(decision.action.name()),
            evidence: Some(serde_json::json!({ "snapshot": snapshot_json, "reason": decision.reason })),
            decided_by: "advisor",
            pr_url: task.pr_url.as_deref(),
            duration_ms: None,
            metadata: None,
        },
    )
    .await
    .context("failed to persist pr lifecycle decision")?;

    execute_decision(ctx, task, &pr, pr_number, decision, merged_parents_this_pulse).await
}

/// Execute a decided action (spec §4.8 step 3). Simple actions are
/// synchronous git/gh calls; complex ones spawn a second AI worker.
async fn execute_decision(
    ctx: &PrLifecycleContext<'_>,
    task: &Task,
    pr: &PrSnapshot,
    pr_number: u64,
    decision: PrDecision,
    merged_parents_this_pulse: &mut HashSet<String>,
) -> Result<PrLifecycleOutcome> {
    match decision.action {
        PrAction::MergePr => {
            // Enforced here, not just for tasks already sitting in
            // `merging`: a sibling starting this pulse in `pr_review` can
            // reach a merge attempt in this very call.
            let parent = parent_task_id(&task.id);
            if let Some(p) = &parent {
                if merged_parents_this_pulse.contains(p) {
                    return Ok(PrLifecycleOutcome::Deferred);
                }
            }

            let approved = ctx.skip_merge_review_gate || pr.review_decision == Some(ReviewDecision::Approved);
            if !approved {
                if task.status == TaskStatus::ReviewWaiting {
                    // Already parked; re-transitioning would attempt
                    // `review_triage -> review_waiting` against a task
                    // that is no longer in `review_triage` and fail the
                    // optimistic lock.
                    return Ok(PrLifecycleOutcome::ParkedReviewWaiting);
                }
                state_dispatch::park_review_waiting(ctx.pool, &task.id, "awaiting approving review").await?;
                return Ok(PrLifecycleOutcome::ParkedReviewWaiting);
            }

            let from = if task.status == TaskStatus::ReviewWaiting { TaskStatus::ReviewWaiting } else { TaskStatus::ReviewTriage };
            state_dispatch::begin_merging(ctx.pool, &task.id, from).await?;
            ctx.vcs.merge_pr(ctx.repo_path, pr_number).await.context("merge_pr failed")?;
            state_dispatch::mark_merged(ctx.pool, &task.id).await?;
            if let Some(p) = parent {
                merged_parents_this_pulse.insert(p);
            }
            Ok(PrLifecycleOutcome::Executed { action: PrAction::MergePr })
        }
        PrAction::UpdateBranch | PrAction::RebaseBranch => {
            run_rebase(ctx, task).await?;
            Ok(PrLifecycleOutcome::Executed { action: decision.action })
        }
        PrAction::PromoteDraft => {
            ctx.vcs.promote_draft(ctx.repo_path, pr_number).await.context("promote_draft failed")?;
            Ok(PrLifecycleOutcome::Executed { action: PrAction::PromoteDraft })
        }
        PrAction::ClosePr => {
            ctx.vcs.close_pr(ctx.repo_path, pr_number).await.context("close_pr failed")?;
            state_dispatch::cancel_task(ctx.pool, &task.id, task.status, &decision.reason).await?;
            Ok(PrLifecycleOutcome::Executed { action: PrAction::ClosePr })
        }
        PrAction::DismissReviews => {
            ctx.vcs.dismiss_reviews(ctx.repo_path, pr_number, &decision.reason).await.context("dismiss_reviews failed")?;
            Ok(PrLifecycleOutcome::Executed { action: PrAction::DismissReviews })
        }
        PrAction::FixCi | PrAction::ResolveConflicts | PrAction::FixAndPush => {
            spawn_fix_worker(ctx, task, decision.action, &decision.reason).await?;
            Ok(PrLifecycleOutcome::Executed { action: decision.action })
        }
        PrAction::RetryCi | PrAction::Wait => Ok(PrLifecycleOutcome::Deferred),
        PrAction::Deploy | PrAction::MarkComplete => {
            // Surfaced from the decide step before a merge has actually
            // happened; nothing to do until `merging` completes on its own.
            Ok(PrLifecycleOutcome::Deferred)
        }
        PrAction::Cancel => {
            state_dispatch::cancel_task(ctx.pool, &task.id, task.status, &decision.reason).await?;
            Ok(PrLifecycleOutcome::Executed { action: PrAction::Cancel })
        }
    }
}

/// Rebase the task's branch onto the base branch and push the result
/// (`update_branch`/`rebase_branch`, and the post-merge sibling rebase).
async fn run_rebase(ctx: &PrLifecycleContext<'_>, task: &Task) -> Result<RebaseOutcome> {
    let Some(worktree) = task.worktree.as_deref() else {
        return Ok(RebaseOutcome::Conflict { details: "no worktree recorded".to_string() });
    };
    let outcome = ctx.vcs.rebase_onto_base(Path::new(worktree), ctx.base_branch).await.context("rebase failed")?;
    db::increment_rebase_attempts(ctx.pool, &task.id).await?;
    if outcome == RebaseOutcome::Clean {
        if let Some(branch) = task.branch.as_deref() {
            ctx.vcs.force_push_branch(Path::new(worktree), branch).await.context("force push after rebase failed")?;
        }
    }
    Ok(outcome)
}

async fn advance_merging(
    ctx: &PrLifecycleContext<'_>,
    task: &Task,
    merged_parents_this_pulse: &mut HashSet<String>,
) -> Result<PrLifecycleOutcome> {
    // Reached only if a prior pulse transitioned into `merging` but the
    // process was interrupted before `merged` was recorded; re-drive the
    // merge rather than leaving the task stranded.
    let parent = parent_task_id(&task.id);
    if let Some(p) = &parent {
        if merged_parents_this_pulse.contains(p) {
            return Ok(PrLifecycleOutcome::Deferred);
        }
    }

    let Some(pr_number) = pr_number_from_task(task) else {
        state_dispatch::block_pr_task(ctx.pool, &task.id, TaskStatus::Merging, "no pr url on merging task").await?;
        return Ok(PrLifecycleOutcome::Blocked("no pr url".to_string()));
    };
    match ctx.vcs.merge_pr(ctx.repo_path, pr_number).await {
        Ok(()) => {
            state_dispatch::mark_merged(ctx.pool, &task.id).await?;
            if let Some(p) = parent {
                merged_parents_this_pulse.insert(p);
            }
            Ok(PrLifecycleOutcome::Executed { action: PrAction::MergePr })
        }
        Err(e) => {
            state_dispatch::block_pr_task(ctx.pool, &task.id, TaskStatus::Merging, &e.to_string()).await?;
            Ok(PrLifecycleOutcome::Blocked(e.to_string()))
        }
    }
}

/// Post-merge sequence (spec §4.8): pull base, rebase siblings, deploy,
/// verify, clean up worktree, update task file. `deployed`/`verifying` are
/// driven here rather than split across phases since each step is quick
/// and the whole sequence is meant to complete within one pulse absent
/// failure.
async fn advance_deploying(ctx: &PrLifecycleContext<'_>, task: &Task) -> Result<PrLifecycleOutcome> {
    ctx.vcs.fetch_base(ctx.repo_path, ctx.base_branch).await.context("post-merge base fetch failed")?;

    for sibling in db::list_siblings(ctx.pool, &task.id).await? {
        if sibling.worktree.is_none() || sibling.branch.is_none() {
            continue;
        }
        match run_rebase(ctx, &sibling).await {
            Ok(RebaseOutcome::Clean) => {
                info!(task_id = %sibling.id, "rebased sibling onto updated base");
            }
            Ok(RebaseOutcome::Conflict { details }) => {
                warn!(task_id = %sibling.id, %details, "sibling rebase conflict, leaving for operator");
            }
            Err(e) => warn!(task_id = %sibling.id, error = %e, "sibling rebase failed"),
        }
    }

    match ctx.deployer.deploy(ctx.repo_path, task).await? {
        DeployOutcome::Deployed => {
            state_dispatch::mark_deployed(ctx.pool, &task.id).await?;
            if let Err(e) = populate_verify_queue(ctx, task).await {
                warn!(task_id = %task.id, error = %e, "failed to populate post-deploy verification queue");
            }
            state_dispatch::begin_verifying(ctx.pool, &task.id).await?;
            run_verification(ctx, task).await
        }
        DeployOutcome::Failed(reason) => {
            db::increment_deploy_recovery_attempts(ctx.pool, &task.id).await?;
            state_dispatch::block_pr_task(ctx.pool, &task.id, TaskStatus::Deploying, &reason).await?;
            Ok(PrLifecycleOutcome::Blocked(reason))
        }
    }
}

/// On a successful deploy, derive `check:` directives from the PR's changed
/// files and append them to the verification queue (spec §4.9) for a later
/// pulse to run.
async fn populate_verify_queue(ctx: &PrLifecycleContext<'_>, task: &Task) -> Result<()> {
    let Some(pr_number) = pr_number_from_task(task) else {
        return Ok(());
    };
    let changed = ctx.vcs.changed_files(ctx.repo_path, pr_number).await.context("listing changed files failed")?;
    let checks = checks_for_changed_files(&changed);
    if checks.is_empty() {
        return Ok(());
    }
    let mut queue = VerifyQueue::load(ctx.verify_queue_path)?;
    queue.push(checks);
    queue.save()?;
    Ok(())
}

async fn run_verification(ctx: &PrLifecycleContext<'_>, task: &Task) -> Result<PrLifecycleOutcome> {
    match ctx.deployer.verify(ctx.repo_path, task).await? {
        VerifyOutcome::Verified => {
            state_dispatch::mark_verified(ctx.pool, &task.id).await?;
            if let (Some(worktree), Some(branch)) = (task.worktree.as_deref(), task.branch.as_deref()) {
                let _ = ctx.vcs.remove_worktree(Path::new(worktree), branch);
            }
            Ok(PrLifecycleOutcome::Executed { action: PrAction::Deploy })
        }
        VerifyOutcome::Failed(reason) => {
            state_dispatch::mark_verify_failed(ctx.pool, &task.id, &reason).await?;
            Ok(PrLifecycleOutcome::Blocked(reason))
        }
    }
}

async fn advance_verifying(ctx: &PrLifecycleContext<'_>, task: &Task) -> Result<PrLifecycleOutcome> {
    // Re-driven when a prior pulse entered `verifying` but didn't record an
    // outcome (interrupted pulse) -- idempotent re-run of the same check.
    run_verification(ctx, task).await
}

/// Spawn a second, fully tool-capable AI worker scoped to the task's
/// worktree to resolve conflicts, fix CI, or push a follow-up fix
/// (spec §4.8 step 3, "complex actions").
async fn spawn_fix_worker(ctx: &PrLifecycleContext<'_>, task: &Task, action: PrAction, reason: &str) -> Result<()> {
    let Some(worktree) = task.worktree.clone() else {
        anyhow::bail!("cannot spawn fix worker for {}: no worktree recorded", task.id);
    };

    let instruction = match action {
        PrAction::ResolveConflicts => "Resolve the merge conflicts on this branch against the base branch, then commit and push.",
        PrAction::FixCi => "The CI checks on this pull request are failing. Investigate and fix the failures, then commit and push.",
        PrAction::FixAndPush => "Address the requested review changes on this pull request, then commit and push.",
        _ => reason,
    };

    let invocation = WorkerInvocation {
        task_id: task.id.clone(),
        description: format!("{instruction}\n\nContext: {reason}"),
        model: task.model.clone().unwrap_or_else(|| "sonnet".to_string()),
        working_dir: worktree.clone().into(),
        verify_mode: false,
        env_vars: Default::default(),
    };
    let isolated_config_dir = Path::new(&worktree).join(".foreman-config");
    let cmd = WorkerCommand {
        task_id: task.id.clone(),
        program: ctx.worker_binary.to_string(),
        args: vec![invocation.prompt()],
        working_dir: worktree.into(),
        env: invocation.env(&isolated_config_dir).into_iter().collect(),
    };

    ctx.supervisor.spawn(&cmd).context("failed to spawn pr-lifecycle fix worker")?;
    Ok(())
}

/// Test-only advisor that always hands back `merge_pr`, used to drive
/// both siblings in the serial-merge regression test all the way
/// through `advance_pr_review` to an attempted merge in one call.
#[cfg(test)]
struct AlwaysMergeAdvisor;

#[cfg(test)]
#[async_trait]
impl Advisor for AlwaysMergeAdvisor {
    async fn arbitrate_verdict(&self, _log_tail: &str, _task_description: &str) -> crate::advisor::ArbitratedVerdict {
        crate::advisor::ArbitratedVerdict::Retry("unused".to_string())
    }

    async fn decide_pr_action(&self, _snapshot_json: &str) -> PrDecision {
        PrDecision { action: PrAction::MergePr, reason: "approved, merging".to_string() }
    }
}
