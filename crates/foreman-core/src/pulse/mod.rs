//! PulseDriver (spec §4.10): composes every other component into a
//! single bounded, idempotent pass over the world.
//!
//! Grounded on `orchestrator::run_orchestrator`'s phased loop body (reset
//! orphans, spawn ready work, drain results), collapsed from a
//! long-lived in-process loop into one bounded pass per invocation --
//! `foreman` runs as a periodic pulse with all continuity in the Store,
//! not as a resident scheduler. Phases: claim-pickup (restart recovery),
//! dispatch-eligible, evaluate-running, reconcile-db-vs-file, PR
//! lifecycle, verification queue.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tracing::{info, warn};

use foreman_db::models::{Batch, BatchStatus, TaskStatus};
use foreman_db::queries::batches as batch_db;
use foreman_db::queries::tasks as db;

use crate::advisor::Advisor;
use crate::dispatch::{self, DispatchContext, DispatchOutcome};
use crate::evaluate::{self, EvaluationInput};
use crate::pr_lifecycle::{self, Deployer, PrLifecycleContext};
use crate::retry::{self, RetryOutcome};
use crate::router::HealthChecker;
use crate::state::TaskStateMachine;
use crate::supervisor::ProcessSupervisor;
use crate::taskfile::verify_queue::VerifyQueue;
use crate::taskfile::{reconcile, TaskFile};
use crate::vcs::VcsHost;

/// The retrospective/memory sink invoked when a batch finishes (spec
/// §4.10's "retrospective (on batch completion)" phase). The storage
/// behind this is named in spec §1 as an out-of-core external
/// collaborator ("memory/retrospective storage, an optional sink"); this
/// trait is the seam the PulseDriver calls through, mirroring the
/// `Advisor` pattern -- a deterministic no-op fallback lets the pulse run
/// to completion with no sink configured.
pub trait RetrospectiveSink: Send + Sync {
    fn record(&self, batch: &Batch, progress: batch_db::BatchProgress);
}

/// Default sink: logs the completion and keeps no state. Used whenever
/// no concrete memory backend is wired in.
pub struct NoopRetrospectiveSink;

impl RetrospectiveSink for NoopRetrospectiveSink {
    fn record(&self, batch: &Batch, progress: batch_db::BatchProgress) {
        info!(
            batch_id = %batch.id,
            total = progress.total,
            complete_or_better = progress.complete_or_better,
            failed_or_blocked = progress.failed_or_blocked,
            "batch complete, no retrospective sink configured"
        );
    }
}

/// Everything one pulse needs, constructed once by the caller
/// (`foreman-cli`'s `pulse` command) and reused across every phase.
pub struct PulseConfig<'a> {
    pub pool: &'a SqlitePool,
    pub vcs: &'a dyn VcsHost,
    pub advisor: &'a dyn Advisor,
    pub deployer: &'a dyn Deployer,
    pub supervisor: &'a ProcessSupervisor,
    pub health: &'a HealthChecker,
    pub retrospective: &'a dyn RetrospectiveSink,
    pub repo_path: &'a Path,
    pub base_branch: &'a str,
    pub worker_binary: &'a str,
    pub api_base: &'a str,
    pub api_key: &'a str,
    pub task_file_path: &'a Path,
    pub verify_queue_path: &'a Path,
    pub effective_concurrency: i64,
    pub stale_claim_age: Duration,
    pub skip_merge_review_gate: bool,
    pub max_pr_actions_per_pulse: usize,
    pub max_dispatch_per_pulse: usize,
    pub max_evaluate_per_pulse: usize,
}

/// Tallies from one bounded pass, for the CLI's `pulse` summary output.
#[derive(Debug, Clone, Default)]
pub struct PulseReport {
    pub orphans_recovered: usize,
    pub dispatched: usize,
    pub evaluated: usize,
    pub completed: usize,
    pub retried: usize,
    pub escalated: usize,
    pub blocked: usize,
    pub failed: usize,
    pub pr_actions: usize,
    pub pr_deferred: usize,
    pub reconcile: reconcile::ReconcileReport,
    pub verify_checks_run: usize,
    pub batches_completed: usize,
}

/// Run one bounded pulse. Idempotent: re-running against an unchanged
/// world performs no further state transitions (every phase below only
/// acts on rows whose status makes them eligible, and those same rows
/// would already have moved on after the first pass).
pub async fn run_pulse(cfg: &PulseConfig<'_>) -> Result<PulseReport> {
    let mut report = PulseReport::default();
    cfg.health.start_pulse();

    claim_pickup(cfg, &mut report).await?;
    dispatch_eligible(cfg, &mut report).await?;
    evaluate_running(cfg, &mut report).await?;

    let mut task_file = TaskFile::load(cfg.task_file_path).context("failed to load task file")?;
    task_file.dedupe_duplicate_ids();
    let repo_path_str = cfg.repo_path.to_string_lossy().into_owned();
    report.reconcile = reconcile::reconcile(cfg.pool, &repo_path_str, &mut task_file).await?;
    task_file.save().context("failed to write back task file")?;

    run_pr_lifecycle_phase(cfg, &mut report).await?;
    run_verification_queue(cfg, &mut report)?;
    run_retrospective_phase(cfg, &mut report).await?;

    Ok(report)
}

/// Phase 1: restart recovery. Tasks stuck in an in-flight state after an
/// unclean exit are reset to `failed`; this phase then decides whether
/// each one is retried (budget remaining) or left for operator action.
async fn claim_pickup(cfg: &PulseConfig<'_>, report: &mut PulseReport) -> Result<()> {
    let orphans = db::reset_orphaned_tasks(cfg.pool).await.context("failed to reset orphaned tasks")?;
    for orphan in &orphans {
        if orphan.retries < orphan.max_retries {
            match TaskStateMachine::retry_transition(cfg.pool, &orphan.id).await {
                Ok(()) => {
                    report.orphans_recovered += 1;
                    info!(task_id = %orphan.id, "recovered orphaned task, re-queued");
                }
                Err(err) => warn!(task_id = %orphan.id, %err, "failed to re-queue orphaned task"),
            }
        } else {
            warn!(task_id = %orphan.id, "orphaned task has no retries left, left failed for operator review");
        }
    }
    Ok(())
}

/// Phase 2: dispatch every `queued` task up to the per-pulse cap. Tags
/// come from the task file since the DB row has no column for them.
async fn dispatch_eligible(cfg: &PulseConfig<'_>, report: &mut PulseReport) -> Result<()> {
    let task_file = TaskFile::load(cfg.task_file_path).context("failed to load task file for tags")?;
    let candidates = db::get_dispatch_candidates(cfg.pool).await.context("failed to list dispatch candidates")?;

    let ctx = DispatchContext {
        pool: cfg.pool,
        vcs: cfg.vcs,
        supervisor: cfg.supervisor,
        health: cfg.health,
        repo_path: cfg.repo_path,
        base_branch: cfg.base_branch,
        worker_binary: cfg.worker_binary,
        api_base: cfg.api_base,
        api_key: cfg.api_key,
        effective_concurrency: cfg.effective_concurrency,
        stale_claim_age: cfg.stale_claim_age,
    };

    for task in candidates.into_iter().take(cfg.max_dispatch_per_pulse) {
        let tags = task_file.find(&task.id).map(|t| t.tags.clone()).unwrap_or_default();
        match dispatch::dispatch_task(&ctx, &task, &tags).await {
            Ok(DispatchOutcome::Spawned { session_pid }) => {
                report.dispatched += 1;
                info!(task_id = %task.id, pid = session_pid, "dispatched worker");
            }
            Ok(outcome) => {
                info!(task_id = %task.id, ?outcome, "dispatch deferred");
            }
            Err(err) => warn!(task_id = %task.id, %err, "dispatch preflight failed"),
        }
    }
    Ok(())
}

/// Phase 3: re-diagnose every `running` task whose worker has exited,
/// move it through the Evaluator, and apply the RetryController's
/// policy to the resulting verdict.
async fn evaluate_running(cfg: &PulseConfig<'_>, report: &mut PulseReport) -> Result<()> {
    let running = db::list_tasks_by_status(cfg.pool, &[TaskStatus::Running]).await.context("failed to list running tasks")?;

    for task in running.into_iter().take(cfg.max_evaluate_per_pulse) {
        let worker_pid = task.session.as_deref().and_then(|s| s.parse::<u32>().ok());
        let worker_alive = worker_pid.map(|pid| cfg.supervisor.is_alive(pid)).unwrap_or(false);
        if worker_alive {
            continue;
        }

        let log_path = task.log_file.as_deref().map(Path::new);
        let log_contents = log_path.and_then(|p| std::fs::read_to_string(p).ok());
        let exit_code = log_contents.as_deref().and_then(extract_trailer_exit_code);

        let worktree = task.worktree.as_deref().map(Path::new);
        let branch = task.branch.as_deref();

        let input = EvaluationInput {
            task_id: &task.id,
            task_description: &task.description,
            log_path,
            log_contents,
            exit_code,
            worker_pid,
            worker_alive,
            worktree,
            branch,
            base_branch: cfg.base_branch,
            recorded_pr_url: task.pr_url.as_deref(),
        };

        if let Err(err) = crate::state::dispatch::begin_evaluation(cfg.pool, &task.id).await {
            warn!(task_id = %task.id, %err, "failed to enter evaluating state, skipping this pulse");
            continue;
        }

        let verdict = evaluate::evaluate(&input, cfg.vcs, cfg.advisor, cfg.repo_path).await;
        report.evaluated += 1;

        let Some(task) = db::get_task(cfg.pool, &task.id).await.context("failed to reload task after evaluation")? else {
            continue;
        };

        match retry::apply_verdict(cfg.pool, &task, verdict, None).await {
            Ok(RetryOutcome::Completed) => report.completed += 1,
            Ok(RetryOutcome::Retried) => report.retried += 1,
            Ok(RetryOutcome::Escalated { .. }) => report.escalated += 1,
            Ok(RetryOutcome::Blocked) => report.blocked += 1,
            Ok(RetryOutcome::Failed) => report.failed += 1,
            Err(err) => warn!(task_id = %task.id, %err, "failed to apply evaluator verdict"),
        }

        let _ = cfg.supervisor.reap(&task.id).await;
    }
    Ok(())
}

/// Best-effort read of the supervisory wrapper's `EXIT:<code>` trailer
/// (spec §4.2's spawn contract) from a worker's log tail.
fn extract_trailer_exit_code(log: &str) -> Option<i32> {
    log.lines().rev().find_map(|line| line.strip_prefix("EXIT:")).and_then(|code| code.trim().parse().ok())
}

/// Phase 5: advance every PR-bearing task one step.
async fn run_pr_lifecycle_phase(cfg: &PulseConfig<'_>, report: &mut PulseReport) -> Result<()> {
    let ctx = PrLifecycleContext {
        pool: cfg.pool,
        vcs: cfg.vcs,
        advisor: cfg.advisor,
        deployer: cfg.deployer,
        supervisor: cfg.supervisor,
        repo_path: cfg.repo_path,
        base_branch: cfg.base_branch,
        worker_binary: cfg.worker_binary,
        verify_queue_path: cfg.verify_queue_path,
        skip_merge_review_gate: cfg.skip_merge_review_gate,
        max_actions_per_pulse: cfg.max_pr_actions_per_pulse,
    };
    let pr_report = pr_lifecycle::run_pr_lifecycle(&ctx).await.context("PR lifecycle pass failed")?;
    report.pr_actions = pr_report.actions_taken;
    report.pr_deferred = pr_report.deferred;
    Ok(())
}

/// Phase 6: run whatever verification-queue checks are still pending
/// from a prior successful deploy.
fn run_verification_queue(cfg: &PulseConfig<'_>, report: &mut PulseReport) -> Result<()> {
    let mut queue = VerifyQueue::load(cfg.verify_queue_path).context("failed to load verification queue")?;
    if !queue.pending() {
        return Ok(());
    }
    let before = queue.checks.iter().filter(|c| c.passed.is_none()).count();
    queue.run_pending(cfg.repo_path).context("failed to run verification queue checks")?;
    report.verify_checks_run = before;
    queue.save().context("failed to write back verification queue")?;
    Ok(())
}

/// Phase 7: any `active` batch whose every task has reached a terminal
/// status is closed out and handed to the retrospective sink. Idempotent
/// because it only fires for batches still `active` -- a batch already
/// marked `complete` is never re-reported.
async fn run_retrospective_phase(cfg: &PulseConfig<'_>, report: &mut PulseReport) -> Result<()> {
    let batches = batch_db::list_batches(cfg.pool).await.context("failed to list batches")?;
    for batch in batches {
        if batch.status != BatchStatus::Active {
            continue;
        }
        if !batch_db::is_batch_complete(cfg.pool, &batch.id).await.context("failed to check batch completion")? {
            continue;
        }
        let progress = batch_db::get_batch_progress(cfg.pool, &batch.id).await.context("failed to compute batch progress")?;
        batch_db::update_batch_status(cfg.pool, &batch.id, BatchStatus::Complete)
            .await
            .context("failed to mark batch complete")?;
        cfg.retrospective.record(&batch, progress);
        report.batches_completed += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_exit_code_from_trailer() {
        let log = "=== foreman worker start ===\nsome output\nmore output\nEXIT:0\n";
        assert_eq!(extract_trailer_exit_code(log), Some(0));
    }

    #[test]
    fn missing_trailer_yields_none() {
        assert_eq!(extract_trailer_exit_code("nothing to see here"), None);
    }

    #[test]
    fn report_defaults_to_zero() {
        let report = PulseReport::default();
        assert_eq!(report.dispatched, 0);
        assert_eq!(report.pr_actions, 0);
    }
}
