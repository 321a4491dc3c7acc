//! `foreman pulse` command: run one (or more) bounded pulses.
//!
//! Builds every collaborator `PulseConfig` needs from the resolved
//! [`ForemanConfig`] and calls [`foreman_core::pulse::run_pulse`],
//! mirroring the teacher's `dispatch_cmd`/`cleanup_cmd` pattern of
//! wiring concrete adapters at the CLI boundary and handing the core
//! only trait objects.

use std::time::Duration;

use anyhow::Result;
use sqlx::SqlitePool;
use tracing::{error, info};

use foreman_core::advisor::DeterministicAdvisor;
use foreman_core::pr_lifecycle::NoopDeployer;
use foreman_core::pulse::{run_pulse, NoopRetrospectiveSink, PulseConfig};
use foreman_core::router::HealthChecker;
use foreman_core::supervisor::ProcessSupervisor;
use foreman_core::vcs::CliVcsHost;
use foreman_core::worktree::WorktreeManager;

use crate::config::ForemanConfig;

const HEALTH_CACHE_TTL: Duration = Duration::from_secs(300);

/// Run pulses against `cfg` until `once` is satisfied or (in loop mode)
/// the process is interrupted.
pub async fn run_pulse_command(pool: &SqlitePool, cfg: &ForemanConfig, once: bool, interval: Duration) -> Result<()> {
    let worktrees = WorktreeManager::new(cfg.repo_path.clone(), None)?;
    let vcs = CliVcsHost::new(worktrees);
    let advisor = DeterministicAdvisor;
    let deployer = NoopDeployer;
    let supervisor = ProcessSupervisor::new(cfg.paths.root());
    let health = HealthChecker::new(HEALTH_CACHE_TTL);
    let retrospective = NoopRetrospectiveSink;

    loop {
        let pulse_cfg = PulseConfig {
            pool,
            vcs: &vcs,
            advisor: &advisor,
            deployer: &deployer,
            supervisor: &supervisor,
            health: &health,
            retrospective: &retrospective,
            repo_path: &cfg.repo_path,
            base_branch: &cfg.base_branch,
            worker_binary: &cfg.worker_binary,
            api_base: &cfg.api_base,
            api_key: &cfg.api_key,
            task_file_path: &cfg.task_file_path,
            verify_queue_path: &cfg.verify_queue_path,
            effective_concurrency: cfg.global_concurrency,
            stale_claim_age: cfg.stale_claim_age,
            skip_merge_review_gate: cfg.skip_merge_review_gate,
            max_pr_actions_per_pulse: cfg.max_pr_actions_per_pulse,
            max_dispatch_per_pulse: cfg.max_dispatch_per_pulse,
            max_evaluate_per_pulse: cfg.max_evaluate_per_pulse,
        };

        match run_pulse(&pulse_cfg).await {
            Ok(report) => {
                println!(
                    "pulse: orphans_recovered={} dispatched={} evaluated={} completed={} retried={} \
                     escalated={} blocked={} failed={} pr_actions={} pr_deferred={} \
                     reconciled(annotated={} cancelled={} completed_in_db={} orphans={}) \
                     verify_checks_run={} batches_completed={}",
                    report.orphans_recovered,
                    report.dispatched,
                    report.evaluated,
                    report.completed,
                    report.retried,
                    report.escalated,
                    report.blocked,
                    report.failed,
                    report.pr_actions,
                    report.pr_deferred,
                    report.reconcile.annotated,
                    report.reconcile.marked_cancelled_in_file,
                    report.reconcile.completed_in_db,
                    report.reconcile.orphans.len(),
                    report.verify_checks_run,
                    report.batches_completed,
                );
            }
            Err(err) => error!(%err, "pulse failed"),
        }

        if once {
            return Ok(());
        }

        info!(interval_secs = interval.as_secs(), "sleeping until next pulse");
        tokio::time::sleep(interval).await;
    }
}
