//! RetryController (spec §4.7): turns an Evaluator verdict into the
//! next state-machine action, including quality-gate escalation.
//!
//! Grounded on `orchestrator::orchestrator_retry` +
//! `handle_lifecycle_result`'s retry/escalate branching, generalized
//! with the quality-gate escalation step and the `FailureMode`
//! taxonomy (spec §7).

use anyhow::Result;
use sqlx::SqlitePool;

use foreman_db::models::{FailureMode, Task, TaskStatus};
use foreman_db::queries::{state_log, tasks as db};

use crate::evaluate::Verdict;
use crate::router::Tier;
use crate::state::dispatch as state_dispatch;

/// Classify a retry reason string into the taxonomy spec §7 names, to
/// decide whether it consumes the task's retry budget. Provider-side
/// transience (rate-limited, backend-infra, timeout) is exempted since
/// the Dispatcher's provider-unavailable path already defers those
/// without touching the counter -- this function only classifies
/// reasons that reach here *after* a worker ran to completion.
pub fn classify_failure_mode(reason: &str) -> FailureMode {
    match reason {
        "rate_limited" | "backend_infrastructure_error" | "backend_quota_error" | "timeout" => FailureMode::Transient,
        "interrupted_sigint" | "killed_sigkill" | "terminated_sigterm" | "out_of_memory" => FailureMode::Resource,
        "no_log_path_in_db" | "worker_never_started" => FailureMode::Environment,
        "auth_error" | "merge_conflict" | "billing_credits_exhausted" => FailureMode::Blocked,
        "ambiguous_ai_unavailable" | "pr_attribution_mismatch" | "pr_fetch_failed_after_retries" => {
            FailureMode::Ambiguous
        }
        _ => FailureMode::Logic,
    }
}

/// Outcome of applying the RetryController's policy to a verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    Completed,
    Retried,
    /// Quality-gate escalation: re-queued at a higher tier.
    Escalated { new_model: String },
    Blocked,
    Failed,
}

/// Post-hoc quality checks run after a `complete` verdict (spec §4.7).
/// Pure given the evidence the Evaluator already gathered; returns
/// `true` if the task should be accepted as-is, `false` if it should be
/// escalated to a higher tier.
pub struct QualityCheckInput<'a> {
    pub log_substantive_lines: usize,
    pub modified_shell_files_valid: bool,
    pub diff_is_substantive: bool,
    pub pr_exists: bool,
    pub detail: &'a str,
}

const MIN_SUBSTANTIVE_LOG_LINES: usize = 5;

pub fn passes_quality_gate(input: &QualityCheckInput<'_>) -> bool {
    if input.detail == "task_obsolete" {
        // An obsolete-task completion has nothing to diff or log; it
        // trivially passes rather than being penalized for brevity.
        return true;
    }
    input.log_substantive_lines >= MIN_SUBSTANTIVE_LOG_LINES
        && input.modified_shell_files_valid
        && input.diff_is_substantive
        && input.pr_exists
}

/// Apply the RetryController's policy for a finished verdict,
/// transitioning the task row accordingly.
///
/// `quality_check` is `None` when the batch has opted out of quality-gate
/// escalation, or when the verdict isn't `Complete`.
pub async fn apply_verdict(
    pool: &SqlitePool,
    task: &Task,
    verdict: Verdict,
    quality_check: Option<&QualityCheckInput<'_>>,
) -> Result<RetryOutcome> {
    match verdict {
        Verdict::Complete(detail) => {
            if let Some(check) = quality_check {
                if !passes_quality_gate(check) {
                    if let Some(next_tier) = current_tier(task).and_then(Tier::next) {
                        let new_model = tier_name(next_tier);
                        // `escalate_model` jumps the row straight to `queued`
                        // (mirroring `increment_retry`'s direct write); log the
                        // transition ourselves since it bypasses `TaskStateMachine`.
                        db::escalate_model(pool, &task.id, task.escalation_depth, &new_model).await?;
                        state_log::append(
                            pool,
                            &task.id,
                            Some(&task.status.to_string()),
                            "queued",
                            Some("quality_gate_escalation"),
                        )
                        .await?;
                        return Ok(RetryOutcome::Escalated { new_model });
                    }
                    // At the ceiling: accepted as-is.
                }
            }
            state_dispatch::complete_task(pool, &task.id, &detail).await?;
            Ok(RetryOutcome::Completed)
        }
        Verdict::Retry(reason) => {
            let mode = classify_failure_mode(&reason);

            if mode.consumes_retry_budget() && task.retries >= task.max_retries {
                state_dispatch::fail_task(pool, &task.id, TaskStatus::Evaluating, &reason).await?;
                return Ok(RetryOutcome::Failed);
            }

            // evaluating -> retrying, logged through the state machine.
            state_dispatch::retry_task(pool, &task.id, &reason).await?;

            if mode.consumes_retry_budget() {
                // retrying -> queued: `increment_retry` writes the status
                // directly (mirroring `TaskStateMachine::retry_transition`'s
                // own pattern), so log the edge ourselves.
                db::increment_retry(pool, &task.id, task.retries).await?;
                state_log::append(pool, &task.id, Some("retrying"), "queued", Some(&reason)).await?;
            } else {
                // Transient/environment failures do not consume the
                // counter; go straight back to queued through the
                // ordinary transition.
                state_dispatch::requeue_task(pool, &task.id).await?;
            }
            Ok(RetryOutcome::Retried)
        }
        Verdict::Blocked(reason) => {
            state_dispatch::block_task(pool, &task.id, TaskStatus::Evaluating, &reason).await?;
            Ok(RetryOutcome::Blocked)
        }
        Verdict::Failed(reason) => {
            state_dispatch::fail_task(pool, &task.id, TaskStatus::Evaluating, &reason).await?;
            Ok(RetryOutcome::Failed)
        }
    }
}

fn current_tier(task: &Task) -> Option<Tier> {
    match task.model.as_deref() {
        Some("haiku") | Some("flash") => Some(Tier::Haiku),
        Some("sonnet") | Some("pro") => Some(Tier::Sonnet),
        Some("opus") => Some(Tier::Opus),
        _ => Some(Tier::Haiku),
    }
}

fn tier_name(tier: Tier) -> String {
    match tier {
        Tier::Haiku => "haiku",
        Tier::Sonnet => "sonnet",
        Tier::Opus => "opus",
        Tier::Contest => "CONTEST",
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_reasons_do_not_consume_retry_budget() {
        assert!(!classify_failure_mode("rate_limited").consumes_retry_budget());
        assert!(!classify_failure_mode("timeout").consumes_retry_budget());
    }

    #[test]
    fn environment_reasons_do_not_consume_retry_budget() {
        assert!(!classify_failure_mode("worker_never_started").consumes_retry_budget());
    }

    #[test]
    fn logic_and_ambiguous_reasons_consume_retry_budget() {
        assert!(classify_failure_mode("weird_unrecognised_reason").consumes_retry_budget());
        assert!(classify_failure_mode("ambiguous_ai_unavailable").consumes_retry_budget());
    }

    #[test]
    fn quality_gate_accepts_obsolete_completion_unconditionally() {
        let input = QualityCheckInput {
            log_substantive_lines: 0,
            modified_shell_files_valid: false,
            diff_is_substantive: false,
            pr_exists: false,
            detail: "task_obsolete",
        };
        assert!(passes_quality_gate(&input));
    }

    #[test]
    fn quality_gate_rejects_thin_evidence() {
        let input = QualityCheckInput {
            log_substantive_lines: 1,
            modified_shell_files_valid: true,
            diff_is_substantive: true,
            pr_exists: true,
            detail: "some_pr_url",
        };
        assert!(!passes_quality_gate(&input));
    }
}
