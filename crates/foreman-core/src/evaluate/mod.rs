//! Evaluator (spec §4.6): determines a task's outcome after its worker
//! has finished.
//!
//! Grounded on the teacher's `GateRunner`/`evaluate_verdict` two-step
//! shape (run checks, then turn a verdict into an action), but the
//! verdict itself is built from structured log-tail parsing rather than
//! reading pre-structured events, since `foreman`'s workers are opaque
//! CLIs. See [`log_parser`] for the text-scanning primitives, grounded
//! on `ClaudeCodeAdapter::parse_stream_json_line`'s line-oriented style.

pub mod log_parser;

use std::path::Path;

use crate::advisor::{Advisor, ArbitratedVerdict};
use crate::vcs::VcsHost;
use crate::worker::PrUrl;
use log_parser as lp;

/// The evaluator's verdict, matching spec §4.6's four-shape output
/// exactly: every path produces one of these with a detail string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Complete(String),
    Retry(String),
    Blocked(String),
    Failed(String),
}

/// Everything the Evaluator needs about one finished task's worker run.
pub struct EvaluationInput<'a> {
    pub task_id: &'a str,
    pub task_description: &'a str,
    pub log_path: Option<&'a Path>,
    pub log_contents: Option<String>,
    pub exit_code: Option<i32>,
    pub worker_pid: Option<u32>,
    pub worker_alive: bool,
    pub worktree: Option<&'a Path>,
    pub branch: Option<&'a str>,
    pub base_branch: &'a str,
    pub recorded_pr_url: Option<&'a str>,
}

/// Evaluate a finished task's worker run, returning exactly one verdict.
/// Steps through tiers 0-3 in strict order, as spec.md requires ("strict
/// tier order, returning at the first match").
pub async fn evaluate(
    input: &EvaluationInput<'_>,
    vcs: &dyn VcsHost,
    advisor: &dyn Advisor,
    repo_path: &Path,
) -> Verdict {
    // Tier 0: infrastructure diagnostics.
    let Some(log_path) = input.log_path else {
        let pid_state = match input.worker_pid {
            Some(pid) => format!(":worker_pid_{pid}_{}", if input.worker_alive { "alive" } else { "dead" }),
            None => String::new(),
        };
        return Verdict::Failed(format!("no_log_path_in_db{pid_state}"));
    };

    let Some(log) = &input.log_contents else {
        let pid_state = if input.worker_pid.is_none() {
            ":no_pid_file".to_string()
        } else if !input.worker_alive {
            format!(":worker_pid_{}_dead", input.worker_pid.unwrap())
        } else {
            String::new()
        };
        return Verdict::Failed(format!("log_file_missing{pid_state}"));
    };
    let _ = log_path;

    if log.trim().is_empty() {
        return Verdict::Failed("log_file_empty".to_string());
    }

    if !lp::has_startup_sentinel(log) && lp::substantive_line_count(log) < 3 {
        return Verdict::Failed("worker_never_started:no_sentinel".to_string());
    }

    // Tier 1: signals in the final text output.
    let final_text = lp::final_text_output(log);
    let parsed = lp::parse_final_output(final_text);
    let exit_code = input.exit_code.or_else(|| lp::extract_exit_code(log));

    if let Some(signal) = parsed.signal {
        use crate::worker::WorkerSignal::*;
        let verdict = match signal {
            FullLoopComplete | VerifyComplete => Some(Verdict::Complete(format!("{signal:?}"))),
            TaskComplete if exit_code == Some(0) => Some(Verdict::Complete("task_complete".to_string())),
            VerifyIncomplete if parsed.pr_url.is_some() => Some(Verdict::Complete("verify_incomplete_with_pr".to_string())),
            VerifyIncomplete => Some(Verdict::Retry("verify_incomplete_no_pr".to_string())),
            VerifyNotStarted if parsed.pr_url.is_some() => Some(Verdict::Complete("verify_not_started_with_pr".to_string())),
            VerifyNotStarted => Some(Verdict::Retry("verify_not_started_needs_full".to_string())),
            TaskComplete => None,
        };
        if let Some(v) = verdict {
            return validate_pr_attribution(v, parsed.pr_url.as_ref(), input.task_id, vcs, repo_path).await;
        }
    }

    if let Some(reason) = &parsed.blocked_reason {
        return Verdict::Blocked(reason.clone());
    }

    if exit_code == Some(0) && parsed.signal.is_none() {
        if let Some(pr) = &parsed.pr_url {
            if PrUrl::attributed_to(&pr.url, input.task_id) {
                return validate_pr_attribution(
                    Verdict::Complete(pr.url.clone()),
                    Some(pr),
                    input.task_id,
                    vcs,
                    repo_path,
                )
                .await;
            }
        }
    }

    // Tier 1.5: backend errors with a clean exit.
    if exit_code == Some(0) && parsed.signal.is_none() {
        let tail = lp::tail(log, lp::TAIL_LINES);
        if lp::substantive_line_count(log) < 10 {
            if lp::tail_has_billing_tokens(&tail) {
                return Verdict::Blocked("billing_credits_exhausted".to_string());
            }
            if lp::tail_has_backend_infra_tokens(&tail) {
                return Verdict::Retry("backend_quota_error".to_string());
            }
        }
    }

    // Tier 1.75: obsolete-task detection.
    if exit_code == Some(0) && parsed.signal.is_none() && parsed.pr_url.is_none() && lp::looks_obsolete(final_text) {
        return Verdict::Complete("task_obsolete".to_string());
    }

    // Tier 2: error patterns on non-zero exit.
    if let Some(code) = exit_code {
        if code != 0 {
            let tail = lp::tail(log, lp::TAIL_LINES);
            if lp::tail_has_auth_tokens(&tail) {
                return Verdict::Blocked("auth_error".to_string());
            }
            if lp::tail_has_merge_conflict_tokens(&tail) {
                return Verdict::Blocked("merge_conflict".to_string());
            }
            if lp::tail_has_oom_tokens(&tail) {
                return Verdict::Blocked("out_of_memory".to_string());
            }
            if lp::tail_has_rate_limit_tokens(&tail) {
                return Verdict::Retry("rate_limited".to_string());
            }
            if lp::tail_has_timeout_tokens(&tail) {
                return Verdict::Retry("timeout".to_string());
            }
            if lp::tail_has_backend_infra_tokens(&tail) {
                return Verdict::Retry("backend_infrastructure_error".to_string());
            }
            match code {
                130 => return Verdict::Retry("interrupted_sigint".to_string()),
                137 => return Verdict::Retry("killed_sigkill".to_string()),
                143 => return Verdict::Retry("terminated_sigterm".to_string()),
                _ => {}
            }
        }
    }

    // Tier 2.5: git-evidence heuristic.
    if let (Some(worktree), Some(branch)) = (input.worktree, input.branch) {
        let commits = vcs.commits_ahead(worktree, input.base_branch, branch).unwrap_or(0);
        let dirty = vcs.working_tree_dirty(worktree).unwrap_or(false);

        if commits > 0 {
            if let Some(pr_url) = input.recorded_pr_url {
                return Verdict::Complete(pr_url.to_string());
            }
            let title = format!("{}: automated commit ({} ahead of {})", input.task_id, commits, input.base_branch);
            match vcs.open_pr(repo_path, branch, input.base_branch, &title, "", true).await {
                Ok(pr) => return Verdict::Complete(pr.url),
                Err(_) => return Verdict::Complete("task_only".to_string()),
            }
        }
        if dirty {
            return Verdict::Retry("work_in_progress".to_string());
        }
    }

    // Tier 2.75: clean exit, no signal, no PR, and no git evidence at all --
    // the worker produced nothing for tier 2.5 to find (no worktree/branch,
    // or a worktree with 0 commits ahead and a clean working tree).
    if exit_code == Some(0) && parsed.signal.is_none() && parsed.pr_url.is_none() {
        return Verdict::Retry("clean_exit_no_signal".to_string());
    }

    // Tier 3: AI arbitration.
    let tail = lp::tail(log, lp::ARBITRATION_TAIL_LINES);
    match advisor.arbitrate_verdict(&tail, input.task_description).await {
        ArbitratedVerdict::Complete(d) => Verdict::Complete(d),
        ArbitratedVerdict::Retry(d) => Verdict::Retry(d),
        ArbitratedVerdict::Blocked(d) => Verdict::Blocked(d),
        ArbitratedVerdict::Failed(d) => Verdict::Failed(d),
    }
}

/// PR attribution guard (spec §4.6): any PR URL the evaluator asserts is
/// fetched from GitHub and its title+head-branch checked for the task
/// ID as a word-boundary match. An unvalidated URL is cleared rather
/// than attributed.
async fn validate_pr_attribution(
    verdict: Verdict,
    pr_url: Option<&PrUrl>,
    task_id: &str,
    vcs: &dyn VcsHost,
    repo_path: &Path,
) -> Verdict {
    let Some(pr) = pr_url else { return verdict };

    const MAX_ATTEMPTS: u32 = 3;
    let mut delay = std::time::Duration::from_millis(200);
    for attempt in 0..MAX_ATTEMPTS {
        match vcs.pr_snapshot(repo_path, pr.number).await {
            Ok(snapshot) => {
                let attributed = PrUrl::attributed_to(&snapshot.title, task_id)
                    || PrUrl::attributed_to(&snapshot.head_ref_name, task_id);
                return if attributed {
                    verdict
                } else {
                    Verdict::Retry("pr_attribution_mismatch".to_string())
                };
            }
            Err(_) if attempt + 1 < MAX_ATTEMPTS => {
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(_) => return Verdict::Retry("pr_fetch_failed_after_retries".to_string()),
        }
    }
    unreachable!()
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_test_utils::FakeVcsHost;

    fn base_input() -> EvaluationInput<'static> {
        EvaluationInput {
            task_id: "t1",
            task_description: "fix the thing",
            log_path: Some(Path::new("/tmp/t1.log")),
            log_contents: None,
            exit_code: None,
            worker_pid: None,
            worker_alive: false,
            worktree: None,
            branch: None,
            base_branch: "main",
            recorded_pr_url: None,
        }
    }

    #[tokio::test]
    async fn missing_log_contents_is_tier0_failed() {
        let vcs = FakeVcsHost::new();
        let advisor = crate::advisor::DeterministicAdvisor;
        let input = base_input();
        let verdict = evaluate(&input, &vcs, &advisor, Path::new("/repo")).await;
        assert_eq!(verdict, Verdict::Failed("log_file_missing:no_pid_file".to_string()));
    }

    #[tokio::test]
    async fn empty_log_is_tier0_failed() {
        let vcs = FakeVcsHost::new();
        let advisor = crate::advisor::DeterministicAdvisor;
        let mut input = base_input();
        input.log_contents = Some("   \n".to_string());
        let verdict = evaluate(&input, &vcs, &advisor, Path::new("/repo")).await;
        assert_eq!(verdict, Verdict::Failed("log_file_empty".to_string()));
    }

    #[tokio::test]
    async fn full_loop_complete_signal_with_no_pr_is_complete() {
        let vcs = FakeVcsHost::new();
        let advisor = crate::advisor::DeterministicAdvisor;
        let mut input = base_input();
        input.log_contents = Some(format!(
            "{}\ntask: t1\n\ndid the thing\nFULL_LOOP_COMPLETE\nEXIT:0\n",
            lp::STARTUP_SENTINEL
        ));
        input.exit_code = Some(0);
        let verdict = evaluate(&input, &vcs, &advisor, Path::new("/repo")).await;
        assert!(matches!(verdict, Verdict::Complete(_)));
    }

    #[tokio::test]
    async fn nonzero_exit_with_rate_limit_tail_retries() {
        let vcs = FakeVcsHost::new();
        let advisor = crate::advisor::DeterministicAdvisor;
        let mut input = base_input();
        input.log_contents = Some(format!(
            "{}\ntask: t1\n\nerror: 429 too many requests\nEXIT:1\n",
            lp::STARTUP_SENTINEL
        ));
        input.exit_code = Some(1);
        let verdict = evaluate(&input, &vcs, &advisor, Path::new("/repo")).await;
        assert_eq!(verdict, Verdict::Retry("rate_limited".to_string()));
    }

    #[tokio::test]
    async fn sigkill_exit_code_retries() {
        let vcs = FakeVcsHost::new();
        let advisor = crate::advisor::DeterministicAdvisor;
        let mut input = base_input();
        input.log_contents = Some(format!("{}\ntask: t1\n\nkilled\nEXIT:137\n", lp::STARTUP_SENTINEL));
        input.exit_code = Some(137);
        let verdict = evaluate(&input, &vcs, &advisor, Path::new("/repo")).await;
        assert_eq!(verdict, Verdict::Retry("killed_sigkill".to_string()));
    }

    #[tokio::test]
    async fn git_evidence_with_commits_and_recorded_pr_is_complete() {
        let vcs = FakeVcsHost::new();
        vcs.set_commits_ahead("foreman/t1", 3);
        let advisor = crate::advisor::DeterministicAdvisor;
        let mut input = base_input();
        input.log_contents = Some(format!("{}\ntask: t1\n\nno signal here\nEXIT:1\n", lp::STARTUP_SENTINEL));
        input.exit_code = Some(1);
        input.worktree = Some(Path::new("/tmp/wt"));
        input.branch = Some("foreman/t1");
        input.recorded_pr_url = Some("https://github.com/acme/svc/pull/5");
        let verdict = evaluate(&input, &vcs, &advisor, Path::new("/repo")).await;
        assert_eq!(verdict, Verdict::Complete("https://github.com/acme/svc/pull/5".to_string()));
    }

    #[tokio::test]
    async fn clean_exit_no_pr_no_worktree_retries_without_advisor() {
        let vcs = FakeVcsHost::new();
        let advisor = crate::advisor::DeterministicAdvisor;
        let mut input = base_input();
        input.log_contents = Some(format!("{}\ntask: t1\n\nfinished up, nothing to report\nEXIT:0\n", lp::STARTUP_SENTINEL));
        input.exit_code = Some(0);
        let verdict = evaluate(&input, &vcs, &advisor, Path::new("/repo")).await;
        assert_eq!(verdict, Verdict::Retry("clean_exit_no_signal".to_string()));
    }

    #[tokio::test]
    async fn clean_exit_with_zero_commits_and_clean_tree_retries_as_no_signal() {
        let vcs = FakeVcsHost::new();
        let advisor = crate::advisor::DeterministicAdvisor;
        let mut input = base_input();
        input.log_contents = Some(format!("{}\ntask: t1\n\nfinished up, nothing to report\nEXIT:0\n", lp::STARTUP_SENTINEL));
        input.exit_code = Some(0);
        input.worktree = Some(Path::new("/tmp/wt"));
        input.branch = Some("foreman/t1");
        let verdict = evaluate(&input, &vcs, &advisor, Path::new("/repo")).await;
        assert_eq!(verdict, Verdict::Retry("clean_exit_no_signal".to_string()));
    }

    #[tokio::test]
    async fn ambiguous_output_falls_through_to_advisor_default() {
        let vcs = FakeVcsHost::new();
        let advisor = crate::advisor::DeterministicAdvisor;
        let mut input = base_input();
        input.log_contents = Some(format!("{}\ntask: t1\n\nsomething odd happened\nEXIT:1\n", lp::STARTUP_SENTINEL));
        input.exit_code = Some(1);
        let verdict = evaluate(&input, &vcs, &advisor, Path::new("/repo")).await;
        assert_eq!(verdict, Verdict::Retry("ambiguous_ai_unavailable".to_string()));
    }
}
