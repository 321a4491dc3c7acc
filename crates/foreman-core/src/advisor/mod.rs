//! Advisor: the AI-arbitration seam used by the Evaluator's tier 3
//! (truly ambiguous verdicts) and by `PRLifecycleEngine`'s decide step.
//!
//! New component -- no teacher analogue beyond the subprocess-invocation
//! shape of `ClaudeCodeAdapter::spawn` (build a command, pipe output,
//! parse the final text), adapted here to a single one-shot call rather
//! than a kept-open streaming session. An object-safe trait plus a
//! `DeterministicAdvisor` fallback lets the same decision points run
//! under CI without an LLM in the loop, per the Design Notes.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::Duration;

/// The fixed PR-lifecycle decision grammar (spec §4.8 step 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrAction {
    MergePr,
    UpdateBranch,
    RebaseBranch,
    FixCi,
    ResolveConflicts,
    FixAndPush,
    PromoteDraft,
    ClosePr,
    Deploy,
    MarkComplete,
    DismissReviews,
    RetryCi,
    Wait,
    Cancel,
}

impl PrAction {
    /// The wire/grammar token for this action, the inverse of [`Self::parse`].
    pub fn name(self) -> &'static str {
        match self {
            Self::MergePr => "merge_pr",
            Self::UpdateBranch => "update_branch",
            Self::RebaseBranch => "rebase_branch",
            Self::FixCi => "fix_ci",
            Self::ResolveConflicts => "resolve_conflicts",
            Self::FixAndPush => "fix_and_push",
            Self::PromoteDraft => "promote_draft",
            Self::ClosePr => "close_pr",
            Self::Deploy => "deploy",
            Self::MarkComplete => "mark_complete",
            Self::DismissReviews => "dismiss_reviews",
            Self::RetryCi => "retry_ci",
            Self::Wait => "wait",
            Self::Cancel => "cancel",
        }
    }

    pub fn parse(token: &str) -> Option<Self> {
        match token.trim() {
            "merge_pr" => Some(Self::MergePr),
            "update_branch" => Some(Self::UpdateBranch),
            "rebase_branch" => Some(Self::RebaseBranch),
            "fix_ci" => Some(Self::FixCi),
            "resolve_conflicts" => Some(Self::ResolveConflicts),
            "fix_and_push" => Some(Self::FixAndPush),
            "promote_draft" => Some(Self::PromoteDraft),
            "close_pr" => Some(Self::ClosePr),
            "deploy" => Some(Self::Deploy),
            "mark_complete" => Some(Self::MarkComplete),
            "dismiss_reviews" => Some(Self::DismissReviews),
            "retry_ci" => Some(Self::RetryCi),
            "wait" => Some(Self::Wait),
            "cancel" => Some(Self::Cancel),
            _ => None,
        }
    }
}

/// A PR-lifecycle decision: the action plus a short human-readable
/// reason, persisted for audit (spec §4.8 step 2: "Decisions are
/// persisted for audit").
#[derive(Debug, Clone)]
pub struct PrDecision {
    pub action: PrAction,
    pub reason: String,
}

/// A tier-3 evaluator verdict, arbitrated by an LLM when the log/git
/// evidence alone is ambiguous. Mirrors the verdict shape the lower
/// tiers of `evaluate` already produce.
#[derive(Debug, Clone)]
pub enum ArbitratedVerdict {
    Complete(String),
    Retry(String),
    Blocked(String),
    Failed(String),
}

/// Object-safe seam for the two AI-advised decision points in the
/// system: arbitrating an ambiguous evaluator verdict, and deciding the
/// next PR-lifecycle action.
#[async_trait]
pub trait Advisor: Send + Sync {
    /// Tier 3 of the Evaluator (spec §4.6): given the last ~200 lines of
    /// a worker's log and its task description, produce a single
    /// verdict.
    async fn arbitrate_verdict(&self, log_tail: &str, task_description: &str) -> ArbitratedVerdict;

    /// The PR-lifecycle decide step (spec §4.8 step 2): given a
    /// structured snapshot of a PR-bearing task, produce one decision
    /// from the fixed grammar.
    async fn decide_pr_action(&self, snapshot_json: &str) -> PrDecision;
}

/// A pure, I/O-free fallback advisor usable in CI or when no LLM CLI is
/// configured. Defaults to the conservative action named in the spec
/// ("Unknown verdicts from the arbitrator default to `retry` rather
/// than `fail`") and to `wait` for PR decisions it can't reason about.
pub struct DeterministicAdvisor;

#[async_trait]
impl Advisor for DeterministicAdvisor {
    async fn arbitrate_verdict(&self, _log_tail: &str, _task_description: &str) -> ArbitratedVerdict {
        ArbitratedVerdict::Retry("ambiguous_ai_unavailable".to_string())
    }

    async fn decide_pr_action(&self, _snapshot_json: &str) -> PrDecision {
        PrDecision { action: PrAction::Wait, reason: "no advisor configured, deferring".to_string() }
    }
}

/// An advisor that shells out to a cheap model CLI for a single-shot
/// arbitration call, grounded on `ClaudeCodeAdapter::spawn`'s
/// command-building shape but collapsed to one blocking call + final
/// text parse rather than a kept-open streamed session.
pub struct LlmCliAdvisor {
    binary: String,
    timeout: Duration,
}

impl LlmCliAdvisor {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self { binary: binary.into(), timeout }
    }

    async fn run(&self, prompt: &str, cwd: Option<&Path>) -> Option<String> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-p").arg(prompt).stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::null());
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let output = tokio::time::timeout(self.timeout, cmd.output()).await.ok()?.ok()?;
        if !output.status.success() {
            return None;
        }
        Some(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl Advisor for LlmCliAdvisor {
    async fn arbitrate_verdict(&self, log_tail: &str, task_description: &str) -> ArbitratedVerdict {
        let prompt = format!(
            "Task: {task_description}\n\nWorker log tail:\n{log_tail}\n\n\
             Respond with exactly one line: complete:<detail>, retry:<reason>, \
             blocked:<reason>, or failed:<reason>."
        );

        match self.run(&prompt, None).await {
            Some(output) => parse_verdict_line(output.lines().last().unwrap_or(""))
                .unwrap_or_else(|| ArbitratedVerdict::Retry("ambiguous_ai_unavailable".to_string())),
            None => ArbitratedVerdict::Retry("ambiguous_ai_unavailable".to_string()),
        }
    }

    async fn decide_pr_action(&self, snapshot_json: &str) -> PrDecision {
        let prompt = format!(
            "PR snapshot:\n{snapshot_json}\n\n\
             Respond with exactly one line: <action> <reason>, where action is one of \
             merge_pr, update_branch, rebase_branch, fix_ci, resolve_conflicts, fix_and_push, \
             promote_draft, close_pr, deploy, mark_complete, dismiss_reviews, retry_ci, wait, cancel."
        );

        match self.run(&prompt, None).await {
            Some(output) => parse_pr_decision_line(output.lines().last().unwrap_or(""))
                .unwrap_or_else(|| PrDecision { action: PrAction::Wait, reason: "unparseable advisor output".to_string() }),
            None => PrDecision { action: PrAction::Wait, reason: "advisor unavailable".to_string() },
        }
    }
}

fn parse_verdict_line(line: &str) -> Option<ArbitratedVerdict> {
    let (kind, rest) = line.split_once(':')?;
    let rest = rest.trim().to_string();
    match kind.trim() {
        "complete" => Some(ArbitratedVerdict::Complete(rest)),
        "retry" => Some(ArbitratedVerdict::Retry(rest)),
        "blocked" => Some(ArbitratedVerdict::Blocked(rest)),
        "failed" => Some(ArbitratedVerdict::Failed(rest)),
        _ => None,
    }
}

fn parse_pr_decision_line(line: &str) -> Option<PrDecision> {
    let mut parts = line.trim().splitn(2, ' ');
    let action = PrAction::parse(parts.next()?)?;
    let reason = parts.next().unwrap_or("").to_string();
    Some(PrDecision { action, reason })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deterministic_advisor_defaults_to_retry_not_fail() {
        let advisor = DeterministicAdvisor;
        let verdict = advisor.arbitrate_verdict("garbage log", "do a thing").await;
        assert!(matches!(verdict, ArbitratedVerdict::Retry(_)));
    }

    #[tokio::test]
    async fn deterministic_advisor_pr_action_is_wait() {
        let advisor = DeterministicAdvisor;
        let decision = advisor.decide_pr_action("{}").await;
        assert_eq!(decision.action, PrAction::Wait);
    }

    #[test]
    fn verdict_line_parses_all_four_kinds() {
        assert!(matches!(parse_verdict_line("complete:task_obsolete"), Some(ArbitratedVerdict::Complete(_))));
        assert!(matches!(parse_verdict_line("retry:flaky"), Some(ArbitratedVerdict::Retry(_))));
        assert!(matches!(parse_verdict_line("blocked:auth"), Some(ArbitratedVerdict::Blocked(_))));
        assert!(matches!(parse_verdict_line("failed:oops"), Some(ArbitratedVerdict::Failed(_))));
        assert!(parse_verdict_line("nonsense").is_none());
    }

    #[test]
    fn pr_action_name_parse_round_trip() {
        let actions = [
            PrAction::MergePr,
            PrAction::UpdateBranch,
            PrAction::RebaseBranch,
            PrAction::FixCi,
            PrAction::ResolveConflicts,
            PrAction::FixAndPush,
            PrAction::PromoteDraft,
            PrAction::ClosePr,
            PrAction::Deploy,
            PrAction::MarkComplete,
            PrAction::DismissReviews,
            PrAction::RetryCi,
            PrAction::Wait,
            PrAction::Cancel,
        ];
        for action in actions {
            assert_eq!(PrAction::parse(action.name()), Some(action));
        }
    }

    #[test]
    fn pr_decision_line_parses_action_and_reason() {
        let decision = parse_pr_decision_line("merge_pr approved and CI green").unwrap();
        assert_eq!(decision.action, PrAction::MergePr);
        assert_eq!(decision.reason, "approved and CI green");
    }
}
