//! Key-value/log-tail parsing for worker output.
//!
//! Grounded on `ClaudeCodeAdapter::parse_stream_json_line`'s
//! line-oriented parsing style, adapted from JSONL-event parsing (the
//! teacher reads structured events from a kept-open child) to plain
//! text-tail scanning, since `foreman`'s workers are opaque CLIs whose
//! only contract is their final text output and exit code (spec §6).

use crate::worker::{parse_blocked, PrUrl, WorkerSignal};

/// How many trailing lines tier 1.5/2 scans consider "the tail", to
/// avoid false positives from LLM-generated content earlier in the log
/// that merely *discusses* errors.
pub const TAIL_LINES: usize = 20;

/// How many trailing lines are shipped to the tier-3 AI arbitrator.
pub const ARBITRATION_TAIL_LINES: usize = 200;

pub fn tail(log: &str, n: usize) -> String {
    let lines: Vec<&str> = log.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

/// A line count excluding blank lines, used for the "substantive line
/// count is small" check in tier 1.5.
pub fn substantive_line_count(log: &str) -> usize {
    log.lines().filter(|l| !l.trim().is_empty()).count()
}

const BACKEND_INFRA_TOKENS: &[&str] =
    &["internal server error", "upstream connect error", "502 bad gateway", "503 service unavailable"];
const BILLING_TOKENS: &[&str] = &["insufficient credits", "billing", "payment required", "quota exceeded"];
const AUTH_TOKENS: &[&str] = &["permission denied", "401 unauthorized", "403 forbidden", "authentication failed"];
const MERGE_CONFLICT_TOKENS: &[&str] = &["conflict markers", "automatic merge failed", "merge conflict"];
const OOM_TOKENS: &[&str] = &["out of memory", "oom killed", "cannot allocate memory"];
const RATE_LIMIT_TOKENS: &[&str] = &["rate limit", "429 too many requests"];
const TIMEOUT_TOKENS: &[&str] = &["timed out", "deadline exceeded"];

fn tail_contains_any(tail: &str, tokens: &[&str]) -> bool {
    let lower = tail.to_lowercase();
    tokens.iter().any(|t| lower.contains(t))
}

pub fn tail_has_backend_infra_tokens(tail: &str) -> bool {
    tail_contains_any(tail, BACKEND_INFRA_TOKENS)
}
pub fn tail_has_billing_tokens(tail: &str) -> bool {
    tail_contains_any(tail, BILLING_TOKENS)
}
pub fn tail_has_auth_tokens(tail: &str) -> bool {
    tail_contains_any(tail, AUTH_TOKENS)
}
pub fn tail_has_merge_conflict_tokens(tail: &str) -> bool {
    tail_contains_any(tail, MERGE_CONFLICT_TOKENS)
}
pub fn tail_has_oom_tokens(tail: &str) -> bool {
    tail_contains_any(tail, OOM_TOKENS)
}
pub fn tail_has_rate_limit_tokens(tail: &str) -> bool {
    tail_contains_any(tail, RATE_LIMIT_TOKENS)
}
pub fn tail_has_timeout_tokens(tail: &str) -> bool {
    tail_contains_any(tail, TIMEOUT_TOKENS)
}

const OBSOLETE_PHRASES: &[&str] =
    &["already complete", "already done", "no changes needed", "nothing to do", "task is already satisfied"];

pub fn looks_obsolete(final_text: &str) -> bool {
    let lower = final_text.to_lowercase();
    OBSOLETE_PHRASES.iter().any(|p| lower.contains(p))
}

/// The startup sentinel `ProcessSupervisor` writes as the first line of
/// every log (spec §4.2's "startup-metadata prologue").
pub const STARTUP_SENTINEL: &str = "=== foreman worker start ===";

pub fn has_startup_sentinel(log: &str) -> bool {
    log.lines().next().map(|l| l.trim() == STARTUP_SENTINEL).unwrap_or(false)
}

/// The `EXIT:<code>` trailer `ProcessSupervisor`'s wrapper script
/// appends.
pub fn extract_exit_code(log: &str) -> Option<i32> {
    log.lines().rev().find_map(|l| l.strip_prefix("EXIT:")?.trim().parse().ok())
}

/// The worker's "final text output" per spec §4.6 tier 1 -- everything
/// after the startup prologue and before the `EXIT:` trailer, since the
/// log embeds generated content that may itself discuss errors and
/// must not be mistaken for the supervisor's own framing.
pub fn final_text_output(log: &str) -> &str {
    let without_prologue = log.strip_prefix(STARTUP_SENTINEL).unwrap_or(log);
    let end = without_prologue.rfind("\nEXIT:").unwrap_or(without_prologue.len());
    without_prologue[..end].trim()
}

/// Scan the worker's final text output for a recognised signal, a PR
/// URL, and a `BLOCKED:` line, all in one pass.
#[derive(Debug, Default)]
pub struct ParsedOutput {
    pub signal: Option<WorkerSignal>,
    pub pr_url: Option<PrUrl>,
    pub blocked_reason: Option<String>,
}

pub fn parse_final_output(final_text: &str) -> ParsedOutput {
    let mut out = ParsedOutput::default();
    for line in final_text.lines() {
        if out.signal.is_none() {
            out.signal = WorkerSignal::parse(line);
        }
        if out.pr_url.is_none() {
            out.pr_url = PrUrl::find_in(line);
        }
        if out.blocked_reason.is_none() {
            out.blocked_reason = parse_blocked(line).map(str::to_string);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_returns_last_n_lines_only() {
        let log = (1..=30).map(|n| format!("line {n}")).collect::<Vec<_>>().join("\n");
        let t = tail(&log, 5);
        assert_eq!(t.lines().count(), 5);
        assert!(t.starts_with("line 26"));
    }

    #[test]
    fn extracts_exit_trailer() {
        let log = "some output\nmore output\nEXIT:137\n";
        assert_eq!(extract_exit_code(log), Some(137));
    }

    #[test]
    fn final_text_excludes_prologue_and_trailer() {
        let log = format!("{STARTUP_SENTINEL}\ntask: t1\n\nHello world\nFULL_LOOP_COMPLETE\nEXIT:0\n");
        let text = final_text_output(&log);
        assert!(text.contains("FULL_LOOP_COMPLETE"));
        assert!(!text.contains("EXIT:0"));
    }

    #[test]
    fn parse_final_output_finds_signal_and_pr() {
        let text = "done.\nhttps://github.com/acme/svc/pull/9\nFULL_LOOP_COMPLETE";
        let parsed = parse_final_output(text);
        assert_eq!(parsed.signal, Some(WorkerSignal::FullLoopComplete));
        assert_eq!(parsed.pr_url.unwrap().number, 9);
    }

    #[test]
    fn obsolete_phrase_detection() {
        assert!(looks_obsolete("The task is already satisfied, nothing to do."));
        assert!(!looks_obsolete("Implemented the feature."));
    }
}
