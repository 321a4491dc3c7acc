//! Worker invocation and output contract (spec §6).
//!
//! `foreman`'s workers are opaque LLM CLI subprocesses: the core's only
//! contract with them is the command line it builds, the environment it
//! sets, and the sentinel vocabulary it looks for in their final text
//! output. Grounded on the teacher's `harness::types::MaterializedTask` /
//! `AgentHandle` shape, flattened from an in-process event-streaming model
//! (the teacher reads structured JSONL from a child it keeps open) to a
//! fire-and-forget supervised subprocess (`foreman`'s workers outlive the
//! pulse that spawned them).

use std::collections::HashMap;
use std::path::PathBuf;

/// Editing restrictions communicated to the worker in its prompt. The
/// worker may not touch the task file or planning files -- only
/// `TaskFileSync` writes those.
pub const PROMPT_EDITING_RESTRICTIONS: &str =
    "Do not edit the task list file or any planning files. Edit only the \
     files needed to implement the task.";

/// The uncertainty-decision policy embedded in every prompt: proceed on
/// reasonable judgment calls, but exit with `BLOCKED: <reason>` rather than
/// guessing on anything that would be unsafe to reverse.
pub const PROMPT_UNCERTAINTY_POLICY: &str =
    "If a requirement is ambiguous, make the most reasonable judgment call \
     and proceed. If you cannot proceed safely (e.g. you would need \
     destructive or irreversible actions to guess at intent), stop and \
     print a line starting with `BLOCKED: ` followed by the reason.";

/// A worker invocation: everything the core promises the worker per spec §6.
#[derive(Debug, Clone)]
pub struct WorkerInvocation {
    pub task_id: String,
    pub description: String,
    pub model: String,
    pub working_dir: PathBuf,
    pub verify_mode: bool,
    pub env_vars: HashMap<String, String>,
}

impl WorkerInvocation {
    /// Build the single prompt argument: task ID, headless flag, the task
    /// description, editing restrictions, uncertainty policy, and (for
    /// verify-mode dispatches) the instruction to check prior work first.
    pub fn prompt(&self) -> String {
        let mut sections = vec![
            format!("Task ID: {}", self.task_id),
            "Mode: headless".to_string(),
        ];

        if self.verify_mode {
            sections.push(
                "Before making any changes, check whether this task's goal is already \
                 satisfied by the current state of the repository. If so, print \
                 VERIFY_COMPLETE (with the existing PR URL if one covers it) and stop. \
                 If you cannot tell, print VERIFY_NOT_STARTED and stop rather than \
                 re-implementing from scratch."
                    .to_string(),
            );
        }

        sections.push(format!("Description:\n{}", self.description));
        sections.push(PROMPT_EDITING_RESTRICTIONS.to_string());
        sections.push(PROMPT_UNCERTAINTY_POLICY.to_string());
        sections.push(
            "Efficiency: prefer the smallest correct change; do not refactor unrelated code."
                .to_string(),
        );

        sections.join("\n\n")
    }

    /// Build the full environment, adding the headless sentinel and an
    /// isolated config directory (so each worker gets its own MCP/index
    /// cache rather than contending on a shared one).
    pub fn env(&self, isolated_config_dir: &std::path::Path) -> HashMap<String, String> {
        let mut env = self.env_vars.clone();
        env.insert("FOREMAN_HEADLESS".to_string(), "1".to_string());
        env.insert(
            "FOREMAN_CONFIG_DIR".to_string(),
            isolated_config_dir.to_string_lossy().into_owned(),
        );
        env
    }
}

/// A recognised sentinel in a worker's final text output (spec §6/§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerSignal {
    FullLoopComplete,
    TaskComplete,
    VerifyComplete,
    VerifyIncomplete,
    VerifyNotStarted,
}

impl WorkerSignal {
    /// Scan a line for any recognised sentinel, returning the first match.
    pub fn parse(line: &str) -> Option<Self> {
        if line.contains("FULL_LOOP_COMPLETE") {
            Some(Self::FullLoopComplete)
        } else if line.contains("VERIFY_COMPLETE") {
            Some(Self::VerifyComplete)
        } else if line.contains("VERIFY_INCOMPLETE") {
            Some(Self::VerifyIncomplete)
        } else if line.contains("VERIFY_NOT_STARTED") {
            Some(Self::VerifyNotStarted)
        } else if line.contains("TASK_COMPLETE") {
            Some(Self::TaskComplete)
        } else {
            None
        }
    }
}

/// A GitHub pull-request URL extracted from worker output: `https://github.com/<owner>/<repo>/pull/<n>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrUrl {
    pub owner: String,
    pub repo: String,
    pub number: u64,
    pub url: String,
}

impl PrUrl {
    /// Find the first GitHub PR URL in a block of text.
    pub fn find_in(text: &str) -> Option<Self> {
        for word in text.split_whitespace() {
            let word = word.trim_matches(|c: char| !c.is_alphanumeric() && c != '/' && c != ':' && c != '.' && c != '-');
            if let Some(pr) = Self::parse(word) {
                return Some(pr);
            }
        }
        None
    }

    fn parse(candidate: &str) -> Option<Self> {
        let rest = candidate.strip_prefix("https://github.com/")?;
        let mut parts = rest.splitn(4, '/');
        let owner = parts.next()?;
        let repo = parts.next()?;
        let marker = parts.next()?;
        let number_str = parts.next()?;
        if marker != "pull" || owner.is_empty() || repo.is_empty() {
            return None;
        }
        let number: u64 = number_str.parse().ok()?;
        Some(Self {
            owner: owner.to_string(),
            repo: repo.to_string(),
            number,
            url: candidate.to_string(),
        })
    }

    /// Word-boundary attribution check: does `haystack` (a PR title or
    /// head-branch name) mention `task_id` as a standalone token? Guards
    /// against `t195` matching inside `t1950` (spec §6).
    pub fn attributed_to(haystack: &str, task_id: &str) -> bool {
        haystack.split(|c: char| !c.is_alphanumeric() && c != '_').any(|tok| tok == task_id)
    }
}

/// An explicit `BLOCKED: <reason>` line from worker output.
pub fn parse_blocked(line: &str) -> Option<&str> {
    line.trim().strip_prefix("BLOCKED:").map(|s| s.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_includes_verify_mode_instructions() {
        let inv = WorkerInvocation {
            task_id: "t42".into(),
            description: "add retries".into(),
            model: "sonnet".into(),
            working_dir: "/tmp".into(),
            verify_mode: true,
            env_vars: HashMap::new(),
        };
        assert!(inv.prompt().contains("VERIFY_NOT_STARTED"));
    }

    #[test]
    fn signal_parse_prefers_first_recognised() {
        assert_eq!(
            WorkerSignal::parse("all done: FULL_LOOP_COMPLETE"),
            Some(WorkerSignal::FullLoopComplete)
        );
        assert_eq!(WorkerSignal::parse("nothing here"), None);
    }

    #[test]
    fn pr_url_parses_and_extracts_fields() {
        let pr = PrUrl::find_in("see https://github.com/acme/svc/pull/101 for details").unwrap();
        assert_eq!(pr.owner, "acme");
        assert_eq!(pr.repo, "svc");
        assert_eq!(pr.number, 101);
    }

    #[test]
    fn attribution_guard_rejects_substring_id() {
        assert!(PrUrl::attributed_to("t195: add retry", "t195"));
        assert!(!PrUrl::attributed_to("t1950: unrelated", "t195"));
    }

    #[test]
    fn blocked_line_is_extracted() {
        assert_eq!(parse_blocked("BLOCKED: missing credentials"), Some("missing credentials"));
        assert_eq!(parse_blocked("not blocked"), None);
    }
}
