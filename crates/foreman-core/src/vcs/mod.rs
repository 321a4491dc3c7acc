//! Git/GitHub capability boundary (spec §2 A2, out-of-scope collaborator
//! "the git/GitHub command surface (treated as a capability the core
//! consumes)").
//!
//! An object-safe [`VcsHost`] trait with one production implementation
//! shelling to `git` and `gh`, grounded on `worktree::WorktreeManager`'s
//! `Command`-based style and `lifecycle::commit_agent_work`'s git
//! add/commit pattern.

use std::path::{Path, PathBuf};
use std::process::Command;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::worktree::{WorktreeError, WorktreeManager};

#[derive(Debug, Error)]
pub enum VcsError {
    #[error("git command failed: {0}")]
    Git(#[from] WorktreeError),

    #[error("gh command failed ({command}): {stderr}")]
    Gh { command: String, stderr: String },

    #[error("failed to parse gh output: {0}")]
    ParseError(String),

    #[error("failed to spawn subprocess: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Outcome of rebasing a branch onto the base branch, mirroring
/// [`crate::worktree::MergeResult`]'s clean/conflict split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebaseOutcome {
    Clean,
    Conflict { details: String },
}

/// Review decision for a pull request, as reported by the GitHub API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewDecision {
    Approved,
    ChangesRequested,
    ReviewRequired,
}

/// A structured snapshot of a pull request's current GitHub state, as
/// gathered by `PRLifecycleEngine`'s step 1 (spec §4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrSnapshot {
    pub url: String,
    pub number: u64,
    pub state: String,
    #[serde(rename = "isDraft")]
    pub draft: bool,
    #[serde(rename = "reviewDecision")]
    pub review_decision: Option<ReviewDecision>,
    pub mergeable: Option<String>,
    #[serde(rename = "mergeStateStatus")]
    pub merge_state_status: Option<String>,
    #[serde(rename = "baseRefName")]
    pub base_ref_name: String,
    #[serde(rename = "headRefName")]
    pub head_ref_name: String,
    pub title: String,
}

/// Capability surface the core consumes to drive git/GitHub, without
/// reimplementing either. Object-safe so it can be boxed and a
/// `FakeVcsHost` test double substituted in `foreman-test-utils`.
#[async_trait]
pub trait VcsHost: Send + Sync {
    /// Fetch and fast-forward the base branch (post-merge sequence step 1).
    async fn fetch_base(&self, repo_path: &Path, base_branch: &str) -> Result<(), VcsError>;

    /// Create an isolated worktree rooted at a fresh base-branch snapshot.
    fn create_worktree(&self, branch_name: &str) -> Result<PathBuf, VcsError>;

    /// Remove a worktree and delete its branch.
    fn remove_worktree(&self, worktree_path: &Path, branch_name: &str) -> Result<(), VcsError>;

    /// Count commits on `branch_name` ahead of `base_branch`.
    fn commits_ahead(&self, worktree_path: &Path, base_branch: &str, branch_name: &str) -> Result<u32, VcsError>;

    /// Whether the worktree has uncommitted changes.
    fn working_tree_dirty(&self, worktree_path: &Path) -> Result<bool, VcsError>;

    /// Push a branch to the configured remote, rewriting SSH remotes to
    /// HTTPS first (a detached worker cannot access SSH keys, spec §4.5
    /// step 7).
    async fn push_branch(&self, worktree_path: &Path, branch_name: &str) -> Result<(), VcsError>;

    /// Open a (possibly draft) PR from `branch_name` against `base_branch`.
    async fn open_pr(
        &self,
        repo_path: &Path,
        branch_name: &str,
        base_branch: &str,
        title: &str,
        body: &str,
        draft: bool,
    ) -> Result<PrSnapshot, VcsError>;

    /// Gather the full GitHub-side snapshot of a PR (spec §4.8 step 1).
    async fn pr_snapshot(&self, repo_path: &Path, pr_number: u64) -> Result<PrSnapshot, VcsError>;

    /// Merge a PR (squash merge, matching the teacher's `merge_cmd`
    /// single-commit-per-task convention).
    async fn merge_pr(&self, repo_path: &Path, pr_number: u64) -> Result<(), VcsError>;

    /// Close a PR without merging.
    async fn close_pr(&self, repo_path: &Path, pr_number: u64) -> Result<(), VcsError>;

    /// Mark a draft PR ready for review.
    async fn promote_draft(&self, repo_path: &Path, pr_number: u64) -> Result<(), VcsError>;

    /// Dismiss all reviews on a PR (used when a fix-and-push action
    /// invalidates a prior `CHANGES_REQUESTED` review).
    async fn dismiss_reviews(&self, repo_path: &Path, pr_number: u64, message: &str) -> Result<(), VcsError>;

    /// Rebase the branch checked out in `worktree_path` onto the latest
    /// `base_branch` (post-merge sibling-rebase step, spec §4.8). Aborts
    /// and reports `Conflict` rather than leaving the worktree mid-rebase.
    async fn rebase_onto_base(&self, worktree_path: &Path, base_branch: &str) -> Result<RebaseOutcome, VcsError>;

    /// Force-push a rebased branch (rewritten history requires
    /// `--force-with-lease` rather than the fast-forward-only push used
    /// for a fresh branch).
    async fn force_push_branch(&self, worktree_path: &Path, branch_name: &str) -> Result<(), VcsError>;

    /// Search the repository's merged-PR history for a reference to
    /// `task_id` (Dispatcher step 2, the prior-completion guard).
    async fn merged_evidence_for(&self, repo_path: &Path, task_id: &str) -> Result<Option<String>, VcsError>;

    /// List the files a PR touches (post-deploy verification-queue
    /// population, spec §4.9).
    async fn changed_files(&self, repo_path: &Path, pr_number: u64) -> Result<Vec<String>, VcsError>;
}

/// Production [`VcsHost`] shelling to `git` and `gh`.
pub struct CliVcsHost {
    worktrees: WorktreeManager,
}

impl CliVcsHost {
    pub fn new(worktrees: WorktreeManager) -> Self {
        Self { worktrees }
    }

    fn run_gh(repo_path: &Path, args: &[&str]) -> Result<String, VcsError> {
        let output = Command::new("gh")
            .args(args)
            .current_dir(repo_path)
            .output()
            .map_err(VcsError::Spawn)?;

        if !output.status.success() {
            return Err(VcsError::Gh {
                command: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn run_git(repo_path: &Path, args: &[&str]) -> Result<String, VcsError> {
        let output = Command::new("git")
            .args(args)
            .current_dir(repo_path)
            .output()
            .map_err(VcsError::Spawn)?;

        if !output.status.success() {
            return Err(VcsError::Gh {
                command: format!("git {}", args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Rewrite an SSH remote URL to HTTPS (spec §4.5 step 7).
    pub fn rewrite_ssh_remote_to_https(url: &str) -> Option<String> {
        let rest = url.strip_prefix("git@github.com:")?;
        let rest = rest.strip_suffix(".git").unwrap_or(rest);
        Some(format!("https://github.com/{rest}.git"))
    }

    const PR_JSON_FIELDS: &'static str =
        "url,number,state,isDraft,reviewDecision,mergeable,mergeStateStatus,baseRefName,headRefName,title";
}

#[async_trait]
impl VcsHost for CliVcsHost {
    async fn fetch_base(&self, repo_path: &Path, base_branch: &str) -> Result<(), VcsError> {
        Self::run_git(repo_path, &["fetch", "origin", base_branch])?;
        Ok(())
    }

    fn create_worktree(&self, branch_name: &str) -> Result<PathBuf, VcsError> {
        Ok(self.worktrees.create_worktree(branch_name)?.path)
    }

    fn remove_worktree(&self, worktree_path: &Path, branch_name: &str) -> Result<(), VcsError> {
        self.worktrees.remove_worktree(worktree_path)?;
        let _ = self.worktrees.delete_branch(branch_name);
        Ok(())
    }

    fn commits_ahead(&self, worktree_path: &Path, base_branch: &str, branch_name: &str) -> Result<u32, VcsError> {
        Ok(self.worktrees.commits_ahead(worktree_path, base_branch, branch_name)?)
    }

    fn working_tree_dirty(&self, worktree_path: &Path) -> Result<bool, VcsError> {
        Ok(self.worktrees.has_uncommitted_changes(worktree_path)?)
    }

    async fn push_branch(&self, worktree_path: &Path, branch_name: &str) -> Result<(), VcsError> {
        let remote = Self::run_git(worktree_path, &["remote", "get-url", "origin"])?;
        if let Some(https) = Self::rewrite_ssh_remote_to_https(remote.trim()) {
            Self::run_git(worktree_path, &["remote", "set-url", "origin", &https])?;
        }
        Self::run_git(worktree_path, &["push", "-u", "origin", branch_name])?;
        Ok(())
    }

    async fn open_pr(
        &self,
        repo_path: &Path,
        branch_name: &str,
        base_branch: &str,
        title: &str,
        body: &str,
        draft: bool,
    ) -> Result<PrSnapshot, VcsError> {
        let mut args = vec![
            "pr", "create", "--head", branch_name, "--base", base_branch, "--title", title, "--body", body,
        ];
        if draft {
            args.push("--draft");
        }
        let url = Self::run_gh(repo_path, &args)?;
        let number = url
            .trim()
            .rsplit('/')
            .next()
            .and_then(|n| n.parse::<u64>().ok())
            .ok_or_else(|| VcsError::ParseError(format!("could not parse PR number from: {url}")))?;
        self.pr_snapshot(repo_path, number).await
    }

    async fn pr_snapshot(&self, repo_path: &Path, pr_number: u64) -> Result<PrSnapshot, VcsError> {
        let number = pr_number.to_string();
        let json = Self::run_gh(
            repo_path,
            &["pr", "view", &number, "--json", Self::PR_JSON_FIELDS],
        )?;
        serde_json::from_str(&json).map_err(|e| VcsError::ParseError(e.to_string()))
    }

    async fn merge_pr(&self, repo_path: &Path, pr_number: u64) -> Result<(), VcsError> {
        let number = pr_number.to_string();
        Self::run_gh(repo_path, &["pr", "merge", &number, "--squash", "--delete-branch"])?;
        Ok(())
    }

    async fn close_pr(&self, repo_path: &Path, pr_number: u64) -> Result<(), VcsError> {
        let number = pr_number.to_string();
        Self::run_gh(repo_path, &["pr", "close", &number])?;
        Ok(())
    }

    async fn promote_draft(&self, repo_path: &Path, pr_number: u64) -> Result<(), VcsError> {
        let number = pr_number.to_string();
        Self::run_gh(repo_path, &["pr", "ready", &number])?;
        Ok(())
    }

    async fn dismiss_reviews(&self, repo_path: &Path, pr_number: u64, message: &str) -> Result<(), VcsError> {
        let number = pr_number.to_string();
        Self::run_gh(
            repo_path,
            &["pr", "comment", &number, "--body", message],
        )?;
        Ok(())
    }

    async fn rebase_onto_base(&self, worktree_path: &Path, base_branch: &str) -> Result<RebaseOutcome, VcsError> {
        Self::run_git(worktree_path, &["fetch", "origin", base_branch])?;
        let origin_ref = format!("origin/{base_branch}");
        match Self::run_git(worktree_path, &["rebase", &origin_ref]) {
            Ok(_) => Ok(RebaseOutcome::Clean),
            Err(e) => {
                let _ = Self::run_git(worktree_path, &["rebase", "--abort"]);
                Ok(RebaseOutcome::Conflict { details: e.to_string() })
            }
        }
    }

    async fn force_push_branch(&self, worktree_path: &Path, branch_name: &str) -> Result<(), VcsError> {
        Self::run_git(worktree_path, &["push", "--force-with-lease", "origin", branch_name])?;
        Ok(())
    }

    async fn merged_evidence_for(&self, repo_path: &Path, task_id: &str) -> Result<Option<String>, VcsError> {
        let query = format!("{task_id} in:title,body is:merged");
        let json = Self::run_gh(
            repo_path,
            &["pr", "list", "--search", &query, "--state", "merged", "--json", "url,title"],
        )?;
        let rows: Vec<serde_json::Value> =
            serde_json::from_str(&json).map_err(|e| VcsError::ParseError(e.to_string()))?;
        for row in rows {
            let title = row.get("title").and_then(|v| v.as_str()).unwrap_or("");
            if crate::worker::PrUrl::attributed_to(title, task_id) {
                return Ok(row.get("url").and_then(|v| v.as_str()).map(String::from));
            }
        }
        Ok(None)
    }

    async fn changed_files(&self, repo_path: &Path, pr_number: u64) -> Result<Vec<String>, VcsError> {
        let number = pr_number.to_string();
        let json = Self::run_gh(repo_path, &["pr", "view", &number, "--json", "files"])?;
        let value: serde_json::Value = serde_json::from_str(&json).map_err(|e| VcsError::ParseError(e.to_string()))?;
        let files = value
            .get("files")
            .and_then(|f| f.as_array())
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| row.get("path").and_then(|p| p.as_str()).map(String::from))
                    .collect()
            })
            .unwrap_or_default();
        Ok(files)
    }
}
