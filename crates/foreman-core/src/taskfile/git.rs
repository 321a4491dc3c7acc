//! Commit-and-push helper for the task file (spec §4.9: "Each operation
//! commits and pushes with a pull-rebase retry loop tolerating concurrent
//! worker pushes").
//!
//! Grounded on `lifecycle::commit_agent_work`'s git add/commit shelling
//! pattern, extended with a bounded `pull --rebase` / push retry loop
//! since, unlike a worker's private branch, the task file lives on a
//! shared branch multiple pulses and workers push to concurrently.

use std::path::Path;
use std::process::Command;

use anyhow::{bail, Context, Result};
use tracing::{debug, warn};

/// Commit the task file (and any sibling queue file) and push, retrying
/// through a `pull --rebase` on a non-fast-forward rejection.
pub fn commit_and_push(repo_path: &Path, file_paths: &[&Path], message: &str, max_attempts: u32) -> Result<bool> {
    if !any_dirty(repo_path, file_paths)? {
        return Ok(false);
    }

    for path in file_paths {
        run_git(repo_path, &["add", "--", &path.to_string_lossy()])?;
    }

    let output = Command::new("git")
        .args(["commit", "-m", message])
        .current_dir(repo_path)
        .output()
        .context("failed to run git commit")?;
    if !output.status.success() {
        bail!("git commit failed: {}", String::from_utf8_lossy(&output.stderr));
    }

    for attempt in 1..=max_attempts {
        let push = Command::new("git").args(["push"]).current_dir(repo_path).output().context("failed to run git push")?;
        if push.status.success() {
            return Ok(true);
        }

        let stderr = String::from_utf8_lossy(&push.stderr);
        if attempt == max_attempts {
            bail!("git push failed after {max_attempts} attempts: {stderr}");
        }

        warn!(attempt, %stderr, "task file push rejected, pulling and rebasing before retry");
        run_git(repo_path, &["pull", "--rebase"]).context("failed to pull --rebase before push retry")?;
    }

    Ok(true)
}

fn any_dirty(repo_path: &Path, file_paths: &[&Path]) -> Result<bool> {
    let mut cmd = Command::new("git");
    cmd.arg("status").arg("--porcelain").arg("--").current_dir(repo_path);
    for path in file_paths {
        cmd.arg(path);
    }
    let output = cmd.output().context("failed to run git status")?;
    let dirty = !String::from_utf8_lossy(&output.stdout).trim().is_empty();
    debug!(dirty, "task file dirty check");
    Ok(dirty)
}

fn run_git(repo_path: &Path, args: &[&str]) -> Result<()> {
    let output = Command::new("git").args(args).current_dir(repo_path).output().with_context(|| format!("failed to run git {}", args.join(" ")))?;
    if !output.status.success() {
        bail!("git {} failed: {}", args.join(" "), String::from_utf8_lossy(&output.stderr));
    }
    Ok(())
}
