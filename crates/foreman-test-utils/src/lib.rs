//! Shared test utilities for foreman integration tests.
//!
//! Each test gets its own on-disk SQLite database in a fresh temp
//! directory, with migrations already applied. There is no shared server
//! to stand up, so unlike a Postgres-backed test harness this pays only
//! the cost of a single file create + migration run per test.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tempfile::TempDir;

use foreman_db::pool;

use foreman_core::vcs::{PrSnapshot, RebaseOutcome, ReviewDecision, VcsError, VcsHost};

/// A temporary SQLite-backed store for a single test.
///
/// Keeps the backing [`TempDir`] alive for the lifetime of the handle;
/// the directory (and the `.db`/`-wal`/`-shm` files in it) is removed on
/// drop.
pub struct TestStore {
    pub pool: SqlitePool,
    _dir: TempDir,
}

impl TestStore {
    pub fn path(&self) -> &std::path::Path {
        self._dir.path()
    }
}

/// Create a temporary SQLite store with migrations applied.
pub async fn create_test_db() -> TestStore {
    let dir = tempfile::tempdir().expect("failed to create temp dir for test db");
    let db_path = dir.path().join("foreman_test.db");

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(pool::connect_options(&db_path, Duration::from_secs(5)))
        .await
        .unwrap_or_else(|e| panic!("failed to open temp sqlite db {db_path:?}: {e}"));

    pool::run_migrations(&pool)
        .await
        .expect("migrations should succeed");

    TestStore { pool, _dir: dir }
}

/// In-memory state for one fake pull request, configurable by tests
/// before exercising `PRLifecycleEngine` logic against it.
#[derive(Debug, Clone)]
pub struct FakePr {
    pub snapshot: PrSnapshot,
    pub merged: bool,
    pub closed: bool,
}

/// An in-memory [`VcsHost`] double, mirroring the teacher's
/// `NoopHarness`/`FakeHarness` convention: no subprocess, no network,
/// fully inspectable state for assertions.
#[derive(Default)]
pub struct FakeVcsHost {
    inner: Mutex<FakeVcsHostState>,
}

#[derive(Default)]
struct FakeVcsHostState {
    prs: HashMap<u64, FakePr>,
    next_pr_number: u64,
    worktrees: HashMap<String, PathBuf>,
    dirty: HashMap<PathBuf, bool>,
    commits_ahead: HashMap<String, u32>,
    pushed_branches: Vec<String>,
    merged_evidence: HashMap<String, String>,
    rebase_conflicts: std::collections::HashSet<String>,
    changed_files: HashMap<u64, Vec<String>>,
}

impl FakeVcsHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a PR as it would appear after `open_pr`/`pr_snapshot`.
    pub fn seed_pr(&self, snapshot: PrSnapshot) {
        let mut state = self.inner.lock().unwrap();
        let number = snapshot.number;
        state.next_pr_number = state.next_pr_number.max(number + 1);
        state.prs.insert(number, FakePr { snapshot, merged: false, closed: false });
    }

    /// Mark a review decision on an already-seeded PR.
    pub fn set_review_decision(&self, pr_number: u64, decision: Option<ReviewDecision>) {
        let mut state = self.inner.lock().unwrap();
        if let Some(pr) = state.prs.get_mut(&pr_number) {
            pr.snapshot.review_decision = decision;
        }
    }

    pub fn set_dirty(&self, worktree_path: &Path, dirty: bool) {
        self.inner.lock().unwrap().dirty.insert(worktree_path.to_path_buf(), dirty);
    }

    pub fn set_commits_ahead(&self, branch_name: &str, count: u32) {
        self.inner.lock().unwrap().commits_ahead.insert(branch_name.to_string(), count);
    }

    pub fn set_merged_evidence(&self, task_id: &str, pr_url: &str) {
        self.inner.lock().unwrap().merged_evidence.insert(task_id.to_string(), pr_url.to_string());
    }

    pub fn is_merged(&self, pr_number: u64) -> bool {
        self.inner.lock().unwrap().prs.get(&pr_number).map(|pr| pr.merged).unwrap_or(false)
    }

    pub fn is_closed(&self, pr_number: u64) -> bool {
        self.inner.lock().unwrap().prs.get(&pr_number).map(|pr| pr.closed).unwrap_or(false)
    }

    pub fn pushed_branches(&self) -> Vec<String> {
        self.inner.lock().unwrap().pushed_branches.clone()
    }

    /// Force the next rebase of `branch_name` to report a conflict.
    pub fn set_rebase_conflict(&self, branch_name: &str) {
        self.inner.lock().unwrap().rebase_conflicts.insert(branch_name.to_string());
    }

    /// Seed the file list `changed_files` will report for a PR.
    pub fn set_changed_files(&self, pr_number: u64, files: Vec<String>) {
        self.inner.lock().unwrap().changed_files.insert(pr_number, files);
    }
}

#[async_trait]
impl VcsHost for FakeVcsHost {
    async fn fetch_base(&self, _repo_path: &Path, _base_branch: &str) -> Result<(), VcsError> {
        Ok(())
    }

    fn create_worktree(&self, branch_name: &str) -> Result<PathBuf, VcsError> {
        let mut state = self.inner.lock().unwrap();
        let path = PathBuf::from(format!("/tmp/fake-worktrees/{}", branch_name.replace('/', "--")));
        state.worktrees.insert(branch_name.to_string(), path.clone());
        Ok(path)
    }

    fn remove_worktree(&self, worktree_path: &Path, branch_name: &str) -> Result<(), VcsError> {
        let mut state = self.inner.lock().unwrap();
        state.worktrees.remove(branch_name);
        state.dirty.remove(worktree_path);
        Ok(())
    }

    fn commits_ahead(&self, _worktree_path: &Path, _base_branch: &str, branch_name: &str) -> Result<u32, VcsError> {
        Ok(self.inner.lock().unwrap().commits_ahead.get(branch_name).copied().unwrap_or(0))
    }

    fn working_tree_dirty(&self, worktree_path: &Path) -> Result<bool, VcsError> {
        Ok(self.inner.lock().unwrap().dirty.get(worktree_path).copied().unwrap_or(false))
    }

    async fn push_branch(&self, _worktree_path: &Path, branch_name: &str) -> Result<(), VcsError> {
        self.inner.lock().unwrap().pushed_branches.push(branch_name.to_string());
        Ok(())
    }

    async fn open_pr(
        &self,
        _repo_path: &Path,
        branch_name: &str,
        base_branch: &str,
        title: &str,
        _body: &str,
        draft: bool,
    ) -> Result<PrSnapshot, VcsError> {
        let mut state = self.inner.lock().unwrap();
        let number = state.next_pr_number;
        state.next_pr_number += 1;
        let snapshot = PrSnapshot {
            url: format!("https://github.com/fake/repo/pull/{number}"),
            number,
            state: "OPEN".to_string(),
            draft,
            review_decision: None,
            mergeable: Some("MERGEABLE".to_string()),
            merge_state_status: Some("CLEAN".to_string()),
            base_ref_name: base_branch.to_string(),
            head_ref_name: branch_name.to_string(),
            title: title.to_string(),
        };
        state.prs.insert(number, FakePr { snapshot: snapshot.clone(), merged: false, closed: false });
        Ok(snapshot)
    }

    async fn pr_snapshot(&self, _repo_path: &Path, pr_number: u64) -> Result<PrSnapshot, VcsError> {
        self.inner
            .lock()
            .unwrap()
            .prs
            .get(&pr_number)
            .map(|pr| pr.snapshot.clone())
            .ok_or_else(|| VcsError::ParseError(format!("no fake PR #{pr_number}")))
    }

    async fn merge_pr(&self, _repo_path: &Path, pr_number: u64) -> Result<(), VcsError> {
        let mut state = self.inner.lock().unwrap();
        let pr = state
            .prs
            .get_mut(&pr_number)
            .ok_or_else(|| VcsError::ParseError(format!("no fake PR #{pr_number}")))?;
        pr.merged = true;
        pr.snapshot.state = "MERGED".to_string();
        Ok(())
    }

    async fn close_pr(&self, _repo_path: &Path, pr_number: u64) -> Result<(), VcsError> {
        let mut state = self.inner.lock().unwrap();
        let pr = state
            .prs
            .get_mut(&pr_number)
            .ok_or_else(|| VcsError::ParseError(format!("no fake PR #{pr_number}")))?;
        pr.closed = true;
        pr.snapshot.state = "CLOSED".to_string();
        Ok(())
    }

    async fn promote_draft(&self, _repo_path: &Path, pr_number: u64) -> Result<(), VcsError> {
        let mut state = self.inner.lock().unwrap();
        if let Some(pr) = state.prs.get_mut(&pr_number) {
            pr.snapshot.draft = false;
        }
        Ok(())
    }

    async fn dismiss_reviews(&self, _repo_path: &Path, pr_number: u64, _message: &str) -> Result<(), VcsError> {
        let mut state = self.inner.lock().unwrap();
        if let Some(pr) = state.prs.get_mut(&pr_number) {
            pr.snapshot.review_decision = None;
        }
        Ok(())
    }

    async fn rebase_onto_base(&self, worktree_path: &Path, _base_branch: &str) -> Result<RebaseOutcome, VcsError> {
        let state = self.inner.lock().unwrap();
        let branch_name = state.worktrees.iter().find(|(_, p)| p.as_path() == worktree_path).map(|(b, _)| b.clone());
        if let Some(branch) = branch_name {
            if state.rebase_conflicts.contains(&branch) {
                return Ok(RebaseOutcome::Conflict { details: "fake conflict".to_string() });
            }
        }
        Ok(RebaseOutcome::Clean)
    }

    async fn force_push_branch(&self, _worktree_path: &Path, branch_name: &str) -> Result<(), VcsError> {
        self.inner.lock().unwrap().pushed_branches.push(branch_name.to_string());
        Ok(())
    }

    async fn merged_evidence_for(&self, _repo_path: &Path, task_id: &str) -> Result<Option<String>, VcsError> {
        Ok(self.inner.lock().unwrap().merged_evidence.get(task_id).cloned())
    }

    async fn changed_files(&self, _repo_path: &Path, pr_number: u64) -> Result<Vec<String>, VcsError> {
        Ok(self.inner.lock().unwrap().changed_files.get(&pr_number).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_vcs_host_open_then_merge_round_trip() {
        let host = FakeVcsHost::new();
        let snap = host
            .open_pr(Path::new("/repo"), "foreman/t1", "main", "t1: fix thing", "body", false)
            .await
            .unwrap();
        assert!(!host.is_merged(snap.number));
        host.merge_pr(Path::new("/repo"), snap.number).await.unwrap();
        assert!(host.is_merged(snap.number));
    }
}
