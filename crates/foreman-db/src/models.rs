use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a task.
///
/// `is_terminal` follows the closed set named in the spec's invariants
/// (`complete, deployed, verified, verify_failed, failed, cancelled,
/// blocked`); `complete` can still be advanced by the PR lifecycle engine
/// when the task carries a PR, but absent one it is a resting state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Dispatched,
    Running,
    Evaluating,
    Complete,
    Retrying,
    Blocked,
    Failed,
    PrReview,
    ReviewTriage,
    ReviewWaiting,
    Merging,
    Merged,
    Deploying,
    Deployed,
    Verifying,
    Verified,
    VerifyFailed,
    Cancelled,
}

impl TaskStatus {
    /// Whether this status is one of the rest states named by the spec's
    /// invariants. See the struct-level note: `Complete` is listed here
    /// even though a PR-bearing task continues past it.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Complete
                | Self::Deployed
                | Self::Verified
                | Self::VerifyFailed
                | Self::Failed
                | Self::Cancelled
                | Self::Blocked
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Dispatched => "dispatched",
            Self::Running => "running",
            Self::Evaluating => "evaluating",
            Self::Complete => "complete",
            Self::Retrying => "retrying",
            Self::Blocked => "blocked",
            Self::Failed => "failed",
            Self::PrReview => "pr_review",
            Self::ReviewTriage => "review_triage",
            Self::ReviewWaiting => "review_waiting",
            Self::Merging => "merging",
            Self::Merged => "merged",
            Self::Deploying => "deploying",
            Self::Deployed => "deployed",
            Self::Verifying => "verifying",
            Self::Verified => "verified",
            Self::VerifyFailed => "verify_failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "dispatched" => Ok(Self::Dispatched),
            "running" => Ok(Self::Running),
            "evaluating" => Ok(Self::Evaluating),
            "complete" => Ok(Self::Complete),
            "retrying" => Ok(Self::Retrying),
            "blocked" => Ok(Self::Blocked),
            "failed" => Ok(Self::Failed),
            "pr_review" => Ok(Self::PrReview),
            "review_triage" => Ok(Self::ReviewTriage),
            "review_waiting" => Ok(Self::ReviewWaiting),
            "merging" => Ok(Self::Merging),
            "merged" => Ok(Self::Merged),
            "deploying" => Ok(Self::Deploying),
            "deployed" => Ok(Self::Deployed),
            "verifying" => Ok(Self::Verifying),
            "verified" => Ok(Self::Verified),
            "verify_failed" => Ok(Self::VerifyFailed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Classification tag attached to every recorded failure.
///
/// `Transient` and `Environment` failures do not consume the task's
/// retry counter (see `RetryController`); the others do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    Transient,
    Resource,
    Environment,
    Logic,
    Blocked,
    Ambiguous,
}

impl FailureMode {
    /// Transient and environment failures are the two categories the
    /// spec says must not consume the task's retry budget.
    pub fn consumes_retry_budget(self) -> bool {
        !matches!(self, Self::Transient | Self::Environment)
    }
}

impl fmt::Display for FailureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Transient => "transient",
            Self::Resource => "resource",
            Self::Environment => "environment",
            Self::Logic => "logic",
            Self::Blocked => "blocked",
            Self::Ambiguous => "ambiguous",
        };
        f.write_str(s)
    }
}

impl FromStr for FailureMode {
    type Err = FailureModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transient" => Ok(Self::Transient),
            "resource" => Ok(Self::Resource),
            "environment" => Ok(Self::Environment),
            "logic" => Ok(Self::Logic),
            "blocked" => Ok(Self::Blocked),
            "ambiguous" => Ok(Self::Ambiguous),
            other => Err(FailureModeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`FailureMode`] string.
#[derive(Debug, Clone)]
pub struct FailureModeParseError(pub String);

impl fmt::Display for FailureModeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid failure mode: {:?}", self.0)
    }
}

impl std::error::Error for FailureModeParseError {}

// ---------------------------------------------------------------------------

/// Release type a batch cuts on completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ReleaseType {
    Major,
    Minor,
    Patch,
}

impl fmt::Display for ReleaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Major => "major",
            Self::Minor => "minor",
            Self::Patch => "patch",
        };
        f.write_str(s)
    }
}

impl FromStr for ReleaseType {
    type Err = ReleaseTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "major" => Ok(Self::Major),
            "minor" => Ok(Self::Minor),
            "patch" => Ok(Self::Patch),
            other => Err(ReleaseTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ReleaseType`] string.
#[derive(Debug, Clone)]
pub struct ReleaseTypeParseError(pub String);

impl fmt::Display for ReleaseTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid release type: {:?}", self.0)
    }
}

impl std::error::Error for ReleaseTypeParseError {}

// ---------------------------------------------------------------------------

/// Status of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Active,
    Paused,
    Complete,
    Cancelled,
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Complete => "complete",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for BatchStatus {
    type Err = BatchStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "complete" => Ok(Self::Complete),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(BatchStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`BatchStatus`] string.
#[derive(Debug, Clone)]
pub struct BatchStatusParseError(pub String);

impl fmt::Display for BatchStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid batch status: {:?}", self.0)
    }
}

impl std::error::Error for BatchStatusParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A task -- the unit of work the orchestrator schedules.
///
/// Identity is a stable string ID (e.g. `t42`), matching the human-edited
/// task-file surface the task originates from.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: String,
    pub repo_path: String,
    pub description: String,
    pub status: TaskStatus,
    pub model: Option<String>,
    pub retries: i32,
    pub max_retries: i32,
    pub escalation_depth: i32,
    pub max_escalation: i32,
    pub rebase_attempts: i32,
    pub deploy_recovery_attempts: i32,
    pub session: Option<String>,
    pub worktree: Option<String>,
    pub branch: Option<String>,
    pub log_file: Option<String>,
    pub pr_url: Option<String>,
    pub parent_issue_url: Option<String>,
    pub diagnostic_of: Option<String>,
    pub triage_result: Option<String>,
    pub claim_owner: Option<String>,
    pub claim_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Invariant 1 from the testable-properties section: retries and
    /// escalation depth must never exceed their configured ceilings.
    pub fn within_budget(&self) -> bool {
        self.retries <= self.max_retries && self.escalation_depth <= self.max_escalation
    }
}

/// A cohort of tasks sharing a concurrency budget.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Batch {
    pub id: String,
    pub name: String,
    pub base_concurrency: i32,
    pub hard_ceiling: Option<i32>,
    pub load_factor: f64,
    pub release_on_complete: bool,
    pub release_type: Option<ReleaseType>,
    pub skip_quality_gate: bool,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
}

/// Join row linking a task to a batch, ordered by position.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BatchTask {
    pub batch_id: String,
    pub task_id: String,
    pub position: i32,
}

/// Append-only audit record of a single state transition.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StateLogEntry {
    pub id: i64,
    pub task_id: String,
    pub from_state: Option<String>,
    pub to_state: String,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Append-only evidence record justifying a terminal transition or a
/// PR-lifecycle decision.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ProofLogEntry {
    pub id: i64,
    pub task_id: String,
    pub event: String,
    pub stage: String,
    pub decision: Option<String>,
    pub evidence: Option<serde_json::Value>,
    pub decided_by: String,
    pub pr_url: Option<String>,
    pub duration_ms: Option<i64>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
