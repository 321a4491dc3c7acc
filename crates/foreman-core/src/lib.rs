//! Core orchestration logic for the `foreman` supervisor: state machine,
//! worker invocation contract, VCS/GitHub capability, dispatch, evaluation,
//! retry/escalation, and PR lifecycle. See the top-level crate for the
//! pulse driver and CLI that wire these together.

pub mod advisor;
pub mod dispatch;
pub mod evaluate;
pub mod pr_lifecycle;
pub mod pulse;
pub mod retry;
pub mod router;
pub mod state;
pub mod supervisor;
pub mod taskfile;
pub mod vcs;
pub mod worker;
pub mod worktree;
