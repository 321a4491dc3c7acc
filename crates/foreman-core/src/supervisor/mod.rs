//! ProcessSupervisor (spec §4.2): spawns, tracks, and reaps worker
//! subprocesses, and owns per-task PID and log files.
//!
//! Grounded on the teacher's `ClaudeCodeAdapter` spawn/kill pattern
//! (`tokio::process::Command`, `libc::kill` SIGTERM-then-SIGKILL), but
//! generalized: `foreman`'s workers are opaque CLIs that outlive the
//! pulse that spawned them, so every spawn is interposed through a
//! supervisory wrapper script that traps TERM/INT and kills the whole
//! process group, and the child is detached into its own session rather
//! than kept open for streaming.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn worker: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("could not create or write log file {path}: {source}")]
    LogUnwritable { path: PathBuf, #[source] source: std::io::Error },
}

/// A prepared worker invocation: the command vector and the directory to
/// run it in. Building this is the caller's (Dispatcher's) job; this
/// module only spawns, probes, and reaps it.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub task_id: String,
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
}

/// A spawned worker's session handle, as recorded on the task row.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub pid: u32,
    pub log_file: PathBuf,
    pub pid_file: PathBuf,
}

/// Owns the `$SUPERVISOR_DIR/logs` and `$SUPERVISOR_DIR/pids` directories
/// (spec §6 "State store file layout").
pub struct ProcessSupervisor {
    logs_dir: PathBuf,
    pids_dir: PathBuf,
}

impl ProcessSupervisor {
    pub fn new(supervisor_dir: &Path) -> Self {
        Self {
            logs_dir: supervisor_dir.join("logs"),
            pids_dir: supervisor_dir.join("pids"),
        }
    }

    pub fn log_path(&self, task_id: &str, timestamp: &str) -> PathBuf {
        self.logs_dir.join(format!("{task_id}-{timestamp}.log"))
    }

    fn pid_path(&self, task_id: &str) -> PathBuf {
        self.pids_dir.join(format!("{task_id}.pid"))
    }

    /// Spawn a worker per the spec §4.2 contract: startup-metadata
    /// prologue, output redirected into the log file via shell
    /// redirection inside the wrapper, PID sidecar written, process
    /// detached into its own session.
    pub fn spawn(&self, cmd: &WorkerCommand) -> Result<SessionHandle, SupervisorError> {
        fs::create_dir_all(&self.logs_dir).map_err(|e| SupervisorError::LogUnwritable {
            path: self.logs_dir.clone(),
            source: e,
        })?;
        fs::create_dir_all(&self.pids_dir).map_err(|e| SupervisorError::LogUnwritable {
            path: self.pids_dir.clone(),
            source: e,
        })?;

        let timestamp = Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
        let log_path = self.log_path(&cmd.task_id, &timestamp);

        let prologue = format!(
            "=== foreman worker start ===\ntask: {}\ncommand: {} {}\ncwd: {}\nstarted: {}\n\n",
            cmd.task_id,
            cmd.program,
            cmd.args.join(" "),
            cmd.working_dir.display(),
            timestamp,
        );
        fs::write(&log_path, prologue).map_err(|e| SupervisorError::LogUnwritable {
            path: log_path.clone(),
            source: e,
        })?;

        // The supervisory wrapper traps TERM/INT, forwards them to the
        // whole process group, and appends an EXIT:<code> trailer so a
        // failed-to-start (or killed) worker is still diagnosable from
        // the log alone.
        let wrapper = format!(
            r#"trap 'kill -TERM -$$ 2>/dev/null; wait; exit 143' TERM INT
"$@" >>"{log}" 2>&1
code=$?
echo "EXIT:$code" >>"{log}"
exit $code"#,
            log = log_path.display(),
        );

        let mut command = std::process::Command::new("sh");
        command
            .arg("-c")
            .arg(wrapper)
            .arg("--")
            .arg(&cmd.program)
            .args(&cmd.args)
            .current_dir(&cmd.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        for (key, value) in &cmd.env {
            command.env(key, value);
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Detach into its own process group so the wrapper's `kill
            // -TERM -$$` reaches descendants, and the whole group
            // survives the parent pulse process exiting.
            unsafe {
                command.pre_exec(|| {
                    libc::setsid();
                    Ok(())
                });
            }
        }

        let child = command.spawn().map_err(SupervisorError::SpawnFailed)?;
        let pid = child.id();
        // We intentionally do not wait() on this child: it is detached
        // and owned by its own session. The OS reparents it to init once
        // this process exits; the pulse re-derives liveness from the PID
        // sidecar on the next invocation rather than from a held handle.
        std::mem::forget(child);

        let pid_path = self.pid_path(&cmd.task_id);
        fs::write(&pid_path, pid.to_string()).map_err(|e| SupervisorError::LogUnwritable {
            path: pid_path.clone(),
            source: e,
        })?;

        Ok(SessionHandle { pid, log_file: log_path, pid_file: pid_path })
    }

    /// Liveness probe: does this PID still exist? Non-blocking.
    pub fn is_alive(&self, pid: u32) -> bool {
        #[cfg(unix)]
        {
            // signal 0 performs no-op error checking only.
            let ret = unsafe { libc::kill(pid as i32, 0) };
            ret == 0
        }
        #[cfg(not(unix))]
        {
            false
        }
    }

    /// Read the PID sidecar for a task, if it exists.
    pub fn read_session(&self, task_id: &str) -> Option<u32> {
        let path = self.pid_path(task_id);
        fs::read_to_string(path).ok()?.trim().parse().ok()
    }

    /// Reap contract (spec §4.2): terminate the descendant tree
    /// (SIGTERM, then SIGKILL after a grace period) and delete the PID
    /// sidecar. Called when a task transitions to any terminal state,
    /// including cancellation.
    pub async fn reap(&self, task_id: &str) -> Result<()> {
        if let Some(pid) = self.read_session(task_id) {
            self.terminate(pid).await.with_context(|| format!("failed to reap task {task_id} (pid {pid})"))?;
        }
        let pid_path = self.pid_path(task_id);
        if pid_path.exists() {
            fs::remove_file(&pid_path).with_context(|| format!("failed to remove pid sidecar {pid_path:?}"))?;
        }
        Ok(())
    }

    async fn terminate(&self, pid: u32) -> Result<()> {
        #[cfg(unix)]
        {
            // Signal the whole process group (negative pid) since the
            // wrapper script detached via setsid.
            let ret = unsafe { libc::kill(-(pid as i32), libc::SIGTERM) };
            if ret != 0 {
                debug!(pid, "SIGTERM to process group failed (already dead?)");
                return Ok(());
            }

            for _ in 0..25 {
                tokio::time::sleep(Duration::from_millis(200)).await;
                if !self.is_alive(pid) {
                    debug!(pid, "process group exited after SIGTERM");
                    return Ok(());
                }
            }

            warn!(pid, "process group did not exit after SIGTERM, sending SIGKILL");
            let _ = unsafe { libc::kill(-(pid as i32), libc::SIGKILL) };
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_and_pid_paths_are_namespaced_by_task_id() {
        let sup = ProcessSupervisor::new(Path::new("/tmp/foreman-test-supervisor"));
        assert_eq!(sup.pid_path("t42"), Path::new("/tmp/foreman-test-supervisor/pids/t42.pid"));
        assert!(sup.log_path("t42", "20260101T000000Z").ends_with("t42-20260101T000000Z.log"));
    }

    #[tokio::test]
    async fn spawn_writes_log_prologue_and_pid_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let sup = ProcessSupervisor::new(dir.path());

        let handle = sup
            .spawn(&WorkerCommand {
                task_id: "t1".into(),
                program: "true".into(),
                args: vec![],
                working_dir: dir.path().to_path_buf(),
                env: vec![],
            })
            .unwrap();

        assert!(handle.pid_file.exists());
        let contents = fs::read_to_string(&handle.log_file).unwrap();
        assert!(contents.contains("task: t1"));

        // Let the detached wrapper finish, then reap.
        tokio::time::sleep(Duration::from_millis(300)).await;
        sup.reap("t1").await.unwrap();
        assert!(!handle.pid_file.exists());
    }

    #[test]
    fn is_alive_returns_false_for_unused_pid() {
        let sup = ProcessSupervisor::new(Path::new("/tmp/foreman-test-supervisor-2"));
        // PID 1 is typically init and alive, but a very high unlikely PID
        // should report dead without blocking.
        assert!(!sup.is_alive(u32::MAX - 1));
    }
}
