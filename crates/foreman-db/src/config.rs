use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Resolves the on-disk layout under `$FOREMAN_SUPERVISOR_DIR` (the spec's
/// `$SUPERVISOR_DIR`): the store file, its backups, per-worker logs, PID
/// sidecars, and PR-lifecycle decision logs.
#[derive(Debug, Clone)]
pub struct ForemanPaths {
    root: PathBuf,
}

impl ForemanPaths {
    /// Environment variable naming the supervisor's working directory.
    pub const ENV_VAR: &str = "FOREMAN_SUPERVISOR_DIR";

    /// Resolve from the environment, falling back to
    /// `<data-local-dir>/foreman`.
    pub fn from_env() -> Self {
        let root = env::var(Self::ENV_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::data_local_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("foreman")
            });
        Self::new(root)
    }

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    /// Path to the single store file for this host.
    pub fn store_path(&self) -> PathBuf {
        self.root.join("foreman.db")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.root.join("backups")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn pids_dir(&self) -> PathBuf {
        self.root.join("pids")
    }

    pub fn decisions_dir(&self) -> PathBuf {
        self.root.join("decisions")
    }

    /// Path for a worker's log file: `logs/<task_id>-<timestamp>.log`.
    pub fn worker_log_path(&self, task_id: &str, timestamp: &str) -> PathBuf {
        self.logs_dir().join(format!("{task_id}-{timestamp}.log"))
    }

    /// Path for a task's PID sidecar: `pids/<task_id>.pid`.
    pub fn pid_sidecar_path(&self, task_id: &str) -> PathBuf {
        self.pids_dir().join(format!("{task_id}.pid"))
    }

    /// Path for a PR-lifecycle decision log:
    /// `decisions/decision-<task_id>-<timestamp>.md`.
    pub fn decision_log_path(&self, task_id: &str, timestamp: &str) -> PathBuf {
        self.decisions_dir()
            .join(format!("decision-{task_id}-{timestamp}.md"))
    }

    /// Path for a timestamped store backup:
    /// `backups/supervisor-backup-<reason>-<timestamp>.db`.
    pub fn backup_path(&self, reason: &str, timestamp: &str) -> PathBuf {
        self.backups_dir()
            .join(format!("supervisor-backup-{reason}-{timestamp}.db"))
    }

    /// Ensure every directory this layout names exists.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [
            self.root.clone(),
            self.backups_dir(),
            self.logs_dir(),
            self.pids_dir(),
            self.decisions_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

impl Default for ForemanPaths {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Store connection configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// `PRAGMA busy_timeout` applied to every connection, absorbing the
    /// single-writer contention the concurrency model expects rather than
    /// failing on first lock conflict.
    pub busy_timeout: Duration,
    /// How many most-recent backups to retain after a verified migration.
    pub backup_retain: usize,
}

impl StoreConfig {
    pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);
    pub const DEFAULT_BACKUP_RETAIN: usize = 10;

    pub fn from_env() -> Self {
        let paths = ForemanPaths::from_env();
        let db_path = env::var("FOREMAN_DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| paths.store_path());
        Self {
            db_path,
            busy_timeout: Self::DEFAULT_BUSY_TIMEOUT,
            backup_retain: Self::DEFAULT_BACKUP_RETAIN,
        }
    }

    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            busy_timeout: Self::DEFAULT_BUSY_TIMEOUT,
            backup_retain: Self::DEFAULT_BACKUP_RETAIN,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_derive_from_root() {
        let paths = ForemanPaths::new("/tmp/foreman-test-root");
        assert_eq!(
            paths.store_path(),
            PathBuf::from("/tmp/foreman-test-root/foreman.db")
        );
        assert_eq!(
            paths.pid_sidecar_path("t42"),
            PathBuf::from("/tmp/foreman-test-root/pids/t42.pid")
        );
        assert_eq!(
            paths.worker_log_path("t42", "20260101T000000"),
            PathBuf::from("/tmp/foreman-test-root/logs/t42-20260101T000000.log")
        );
        assert_eq!(
            paths.backup_path("pre-migrate", "20260101T000000"),
            PathBuf::from(
                "/tmp/foreman-test-root/backups/supervisor-backup-pre-migrate-20260101T000000.db"
            )
        );
    }

    #[test]
    fn store_config_defaults() {
        let cfg = StoreConfig::new("/tmp/foreman-test-root/foreman.db");
        assert_eq!(cfg.backup_retain, StoreConfig::DEFAULT_BACKUP_RETAIN);
        assert_eq!(cfg.busy_timeout, StoreConfig::DEFAULT_BUSY_TIMEOUT);
    }
}
