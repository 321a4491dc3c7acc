//! Configuration file management for foreman.
//!
//! Provides a TOML-based config file at `~/.config/foreman/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default, the same
//! chain the teacher used for its own config.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use foreman_db::config::{ForemanPaths, StoreConfig};

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub repo: RepoSection,
    #[serde(default)]
    pub worker: WorkerSection,
    #[serde(default)]
    pub limits: LimitsSection,
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct RepoSection {
    pub path: Option<String>,
    pub base_branch: Option<String>,
    pub task_file: Option<String>,
    pub verify_queue_file: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct WorkerSection {
    pub binary: Option<String>,
    pub api_base: Option<String>,
    pub api_key: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct LimitsSection {
    pub global_concurrency: Option<i64>,
    pub stale_claim_age_secs: Option<u64>,
    pub skip_merge_review_gate: Option<bool>,
    pub max_pr_actions_per_pulse: Option<usize>,
    pub max_dispatch_per_pulse: Option<usize>,
    pub max_evaluate_per_pulse: Option<usize>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the foreman config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/foreman` or `~/.config/foreman`.
/// We intentionally ignore the platform-specific `dirs::config_dir()`
/// (which returns `~/Library/Application Support` on macOS).
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("foreman");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("foreman")
}

/// Return the path to the foreman config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix (worker.api_key may be a secret).
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use by every `foreman-cli`
/// command. Mirrors the teacher's `ForemanConfig` resolution chain (CLI
/// flag > env var > config file > default), widened to cover the ambient
/// knobs `PulseConfig` (spec §4.10/§5) needs: the repo location, the
/// worker invocation contract's binary/provider, and the per-pulse
/// concurrency and action ceilings.
#[derive(Debug, Clone)]
pub struct ForemanConfig {
    pub store: StoreConfig,
    pub paths: ForemanPaths,
    pub repo_path: PathBuf,
    pub base_branch: String,
    pub task_file_path: PathBuf,
    pub verify_queue_path: PathBuf,
    pub worker_binary: String,
    pub api_base: String,
    pub api_key: String,
    pub global_concurrency: i64,
    pub stale_claim_age: Duration,
    pub skip_merge_review_gate: bool,
    pub max_pr_actions_per_pulse: usize,
    pub max_dispatch_per_pulse: usize,
    pub max_evaluate_per_pulse: usize,
}

const DEFAULT_BASE_BRANCH: &str = "main";
const DEFAULT_TASK_FILE: &str = "tasks.md";
const DEFAULT_VERIFY_QUEUE_FILE: &str = "verify_queue.txt";
const DEFAULT_WORKER_BINARY: &str = "claude";
const DEFAULT_API_BASE: &str = "https://api.anthropic.com";
const DEFAULT_GLOBAL_CONCURRENCY: i64 = 4;
const DEFAULT_STALE_CLAIM_AGE_SECS: u64 = 7200;
const DEFAULT_MAX_PR_ACTIONS_PER_PULSE: usize = 8;
const DEFAULT_MAX_DISPATCH_PER_PULSE: usize = 8;
const DEFAULT_MAX_EVALUATE_PER_PULSE: usize = 16;

impl ForemanConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config
    /// file > default. `cli_repo_path` is the one value every pulse
    /// invocation needs explicitly (there is no sane default); everything
    /// else falls back gracefully.
    pub fn resolve(cli_repo_path: Option<&str>) -> Result<Self> {
        let file_config = load_config().ok();
        let repo = file_config.as_ref().map(|c| &c.repo);
        let worker = file_config.as_ref().map(|c| &c.worker);
        let limits = file_config.as_ref().map(|c| &c.limits);

        let repo_path = cli_repo_path
            .map(PathBuf::from)
            .or_else(|| std::env::var("FOREMAN_REPO_PATH").ok().map(PathBuf::from))
            .or_else(|| repo.and_then(|r| r.path.clone()).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("."));

        let base_branch = std::env::var("FOREMAN_BASE_BRANCH")
            .ok()
            .or_else(|| repo.and_then(|r| r.base_branch.clone()))
            .unwrap_or_else(|| DEFAULT_BASE_BRANCH.to_string());

        let task_file_path = std::env::var("FOREMAN_TASK_FILE")
            .ok()
            .or_else(|| repo.and_then(|r| r.task_file.clone()))
            .map(PathBuf::from)
            .unwrap_or_else(|| repo_path.join(DEFAULT_TASK_FILE));

        let verify_queue_path = std::env::var("FOREMAN_VERIFY_QUEUE_FILE")
            .ok()
            .or_else(|| repo.and_then(|r| r.verify_queue_file.clone()))
            .map(PathBuf::from)
            .unwrap_or_else(|| repo_path.join(DEFAULT_VERIFY_QUEUE_FILE));

        let worker_binary = std::env::var("FOREMAN_WORKER_BINARY")
            .ok()
            .or_else(|| worker.and_then(|w| w.binary.clone()))
            .unwrap_or_else(|| DEFAULT_WORKER_BINARY.to_string());

        let api_base = std::env::var("FOREMAN_API_BASE")
            .ok()
            .or_else(|| worker.and_then(|w| w.api_base.clone()))
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());

        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .ok()
            .or_else(|| std::env::var("FOREMAN_API_KEY").ok())
            .or_else(|| worker.and_then(|w| w.api_key.clone()))
            .unwrap_or_default();

        let global_concurrency = std::env::var("FOREMAN_GLOBAL_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse().ok())
            .or_else(|| limits.and_then(|l| l.global_concurrency))
            .unwrap_or(DEFAULT_GLOBAL_CONCURRENCY);

        let stale_claim_age_secs = std::env::var("FOREMAN_STALE_CLAIM_AGE_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .or_else(|| limits.and_then(|l| l.stale_claim_age_secs))
            .unwrap_or(DEFAULT_STALE_CLAIM_AGE_SECS);

        let skip_merge_review_gate = std::env::var("FOREMAN_SKIP_MERGE_REVIEW_GATE")
            .ok()
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .or_else(|| limits.and_then(|l| l.skip_merge_review_gate))
            .unwrap_or(false);

        let max_pr_actions_per_pulse = limits
            .and_then(|l| l.max_pr_actions_per_pulse)
            .unwrap_or(DEFAULT_MAX_PR_ACTIONS_PER_PULSE);
        let max_dispatch_per_pulse = limits
            .and_then(|l| l.max_dispatch_per_pulse)
            .unwrap_or(DEFAULT_MAX_DISPATCH_PER_PULSE);
        let max_evaluate_per_pulse = limits
            .and_then(|l| l.max_evaluate_per_pulse)
            .unwrap_or(DEFAULT_MAX_EVALUATE_PER_PULSE);

        let paths = ForemanPaths::from_env();
        let store = StoreConfig::from_env();

        Ok(Self {
            store,
            paths,
            repo_path,
            base_branch,
            task_file_path,
            verify_queue_path,
            worker_binary,
            api_base,
            api_key,
            global_concurrency,
            stale_claim_age: Duration::from_secs(stale_claim_age_secs),
            skip_merge_review_gate,
            max_pr_actions_per_pulse,
            max_dispatch_per_pulse,
            max_evaluate_per_pulse,
        })
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    /// Serialises tests that mutate process-wide env vars.
    fn lock_env() -> std::sync::MutexGuard<'static, ()> {
        static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
        LOCK.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    #[test]
    fn save_and_load_config_roundtrip() {
        let _lock = lock_env();
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path().join("foreman");
        let path = dir.join("config.toml");

        let original = ConfigFile {
            repo: RepoSection {
                path: Some("/repo".to_string()),
                base_branch: Some("develop".to_string()),
                task_file: None,
                verify_queue_file: None,
            },
            worker: WorkerSection {
                binary: Some("claude".to_string()),
                api_base: None,
                api_key: None,
            },
            limits: LimitsSection::default(),
        };

        std::fs::create_dir_all(&dir).unwrap();
        let contents = toml::to_string_pretty(&original).unwrap();
        std::fs::write(&path, &contents).unwrap();

        let loaded_contents = std::fs::read_to_string(&path).unwrap();
        let loaded: ConfigFile = toml::from_str(&loaded_contents).unwrap();

        assert_eq!(loaded.repo.path, original.repo.path);
        assert_eq!(loaded.repo.base_branch, original.repo.base_branch);
    }

    #[cfg(unix)]
    #[test]
    fn save_config_sets_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let _lock = lock_env();
        let tmp = tempfile::TempDir::new().unwrap();
        let file = tmp.path().join("test.toml");
        std::fs::write(&file, "test").unwrap();

        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&file, perms).unwrap();

        let meta = std::fs::metadata(&file).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn resolve_with_cli_flag_overrides_env_and_default() {
        let _lock = lock_env();
        unsafe { std::env::set_var("FOREMAN_REPO_PATH", "/env/repo") };

        let config = ForemanConfig::resolve(Some("/cli/repo")).unwrap();
        assert_eq!(config.repo_path, PathBuf::from("/cli/repo"));

        unsafe { std::env::remove_var("FOREMAN_REPO_PATH") };
    }

    #[test]
    fn resolve_with_env_var_overrides_default() {
        let _lock = lock_env();
        unsafe { std::env::set_var("FOREMAN_REPO_PATH", "/env/repo") };

        let config = ForemanConfig::resolve(None).unwrap();
        assert_eq!(config.repo_path, PathBuf::from("/env/repo"));

        unsafe { std::env::remove_var("FOREMAN_REPO_PATH") };
    }

    #[test]
    fn resolve_defaults_base_branch_and_limits() {
        let _lock = lock_env();
        unsafe { std::env::remove_var("FOREMAN_BASE_BRANCH") };
        unsafe { std::env::remove_var("FOREMAN_GLOBAL_CONCURRENCY") };

        let config = ForemanConfig::resolve(Some("/repo")).unwrap();
        assert_eq!(config.base_branch, DEFAULT_BASE_BRANCH);
        assert_eq!(config.global_concurrency, DEFAULT_GLOBAL_CONCURRENCY);
        assert_eq!(config.task_file_path, PathBuf::from("/repo").join(DEFAULT_TASK_FILE));
    }

    #[test]
    fn config_path_ends_with_expected_filename() {
        let path = config_path();
        assert!(
            path.ends_with("foreman/config.toml"),
            "unexpected config path: {}",
            path.display()
        );
    }
}
