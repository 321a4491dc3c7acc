//! Post-deploy verification queue (spec §4.9): a successful deploy
//! generates `check:` directives in a sibling queue file -- a syntax
//! check for changed scripts, an existence check for new files, and an
//! index-reference check for agent definitions -- which a later pulse
//! runs and marks pass/fail, mirroring the task file's own line-oriented
//! directive grammar.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckKind {
    SyntaxCheck(String),
    FileExists(String),
    IndexReference(String),
}

#[derive(Debug, Clone)]
pub struct CheckDirective {
    pub kind: CheckKind,
    pub passed: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct VerifyQueue {
    pub path: PathBuf,
    pub checks: Vec<CheckDirective>,
}

impl VerifyQueue {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self { path: path.to_path_buf(), checks: Vec::new() });
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read verification queue {}", path.display()))?;
        let checks = content.lines().filter_map(parse_line).collect();
        Ok(Self { path: path.to_path_buf(), checks })
    }

    pub fn save(&self) -> Result<()> {
        let mut content = self.checks.iter().map(render_line).collect::<Vec<_>>().join("\n");
        content.push('\n');
        fs::write(&self.path, content)
            .with_context(|| format!("failed to write verification queue {}", self.path.display()))
    }

    pub fn push(&mut self, checks: Vec<CheckDirective>) {
        self.checks.extend(checks);
    }

    pub fn pending(&self) -> bool {
        self.checks.iter().any(|c| c.passed.is_none())
    }

    pub fn all_passed(&self) -> bool {
        !self.checks.is_empty() && self.checks.iter().all(|c| c.passed == Some(true))
    }

    /// Run every not-yet-decided check against `repo_path`, recording
    /// pass/fail in place.
    pub fn run_pending(&mut self, repo_path: &Path) -> Result<()> {
        for check in &mut self.checks {
            if check.passed.is_some() {
                continue;
            }
            check.passed = Some(run_one(repo_path, &check.kind)?);
        }
        Ok(())
    }
}

/// Derive checks for a deploy's changed files: a syntax check for
/// recognised script extensions, an index-reference check for anything
/// under an `agents/` directory.
pub fn checks_for_changed_files(changed_files: &[String]) -> Vec<CheckDirective> {
    let mut checks = Vec::new();
    for path in changed_files {
        if is_script(path) {
            checks.push(CheckDirective { kind: CheckKind::SyntaxCheck(path.clone()), passed: None });
        }
        if is_agent_definition(path) {
            checks.push(CheckDirective { kind: CheckKind::IndexReference(path.clone()), passed: None });
        }
    }
    checks
}

/// Derive existence checks for files a deploy is expected to have
/// newly created.
pub fn checks_for_new_files(new_files: &[String]) -> Vec<CheckDirective> {
    new_files
        .iter()
        .map(|path| CheckDirective { kind: CheckKind::FileExists(path.clone()), passed: None })
        .collect()
}

fn is_script(path: &str) -> bool {
    matches!(
        Path::new(path).extension().and_then(|e| e.to_str()),
        Some("sh") | Some("bash") | Some("py") | Some("js") | Some("ts") | Some("rb")
    )
}

fn is_agent_definition(path: &str) -> bool {
    path.contains("/agents/") || path.starts_with("agents/") || path.ends_with(".agent.md")
}

fn run_one(repo_path: &Path, kind: &CheckKind) -> Result<bool> {
    match kind {
        CheckKind::FileExists(path) => Ok(repo_path.join(path).exists()),
        CheckKind::SyntaxCheck(path) => syntax_check(repo_path, path),
        CheckKind::IndexReference(path) => Ok(index_reference_check(repo_path, path)?),
    }
}

fn syntax_check(repo_path: &Path, path: &str) -> Result<bool> {
    let full = repo_path.join(path);
    if !full.exists() {
        return Ok(false);
    }
    let ext = full.extension().and_then(|e| e.to_str()).unwrap_or("");
    let ok = match ext {
        "sh" | "bash" => Command::new("bash").arg("-n").arg(&full).status().map(|s| s.success()).unwrap_or(false),
        "py" => Command::new("python3").args(["-m", "py_compile"]).arg(&full).status().map(|s| s.success()).unwrap_or(false),
        "js" | "ts" => Command::new("node").args(["--check"]).arg(&full).status().map(|s| s.success()).unwrap_or(false),
        "rb" => Command::new("ruby").arg("-c").arg(&full).status().map(|s| s.success()).unwrap_or(false),
        _ => true,
    };
    Ok(ok)
}

fn index_reference_check(repo_path: &Path, path: &str) -> Result<bool> {
    let index_path = repo_path.join("agents").join("INDEX.md");
    if !index_path.exists() {
        return Ok(false);
    }
    let content = fs::read_to_string(&index_path).context("failed to read agent index")?;
    let stem = Path::new(path).file_stem().and_then(|s| s.to_str()).unwrap_or(path);
    Ok(content.contains(stem))
}

fn render_line(check: &CheckDirective) -> String {
    let prefix = match &check.kind {
        CheckKind::SyntaxCheck(p) => format!("check:syntax:{p}"),
        CheckKind::FileExists(p) => format!("check:exists:{p}"),
        CheckKind::IndexReference(p) => format!("check:index:{p}"),
    };
    match check.passed {
        Some(true) => format!("{prefix} -> pass"),
        Some(false) => format!("{prefix} -> fail"),
        None => prefix,
    }
}

fn parse_line(line: &str) -> Option<CheckDirective> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let (directive, outcome) = match line.split_once(" -> ") {
        Some((d, o)) => (d, Some(o)),
        None => (line, None),
    };
    let rest = directive.strip_prefix("check:")?;
    let (kind_tag, path) = rest.split_once(':')?;
    let kind = match kind_tag {
        "syntax" => CheckKind::SyntaxCheck(path.to_string()),
        "exists" => CheckKind::FileExists(path.to_string()),
        "index" => CheckKind::IndexReference(path.to_string()),
        _ => return None,
    };
    let passed = match outcome {
        Some("pass") => Some(true),
        Some("fail") => Some(false),
        _ => None,
    };
    Some(CheckDirective { kind, passed })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn changed_files_classify_scripts_and_agent_defs() {
        let checks = checks_for_changed_files(&["deploy/rollout.sh".to_string(), "agents/reviewer.md".to_string(), "src/lib.rs".to_string()]);
        assert!(checks.iter().any(|c| matches!(&c.kind, CheckKind::SyntaxCheck(p) if p == "deploy/rollout.sh")));
        assert!(checks.iter().any(|c| matches!(&c.kind, CheckKind::IndexReference(p) if p == "agents/reviewer.md")));
        assert_eq!(checks.len(), 2);
    }

    #[test]
    fn render_and_parse_round_trip() {
        let checks = vec![
            CheckDirective { kind: CheckKind::SyntaxCheck("a.sh".to_string()), passed: None },
            CheckDirective { kind: CheckKind::FileExists("b.txt".to_string()), passed: Some(true) },
            CheckDirective { kind: CheckKind::IndexReference("agents/c.md".to_string()), passed: Some(false) },
        ];
        for check in &checks {
            let line = render_line(check);
            let parsed = parse_line(&line).unwrap();
            assert_eq!(parsed.kind, check.kind);
            assert_eq!(parsed.passed, check.passed);
        }
    }

    #[test]
    fn run_pending_checks_existence_against_real_repo() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("present.txt"), "hi").unwrap();
        let mut queue = VerifyQueue { path: dir.path().join("verify_queue.txt"), checks: Vec::new() };
        queue.push(checks_for_new_files(&["present.txt".to_string(), "missing.txt".to_string()]));
        queue.run_pending(dir.path()).unwrap();
        assert_eq!(queue.checks[0].passed, Some(true));
        assert_eq!(queue.checks[1].passed, Some(false));
        assert!(!queue.pending());
        assert!(!queue.all_passed());
    }

    #[test]
    fn save_and_load_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let queue_path = dir.path().join("verify_queue.txt");
        let mut queue = VerifyQueue { path: queue_path.clone(), checks: Vec::new() };
        queue.push(checks_for_new_files(&["f.txt".to_string()]));
        queue.checks[0].passed = Some(true);
        queue.save().unwrap();

        let reloaded = VerifyQueue::load(&queue_path).unwrap();
        assert_eq!(reloaded.checks.len(), 1);
        assert_eq!(reloaded.checks[0].passed, Some(true));
    }
}
