//! Task-file ownership: load, mutate, and write back the external task
//! file (spec §4.9/§6). `parser` turns raw text into a tolerant line
//! index; this module owns the mutation API and re-serialization, and
//! `git` commits the result to the shared branch.

pub mod git;
pub mod parser;
pub mod reconcile;
pub mod verify_queue;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use thiserror::Error;

pub use parser::{NoteLine, ParseWarning, TaskFileState, TaskLine};

const MAX_NOTE_LEN: usize = 200;

#[derive(Debug, Error)]
pub enum TaskFileError {
    #[error("task {0:?} not found in task file")]
    NotFound(String),
    #[error("task {0:?} has open subtasks, refusing to mark complete")]
    OpenSubtasks(String),
}

/// Proof recorded alongside a task being marked complete in the file
/// (spec §4.9: completion is annotated with how it was proven).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionProof {
    Pr(u64),
    Verified,
}

/// The task file: owning file path plus the current parse, kept in sync
/// by reparsing after every mutation so line numbers never drift.
#[derive(Debug, Clone)]
pub struct TaskFile {
    pub path: PathBuf,
    pub raw_lines: Vec<String>,
    pub tasks: Vec<TaskLine>,
    pub notes: Vec<NoteLine>,
    pub warnings: Vec<ParseWarning>,
}

impl TaskFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read task file {}", path.display()))?;
        let parsed = parser::parse(&content);
        Ok(Self {
            path: path.to_path_buf(),
            raw_lines: parsed.raw_lines,
            tasks: parsed.tasks,
            notes: parsed.notes,
            warnings: parsed.warnings,
        })
    }

    pub fn save(&self) -> Result<()> {
        let mut content = self.raw_lines.join("\n");
        content.push('\n');
        fs::write(&self.path, content)
            .with_context(|| format!("failed to write task file {}", self.path.display()))
    }

    fn reparse(&mut self) {
        let content = self.raw_lines.join("\n");
        let parsed = parser::parse(&content);
        self.tasks = parsed.tasks;
        self.notes = parsed.notes;
        self.warnings = parsed.warnings;
    }

    pub fn find(&self, id: &str) -> Option<&TaskLine> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Every subtask of `id`, found by either the numeric dotted-id
    /// convention (`t46.1` under `t46`) or deeper markdown indentation
    /// immediately following the parent's line (spec §4.9 parent-closure
    /// guard: both mechanisms must be checked, neither alone is enough).
    pub fn subtasks_of(&self, id: &str) -> Vec<&TaskLine> {
        let Some(parent) = self.find(id) else { return Vec::new() };
        let parent_indent = parent.indent;
        let parent_line_no = parent.line_no;

        let mut result: Vec<&TaskLine> = self.tasks.iter().filter(|t| t.is_dotted_child_of(id)).collect();

        if let Some(parent_pos) = self.tasks.iter().position(|t| t.line_no == parent_line_no) {
            for task in self.tasks.iter().skip(parent_pos + 1) {
                if task.indent <= parent_indent {
                    break;
                }
                if !result.iter().any(|r| r.line_no == task.line_no) {
                    result.push(task);
                }
            }
        }

        result
    }

    pub fn has_open_subtasks(&self, id: &str) -> bool {
        self.subtasks_of(id).iter().any(|t| t.state == TaskFileState::Open)
    }

    fn require_line_no(&self, id: &str) -> Result<usize, TaskFileError> {
        self.find(id).map(|t| t.line_no).ok_or_else(|| TaskFileError::NotFound(id.to_string()))
    }

    /// Mark a task `[x]` done, refusing if it still has open subtasks.
    pub fn mark_complete(&mut self, id: &str, proof: CompletionProof, now: DateTime<Utc>) -> Result<(), TaskFileError> {
        if self.has_open_subtasks(id) {
            return Err(TaskFileError::OpenSubtasks(id.to_string()));
        }
        let line_no = self.require_line_no(id)?;
        self.set_state(line_no, TaskFileState::Done);
        self.set_annotation(line_no, "completed", &now.format("%Y-%m-%d").to_string());
        match proof {
            CompletionProof::Pr(number) => self.set_annotation(line_no, "pr", &format!("#{number}")),
            CompletionProof::Verified => self.set_annotation(line_no, "verified", &now.format("%Y-%m-%d").to_string()),
        }
        self.reparse();
        Ok(())
    }

    /// Mark a task `[-]` cancelled.
    pub fn mark_cancelled(&mut self, id: &str, now: DateTime<Utc>) -> Result<(), TaskFileError> {
        let line_no = self.require_line_no(id)?;
        self.set_state(line_no, TaskFileState::Cancelled);
        self.set_annotation(line_no, "cancelled", &now.format("%Y-%m-%d").to_string());
        self.reparse();
        Ok(())
    }

    /// Annotate a task's status (e.g. `status:failed`) and attach a short
    /// `Notes:` line explaining why, without changing its checkbox state.
    pub fn annotate_status(&mut self, id: &str, tag: &str, note: &str, now: DateTime<Utc>) -> Result<(), TaskFileError> {
        let line_no = self.require_line_no(id)?;
        self.set_annotation(line_no, "status", tag);
        let indent = self.find(id).map(|t| t.indent).unwrap_or(0);
        let note_line = format!("{}  - Notes: {} ({})", " ".repeat(indent), cap_len(note, MAX_NOTE_LEN), now.format("%Y-%m-%d"));
        self.raw_lines.insert(line_no + 1, note_line);
        self.reparse();
        Ok(())
    }

    /// Drop duplicate *open* lines sharing a task id, keeping the first
    /// occurrence. Never renames an id -- renaming has historically
    /// produced ghost ids that nothing ever references again.
    pub fn dedupe_duplicate_ids(&mut self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut to_remove = Vec::new();
        let mut duped = Vec::new();
        for task in &self.tasks {
            if task.state != TaskFileState::Open {
                continue;
            }
            if !seen.insert(task.id.clone()) {
                to_remove.push(task.line_no);
                duped.push(task.id.clone());
            }
        }
        if to_remove.is_empty() {
            return duped;
        }
        to_remove.sort_unstable();
        for line_no in to_remove.into_iter().rev() {
            self.raw_lines.remove(line_no);
        }
        self.reparse();
        duped
    }

    fn set_state(&mut self, line_no: usize, new_state: TaskFileState) {
        let line = &mut self.raw_lines[line_no];
        for marker in ["[ ]", "[x]", "[X]", "[-]"] {
            if let Some(pos) = line.find(marker) {
                line.replace_range(pos..pos + marker.len(), new_state.marker());
                return;
            }
        }
    }

    /// Set (or replace) a trailing `key:value` annotation token on a
    /// line, preserving its leading indentation.
    fn set_annotation(&mut self, line_no: usize, key: &str, value: &str) {
        let line = self.raw_lines[line_no].clone();
        let indent_len = line.len() - line.trim_start().len();
        let indent = &line[..indent_len];

        let prefix = format!("{key}:");
        let mut found = false;
        let mut tokens: Vec<String> = Vec::new();
        for token in line.trim_start().split_whitespace() {
            if token.starts_with(&prefix) {
                tokens.push(format!("{key}:{value}"));
                found = true;
            } else {
                tokens.push(token.to_string());
            }
        }
        if !found {
            tokens.push(format!("{key}:{value}"));
        }

        self.raw_lines[line_no] = format!("{indent}{}", tokens.join(" "));
    }
}

fn cap_len(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max.saturating_sub(1)).collect();
    format!("{truncated}…")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TaskFile {
        TaskFile {
            path: PathBuf::from("tasks.md"),
            raw_lines: vec![],
            tasks: vec![],
            notes: vec![],
            warnings: vec![],
        }
    }

    fn load_str(content: &str) -> TaskFile {
        let parsed = parser::parse(content);
        TaskFile {
            path: PathBuf::from("tasks.md"),
            raw_lines: parsed.raw_lines,
            tasks: parsed.tasks,
            notes: parsed.notes,
            warnings: parsed.warnings,
        }
    }

    #[test]
    fn mark_complete_sets_marker_and_annotations() {
        let mut file = load_str("- [ ] t1 do the thing");
        let now = DateTime::parse_from_rfc3339("2026-07-28T00:00:00Z").unwrap().with_timezone(&Utc);
        file.mark_complete("t1", CompletionProof::Pr(42), now).unwrap();
        let task = file.find("t1").unwrap();
        assert_eq!(task.state, TaskFileState::Done);
        assert_eq!(task.annotation("completed"), Some("2026-07-28"));
        assert_eq!(task.annotation("pr"), Some("#42"));
    }

    #[test]
    fn mark_complete_refuses_when_subtask_still_open() {
        let mut file = load_str("- [ ] t1 parent\n  - [ ] t1.1 child");
        let now = Utc::now();
        let err = file.mark_complete("t1", CompletionProof::Verified, now).unwrap_err();
        assert!(matches!(err, TaskFileError::OpenSubtasks(id) if id == "t1"));
    }

    #[test]
    fn mark_complete_allows_when_subtask_closed() {
        let mut file = load_str("- [ ] t1 parent\n  - [x] t1.1 child completed:2026-07-01");
        let now = Utc::now();
        assert!(file.mark_complete("t1", CompletionProof::Verified, now).is_ok());
    }

    #[test]
    fn subtasks_of_detects_dotted_and_indented_children() {
        let file = load_str("- [ ] t1 parent\n  - [ ] t1.1 indented child\n- [ ] t1.2 dotted child elsewhere\n- [ ] t2 unrelated");
        let subs = file.subtasks_of("t1");
        assert_eq!(subs.len(), 2);
        assert!(subs.iter().any(|t| t.id == "t1.1"));
        assert!(subs.iter().any(|t| t.id == "t1.2"));
    }

    #[test]
    fn annotate_status_inserts_notes_line() {
        let mut file = load_str("- [ ] t1 do the thing");
        let now = DateTime::parse_from_rfc3339("2026-07-28T00:00:00Z").unwrap().with_timezone(&Utc);
        file.annotate_status("t1", "blocked", "waiting on credentials", now).unwrap();
        assert_eq!(file.find("t1").unwrap().annotation("status"), Some("blocked"));
        assert_eq!(file.notes.len(), 1);
        assert!(file.notes[0].text.contains("waiting on credentials"));
    }

    #[test]
    fn dedupe_keeps_first_open_occurrence() {
        let mut file = load_str("- [ ] t1 first copy\n- [ ] t1 second copy\n- [ ] t2 unrelated");
        let removed = file.dedupe_duplicate_ids();
        assert_eq!(removed, vec!["t1".to_string()]);
        assert_eq!(file.tasks.iter().filter(|t| t.id == "t1").count(), 1);
        assert_eq!(file.find("t1").unwrap().description, "first copy");
    }

    #[test]
    fn dedupe_ignores_closed_duplicates() {
        let mut file = load_str("- [x] t1 done copy completed:2026-07-01\n- [ ] t1 reopened copy\n- [ ] t2 unrelated");
        let removed = file.dedupe_duplicate_ids();
        assert!(removed.is_empty());
        assert_eq!(file.tasks.iter().filter(|t| t.id == "t1").count(), 2);
    }

    #[test]
    fn not_found_is_reported_not_panicked() {
        let mut file = sample();
        let err = file.mark_cancelled("ghost", Utc::now()).unwrap_err();
        assert!(matches!(err, TaskFileError::NotFound(id) if id == "ghost"));
    }
}
