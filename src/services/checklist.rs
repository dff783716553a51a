//! Checklist document synchronization.
//!
//! The checklist is a human-editable Markdown bullet list that mirrors a
//! taskset. Task lines follow `- [ ] <id> <title>` with two-space indent per
//! hierarchy level; `[ ]` means Ready/Blocked, `[-]` Running or Failed, and
//! `[x]` Done. Everything that is not a task line (including trailing
//! `_Requirements: ..._` metadata lines) is preserved verbatim.

use std::path::Path;

use regex::Regex;
use serde::Serialize;
use tracing::{info, instrument};

use crate::domain::error::RegistryError;
use crate::domain::models::{Task, TaskState, Taskset};

/// Sync directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    /// Doc is authoritative for identity (id, title); registry state wins
    FromDoc,
    /// Registry state is written into the checkboxes; nothing else changes
    ToDoc,
    /// FromDoc, then ToDoc
    Bidirectional,
}

/// Outcome of one sync pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncResult {
    pub tasks_added: Vec<String>,
    pub titles_updated: Vec<String>,
    /// Failed tasks re-enabled by the user flipping `[-]` back to `[ ]`
    pub tasks_reenabled: Vec<String>,
    pub checkboxes_updated: Vec<String>,
    /// Registry tasks with no matching doc line
    pub missing_from_doc: Vec<String>,
}

/// One parsed line of the checklist.
#[derive(Debug, Clone, PartialEq)]
enum DocLine {
    Task {
        raw: String,
        indent: usize,
        checkbox: char,
        id: String,
        title: String,
    },
    Other(String),
}

/// Parsed checklist document.
#[derive(Debug, Clone, PartialEq)]
pub struct ChecklistDoc {
    lines: Vec<DocLine>,
}

/// One task entry as it appears in the document.
#[derive(Debug, Clone, PartialEq)]
pub struct ChecklistEntry {
    pub id: String,
    pub title: String,
    pub checkbox: char,
    pub indent: usize,
}

impl ChecklistDoc {
    /// Parse the line-anchored grammar. Lines that do not match are kept as
    /// opaque text.
    pub fn parse(content: &str) -> Self {
        let task_line = task_line_regex();
        let lines = content
            .lines()
            .map(|line| {
                if let Some(caps) = task_line.captures(line) {
                    DocLine::Task {
                        raw: line.to_string(),
                        indent: caps[1].len(),
                        checkbox: caps[2].chars().next().unwrap_or(' '),
                        id: caps[3].to_string(),
                        title: caps[4].to_string(),
                    }
                } else {
                    DocLine::Other(line.to_string())
                }
            })
            .collect();
        Self { lines }
    }

    /// Render a fresh checklist from a taskset, indented by id depth.
    pub fn render_from_taskset(taskset: &Taskset) -> String {
        let mut out = format!("# Tasks: {}\n\n", taskset.spec_name);
        let mut tasks: Vec<&Task> = taskset.tasks.iter().collect();
        tasks.sort_by(|a, b| id_sort_key(&a.id).cmp(&id_sort_key(&b.id)));
        for task in tasks {
            let depth = task.id.split('.').count().saturating_sub(1);
            out.push_str(&format!(
                "{}- [{}] {} {}\n",
                "  ".repeat(depth),
                checkbox_for(task.state),
                task.id,
                task.title
            ));
        }
        out
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            match line {
                DocLine::Task { raw, .. } | DocLine::Other(raw) => {
                    out.push_str(raw);
                    out.push('\n');
                }
            }
        }
        out
    }

    /// Task entries in document order, for importers.
    pub fn entries(&self) -> Vec<ChecklistEntry> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                DocLine::Task { id, title, checkbox, indent, .. } => Some(ChecklistEntry {
                    id: id.clone(),
                    title: title.clone(),
                    checkbox: *checkbox,
                    indent: *indent,
                }),
                DocLine::Other(_) => None,
            })
            .collect()
    }

    fn task_ids(&self) -> Vec<String> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                DocLine::Task { id, .. } => Some(id.clone()),
                DocLine::Other(_) => None,
            })
            .collect()
    }
}

fn task_line_regex() -> Regex {
    Regex::new(r"^(\s*)- \[( |-|x)\] (\d+(?:\.\d+)*) (.+)$").expect("valid regex")
}

/// Registry state → checkbox character.
fn checkbox_for(state: TaskState) -> char {
    match state {
        TaskState::Done => 'x',
        TaskState::Running | TaskState::Failed => '-',
        TaskState::Ready | TaskState::Blocked => ' ',
    }
}

/// Numeric sort key so `1.10` follows `1.9`.
fn id_sort_key(id: &str) -> Vec<u64> {
    id.split('.').map(|s| s.parse().unwrap_or(0)).collect()
}

/// Merge the parsed doc into the taskset (FromDoc). Mutates `taskset` in
/// place and reports what changed. Only identity fields move, with the one
/// exception of the user re-enabling a Failed task.
pub fn merge_from_doc(taskset: &mut Taskset, doc: &ChecklistDoc) -> SyncResult {
    let mut result = SyncResult::default();

    for line in &doc.lines {
        let DocLine::Task { checkbox, id, title, .. } = line else { continue };

        match taskset.task_mut(id) {
            Some(task) => {
                if task.title != *title {
                    task.title = title.clone();
                    result.titles_updated.push(id.clone());
                }
                // User re-enable: Failed task flipped back to an open box.
                if task.state == TaskState::Failed
                    && *checkbox == ' '
                    && task.transition_to(TaskState::Ready).is_ok()
                {
                    result.tasks_reenabled.push(id.clone());
                }
            }
            None => {
                let mut task = Task::new(id.clone(), title.clone(), title.clone());
                if *checkbox == 'x' {
                    task.state = TaskState::Done;
                }
                taskset.tasks.push(task);
                result.tasks_added.push(id.clone());
            }
        }
    }

    let doc_ids = doc.task_ids();
    for task in &taskset.tasks {
        if !doc_ids.contains(&task.id) {
            result.missing_from_doc.push(task.id.clone());
        }
    }

    result
}

/// Rewrite checkbox characters from registry state (ToDoc). Returns the
/// updated doc and the ids whose checkbox changed.
pub fn merge_to_doc(taskset: &Taskset, doc: &ChecklistDoc) -> (ChecklistDoc, Vec<String>) {
    let mut updated = Vec::new();
    let lines = doc
        .lines
        .iter()
        .map(|line| match line {
            DocLine::Task { raw, indent, checkbox, id, title } => {
                if let Some(task) = taskset.task(id) {
                    let wanted = checkbox_for(task.state);
                    if wanted != *checkbox {
                        updated.push(id.clone());
                        return DocLine::Task {
                            raw: format!("{}- [{}] {} {}", " ".repeat(*indent), wanted, id, title),
                            indent: *indent,
                            checkbox: wanted,
                            id: id.clone(),
                            title: title.clone(),
                        };
                    }
                }
                line.clone()
            }
            DocLine::Other(_) => line.clone(),
        })
        .collect();
    (ChecklistDoc { lines }, updated)
}

/// File-backed checklist sync, used by the registry's `sync_checklist`.
pub struct ChecklistSync;

impl ChecklistSync {
    /// Run a sync pass over the document at `path`. The caller holds the
    /// per-spec lock and persists the taskset afterwards when the result
    /// reports registry-side changes.
    #[instrument(skip(taskset), fields(spec = %taskset.spec_name))]
    pub async fn sync_file(
        taskset: &mut Taskset,
        path: &Path,
        direction: SyncDirection,
    ) -> Result<SyncResult, RegistryError> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // No document yet: ToDoc bootstraps one, FromDoc has nothing
                // to read.
                if direction == SyncDirection::FromDoc {
                    return Err(RegistryError::ChecklistSync(format!(
                        "checklist not found: {}",
                        path.display()
                    )));
                }
                String::new()
            }
            Err(e) => {
                return Err(RegistryError::ChecklistSync(format!(
                    "failed to read {}: {e}",
                    path.display()
                )));
            }
        };

        let mut result = SyncResult::default();
        let mut doc = if content.is_empty() {
            ChecklistDoc::parse(&ChecklistDoc::render_from_taskset(taskset))
        } else {
            ChecklistDoc::parse(&content)
        };

        if matches!(direction, SyncDirection::FromDoc | SyncDirection::Bidirectional) {
            result = merge_from_doc(taskset, &doc);
        }

        if matches!(direction, SyncDirection::ToDoc | SyncDirection::Bidirectional) {
            let (updated_doc, updated_ids) = merge_to_doc(taskset, &doc);
            doc = updated_doc;
            result.checkboxes_updated = updated_ids;

            let rendered = doc.render();
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    RegistryError::ChecklistSync(format!("failed to create {}: {e}", parent.display()))
                })?;
            }
            tokio::fs::write(path, rendered).await.map_err(|e| {
                RegistryError::ChecklistSync(format!("failed to write {}: {e}", path.display()))
            })?;
        }

        info!(
            added = result.tasks_added.len(),
            titles = result.titles_updated.len(),
            reenabled = result.tasks_reenabled.len(),
            checkboxes = result.checkboxes_updated.len(),
            "checklist sync complete"
        );
        Ok(result)
    }
}
