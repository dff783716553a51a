//! Prompt assembly and strict response parsing.
//!
//! The prompt is assembled deterministically from the task context so the
//! same task against the same workspace always produces the same request.
//! The model must answer with a single JSON object; anything trailing the
//! object is rejected.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::domain::models::TaskContext;

/// File operation requested by the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Create,
    Modify,
    Delete,
}

/// One file change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeChange {
    pub file_path: String,
    pub operation: ChangeOp,
    /// Required for create/modify, absent for delete
    #[serde(default)]
    pub content: Option<String>,
}

/// The required response schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditResponse {
    pub code_changes: Vec<CodeChange>,
    pub explanation: String,
}

/// Assemble the prompt for one task.
pub fn build_prompt(
    context: &TaskContext,
    file_tree: &str,
    related_files: &[(String, String)],
    playbook: Option<&str>,
) -> String {
    let mut prompt = String::new();

    prompt.push_str(&format!("# Task {}: {}\n\n", context.task_id, context.title));
    prompt.push_str(&format!("{}\n\n", context.description.trim()));

    if let Some(playbook) = playbook {
        prompt.push_str(&format!("## Playbook\n\n{}\n\n", playbook.trim()));
    }

    if !context.acceptance_criteria.is_empty() {
        prompt.push_str("## Acceptance criteria\n\n");
        for (i, criterion) in context.acceptance_criteria.iter().enumerate() {
            prompt.push_str(&format!("{}. {}\n", i + 1, criterion));
        }
        prompt.push('\n');
    }

    if !context.dependencies.is_empty() {
        prompt.push_str("## Completed dependencies\n\n");
        for dep in &context.dependencies {
            prompt.push_str(&format!("- {dep}\n"));
        }
        prompt.push('\n');
    }

    prompt.push_str("## Workspace file tree\n\n```\n");
    prompt.push_str(file_tree);
    prompt.push_str("```\n\n");

    for (path, content) in related_files {
        prompt.push_str(&format!("## File: {path}\n\n```\n{content}\n```\n\n"));
    }

    prompt.push_str(RESPONSE_INSTRUCTIONS);
    prompt
}

const RESPONSE_INSTRUCTIONS: &str = "\
## Response format

Respond with a single JSON object and nothing else:

{
  \"code_changes\": [
    {\"file_path\": \"relative/path\", \"operation\": \"create\" | \"modify\" | \"delete\", \"content\": \"full file content (omit for delete)\"}
  ],
  \"explanation\": \"what you changed and why\"
}

Rules: paths are relative to the workspace root; content is the complete\n\
new file body, not a diff; do not wrap the JSON in prose.\n";

/// Parse the model's answer strictly. A single Markdown code fence around
/// the object is tolerated; trailing non-whitespace is not.
pub fn parse_response(raw: &str) -> Result<EditResponse, String> {
    let trimmed = raw.trim();
    let body = strip_fence(trimmed);
    let response: EditResponse =
        serde_json::from_str(body).map_err(|e| format!("response is not valid JSON: {e}"))?;

    for change in &response.code_changes {
        if change.file_path.is_empty() {
            return Err("code change with empty file_path".to_string());
        }
        if Path::new(&change.file_path).is_absolute() || change.file_path.contains("..") {
            return Err(format!("refusing non-relative path {:?}", change.file_path));
        }
        match change.operation {
            ChangeOp::Create | ChangeOp::Modify if change.content.is_none() => {
                return Err(format!("{} requires content for {}", op_name(change.operation), change.file_path));
            }
            ChangeOp::Delete if change.content.is_some() => {
                return Err(format!("delete must not carry content for {}", change.file_path));
            }
            _ => {}
        }
    }
    Ok(response)
}

fn op_name(op: ChangeOp) -> &'static str {
    match op {
        ChangeOp::Create => "create",
        ChangeOp::Modify => "modify",
        ChangeOp::Delete => "delete",
    }
}

fn strip_fence(s: &str) -> &str {
    let Some(rest) = s.strip_prefix("```") else { return s };
    // Opening fence may carry a language tag; drop the first line.
    let Some(newline) = rest.find('\n') else { return s };
    let inner = &rest[newline + 1..];
    let Some(end) = inner.rfind("```") else { return s };
    let tail = inner[end + 3..].trim();
    if !tail.is_empty() {
        return s; // trailing prose after the fence; let the parser reject it
    }
    inner[..end].trim()
}

/// Render a depth-limited file tree rooted at `root`, sorted, `.git` and
/// hidden entries skipped.
pub fn render_file_tree(root: &Path, max_depth: usize) -> String {
    let mut out = String::new();
    walk(root, 0, max_depth, &mut out);
    out
}

fn walk(dir: &Path, depth: usize, max_depth: usize, out: &mut String) {
    if depth >= max_depth {
        return;
    }
    let Ok(entries) = std::fs::read_dir(dir) else { return };
    let mut names: Vec<(bool, String)> = entries
        .flatten()
        .filter_map(|e| {
            let name = e.file_name().to_str()?.to_string();
            if name.starts_with('.') {
                return None;
            }
            Some((e.path().is_dir(), name))
        })
        .collect();
    names.sort_by(|a, b| a.1.cmp(&b.1));

    for (is_dir, name) in names {
        out.push_str(&"  ".repeat(depth));
        if is_dir {
            out.push_str(&format!("{name}/\n"));
            walk(&dir.join(&name), depth + 1, max_depth, out);
        } else {
            out.push_str(&format!("{name}\n"));
        }
    }
}
