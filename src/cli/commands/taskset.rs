//! `submit` and `taskset` commands.

use anyhow::{bail, Context, Result};

use crate::cli::output;
use crate::domain::models::Task;
use crate::domain::ports::TaskStore;
use crate::services::checklist::ChecklistDoc;
use crate::services::registry::TaskRegistry;

/// Import a checklist document as a fresh taskset. Hierarchy in the doc
/// (two-space indents) becomes parent→child dependencies so parents gate
/// their subtasks.
pub async fn handle_submit(
    registry: &TaskRegistry,
    spec_name: &str,
    checklist_path: &str,
    json: bool,
) -> Result<()> {
    let content = tokio::fs::read_to_string(checklist_path)
        .await
        .with_context(|| format!("failed to read {checklist_path}"))?;
    let doc = ChecklistDoc::parse(&content);
    let entries = doc.entries();
    if entries.is_empty() {
        bail!("{checklist_path} contains no task lines (- [ ] <id> <title>)");
    }

    let mut tasks: Vec<Task> = Vec::new();
    // Stack of (indent, id) tracking the current ancestry.
    let mut ancestry: Vec<(usize, String)> = Vec::new();
    for entry in entries {
        while matches!(ancestry.last(), Some((indent, _)) if *indent >= entry.indent) {
            ancestry.pop();
        }
        let mut task = Task::new(entry.id.clone(), entry.title.clone(), entry.title.clone());
        if let Some((_, parent_id)) = ancestry.last() {
            task = task.with_dependency(parent_id.clone());
        }
        ancestry.push((entry.indent, entry.id));
        tasks.push(task);
    }

    let taskset = registry.create_taskset(spec_name, tasks).await?;
    if json {
        output::print_json(&taskset)?;
    } else {
        output::success(&format!(
            "taskset {spec_name} created with {} tasks",
            taskset.tasks.len()
        ));
    }
    Ok(())
}

pub async fn handle_list(registry: &TaskRegistry, json: bool) -> Result<()> {
    let names = registry.list_tasksets().await?;
    if json {
        return output::print_json(&names);
    }

    let mut table = output::table(&["spec", "tasks", "done", "failed", "updated"]);
    for name in names {
        let taskset = registry.get_taskset(&name).await?;
        let done = taskset
            .tasks
            .iter()
            .filter(|t| t.state == crate::domain::models::TaskState::Done)
            .count();
        let failed = taskset
            .tasks
            .iter()
            .filter(|t| t.state == crate::domain::models::TaskState::Failed)
            .count();
        table.add_row(vec![
            name,
            taskset.tasks.len().to_string(),
            done.to_string(),
            failed.to_string(),
            taskset.updated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        ]);
    }
    println!("{table}");
    Ok(())
}

pub async fn handle_show(registry: &TaskRegistry, spec_name: &str, json: bool) -> Result<()> {
    let taskset = registry.get_taskset(spec_name).await?;
    if json {
        return output::print_json(&taskset);
    }

    println!("taskset {} (version {})", taskset.spec_name, taskset.version);
    let mut table = output::table(&["id", "title", "state", "skill", "priority", "deps", "artifacts"]);
    for task in &taskset.tasks {
        table.add_row(vec![
            task.id.clone(),
            task.title.clone(),
            output::task_state_cell(task.state),
            task.required_skill.clone().unwrap_or_default(),
            task.priority.to_string(),
            task.dependencies.join(","),
            task.artifacts.len().to_string(),
        ]);
    }
    println!("{table}");
    Ok(())
}
