//! `task` commands.

use anyhow::Result;

use crate::cli::output;
use crate::domain::ports::TaskStore;
use crate::services::registry::TaskRegistry;

pub async fn handle_show(registry: &TaskRegistry, spec_name: &str, task_id: &str, json: bool) -> Result<()> {
    let taskset = registry.get_taskset(spec_name).await?;
    let task = taskset
        .task(task_id)
        .ok_or_else(|| crate::domain::error::RegistryError::TaskNotFound {
            spec_name: spec_name.to_string(),
            task_id: task_id.to_string(),
        })?;
    if json {
        return output::print_json(task);
    }

    println!("task {} — {}", task.id, task.title);
    println!("  state:    {}", output::task_state_cell(task.state));
    println!("  skill:    {}", task.required_skill.as_deref().unwrap_or("-"));
    println!("  priority: {}", task.priority);
    println!("  deps:     {}", if task.dependencies.is_empty() { "-".to_string() } else { task.dependencies.join(", ") });
    println!("  retries:  {}/{}", task.retry_count, task.max_retries);
    if let Some(slot) = &task.assigned_slot {
        println!("  slot:     {slot}");
    }
    if let Some(branch) = &task.reserved_branch {
        println!("  branch:   {branch}");
    }
    if !task.acceptance_criteria.is_empty() {
        println!("  acceptance criteria:");
        for (i, criterion) in task.acceptance_criteria.iter().enumerate() {
            println!("    {}. {criterion}", i + 1);
        }
    }
    if !task.artifacts.is_empty() {
        println!("  artifacts:");
        for artifact in &task.artifacts {
            println!("    {} {} ({} bytes)", artifact.artifact_type.as_str(), artifact.uri, artifact.size_bytes);
        }
    }
    Ok(())
}

pub async fn handle_cancel(registry: &TaskRegistry, spec_name: &str, task_id: &str, json: bool) -> Result<()> {
    registry.cancel_task(spec_name, task_id).await?;
    if json {
        output::print_json(&serde_json::json!({"cancelled": task_id}))?;
    } else {
        output::success(&format!("cancel requested for {spec_name}/{task_id}"));
    }
    Ok(())
}

pub async fn handle_retry(registry: &TaskRegistry, spec_name: &str, task_id: &str, json: bool) -> Result<()> {
    let task = registry.retry_task(spec_name, task_id, None).await?;
    if json {
        output::print_json(&task)?;
    } else {
        output::success(&format!(
            "{spec_name}/{task_id} back to ready (retry {}/{})",
            task.retry_count, task.max_retries
        ));
    }
    Ok(())
}
