//! `events` and `graph` commands.

use anyhow::{bail, Result};

use crate::cli::output;
use crate::domain::ports::TaskStore;
use crate::services::registry::{GraphFormat, TaskRegistry};

pub async fn handle_query(
    registry: &TaskRegistry,
    spec_name: &str,
    task_id: Option<&str>,
    limit: usize,
    json: bool,
) -> Result<()> {
    let mut events = registry.query_events(spec_name, task_id, None, None).await?;
    let total = events.len();
    if total > limit {
        events = events.split_off(total - limit);
    }

    if json {
        return output::print_json(&events);
    }

    let mut table = output::table(&["timestamp", "type", "task", "details"]);
    for event in &events {
        let details = event
            .details
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ");
        table.add_row(vec![
            event.timestamp.format("%H:%M:%S%.3f").to_string(),
            event.event_type.as_str().to_string(),
            event.task_id.clone(),
            details,
        ]);
    }
    println!("{table}");
    if total > limit {
        output::note(&format!("showing last {limit} of {total} events"));
    }
    Ok(())
}

pub async fn handle_prune(registry: &TaskRegistry, spec_name: &str, json: bool) -> Result<()> {
    let removed = registry.prune_events(spec_name).await?;
    if json {
        output::print_json(&serde_json::json!({"removed_files": removed}))?;
    } else {
        output::success(&format!("pruned {removed} rotated event log file(s)"));
    }
    Ok(())
}

pub async fn handle_graph(registry: &TaskRegistry, spec_name: &str, format: &str, json: bool) -> Result<()> {
    let format = match format {
        "dot" => GraphFormat::Dot,
        "mermaid" => GraphFormat::Mermaid,
        other => bail!("unknown graph format {other:?} (expected dot or mermaid)"),
    };
    let rendered = registry.export_dependency_graph(spec_name, format).await?;
    if json {
        output::print_json(&serde_json::json!({"graph": rendered}))?;
    } else {
        print!("{rendered}");
    }
    Ok(())
}
