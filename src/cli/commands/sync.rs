//! `sync`: checklist reconciliation.

use anyhow::{bail, Result};

use crate::cli::output;
use crate::services::checklist::SyncDirection;
use crate::services::registry::TaskRegistry;

pub async fn handle_sync(
    registry: &TaskRegistry,
    spec_name: &str,
    doc: &str,
    direction: &str,
    json: bool,
) -> Result<()> {
    let direction = match direction {
        "fromdoc" => SyncDirection::FromDoc,
        "todoc" => SyncDirection::ToDoc,
        "both" | "bidirectional" => SyncDirection::Bidirectional,
        other => bail!("unknown sync direction {other:?} (expected fromdoc, todoc, or both)"),
    };

    let result = registry
        .sync_checklist(spec_name, std::path::Path::new(doc), direction)
        .await?;

    if json {
        return output::print_json(&result);
    }
    output::success(&format!(
        "sync complete: +{} tasks, {} titles, {} re-enabled, {} checkboxes",
        result.tasks_added.len(),
        result.titles_updated.len(),
        result.tasks_reenabled.len(),
        result.checkboxes_updated.len()
    ));
    if !result.missing_from_doc.is_empty() {
        output::note(&format!(
            "{} task(s) have no checklist line: {}",
            result.missing_from_doc.len(),
            result.missing_from_doc.join(", ")
        ));
    }
    Ok(())
}
