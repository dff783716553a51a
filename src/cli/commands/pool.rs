//! `pool` commands.

use anyhow::Result;

use crate::cli::output;
use crate::domain::models::CleanupPolicy;
use crate::services::pool::RepoPoolManager;

pub async fn handle_create(
    pool: &RepoPoolManager,
    repo_name: &str,
    repo_url: &str,
    slots: u32,
    no_fetch_on_allocate: bool,
    json: bool,
) -> Result<()> {
    let policy = CleanupPolicy {
        fetch_on_allocate: !no_fetch_on_allocate,
        ..CleanupPolicy::default()
    };
    let created = pool.create_pool(repo_name, repo_url, slots, policy).await?;
    if json {
        output::print_json(&created)?;
    } else {
        output::success(&format!("pool {repo_name} created with {slots} slots"));
    }
    Ok(())
}

pub async fn handle_status(pool: &RepoPoolManager, repo_name: &str, json: bool) -> Result<()> {
    let loaded = pool.get_pool(repo_name).await?;
    if json {
        return output::print_json(&loaded);
    }

    println!("pool {} ({} slots) — {}", loaded.repo_name, loaded.num_slots, loaded.repo_url);
    let mut table = output::table(&["slot", "state", "branch", "allocations", "holder", "last released"]);
    for slot in &loaded.slots {
        table.add_row(vec![
            slot.slot_id.clone(),
            output::slot_state_cell(slot.state),
            slot.current_branch.clone(),
            slot.allocation_count.to_string(),
            slot.holder
                .as_ref()
                .map(|(spec, task)| format!("{spec}/{task}"))
                .unwrap_or_default(),
            slot.last_released_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "never".to_string()),
        ]);
    }
    println!("{table}");
    Ok(())
}

pub async fn handle_recover(
    pool: &RepoPoolManager,
    max_allocation_hours: u64,
    release_long_allocated: bool,
    json: bool,
) -> Result<()> {
    let report = pool.auto_recover(max_allocation_hours, release_long_allocated).await?;
    if json {
        return output::print_json(&report);
    }
    output::success(&format!(
        "auto-recover: released {} recovered {} isolated {} locks cleared {}",
        report.released, report.recovered, report.isolated, report.locks_cleared
    ));
    Ok(())
}

pub async fn handle_add_slot(pool: &RepoPoolManager, repo_name: &str, json: bool) -> Result<()> {
    let slot = pool.add_slot(repo_name).await?;
    if json {
        output::print_json(&slot)?;
    } else {
        output::success(&format!("added {}", slot.slot_id));
    }
    Ok(())
}

pub async fn handle_remove_slot(pool: &RepoPoolManager, slot_id: &str, force: bool, json: bool) -> Result<()> {
    pool.remove_slot(slot_id, force).await?;
    if json {
        output::print_json(&serde_json::json!({"removed": slot_id}))?;
    } else {
        output::success(&format!("removed {slot_id}"));
    }
    Ok(())
}
