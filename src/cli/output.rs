//! Terminal output helpers: tables for humans, JSON for machines.

use comfy_table::{presets::UTF8_FULL_CONDENSED, Cell, Table};
use console::style;
use serde::Serialize;

use crate::domain::models::{SlotState, TaskState};

/// Print a value as pretty JSON (for `--json`).
pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Build a table with the house preset.
pub fn table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(headers.iter().map(|h| Cell::new(h)).collect::<Vec<_>>());
    table
}

/// Colored task state for table cells.
pub fn task_state_cell(state: TaskState) -> String {
    match state {
        TaskState::Ready => style("ready").cyan().to_string(),
        TaskState::Running => style("running").yellow().to_string(),
        TaskState::Blocked => style("blocked").dim().to_string(),
        TaskState::Done => style("done").green().to_string(),
        TaskState::Failed => style("failed").red().to_string(),
    }
}

pub fn slot_state_cell(state: SlotState) -> String {
    match state {
        SlotState::Available => style("available").green().to_string(),
        SlotState::Allocated => style("allocated").yellow().to_string(),
        SlotState::Cleaning => style("cleaning").cyan().to_string(),
        SlotState::Error => style("error").red().to_string(),
    }
}

pub fn success(message: &str) {
    println!("{} {message}", style("✓").green());
}

pub fn note(message: &str) {
    println!("{} {message}", style("·").dim());
}
