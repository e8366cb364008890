//! Output formatting utilities

use crate::OutputFormat;
use console::{style, StyledObject};
use dlsync_types::{TaskRecord, TaskState};
use serde::Serialize;

/// Print a value as pretty JSON
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn is_json(format: OutputFormat) -> bool {
    matches!(format, OutputFormat::Json)
}

/// Format bytes as human-readable
pub fn format_bytes(bytes: u64) -> String {
    human_bytes::human_bytes(bytes as f64)
}

pub fn format_size(size: Option<u64>) -> String {
    size.map(format_bytes).unwrap_or_else(|| "?".to_string())
}

pub fn state_icon(state: TaskState) -> StyledObject<&'static str> {
    match state {
        TaskState::Completed => style("✓").green(),
        TaskState::Downloading => style("↓").cyan(),
        TaskState::Seeding => style("↑").cyan(),
        TaskState::Paused | TaskState::SeedingPaused => style("⏸").yellow(),
        TaskState::Failed => style("✗").red(),
        TaskState::Init => style("·").dim(),
    }
}

/// Shorten long names for table cells
pub fn truncate(name: &str, max: usize) -> String {
    if name.chars().count() > max {
        let head: String = name.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    } else {
        name.to_string()
    }
}

pub fn print_task_summary(task: &TaskRecord, detailed: bool) {
    println!(
        "{} {} {} [{}]",
        state_icon(task.state),
        style(&task.display_name).bold(),
        style(format!("{:.1}%", task.progress() * 100.0)).dim(),
        style(task.state).dim()
    );

    if detailed {
        println!("    ID: {}", task.id);
        println!("    Source: {}", task.source_locator);
        println!("    Destination: {}", task.destination.display());
        println!(
            "    Size: {} / {}",
            format_bytes(task.downloaded_bytes),
            format_size(task.size_bytes)
        );
        if let Some(ref description) = task.description {
            println!("    Status: {}", description);
        }
        if !task.files.is_empty() {
            println!("    Files:");
            for file in &task.files {
                println!(
                    "      {} ({})",
                    file.path.display(),
                    format_bytes(file.size_bytes)
                );
            }
        }
        if let Some(ref error) = task.error {
            println!("    Error: {}", style(error).red());
        }
        println!();
    }
}
