//! CLI command implementations

use crate::output::{self, format_bytes, format_size, is_json, print_json, print_task_summary};
use crate::progress::TaskProgress;
use crate::{ConfigAction, OutputFormat};
use anyhow::{anyhow, bail, Result};
use console::style;
use dlsync_core::config::{config_path, load_config, save_config};
use dlsync_core::{DlsyncError, DownloadService};
use dlsync_types::{CoreConfig, TaskId, TaskRecord, TaskState};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ============================================================================
// Task Commands
// ============================================================================

pub async fn add_downloads(
    service: &DownloadService,
    urls: Vec<String>,
    output: Option<PathBuf>,
    format: OutputFormat,
) -> Result<()> {
    let mut tasks = Vec::with_capacity(urls.len());
    for url in &urls {
        let task = service.start(url, output.clone()).await?;
        if !is_json(format) {
            println!(
                "{} Added {} ({})",
                style("✓").green().bold(),
                style(&task.display_name).cyan(),
                style(task.id).dim()
            );
        }
        tasks.push(task);
    }

    follow_tasks(service, tasks, format).await
}

pub async fn resume_task(service: &DownloadService, id: &str, format: OutputFormat) -> Result<()> {
    let id = resolve_id(service, id).await?;
    let task = service.resume(id).await?;

    if !is_json(format) {
        println!(
            "{} Resuming {} from {}",
            style("↻").cyan().bold(),
            style(&task.display_name).cyan(),
            format_bytes(task.downloaded_bytes)
        );
    }

    follow_tasks(service, vec![task], format).await
}

/// Show progress until every task's job ends; Ctrl-C pauses them instead
async fn follow_tasks(
    service: &DownloadService,
    tasks: Vec<TaskRecord>,
    format: OutputFormat,
) -> Result<()> {
    let ids: Vec<TaskId> = tasks.iter().map(|t| t.id).collect();

    let renderer = if is_json(format) {
        None
    } else {
        let snapshots = service.observe_all().await?;
        Some(tokio::spawn(TaskProgress::new(&tasks).follow(snapshots)))
    };

    let waits = futures::future::join_all(ids.iter().map(|id| service.wait_terminal(*id)));
    let interrupted = tokio::select! {
        results = waits => {
            for result in results {
                result?;
            }
            false
        }
        _ = tokio::signal::ctrl_c() => true,
    };

    if interrupted {
        for id in &ids {
            match service.pause(*id).await {
                Ok(_) | Err(DlsyncError::InvalidOperation(_)) => {}
                Err(e) => tracing::warn!("Failed to pause {}: {}", id, e),
            }
        }
    }

    if let Some(renderer) = renderer {
        let _ = tokio::time::timeout(Duration::from_secs(1), renderer).await;
    }

    let mut settled = Vec::with_capacity(ids.len());
    for id in &ids {
        if let Some(task) = service.get(*id).await? {
            settled.push(task);
        }
    }

    if is_json(format) {
        return print_json(&settled);
    }

    for task in &settled {
        print_task_summary(task, task.state != TaskState::Completed);
    }
    if interrupted {
        println!(
            "{} Interrupted; continue with {}",
            style("⏸").yellow(),
            style("dlsync resume <id>").bold()
        );
    }

    Ok(())
}

pub async fn list_tasks(
    service: &DownloadService,
    status_filter: Option<String>,
    show_all: bool,
    format: OutputFormat,
) -> Result<()> {
    let state_filter = status_filter
        .map(|s| s.parse::<TaskState>())
        .transpose()
        .map_err(|e| anyhow!("{}", e))?;

    let tasks: Vec<_> = service
        .list()
        .await?
        .into_iter()
        .filter(|t| state_filter.map_or(true, |state| t.state == state))
        .collect();

    match format {
        OutputFormat::Json => print_json(&tasks)?,
        OutputFormat::Table => {
            use tabled::{Table, Tabled};

            #[derive(Tabled)]
            struct TaskRow {
                id: String,
                name: String,
                kind: String,
                size: String,
                progress: String,
                state: String,
            }

            let rows: Vec<TaskRow> = tasks
                .iter()
                .map(|t| TaskRow {
                    id: t.id.to_string()[..8].to_string(),
                    name: output::truncate(&t.display_name, 30),
                    kind: t.kind.as_str().to_string(),
                    size: format_size(t.size_bytes),
                    progress: format!("{:.1}%", t.progress() * 100.0),
                    state: t.state.to_string(),
                })
                .collect();

            println!("{}", Table::new(rows));
        }
        OutputFormat::Human => {
            if tasks.is_empty() {
                println!("{}", style("No tasks found").dim());
                return Ok(());
            }

            for task in &tasks {
                print_task_summary(task, show_all);
            }
            println!();
            println!("{} task(s) total", style(tasks.len()).bold());
        }
    }

    Ok(())
}

pub async fn show_info(service: &DownloadService, id: &str, format: OutputFormat) -> Result<()> {
    let id = resolve_id(service, id).await?;
    let task = service
        .get(id)
        .await?
        .ok_or_else(|| anyhow!("Task not found: {}", id))?;

    match format {
        OutputFormat::Json => print_json(&task)?,
        _ => print_task_summary(&task, true),
    }

    Ok(())
}

pub async fn delete_task(
    service: &DownloadService,
    id: &str,
    yes: bool,
    format: OutputFormat,
) -> Result<()> {
    let id = resolve_id(service, id).await?;

    if !yes {
        let task = service
            .get(id)
            .await?
            .ok_or_else(|| anyhow!("Task not found: {}", id))?;
        let confirmed = dialoguer::Confirm::new()
            .with_prompt(format!("Delete {} and its files?", task.display_name))
            .default(false)
            .interact()?;
        if !confirmed {
            return Ok(());
        }
    }

    service.delete(id).await?;

    if is_json(format) {
        print_json(&serde_json::json!({ "deleted": id }))?;
    } else {
        println!("{} Task deleted", style("✓").green().bold());
    }
    Ok(())
}

/// Accept a full task ID or any unambiguous prefix of one
async fn resolve_id(service: &DownloadService, input: &str) -> Result<TaskId> {
    if let Ok(id) = input.parse::<TaskId>() {
        return Ok(id);
    }

    let matches: Vec<TaskId> = service
        .list()
        .await?
        .into_iter()
        .map(|t| t.id)
        .filter(|id| id.to_string().starts_with(input))
        .collect();

    match matches.as_slice() {
        [id] => Ok(*id),
        [] => bail!("No task matches {}", input),
        _ => bail!("{} matches {} tasks; use more characters", input, matches.len()),
    }
}

// ============================================================================
// Config Commands
// ============================================================================

pub async fn config_action(
    data_dir: &Path,
    action: Option<ConfigAction>,
    format: OutputFormat,
) -> Result<()> {
    let config = load_config(data_dir).await?;

    match action {
        None | Some(ConfigAction::Show) => match format {
            OutputFormat::Json => print_json(&config)?,
            _ => {
                println!("dlsync configuration ({}):", config_path(data_dir).display());
                println!();
                let values = serde_json::to_value(&config)?;
                if let Some(map) = values.as_object() {
                    for (key, value) in map {
                        println!("  {}: {}", key, display_value(value));
                    }
                }
            }
        },

        Some(ConfigAction::Get { key }) => {
            let values = serde_json::to_value(&config)?;
            let value = values
                .get(&key)
                .ok_or_else(|| anyhow!("Unknown config key: {}", key))?;
            println!("{}", display_value(value));
        }

        Some(ConfigAction::Set { key, value }) => {
            let updated = set_value(config, &key, &value)?;
            save_config(&updated).await?;
            println!("{} Config updated", style("✓").green().bold());
        }

        Some(ConfigAction::Reset) => {
            let confirmed = dialoguer::Confirm::new()
                .with_prompt("Reset all settings to defaults?")
                .default(false)
                .interact()?;

            if confirmed {
                save_config(&CoreConfig::with_data_dir(data_dir)).await?;
                println!("{} Settings reset to defaults", style("✓").green().bold());
            }
        }
    }

    Ok(())
}

fn display_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Replace one key, keeping the type the key already has
fn set_value(config: CoreConfig, key: &str, raw: &str) -> Result<CoreConfig> {
    if key == "data_dir" {
        bail!("data_dir is read-only; use --data-dir instead");
    }

    let mut values = serde_json::to_value(&config)?;
    let slot = values
        .get_mut(key)
        .ok_or_else(|| anyhow!("Unknown config key: {}", key))?;

    *slot = if slot.is_number() {
        let number = raw
            .parse::<u64>()
            .map_err(|_| anyhow!("{} expects a non-negative integer", key))?;
        serde_json::Value::from(number)
    } else {
        serde_json::Value::String(raw.to_string())
    };

    Ok(serde_json::from_value(values)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_value_keeps_key_types() {
        let config = CoreConfig::with_data_dir("/tmp/dlsync");

        let updated = set_value(config.clone(), "max_concurrent_jobs", "8").unwrap();
        assert_eq!(updated.max_concurrent_jobs, 8);

        let updated = set_value(config.clone(), "default_destination", "/srv/files").unwrap();
        assert_eq!(updated.default_destination, PathBuf::from("/srv/files"));

        assert!(set_value(config.clone(), "max_retries", "lots").is_err());
        assert!(set_value(config.clone(), "no_such_key", "1").is_err());
        assert!(set_value(config, "data_dir", "/elsewhere").is_err());
    }
}
