//! Progress bars driven by the task snapshot stream

use console::style;
use dlsync_core::Snapshot;
use dlsync_types::{TaskId, TaskRecord, TaskState};
use futures::{Stream, StreamExt};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;

/// One bar per followed task
pub struct TaskProgress {
    multi: MultiProgress,
    bars: HashMap<TaskId, ProgressBar>,
}

impl TaskProgress {
    pub fn new(tasks: &[TaskRecord]) -> Self {
        let multi = MultiProgress::new();
        let bars = tasks
            .iter()
            .map(|task| {
                let pb = multi.add(ProgressBar::new(task.size_bytes.unwrap_or(0)));
                pb.set_style(bar_style());
                pb.set_message(task.display_name.clone());
                pb.set_position(task.downloaded_bytes);
                (task.id, pb)
            })
            .collect();

        Self { multi, bars }
    }

    /// Render snapshots until the stream ends or every bar is finished
    pub async fn follow<S>(mut self, mut snapshots: S)
    where
        S: Stream<Item = Snapshot> + Unpin,
    {
        while let Some(snapshot) = snapshots.next().await {
            for task in snapshot.iter() {
                self.update(task);
            }
            if self.bars.values().all(ProgressBar::is_finished) {
                break;
            }
        }
        let _ = self.multi.clear();
    }

    fn update(&mut self, task: &TaskRecord) {
        let Some(pb) = self.bars.get(&task.id) else {
            return;
        };
        if pb.is_finished() {
            return;
        }

        if let Some(size) = task.size_bytes {
            pb.set_length(size);
        }
        pb.set_position(task.downloaded_bytes);

        match task.state {
            TaskState::Completed | TaskState::Seeding => {
                pb.finish_with_message(format!(
                    "{} {}",
                    style("✓").green().bold(),
                    task.display_name
                ));
            }
            TaskState::Failed => {
                pb.abandon_with_message(format!(
                    "{} {}: {}",
                    style("✗").red().bold(),
                    task.display_name,
                    task.error.as_deref().unwrap_or("unknown error")
                ));
            }
            TaskState::Paused | TaskState::SeedingPaused => {
                pb.abandon_with_message(format!(
                    "{} {} paused",
                    style("⏸").yellow(),
                    task.display_name
                ));
            }
            TaskState::Init | TaskState::Downloading => {
                let message = match &task.description {
                    Some(status) => format!("{} ({})", task.display_name, status),
                    None => task.display_name.clone(),
                };
                pb.set_message(message);
            }
        }
    }
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta}) {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▓▒░  ")
}
