//! Live progress bars driven by the orchestrator's push stream.

use std::collections::HashMap;
use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use shelfdl_core::status::{QueueMirror, StatusUpdate};
use shelfdl_core::{DownloadTask, Orchestrator, TaskStatus};
use tracing::debug;

/// Counts of finished tasks.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RunSummary {
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl RunSummary {
    pub(crate) fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a DownloadTask>) -> Self {
        let mut summary = Self::default();
        for task in tasks {
            match task.status {
                TaskStatus::Complete => summary.completed += 1,
                TaskStatus::Error => summary.failed += 1,
                TaskStatus::Cancelled => summary.cancelled += 1,
                _ => {}
            }
        }
        summary
    }
}

struct Bars {
    multi: MultiProgress,
    style: ProgressStyle,
    bars: HashMap<String, ProgressBar>,
}

impl Bars {
    fn new(visible: bool) -> Self {
        let multi = MultiProgress::new();
        if !visible {
            multi.set_draw_target(ProgressDrawTarget::hidden());
        }
        let style = ProgressStyle::with_template("{spinner} {prefix:30!} [{bar:30}] {pos:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");
        Self {
            multi,
            style,
            bars: HashMap::new(),
        }
    }

    fn render(&mut self, task: &DownloadTask) {
        let bar = self.bars.entry(task.id.clone()).or_insert_with(|| {
            let bar = self.multi.add(ProgressBar::new(100));
            bar.set_style(self.style.clone());
            bar.set_prefix(task.title.clone());
            bar.enable_steady_tick(Duration::from_millis(120));
            bar
        });
        if bar.is_finished() {
            return;
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let position = task.progress.clamp(0.0, 100.0) as u64;
        bar.set_position(position);
        let message = match &task.status_message {
            Some(message) => format!("{} - {message}", task.status),
            None => task.status.to_string(),
        };
        if task.status.is_terminal() {
            bar.finish_with_message(message);
        } else {
            bar.set_message(message);
        }
    }
}

/// Renders every tracked task until all of them are terminal.
///
/// Returns the final summary. Lagging behind the push buffer triggers a
/// resync from a fresh snapshot.
pub(crate) async fn watch_tasks(
    orchestrator: &Orchestrator,
    task_ids: &[String],
    visible: bool,
) -> RunSummary {
    let mut subscription = orchestrator.subscribe();
    let mut mirror = QueueMirror::from_snapshot(&orchestrator.snapshot());
    let mut bars = Bars::new(visible);

    let tracked = |mirror: &QueueMirror| -> Vec<DownloadTask> {
        task_ids
            .iter()
            .filter_map(|id| mirror.get(id).cloned())
            .collect()
    };
    let done = |tasks: &[DownloadTask]| {
        tasks.len() == task_ids.len() && tasks.iter().all(DownloadTask::is_terminal)
    };

    loop {
        let tasks = tracked(&mirror);
        for task in &tasks {
            bars.render(task);
        }
        if done(&tasks) {
            return RunSummary::from_tasks(&tasks);
        }

        match subscription.recv().await {
            Some(StatusUpdate::Event(event)) => {
                mirror.apply(&event);
            }
            Some(StatusUpdate::Resync { missed }) => {
                debug!(missed, "Progress view resyncing");
                mirror.resync(&orchestrator.snapshot());
            }
            None => {
                let tasks = tracked(&QueueMirror::from_snapshot(&orchestrator.snapshot()));
                return RunSummary::from_tasks(&tasks);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shelfdl_core::Release;

    fn task(id: &str, status: TaskStatus) -> DownloadTask {
        let mut task = DownloadTask::from_release(&Release::new("s", id, id), 0);
        task.status = status;
        task
    }

    #[test]
    fn test_summary_counts_terminal_states() {
        let tasks = [
            task("a", TaskStatus::Complete),
            task("b", TaskStatus::Error),
            task("c", TaskStatus::Complete),
            task("d", TaskStatus::Cancelled),
            task("e", TaskStatus::Downloading),
        ];
        let summary = RunSummary::from_tasks(&tasks);
        assert_eq!(
            summary,
            RunSummary {
                completed: 2,
                failed: 1,
                cancelled: 1
            }
        );
    }

    #[test]
    fn test_hidden_bars_track_tasks() {
        let mut bars = Bars::new(false);
        let mut t = task("a", TaskStatus::Downloading);
        t.progress = 40.0;
        bars.render(&t);
        assert_eq!(bars.bars["a"].position(), 40);

        t.status = TaskStatus::Complete;
        t.progress = 100.0;
        bars.render(&t);
        assert!(bars.bars["a"].is_finished());
    }
}
