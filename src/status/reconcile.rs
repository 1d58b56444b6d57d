//! Client-side mirror of the queue, reconciled against fresh snapshots.

use std::collections::HashMap;

use crate::model::{DownloadTask, TaskStatus};

use super::{QueueSnapshot, StatusEvent, TaskDelta};

/// Deltas that turn `old` into `new`.
///
/// Removed ids come first, then upserts in id order. A task whose only
/// change is progress yields a `Progress` delta.
#[must_use]
pub fn diff(old: &QueueSnapshot, new: &QueueSnapshot) -> Vec<TaskDelta> {
    let old_tasks: HashMap<&str, &DownloadTask> = old.tasks().map(|t| (t.id.as_str(), t)).collect();
    let new_tasks: HashMap<&str, &DownloadTask> = new.tasks().map(|t| (t.id.as_str(), t)).collect();

    let mut removed: Vec<&str> = old_tasks
        .keys()
        .filter(|id| !new_tasks.contains_key(*id))
        .copied()
        .collect();
    removed.sort_unstable();

    let mut changed: Vec<&DownloadTask> = new_tasks
        .values()
        .filter(|task| old_tasks.get(task.id.as_str()).is_none_or(|old| *old != **task))
        .copied()
        .collect();
    changed.sort_unstable_by(|a, b| a.id.cmp(&b.id));

    let mut deltas: Vec<TaskDelta> = removed
        .into_iter()
        .map(|id| TaskDelta::Removed {
            task_id: id.to_string(),
        })
        .collect();
    deltas.extend(changed.into_iter().map(|task| {
        match old_tasks.get(task.id.as_str()) {
            Some(old) if only_progress_changed(old, task) => TaskDelta::Progress {
                task_id: task.id.clone(),
                progress: task.progress,
            },
            _ => TaskDelta::Upsert { task: task.clone() },
        }
    }));
    deltas
}

fn only_progress_changed(old: &DownloadTask, new: &DownloadTask) -> bool {
    let mut old = old.clone();
    old.progress = new.progress;
    old == *new
}

/// Local copy of the queue kept current from pushed events.
///
/// Events at or below the mirror's sequence number are already reflected
/// and are ignored, so replaying buffered pushes after a resync never
/// regresses state.
#[derive(Debug, Clone, Default)]
pub struct QueueMirror {
    tasks: HashMap<String, DownloadTask>,
    seq: u64,
}

impl QueueMirror {
    /// Creates a mirror initialised from a snapshot.
    #[must_use]
    pub fn from_snapshot(snapshot: &QueueSnapshot) -> Self {
        Self {
            tasks: snapshot.tasks().map(|t| (t.id.clone(), t.clone())).collect(),
            seq: snapshot.seq,
        }
    }

    /// Applies one pushed event. Returns false if it was stale.
    pub fn apply(&mut self, event: &StatusEvent) -> bool {
        if event.seq <= self.seq {
            return false;
        }
        self.seq = event.seq;
        match &event.delta {
            TaskDelta::Upsert { task } => {
                self.tasks.insert(task.id.clone(), task.clone());
            }
            TaskDelta::Progress { task_id, progress } => {
                if let Some(task) = self.tasks.get_mut(task_id) {
                    task.progress = task.progress.max(*progress);
                }
            }
            TaskDelta::Removed { task_id } => {
                self.tasks.remove(task_id);
            }
        }
        true
    }

    /// Replaces local state with `snapshot`, returning what changed.
    pub fn resync(&mut self, snapshot: &QueueSnapshot) -> Vec<TaskDelta> {
        let current = self.snapshot();
        let deltas = diff(&current, snapshot);
        *self = Self::from_snapshot(snapshot);
        deltas
    }

    /// Current local view as a snapshot.
    #[must_use]
    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot::from_tasks(self.seq, self.tasks.values().cloned())
    }

    /// Looks up a task.
    #[must_use]
    pub fn get(&self, task_id: &str) -> Option<&DownloadTask> {
        self.tasks.get(task_id)
    }

    /// Number of mirrored tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Returns true when no tasks are mirrored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Returns true when every mirrored task is terminal.
    #[must_use]
    pub fn all_terminal(&self) -> bool {
        self.tasks.values().all(|t| t.status.is_terminal())
    }

    /// Count of tasks per status.
    #[must_use]
    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|t| t.status == status).count()
    }

    /// Sequence number of the last applied event or snapshot.
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq
    }
}
