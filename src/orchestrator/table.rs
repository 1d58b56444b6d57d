//! In-memory task table and its state machine.
//!
//! Every method is a short synchronous mutation; callers hold the table lock
//! only for the call. Executors never touch the table directly.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::model::{DownloadTask, TaskStatus};

/// Dispatch order: priority (lower first), enqueue time, insertion.
type PendingKey = (i64, u64, u64, String);

#[derive(Debug)]
struct Entry {
    task: DownloadTask,
    order: u64,
    /// Set while the task holds a worker slot.
    cancel: Option<CancellationToken>,
    /// Message applied if the running task ends cancelled.
    cancel_message: Option<String>,
    last_activity: Instant,
    finished_at: Option<Instant>,
}

impl Entry {
    fn pending_key(&self) -> PendingKey {
        (
            self.task.priority,
            self.task.added_at_ms,
            self.order,
            self.task.id.clone(),
        )
    }

    fn holds_slot(&self) -> bool {
        self.cancel.is_some()
    }

    fn cancel_requested(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    fn finish(&mut self, status: TaskStatus, message: Option<String>, now: Instant) {
        self.task.status = status;
        self.task.status_message = message;
        self.finished_at = Some(now);
    }
}

/// Result of inserting a task.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Inserted {
    /// A non-terminal task with the same id already exists.
    Existing(DownloadTask),
    /// The task was added; `replaced` is true if a terminal task was dropped.
    New { task: DownloadTask, replaced: bool },
}

/// Result of a cancel request.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Cancelled {
    NotFound,
    AlreadyTerminal,
    /// Dropped from the table without running; carries the final snapshot.
    Dequeued(DownloadTask),
    /// Cancellation signal raised on the running executor.
    Signalled,
}

/// How an execution ended, as seen by the worker.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Finish {
    Complete(PathBuf),
    Cancelled,
    Failed(String),
}

/// A task popped from the pending queue.
#[derive(Debug, Clone)]
pub(crate) struct Dispatched {
    pub task: DownloadTask,
    pub cancel: CancellationToken,
    /// Slots held by other tasks at dispatch time.
    pub others_active: usize,
}

#[derive(Debug, Default)]
pub(crate) struct TaskTable {
    entries: HashMap<String, Entry>,
    pending: BTreeSet<PendingKey>,
    next_order: u64,
}

impl TaskTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, task_id: &str) -> Option<&DownloadTask> {
        self.entries.get(task_id).map(|e| &e.task)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn tasks(&self) -> impl Iterator<Item = &DownloadTask> {
        self.entries.values().map(|e| &e.task)
    }

    pub fn insert(&mut self, task: DownloadTask, now: Instant) -> Inserted {
        let mut replaced = false;
        if let Some(existing) = self.entries.get(&task.id) {
            // An errored task whose executor has not returned yet still owns its slot.
            if !existing.task.is_terminal() || existing.holds_slot() {
                return Inserted::Existing(existing.task.clone());
            }
            replaced = true;
        }

        let order = self.next_order;
        self.next_order += 1;
        let entry = Entry {
            task,
            order,
            cancel: None,
            cancel_message: None,
            last_activity: now,
            finished_at: None,
        };
        let terminal = entry.task.is_terminal();
        if terminal {
            // Restored terminal records keep ageing from load time.
            let mut entry = entry;
            entry.finished_at = Some(now);
            let task = entry.task.clone();
            self.entries.insert(task.id.clone(), entry);
            return Inserted::New { task, replaced };
        }

        self.pending.insert(entry.pending_key());
        let task = entry.task.clone();
        self.entries.insert(task.id.clone(), entry);
        Inserted::New { task, replaced }
    }

    /// Pops the next queued task and marks it as holding a slot.
    pub fn dispatch_next(&mut self, parent: &CancellationToken, now: Instant) -> Option<Dispatched> {
        let others_active = self.active_count();
        let key = self.pending.pop_first()?;
        let entry = self.entries.get_mut(&key.3)?;
        let cancel = parent.child_token();
        entry.cancel = Some(cancel.clone());
        entry.last_activity = now;
        Some(Dispatched {
            task: entry.task.clone(),
            cancel,
            others_active,
        })
    }

    /// Clamps and applies reported progress. Returns the new value if it
    /// moved forward.
    pub fn apply_progress(&mut self, task_id: &str, percent: f64, now: Instant) -> Option<f64> {
        let entry = self.entries.get_mut(task_id)?;
        if entry.task.is_terminal() || !entry.holds_slot() {
            return None;
        }
        entry.last_activity = now;
        let percent = if percent.is_nan() { 0.0 } else { percent.clamp(0.0, 100.0) };
        if percent <= entry.task.progress {
            return None;
        }
        entry.task.progress = percent;
        Some(percent)
    }

    /// Applies an executor-reported status. Returns the updated task if the
    /// transition was accepted.
    pub fn apply_status(
        &mut self,
        task_id: &str,
        status: TaskStatus,
        message: Option<String>,
        now: Instant,
    ) -> Option<DownloadTask> {
        let entry = self.entries.get_mut(task_id)?;
        if !entry.holds_slot() || !entry.task.status.can_transition_to(status) {
            return None;
        }
        entry.last_activity = now;
        match status {
            // A cancelled task resolves to cancelled, never error.
            TaskStatus::Error if entry.cancel_requested() => return None,
            TaskStatus::Error => entry.finish(status, message, now),
            TaskStatus::Resolving | TaskStatus::Downloading => {
                if entry.task.status == status && entry.task.status_message == message {
                    return None;
                }
                entry.task.status = status;
                entry.task.status_message = message;
            }
            TaskStatus::Queued | TaskStatus::Complete | TaskStatus::Cancelled => return None,
        }
        Some(entry.task.clone())
    }

    /// Releases the task's slot and records the final state. Returns the
    /// updated task unless it was already terminal.
    pub fn finish(&mut self, task_id: &str, finish: Finish, now: Instant) -> Option<DownloadTask> {
        let entry = self.entries.get_mut(task_id)?;
        let cancel_requested = entry.cancel_requested();
        entry.cancel = None;
        if entry.task.is_terminal() {
            return None;
        }
        match finish {
            Finish::Complete(path) if !cancel_requested => {
                entry.task.progress = 100.0;
                entry.task.output_path = Some(path);
                entry.finish(TaskStatus::Complete, None, now);
            }
            Finish::Failed(message) if !cancel_requested => {
                entry.finish(TaskStatus::Error, Some(message), now);
            }
            Finish::Complete(_) | Finish::Failed(_) | Finish::Cancelled => {
                let message = entry.cancel_message.take();
                entry.finish(TaskStatus::Cancelled, message, now);
            }
        }
        Some(entry.task.clone())
    }

    pub fn cancel(&mut self, task_id: &str, now: Instant) -> Cancelled {
        let Some(entry) = self.entries.get_mut(task_id) else {
            return Cancelled::NotFound;
        };
        if entry.task.is_terminal() {
            return Cancelled::AlreadyTerminal;
        }
        if let Some(token) = &entry.cancel {
            token.cancel();
            return Cancelled::Signalled;
        }
        self.pending.remove(&entry.pending_key());
        entry.finish(TaskStatus::Cancelled, None, now);
        match self.entries.remove(task_id) {
            Some(entry) => Cancelled::Dequeued(entry.task),
            None => Cancelled::NotFound,
        }
    }

    /// Changes the priority of a still-queued task.
    pub fn set_priority(&mut self, task_id: &str, priority: i64) -> Option<DownloadTask> {
        let entry = self.entries.get_mut(task_id)?;
        if entry.task.status != TaskStatus::Queued || entry.holds_slot() {
            return None;
        }
        if entry.task.priority == priority {
            return Some(entry.task.clone());
        }
        self.pending.remove(&entry.pending_key());
        entry.task.priority = priority;
        self.pending.insert(entry.pending_key());
        Some(entry.task.clone())
    }

    /// Queued tasks in dispatch order.
    pub fn queue_order(&self) -> Vec<DownloadTask> {
        self.pending
            .iter()
            .filter_map(|key| self.entries.get(&key.3))
            .map(|e| e.task.clone())
            .collect()
    }

    /// Tasks holding a worker slot.
    pub fn active(&self) -> Vec<DownloadTask> {
        let mut active: Vec<&Entry> = self.entries.values().filter(|e| e.holds_slot()).collect();
        active.sort_by_key(|e| e.order);
        active.into_iter().map(|e| e.task.clone()).collect()
    }

    pub fn active_count(&self) -> usize {
        self.entries.values().filter(|e| e.holds_slot()).count()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Drops every terminal task that no longer holds a slot.
    pub fn clear_terminal(&mut self) -> Vec<String> {
        self.remove_where(|e| e.task.is_terminal())
    }

    /// Drops terminal tasks older than `timeout`.
    pub fn evict_expired(&mut self, now: Instant, timeout: Duration) -> Vec<String> {
        self.remove_where(|e| {
            e.finished_at
                .is_some_and(|at| now.saturating_duration_since(at) >= timeout)
        })
    }

    fn remove_where(&mut self, predicate: impl Fn(&Entry) -> bool) -> Vec<String> {
        let mut removed: Vec<String> = self
            .entries
            .values()
            .filter(|e| !e.holds_slot() && predicate(e))
            .map(|e| e.task.id.clone())
            .collect();
        removed.sort_unstable();
        for id in &removed {
            self.entries.remove(id);
        }
        removed
    }

    /// Signals every slot holder idle for `timeout` or longer.
    pub fn cancel_stalled(&mut self, now: Instant, timeout: Duration) -> Vec<String> {
        let mut stalled = Vec::new();
        for entry in self.entries.values_mut() {
            let Some(token) = &entry.cancel else {
                continue;
            };
            if token.is_cancelled()
                || entry.task.is_terminal()
                || now.saturating_duration_since(entry.last_activity) < timeout
            {
                continue;
            }
            token.cancel();
            entry.cancel_message = Some(format!(
                "Download stalled (no activity for {}s)",
                timeout.as_secs()
            ));
            stalled.push(entry.task.id.clone());
        }
        stalled.sort_unstable();
        stalled
    }
}
