//! Live task-state fan-out.
//!
//! The orchestrator publishes a [`TaskDelta`] for every change to its task
//! table through a [`StatusBroadcaster`]. Subscribers receive sequenced
//! [`StatusEvent`]s; one that falls behind the push buffer is told to
//! resync ([`StatusUpdate::Resync`]) and should fetch a fresh
//! [`QueueSnapshot`] and reconcile with [`QueueMirror::resync`].
//!
//! Progress pushes are throttled per task ([`ProgressThrottle`]); status
//! changes and removals are always pushed.

mod reconcile;
mod throttle;

pub use reconcile::{QueueMirror, diff};
pub use throttle::{NEAR_COMPLETE_PROGRESS, PROGRESS_JUMP_THRESHOLD, ProgressThrottle};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::warn;

use crate::model::{DownloadTask, TaskStatus};

/// Default number of buffered pushes per subscriber.
pub const DEFAULT_PUSH_BUFFER: usize = 1024;

/// One change to the task table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskDelta {
    /// A task was added or any field other than progress changed.
    Upsert {
        /// Full task record after the change
        task: DownloadTask,
    },
    /// Only progress changed.
    Progress {
        /// Task id
        task_id: String,
        /// New progress (0-100)
        progress: f64,
    },
    /// The task left the table.
    Removed {
        /// Task id
        task_id: String,
    },
}

impl TaskDelta {
    /// Id of the affected task.
    #[must_use]
    pub fn task_id(&self) -> &str {
        match self {
            Self::Upsert { task } => &task.id,
            Self::Progress { task_id, .. } | Self::Removed { task_id } => task_id,
        }
    }
}

/// A delta with its position in the publish order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    /// Monotonic sequence number, starting at 1.
    pub seq: u64,
    /// The change.
    pub delta: TaskDelta,
}

/// What a subscriber receives.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusUpdate {
    /// Next event in order.
    Event(StatusEvent),
    /// Pushes were dropped; fetch a fresh snapshot.
    Resync {
        /// Number of events skipped
        missed: u64,
    },
}

/// Consistent view of every task, grouped by status.
///
/// Every status bucket is present, even when empty. `seq` is the sequence
/// number of the last event published before the snapshot was taken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    /// Sequence number the snapshot reflects.
    pub seq: u64,
    /// status -> task id -> task
    pub buckets: BTreeMap<TaskStatus, BTreeMap<String, DownloadTask>>,
}

impl QueueSnapshot {
    /// Builds a snapshot from task records.
    pub fn from_tasks(seq: u64, tasks: impl IntoIterator<Item = DownloadTask>) -> Self {
        let mut buckets: BTreeMap<TaskStatus, BTreeMap<String, DownloadTask>> = TaskStatus::ALL
            .iter()
            .map(|status| (*status, BTreeMap::new()))
            .collect();
        for task in tasks {
            buckets
                .entry(task.status)
                .or_default()
                .insert(task.id.clone(), task);
        }
        Self { seq, buckets }
    }

    /// All tasks, bucket by bucket.
    pub fn tasks(&self) -> impl Iterator<Item = &DownloadTask> {
        self.buckets.values().flat_map(BTreeMap::values)
    }

    /// Tasks in one status.
    #[must_use]
    pub fn bucket(&self, status: TaskStatus) -> Option<&BTreeMap<String, DownloadTask>> {
        self.buckets.get(&status)
    }

    /// Finds a task in any bucket.
    #[must_use]
    pub fn get(&self, task_id: &str) -> Option<&DownloadTask> {
        self.buckets.values().find_map(|bucket| bucket.get(task_id))
    }

    /// Total number of tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.values().map(BTreeMap::len).sum()
    }

    /// Returns true when no tasks exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Publishes task deltas to subscribers.
#[derive(Debug)]
pub struct StatusBroadcaster {
    tx: broadcast::Sender<StatusEvent>,
    throttle: ProgressThrottle,
    seq: AtomicU64,
}

impl StatusBroadcaster {
    /// Creates a broadcaster with a per-subscriber buffer and progress interval.
    #[must_use]
    pub fn new(buffer: usize, progress_interval: Duration) -> Self {
        let (tx, _) = broadcast::channel(buffer.max(1));
        Self {
            tx,
            throttle: ProgressThrottle::new(progress_interval),
            seq: AtomicU64::new(0),
        }
    }

    /// Opens a push subscription starting after the current sequence number.
    #[must_use]
    pub fn subscribe(&self) -> StatusSubscription {
        StatusSubscription {
            rx: self.tx.subscribe(),
        }
    }

    /// Sequence number of the last published event.
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Pushes a full task record. Never throttled.
    pub(crate) fn publish_upsert(&self, task: &DownloadTask) {
        self.throttle.record(&task.id, task.progress, Instant::now());
        self.send(TaskDelta::Upsert { task: task.clone() });
    }

    /// Pushes a progress change if the throttle allows it.
    pub(crate) fn publish_progress(&self, task_id: &str, progress: f64) -> bool {
        if !self.throttle.should_flush(task_id, progress, Instant::now()) {
            return false;
        }
        self.send(TaskDelta::Progress {
            task_id: task_id.to_string(),
            progress,
        });
        true
    }

    /// Pushes a removal. Never throttled.
    pub(crate) fn publish_removed(&self, task_id: &str) {
        self.throttle.forget(task_id);
        self.send(TaskDelta::Removed {
            task_id: task_id.to_string(),
        });
    }

    fn send(&self, delta: TaskDelta) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        // No subscribers is fine; the pull snapshot stays authoritative.
        let _ = self.tx.send(StatusEvent { seq, delta });
    }
}

/// A push subscription.
#[derive(Debug)]
pub struct StatusSubscription {
    rx: broadcast::Receiver<StatusEvent>,
}

impl StatusSubscription {
    /// Waits for the next update. Returns `None` once the broadcaster is gone.
    pub async fn recv(&mut self) -> Option<StatusUpdate> {
        match self.rx.recv().await {
            Ok(event) => Some(StatusUpdate::Event(event)),
            Err(RecvError::Lagged(missed)) => {
                warn!(missed, "Status subscriber lagged, resync required");
                Some(StatusUpdate::Resync { missed })
            }
            Err(RecvError::Closed) => None,
        }
    }

    /// Converts the subscription into a stream of updates.
    pub fn into_stream(self) -> impl Stream<Item = StatusUpdate> + Send {
        futures_util::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|update| (update, sub))
        })
    }
}
