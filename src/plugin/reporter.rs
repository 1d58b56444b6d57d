//! Progress and status callbacks handed to executors.

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::model::TaskStatus;

/// States an executor is allowed to report.
///
/// `complete` and `cancelled` are decided by the orchestrator, never by the
/// executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportedStatus {
    /// Locating the payload.
    Resolving,
    /// Transferring bytes.
    Downloading,
    /// Execution failed; the task becomes terminal immediately.
    Error,
}

impl From<ReportedStatus> for TaskStatus {
    fn from(status: ReportedStatus) -> Self {
        match status {
            ReportedStatus::Resolving => TaskStatus::Resolving,
            ReportedStatus::Downloading => TaskStatus::Downloading,
            ReportedStatus::Error => TaskStatus::Error,
        }
    }
}

/// One callback invocation from an executor.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    /// Transfer progress in percent.
    Progress {
        /// Task the event belongs to
        task_id: String,
        /// Reported percentage (clamped by the consumer)
        percent: f64,
    },
    /// Status change, optionally with a message.
    Status {
        /// Task the event belongs to
        task_id: String,
        /// New state
        status: ReportedStatus,
        /// Human readable detail
        message: Option<String>,
    },
}

impl TaskEvent {
    /// Task the event belongs to.
    #[must_use]
    pub fn task_id(&self) -> &str {
        match self {
            Self::Progress { task_id, .. } | Self::Status { task_id, .. } => task_id,
        }
    }
}

type Sink = Arc<dyn Fn(TaskEvent) + Send + Sync>;

/// Non-blocking handle an executor uses to report progress and status.
///
/// Calls never block and never fail; events for a task that has already
/// reached a terminal state are dropped by the consumer.
#[derive(Clone)]
pub struct TaskReporter {
    task_id: String,
    sink: Sink,
}

impl TaskReporter {
    /// Creates a reporter that forwards every event to `sink`.
    pub fn new(task_id: impl Into<String>, sink: impl Fn(TaskEvent) + Send + Sync + 'static) -> Self {
        Self {
            task_id: task_id.into(),
            sink: Arc::new(sink),
        }
    }

    /// Creates a reporter backed by an unbounded channel.
    #[must_use]
    pub fn channel(task_id: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<TaskEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let reporter = Self::new(task_id, move |event| {
            // Receiver gone means nobody is listening any more.
            let _ = tx.send(event);
        });
        (reporter, rx)
    }

    /// Creates a reporter that discards everything.
    #[must_use]
    pub fn noop(task_id: impl Into<String>) -> Self {
        Self::new(task_id, |_| {})
    }

    /// Task this reporter belongs to.
    #[must_use]
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Reports transfer progress (0-100).
    pub fn progress(&self, percent: f64) {
        (self.sink)(TaskEvent::Progress {
            task_id: self.task_id.clone(),
            percent,
        });
    }

    /// Reports a status change.
    pub fn status(&self, status: ReportedStatus, message: Option<String>) {
        (self.sink)(TaskEvent::Status {
            task_id: self.task_id.clone(),
            status,
            message,
        });
    }

    /// Shorthand for `status(Resolving, message)`.
    pub fn resolving(&self, message: impl Into<String>) {
        self.status(ReportedStatus::Resolving, Some(message.into()));
    }

    /// Shorthand for `status(Downloading, None)`.
    pub fn downloading(&self) {
        self.status(ReportedStatus::Downloading, None);
    }

    /// Shorthand for `status(Error, message)`.
    pub fn error(&self, message: impl Into<String>) {
        self.status(ReportedStatus::Error, Some(message.into()));
    }
}

impl fmt::Debug for TaskReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskReporter")
            .field("task_id", &self.task_id)
            .finish_non_exhaustive()
    }
}
