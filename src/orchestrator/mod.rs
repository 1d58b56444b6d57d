//! Download orchestration.
//!
//! The [`Orchestrator`] owns the task table, a priority-ordered pending
//! queue and a fixed pool of worker slots. Public operations mutate the
//! table under one short-lived lock and publish the resulting deltas to the
//! [`StatusBroadcaster`]. Executors never see the table: they report through
//! a [`TaskReporter`](crate::plugin::TaskReporter) whose events are applied
//! by a single state-mutation loop, which also frees slots, dispatches the
//! next queued task, detects stalls and evicts old terminal tasks.
//!
//! # Lifecycle
//!
//! `queued -> resolving -> downloading -> {complete | error | cancelled}`.
//! `resolving`/`downloading`/`error` come from the executor, `complete` and
//! `cancelled` are decided here once the executor returns.

mod events;
mod persistence;
mod table;
mod worker;

pub use persistence::{INTERRUPTED_MESSAGE, PersistenceError, StateFile, restore_tasks};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::{Settings, StaggerRange};
use crate::model::{DownloadTask, Release};
use crate::output::OutputHandler;
use crate::plugin::{PluginRegistry, TaskReporter};
use crate::status::{QueueSnapshot, StatusBroadcaster, StatusSubscription};

use events::LoopEvent;
use table::{Cancelled, Inserted, TaskTable};

/// Default interval of the housekeeping tick.
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// Errors returned by orchestrator operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// No executor is registered for the release's source.
    #[error("Unknown release source: {0}")]
    UnknownSource(String),

    /// No task with this id exists.
    #[error("task {0} not found")]
    NotFound(String),

    /// The task has already left the pending queue.
    #[error("task {0} is no longer queued")]
    NotQueued(String),

    /// The orchestrator has been shut down.
    #[error("orchestrator is shut down")]
    ShutDown,

    /// Loading or saving task state failed.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Runtime parameters of the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// Worker pool size.
    pub max_concurrent: usize,
    /// Age at which terminal tasks are evicted.
    pub status_timeout: Duration,
    /// Inactivity that cancels a running task. Zero disables detection.
    pub stall_timeout: Duration,
    /// Start staggering while other downloads run.
    pub stagger: StaggerRange,
    /// Housekeeping interval (stalls, eviction, state saving).
    pub tick: Duration,
    /// Task state file.
    pub state_file: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl OrchestratorConfig {
    /// Extracts the orchestrator's part of `settings`.
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_concurrent: settings.max_concurrent_downloads,
            status_timeout: settings.status_timeout,
            stall_timeout: settings.stall_timeout,
            stagger: settings.stagger,
            tick: DEFAULT_TICK,
            state_file: settings.state_file.clone(),
        }
    }
}

pub(crate) struct Shared {
    table: Mutex<TaskTable>,
    registry: Arc<PluginRegistry>,
    output: Arc<dyn OutputHandler>,
    status: Arc<StatusBroadcaster>,
    events: mpsc::UnboundedSender<LoopEvent>,
    slots: Arc<Semaphore>,
    shutdown: CancellationToken,
    config: OrchestratorConfig,
    state_file: Option<StateFile>,
    dirty: AtomicBool,
}

impl Shared {
    fn table(&self) -> MutexGuard<'_, TaskTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reporter(&self, task_id: &str) -> TaskReporter {
        let events = self.events.clone();
        TaskReporter::new(task_id, move |event| {
            // Loop gone means the orchestrator shut down.
            let _ = events.send(LoopEvent::Report(event));
        })
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    fn wake(&self) {
        let _ = self.events.send(LoopEvent::Wake);
    }

    /// Writes the current table if anything changed since the last save.
    async fn save_if_dirty(&self) {
        let Some(state_file) = &self.state_file else {
            return;
        };
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return;
        }
        let tasks: Vec<DownloadTask> = self.table().tasks().cloned().collect();
        if let Err(error) = state_file.save(tasks).await {
            warn!(error = %error, "Failed to save task state");
            self.mark_dirty();
        }
    }
}

/// Schedules download tasks onto executors.
///
/// Cheap to clone; all clones share one task table. Must be created inside
/// a tokio runtime and stopped with [`Orchestrator::shutdown`].
#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
    handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Orchestrator {
    /// Restores persisted tasks and starts the state-mutation loop.
    ///
    /// # Errors
    ///
    /// Returns `OrchestratorError::Persistence` if the state file exists but
    /// cannot be read.
    #[instrument(skip_all, fields(max_concurrent = config.max_concurrent))]
    pub async fn start(
        config: OrchestratorConfig,
        registry: Arc<PluginRegistry>,
        output: Arc<dyn OutputHandler>,
        status: Arc<StatusBroadcaster>,
    ) -> Result<Self, OrchestratorError> {
        let state_file = config.state_file.clone().map(StateFile::new);
        let restored = match &state_file {
            Some(file) => restore_tasks(file.load().await?, &registry),
            None => Vec::new(),
        };

        let (events, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            table: Mutex::new(TaskTable::new()),
            registry,
            output,
            status,
            events,
            slots: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            shutdown: CancellationToken::new(),
            config,
            state_file,
            dirty: AtomicBool::new(false),
        });

        {
            let mut table = shared.table();
            let now = Instant::now();
            for task in restored {
                if let Inserted::New { task, .. } = table.insert(task, now) {
                    shared.status.publish_upsert(&task);
                }
            }
        }

        let handle = tokio::spawn(worker::run(Arc::clone(&shared), rx));
        info!("Orchestrator started");
        Ok(Self {
            shared,
            handle: Arc::new(Mutex::new(Some(handle))),
        })
    }

    /// Queues a task for `release` at the default priority.
    ///
    /// # Errors
    ///
    /// See [`Orchestrator::enqueue_with_priority`].
    pub fn enqueue(&self, release: &Release) -> Result<DownloadTask, OrchestratorError> {
        self.enqueue_with_priority(release, 0)
    }

    /// Queues a task for `release`. Lower priorities dispatch first.
    ///
    /// Re-enqueueing an id that is still live returns the existing task
    /// unchanged; a terminal task with the same id is replaced.
    ///
    /// # Errors
    ///
    /// Returns `UnknownSource` when no executor handles the release's source
    /// and `ShutDown` after shutdown.
    #[instrument(skip(self, release), fields(source = %release.source, release_id = %release.source_id))]
    pub fn enqueue_with_priority(
        &self,
        release: &Release,
        priority: i64,
    ) -> Result<DownloadTask, OrchestratorError> {
        if self.shared.shutdown.is_cancelled() {
            return Err(OrchestratorError::ShutDown);
        }
        if self.shared.registry.get_handler(&release.source).is_none() {
            return Err(OrchestratorError::UnknownSource(release.source.clone()));
        }

        let task = DownloadTask::from_release(release, priority);
        let inserted = {
            let mut table = self.shared.table();
            let inserted = table.insert(task, Instant::now());
            if let Inserted::New { task, replaced } = &inserted {
                if *replaced {
                    self.shared.status.publish_removed(&task.id);
                }
                self.shared.status.publish_upsert(task);
            }
            inserted
        };

        match inserted {
            Inserted::Existing(task) => {
                debug!(task_id = %task.id, status = %task.status, "Task already live, not re-queued");
                Ok(task)
            }
            Inserted::New { task, .. } => {
                info!(task_id = %task.id, title = %task.title, priority, "Task queued");
                self.shared.mark_dirty();
                self.shared.wake();
                Ok(task)
            }
        }
    }

    /// Cancels a task.
    ///
    /// A queued task is dropped at once (subscribers see a removal) and never
    /// reaches an executor. A running task has its cancellation signal raised and turns
    /// `cancelled` when its executor returns. Terminal tasks are left alone.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown ids.
    #[instrument(skip(self))]
    pub fn cancel(&self, task_id: &str) -> Result<(), OrchestratorError> {
        let outcome = {
            let mut table = self.shared.table();
            let outcome = table.cancel(task_id, Instant::now());
            if let Cancelled::Dequeued(task) = &outcome {
                self.shared.status.publish_removed(&task.id);
            }
            outcome
        };

        match outcome {
            Cancelled::NotFound => Err(OrchestratorError::NotFound(task_id.to_string())),
            Cancelled::AlreadyTerminal => {
                debug!("Task already terminal, nothing to cancel");
                Ok(())
            }
            Cancelled::Dequeued(_) => {
                info!("Queued task cancelled");
                self.shared.mark_dirty();
                Ok(())
            }
            Cancelled::Signalled => {
                info!("Cancellation signalled to running task");
                self.notify_executor_cancel(task_id);
                Ok(())
            }
        }
    }

    fn notify_executor_cancel(&self, task_id: &str) {
        let source = self.shared.table().get(task_id).map(|t| t.source.clone());
        let Some(executor) = source.and_then(|s| self.shared.registry.get_handler(&s)) else {
            return;
        };
        let task_id = task_id.to_string();
        tokio::spawn(async move {
            if executor.cancel(&task_id).await {
                debug!(task_id = %task_id, "Executor cancelled external work");
            }
        });
    }

    /// Removes every terminal task. Returns how many were removed.
    pub fn clear_completed(&self) -> usize {
        let removed = {
            let mut table = self.shared.table();
            let removed = table.clear_terminal();
            for id in &removed {
                self.shared.status.publish_removed(id);
            }
            removed
        };
        if !removed.is_empty() {
            info!(removed = removed.len(), "Cleared finished tasks");
            self.shared.mark_dirty();
        }
        removed.len()
    }

    /// Changes the priority of a queued task.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown ids and `NotQueued` once the task has
    /// been dispatched.
    pub fn set_priority(&self, task_id: &str, priority: i64) -> Result<DownloadTask, OrchestratorError> {
        let mut table = self.shared.table();
        if table.get(task_id).is_none() {
            return Err(OrchestratorError::NotFound(task_id.to_string()));
        }
        let task = table
            .set_priority(task_id, priority)
            .ok_or_else(|| OrchestratorError::NotQueued(task_id.to_string()))?;
        self.shared.status.publish_upsert(&task);
        drop(table);
        self.shared.mark_dirty();
        Ok(task)
    }

    /// Applies several priority changes. Ids that are unknown or no longer
    /// queued are skipped. Returns how many tasks were updated.
    pub fn reorder(&self, priorities: &HashMap<String, i64>) -> usize {
        let mut table = self.shared.table();
        let mut updated = 0;
        for (task_id, priority) in priorities {
            if let Some(task) = table.set_priority(task_id, *priority) {
                self.shared.status.publish_upsert(&task);
                updated += 1;
            }
        }
        drop(table);
        if updated > 0 {
            self.shared.mark_dirty();
        }
        updated
    }

    /// Queued tasks in the order they will be dispatched.
    #[must_use]
    pub fn queue_order(&self) -> Vec<DownloadTask> {
        self.shared.table().queue_order()
    }

    /// Tasks currently holding a worker slot.
    #[must_use]
    pub fn active_downloads(&self) -> Vec<DownloadTask> {
        self.shared.table().active()
    }

    /// Looks up one task.
    #[must_use]
    pub fn get(&self, task_id: &str) -> Option<DownloadTask> {
        self.shared.table().get(task_id).cloned()
    }

    /// Authoritative view of every task, grouped by status.
    #[must_use]
    pub fn snapshot(&self) -> QueueSnapshot {
        let table = self.shared.table();
        let seq = self.shared.status.seq();
        QueueSnapshot::from_tasks(seq, table.tasks().cloned())
    }

    /// Opens a push subscription for task deltas.
    #[must_use]
    pub fn subscribe(&self) -> StatusSubscription {
        self.shared.status.subscribe()
    }

    /// Worker pool size.
    #[must_use]
    pub fn max_concurrent(&self) -> usize {
        self.shared.config.max_concurrent
    }

    /// Returns true after [`Orchestrator::shutdown`].
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Stops the loop, signals every running executor and saves state.
    ///
    /// Tasks still running are saved in their current state and come back
    /// as errors on the next start.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle
            && let Err(error) = handle.await
        {
            warn!(error = %error, "Orchestrator loop ended abnormally");
        }
        self.shared.mark_dirty();
        self.shared.save_if_dirty().await;
        info!("Orchestrator stopped");
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.shared.table();
        f.debug_struct("Orchestrator")
            .field("tasks", &table.len())
            .field("pending", &table.pending_count())
            .field("active", &table.active_count())
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}
