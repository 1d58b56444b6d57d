//! State-mutation loop and per-task workers.

use std::any::Any;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{OwnedSemaphorePermit, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::StaggerRange;
use crate::model::{DownloadTask, TaskStatus};
use crate::plugin::TaskEvent;

use super::Shared;
use super::events::LoopEvent;
use super::table::{Dispatched, Finish};

pub(super) async fn run(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<LoopEvent>) {
    let mut tick = tokio::time::interval(shared.config.tick);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    dispatch(&shared);
    loop {
        tokio::select! {
            biased;
            () = shared.shutdown.cancelled() => break,
            event = rx.recv() => {
                let Some(event) = event else { break };
                handle_event(&shared, event);
            }
            _ = tick.tick() => housekeeping(&shared).await,
        }
        dispatch(&shared);
    }
    debug!("Orchestrator loop exited");
}

fn handle_event(shared: &Shared, event: LoopEvent) {
    match event {
        LoopEvent::Report(TaskEvent::Progress { task_id, percent }) => {
            let mut table = shared.table();
            if let Some(progress) = table.apply_progress(&task_id, percent, Instant::now()) {
                shared.status.publish_progress(&task_id, progress);
            }
        }
        LoopEvent::Report(TaskEvent::Status {
            task_id,
            status,
            message,
        }) => {
            let updated = {
                let mut table = shared.table();
                let updated = table.apply_status(&task_id, status.into(), message, Instant::now());
                if let Some(task) = &updated {
                    shared.status.publish_upsert(task);
                }
                updated
            };
            let Some(task) = updated else {
                debug!(task_id = %task_id, ?status, "Dropped status report");
                return;
            };
            if task.status == TaskStatus::Error {
                warn!(
                    task_id = %task_id,
                    message = task.status_message.as_deref().unwrap_or(""),
                    "Executor reported error"
                );
            } else {
                debug!(task_id = %task_id, status = %task.status, "Task status changed");
            }
            shared.mark_dirty();
        }
        LoopEvent::Finished {
            task_id,
            finish,
            permit,
        } => {
            let finished = {
                let mut table = shared.table();
                let finished = table.finish(&task_id, finish, Instant::now());
                if let Some(task) = &finished {
                    shared.status.publish_upsert(task);
                }
                finished
            };
            drop(permit);
            if let Some(task) = finished {
                info!(
                    task_id = %task.id,
                    status = %task.status,
                    message = task.status_message.as_deref().unwrap_or(""),
                    "Task finished"
                );
            }
            shared.mark_dirty();
        }
        LoopEvent::Staged { task_id, reply } => {
            let live = shared
                .table()
                .get(&task_id)
                .is_some_and(|task| !task.is_terminal());
            let _ = reply.send(live);
        }
        LoopEvent::Wake => {}
    }
}

/// Fills free slots from the pending queue.
fn dispatch(shared: &Arc<Shared>) {
    if shared.shutdown.is_cancelled() {
        return;
    }
    loop {
        let Ok(permit) = Arc::clone(&shared.slots).try_acquire_owned() else {
            return;
        };
        let next = shared.table().dispatch_next(&shared.shutdown, Instant::now());
        let Some(dispatched) = next else {
            return;
        };
        info!(
            task_id = %dispatched.task.id,
            source = %dispatched.task.source,
            others_active = dispatched.others_active,
            "Dispatching task"
        );
        tokio::spawn(run_task(Arc::clone(shared), dispatched, permit));
    }
}

async fn housekeeping(shared: &Shared) {
    let now = Instant::now();
    let stall_timeout = shared.config.stall_timeout;
    {
        let mut table = shared.table();
        if !stall_timeout.is_zero() {
            for task_id in table.cancel_stalled(now, stall_timeout) {
                warn!(
                    task_id = %task_id,
                    stall_secs = stall_timeout.as_secs(),
                    "Download stalled, cancelling"
                );
            }
        }
        let evicted = table.evict_expired(now, shared.config.status_timeout);
        for task_id in &evicted {
            shared.status.publish_removed(task_id);
        }
        if !evicted.is_empty() {
            debug!(evicted = evicted.len(), "Evicted expired tasks");
            shared.mark_dirty();
        }
    }
    shared.save_if_dirty().await;
}

async fn run_task(shared: Arc<Shared>, dispatched: Dispatched, permit: OwnedSemaphorePermit) {
    let Dispatched {
        task,
        cancel,
        others_active,
    } = dispatched;

    let finish = execute(&shared, &task, &cancel, others_active).await;
    let success = matches!(finish, Finish::Complete(_));
    let _ = shared.events.send(LoopEvent::Finished {
        task_id: task.id.clone(),
        finish,
        permit,
    });

    if let Some(executor) = shared.registry.get_handler(&task.source)
        && let Err(error) = executor.post_process_cleanup(&task, success).await
    {
        warn!(task_id = %task.id, error = %error, "Post-process cleanup failed");
    }
}

async fn execute(
    shared: &Shared,
    task: &DownloadTask,
    cancel: &CancellationToken,
    others_active: usize,
) -> Finish {
    let Some(executor) = shared.registry.get_handler(&task.source) else {
        return Finish::Failed(format!("Unknown release source: {}", task.source));
    };

    if others_active > 0 && !shared.config.stagger.is_disabled() {
        let delay = stagger_delay(shared.config.stagger);
        debug!(task_id = %task.id, delay_ms = delay.as_millis(), "Staggering start");
        tokio::select! {
            () = cancel.cancelled() => return Finish::Cancelled,
            () = tokio::time::sleep(delay) => {}
        }
    }
    if cancel.is_cancelled() {
        return Finish::Cancelled;
    }

    let reporter = shared.reporter(&task.id);
    // Separate task so a panicking executor surfaces as a JoinError.
    let handle = tokio::spawn({
        let executor = Arc::clone(&executor);
        let task = task.clone();
        let cancel = cancel.clone();
        async move { executor.execute(&task, cancel, reporter).await }
    });

    let staged = match handle.await {
        Ok(Ok(Some(path))) => path,
        Ok(Ok(None)) if cancel.is_cancelled() => return Finish::Cancelled,
        Ok(Ok(None)) => return Finish::Failed("Download failed".to_string()),
        Ok(Err(error)) => {
            warn!(task_id = %task.id, error = %error, "Executor failed");
            return Finish::Failed(format!("Download failed: {error}"));
        }
        Err(join_error) => {
            let message = if join_error.is_panic() {
                panic_message(join_error.into_panic().as_ref())
            } else {
                "task aborted".to_string()
            };
            error!(task_id = %task.id, panic = %message, "Executor panicked");
            return Finish::Failed(format!("Download failed: task panic: {message}"));
        }
    };

    if cancel.is_cancelled() {
        discard_staged(&staged).await;
        return Finish::Cancelled;
    }
    if !still_live(shared, &task.id).await {
        debug!(task_id = %task.id, "Task ended before delivery, discarding payload");
        discard_staged(&staged).await;
        return if cancel.is_cancelled() {
            Finish::Cancelled
        } else {
            Finish::Failed("Download failed".to_string())
        };
    }

    match shared.output.deliver(task, &staged).await {
        Ok(path) => Finish::Complete(path),
        Err(error) => {
            warn!(task_id = %task.id, error = %error, "Output delivery failed");
            Finish::Failed(format!("Output delivery failed: {error}"))
        }
    }
}

/// Asks the loop whether `task_id` is still live. Reports the executor sent
/// before returning are already queued ahead of this question.
async fn still_live(shared: &Shared, task_id: &str) -> bool {
    let (reply, answer) = oneshot::channel();
    let asked = shared.events.send(LoopEvent::Staged {
        task_id: task_id.to_string(),
        reply,
    });
    asked.is_ok() && answer.await.unwrap_or(false)
}

fn stagger_delay(range: StaggerRange) -> Duration {
    let min = u64::try_from(range.min.as_millis()).unwrap_or(u64::MAX);
    let max = u64::try_from(range.max.as_millis()).unwrap_or(u64::MAX);
    if min >= max {
        return Duration::from_millis(max);
    }
    Duration::from_millis(rand::thread_rng().gen_range(min..=max))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

async fn discard_staged(path: &Path) {
    let result = match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(_) => return,
    };
    if let Err(error) = result {
        warn!(path = %path.display(), error = %error, "Failed to discard cancelled output");
    }
}
