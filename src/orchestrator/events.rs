//! Messages consumed by the orchestrator's state-mutation loop.

use tokio::sync::{OwnedSemaphorePermit, oneshot};

use crate::plugin::TaskEvent;

use super::table::Finish;

#[derive(Debug)]
pub(crate) enum LoopEvent {
    /// Progress or status reported by an executor.
    Report(TaskEvent),
    /// A worker is done with its task. Dropping `permit` frees the slot.
    Finished {
        task_id: String,
        finish: Finish,
        permit: OwnedSemaphorePermit,
    },
    /// The executor staged a payload. The loop answers whether the task is
    /// still live, after every report the executor sent before returning.
    Staged {
        task_id: String,
        reply: oneshot::Sender<bool>,
    },
    /// New queued work may be dispatchable.
    Wake,
}
