//! Per-task progress push throttling.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

/// Jump in percentage points that bypasses the interval.
pub const PROGRESS_JUMP_THRESHOLD: f64 = 10.0;

/// Progress at or above this is always pushed.
pub const NEAR_COMPLETE_PROGRESS: f64 = 99.0;

#[derive(Debug, Clone, Copy)]
struct Flushed {
    at: Instant,
    progress: f64,
}

/// Decides which progress updates are pushed to subscribers.
///
/// Always flushes at 0% and at >= 99%; otherwise at most once per interval,
/// or immediately on a jump of 10 points or more since the last flush.
#[derive(Debug)]
pub struct ProgressThrottle {
    interval: Duration,
    flushed: DashMap<String, Flushed>,
}

impl ProgressThrottle {
    /// Creates a throttle with the given minimum interval.
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            flushed: DashMap::new(),
        }
    }

    /// Returns true if `progress` should be pushed now, and records it if so.
    pub fn should_flush(&self, task_id: &str, progress: f64, now: Instant) -> bool {
        let always = progress <= 0.0 || progress >= NEAR_COMPLETE_PROGRESS;
        if let Some(mut last) = self.flushed.get_mut(task_id) {
            let due = now.saturating_duration_since(last.at) >= self.interval;
            let jumped = progress - last.progress >= PROGRESS_JUMP_THRESHOLD;
            if always || due || jumped {
                *last = Flushed { at: now, progress };
                return true;
            }
            return false;
        }
        self.flushed
            .insert(task_id.to_string(), Flushed { at: now, progress });
        true
    }

    /// Records a push that carried `progress` outside the throttle (for
    /// example inside a full task upsert).
    pub fn record(&self, task_id: &str, progress: f64, now: Instant) {
        self.flushed
            .insert(task_id.to_string(), Flushed { at: now, progress });
    }

    /// Drops state for a task that left the table.
    pub fn forget(&self, task_id: &str) {
        self.flushed.remove(task_id);
    }

    /// Number of tracked tasks.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.flushed.len()
    }
}
