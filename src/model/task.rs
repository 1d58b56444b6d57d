//! Download task records and their lifecycle states.

use std::fmt;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::{ContentType, Release, ReleaseProtocol};

/// Status of a download task.
///
/// The lifecycle is strictly forward:
/// `queued -> resolving -> downloading -> {complete | error | cancelled}`.
/// The three terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for a worker slot.
    Queued,
    /// Executor is locating the payload (mirror lookup, bypass, client hand-off).
    Resolving,
    /// Executor is transferring bytes.
    Downloading,
    /// Payload delivered to its output path.
    Complete,
    /// Execution failed.
    Error,
    /// Cancelled by the user or by stall detection.
    Cancelled,
}

impl TaskStatus {
    /// All states in lifecycle order.
    pub const ALL: [TaskStatus; 6] = [
        Self::Queued,
        Self::Resolving,
        Self::Downloading,
        Self::Complete,
        Self::Error,
        Self::Cancelled,
    ];

    /// Returns the wire string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Resolving => "resolving",
            Self::Downloading => "downloading",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }

    /// Returns true for `complete`, `error` and `cancelled`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error | Self::Cancelled)
    }

    /// Returns true while an executor is working on the task.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Resolving | Self::Downloading)
    }

    /// Position in the lifecycle; all terminal states share the last rank.
    fn rank(self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Resolving => 1,
            Self::Downloading => 2,
            Self::Complete | Self::Error | Self::Cancelled => 3,
        }
    }

    /// Returns true if moving from `self` to `next` respects the lifecycle.
    ///
    /// Re-asserting the current non-terminal state is allowed so executors can
    /// update the status message without changing state.
    #[must_use]
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        if self.is_terminal() || next == Self::Queued {
            return false;
        }
        next.rank() >= self.rank()
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "resolving" => Ok(Self::Resolving),
            "downloading" => Ok(Self::Downloading),
            "complete" => Ok(Self::Complete),
            "error" => Ok(Self::Error),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("invalid task status: {s}")),
        }
    }
}

/// A single tracked download attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadTask {
    /// Unique identifier, derived from the release's source-local id.
    pub id: String,
    /// Registry name of the source/executor that owns this task.
    pub source: String,
    /// Display title.
    pub title: String,
    /// Primary author when known.
    pub author: Option<String>,
    /// File format (epub, m4b, ...).
    pub format: Option<String>,
    /// Human readable size.
    pub size: Option<String>,
    /// Cover image URL.
    pub cover_url: Option<String>,
    /// Ebook or audiobook.
    pub content_type: Option<ContentType>,
    /// Where the executor should fetch from, when the release carried a URL.
    pub download_url: Option<String>,
    /// Transfer protocol of the originating release.
    pub protocol: Option<ReleaseProtocol>,
    /// Lower values are dispatched first.
    pub priority: i64,
    /// Enqueue time in milliseconds since the Unix epoch.
    pub added_at_ms: u64,
    /// Transfer progress, 0-100.
    pub progress: f64,
    /// Current lifecycle state.
    pub status: TaskStatus,
    /// Human readable detail for the current state.
    pub status_message: Option<String>,
    /// Final location of the payload once complete.
    pub output_path: Option<PathBuf>,
}

impl DownloadTask {
    /// Builds a fresh `queued` task from a release.
    #[must_use]
    pub fn from_release(release: &Release, priority: i64) -> Self {
        Self {
            id: release.source_id.clone(),
            source: release.source.clone(),
            title: release.title.clone(),
            author: release.extra_str("author").map(str::to_string),
            format: release.format.clone(),
            size: release.size.clone(),
            cover_url: release
                .extra_str("cover_url")
                .or_else(|| release.extra_str("preview"))
                .map(str::to_string),
            content_type: release.content_type,
            download_url: release.download_url.clone(),
            protocol: Some(release.protocol),
            priority,
            added_at_ms: now_ms(),
            progress: 0.0,
            status: TaskStatus::Queued,
            status_message: None,
            output_path: None,
        }
    }

    /// Returns true once the task can no longer change.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Milliseconds since the Unix epoch, saturating on clock errors.
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrips_through_str() {
        for status in TaskStatus::ALL {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("done".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_status_forward_transitions_allowed() {
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Resolving));
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Downloading));
        assert!(TaskStatus::Resolving.can_transition_to(TaskStatus::Downloading));
        assert!(TaskStatus::Downloading.can_transition_to(TaskStatus::Complete));
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Cancelled));
        assert!(TaskStatus::Resolving.can_transition_to(TaskStatus::Resolving));
    }

    #[test]
    fn test_status_regressions_rejected() {
        assert!(!TaskStatus::Downloading.can_transition_to(TaskStatus::Resolving));
        assert!(!TaskStatus::Resolving.can_transition_to(TaskStatus::Queued));
        assert!(!TaskStatus::Queued.can_transition_to(TaskStatus::Queued));
    }

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [TaskStatus::Complete, TaskStatus::Error, TaskStatus::Cancelled] {
            for next in TaskStatus::ALL {
                assert!(
                    !terminal.can_transition_to(next),
                    "{terminal} -> {next} must be rejected"
                );
            }
        }
    }

    #[test]
    fn test_task_from_release_copies_extra_attributes() {
        let mut release = Release::new("direct", "md5-abc", "Dune");
        release
            .extra
            .insert("author".to_string(), serde_json::json!("Frank Herbert"));
        release
            .extra
            .insert("preview".to_string(), serde_json::json!("https://covers/x.jpg"));

        let task = DownloadTask::from_release(&release, 2);
        assert_eq!(task.id, "md5-abc");
        assert_eq!(task.source, "direct");
        assert_eq!(task.author.as_deref(), Some("Frank Herbert"));
        assert_eq!(task.cover_url.as_deref(), Some("https://covers/x.jpg"));
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.priority, 2);
        assert!(task.progress.abs() < f64::EPSILON);
    }
}
