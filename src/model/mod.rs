//! Core data types shared by every component.
//!
//! - [`Release`] - one discovered candidate file for a book
//! - [`DownloadTask`] - the queue/state record tracking one download attempt
//! - [`TaskStatus`] - lifecycle states of a task
//! - [`BookMetadata`] - read-only input from the metadata subsystem

mod book;
mod release;
mod task;

pub use book::BookMetadata;
pub use release::{ContentType, Release, ReleaseProtocol};
pub use task::{DownloadTask, TaskStatus, now_ms};
