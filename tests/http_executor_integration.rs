//! Integration tests for the direct HTTP executor against a mock server.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod support;

use std::sync::Arc;
use std::time::Duration;

use shelfdl_core::model::DownloadTask;
use shelfdl_core::plugin::{ReportedStatus, TaskEvent};
use shelfdl_core::{
    DestinationFolder, DirectHttpExecutor, DownloadExecutor, RetryPolicy, TaskReporter,
    TaskStatus,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

use support::fakes::{quiet_config, start_orchestrator, wait_terminal};
use support::socket_guard::start_mock_server_or_skip;

const BODY: &[u8] = b"%EPUB-FAKE% chapter one, chapter two";

fn fast_retries() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(50), 2.0)
}

fn task_for(url: &str) -> DownloadTask {
    let release = DirectHttpExecutor::release_for_url(url).unwrap();
    DownloadTask::from_release(&release, 0)
}

#[tokio::test]
async fn test_download_is_staged_with_progress() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/files/dune.epub"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(BODY))
        .expect(1)
        .mount(&server)
        .await;

    let staging = TempDir::new().unwrap();
    let executor = DirectHttpExecutor::new(staging.path()).unwrap();
    let task = task_for(&format!("{}/files/dune.epub", server.uri()));
    let (reporter, mut events) = TaskReporter::channel(&task.id);

    let staged = executor
        .execute(&task, CancellationToken::new(), reporter)
        .await
        .unwrap()
        .expect("payload staged");

    assert!(staged.starts_with(staging.path()));
    assert_eq!(staged.file_name().unwrap(), "dune.epub");
    assert_eq!(tokio::fs::read(&staged).await.unwrap(), BODY);

    let mut saw_downloading = false;
    let mut last_progress = 0.0;
    while let Ok(event) = events.try_recv() {
        match event {
            TaskEvent::Status {
                status: ReportedStatus::Downloading,
                ..
            } => saw_downloading = true,
            TaskEvent::Progress { percent, .. } => {
                assert!(percent >= last_progress);
                last_progress = percent;
            }
            TaskEvent::Status { .. } => {}
        }
    }
    assert!(saw_downloading);
    assert_eq!(last_progress, 100.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_filename_downloads_get_separate_staging_paths() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/a/book.epub"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"first edition".as_slice()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/b/book.epub"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"second edition".as_slice()))
        .mount(&server)
        .await;

    let staging = TempDir::new().unwrap();
    let executor = Arc::new(DirectHttpExecutor::new(staging.path()).unwrap());
    for _ in 0..10 {
        let run = |route: &str| {
            let executor = Arc::clone(&executor);
            let task = task_for(&format!("{}{route}", server.uri()));
            tokio::spawn(async move {
                executor
                    .execute(&task, CancellationToken::new(), TaskReporter::noop(&task.id))
                    .await
            })
        };
        let (a, b) = tokio::join!(run("/a/book.epub"), run("/b/book.epub"));
        let a = a.unwrap().unwrap().unwrap();
        let b = b.unwrap().unwrap().unwrap();

        assert_ne!(a, b);
        assert_eq!(tokio::fs::read(&a).await.unwrap(), b"first edition");
        assert_eq!(tokio::fs::read(&b).await.unwrap(), b"second edition");
        tokio::fs::remove_file(&a).await.unwrap();
        tokio::fs::remove_file(&b).await.unwrap();
    }
}

#[tokio::test]
async fn test_not_found_is_permanent_error() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/missing.pdf"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let staging = TempDir::new().unwrap();
    let executor = DirectHttpExecutor::new(staging.path())
        .unwrap()
        .with_retry_policy(fast_retries());
    let task = task_for(&format!("{}/missing.pdf", server.uri()));

    let err = executor
        .execute(&task, CancellationToken::new(), TaskReporter::noop(&task.id))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("HTTP 404"), "{err}");
}

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/flaky.epub"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/flaky.epub"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(BODY))
        .expect(1)
        .mount(&server)
        .await;

    let staging = TempDir::new().unwrap();
    let executor = DirectHttpExecutor::new(staging.path())
        .unwrap()
        .with_retry_policy(fast_retries());
    let task = task_for(&format!("{}/flaky.epub", server.uri()));

    let staged = executor
        .execute(&task, CancellationToken::new(), TaskReporter::noop(&task.id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tokio::fs::read(&staged).await.unwrap(), BODY);
}

#[tokio::test]
async fn test_cancel_while_waiting_for_response() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/slow.epub"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(BODY)
                .set_delay(Duration::from_secs(30)),
        )
        .mount(&server)
        .await;

    let staging = TempDir::new().unwrap();
    let executor = Arc::new(DirectHttpExecutor::new(staging.path()).unwrap());
    let task = task_for(&format!("{}/slow.epub", server.uri()));
    let cancel = CancellationToken::new();

    let handle = tokio::spawn({
        let executor = Arc::clone(&executor);
        let cancel = cancel.clone();
        async move {
            executor
                .execute(&task, cancel, TaskReporter::noop("slow"))
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();

    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("executor returns promptly after cancel")
        .unwrap()
        .unwrap();
    assert!(result.is_none());
    let leftovers = std::fs::read_dir(staging.path()).map_or(0, Iterator::count);
    assert_eq!(leftovers, 0);
}

#[tokio::test]
async fn test_orchestrated_download_lands_in_destination() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/books/Dune.epub"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(BODY))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/books/gone.epub"))
        .respond_with(ResponseTemplate::new(410))
        .mount(&server)
        .await;

    let staging = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();
    let executor = Arc::new(
        DirectHttpExecutor::new(staging.path())
            .unwrap()
            .with_retry_policy(fast_retries()),
    );
    let orchestrator = start_orchestrator(
        quiet_config(2),
        executor,
        Arc::new(DestinationFolder::new(dest.path())),
    )
    .await;

    let good = DirectHttpExecutor::release_for_url(&format!("{}/books/Dune.epub", server.uri()))
        .unwrap();
    let bad = DirectHttpExecutor::release_for_url(&format!("{}/books/gone.epub", server.uri()))
        .unwrap();
    let good = orchestrator.enqueue(&good).unwrap();
    let bad = orchestrator.enqueue(&bad).unwrap();

    let done = wait_terminal(&orchestrator, &good.id).await;
    assert_eq!(done.status, TaskStatus::Complete);
    assert_eq!(done.progress, 100.0);
    let output = done.output_path.unwrap();
    assert_eq!(output, dest.path().join("Dune.epub"));
    assert_eq!(tokio::fs::read(&output).await.unwrap(), BODY);

    let failed = wait_terminal(&orchestrator, &bad.id).await;
    assert_eq!(failed.status, TaskStatus::Error);
    assert!(
        failed.status_message.as_deref().unwrap().contains("HTTP 410"),
        "{:?}",
        failed.status_message
    );
    orchestrator.shutdown().await;
}
