//! Scriptable release sources and executors.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use shelfdl_core::model::{BookMetadata, ContentType, DownloadTask, Release};
use shelfdl_core::orchestrator::{Orchestrator, OrchestratorConfig};
use shelfdl_core::plugin::{
    DownloadExecutor, ExecutorError, PluginRegistry, ReleaseSource, SearchQuery, SourceError,
    SourceSpeed, TaskReporter,
};
use shelfdl_core::status::StatusBroadcaster;
use shelfdl_core::config::StaggerRange;
use shelfdl_core::output::OutputHandler;
use shelfdl_core::TaskStatus;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// What a [`FakeSource`] does when searched.
#[derive(Debug, Clone)]
pub enum SourceBehavior {
    /// Return these releases.
    Results(Vec<Release>),
    /// Return releases only for expanded queries.
    ResultsWhenExpanded(Vec<Release>),
    /// Fail with a request error.
    Fails(String),
    /// Never answer.
    Hangs,
    /// Never answer the first call; return these releases afterwards.
    HangsOnce(Vec<Release>),
    /// Panic inside `search`.
    Panics,
    /// Report unavailable from the probe.
    Unavailable,
}

#[derive(Debug)]
pub struct FakeSource {
    name: String,
    speed: SourceSpeed,
    content_types: Vec<ContentType>,
    behavior: SourceBehavior,
    delay: Duration,
    calls: AtomicUsize,
    expanded_calls: AtomicUsize,
}

impl FakeSource {
    pub fn new(name: &str, behavior: SourceBehavior) -> Self {
        Self {
            name: name.to_string(),
            speed: SourceSpeed::Fast,
            content_types: vec![ContentType::Ebook],
            behavior,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            expanded_calls: AtomicUsize::new(0),
        }
    }

    pub fn slow(mut self) -> Self {
        self.speed = SourceSpeed::Slow;
        self
    }

    pub fn content_types(mut self, types: Vec<ContentType>) -> Self {
        self.content_types = types;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn expanded_calls(&self) -> usize {
        self.expanded_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReleaseSource for FakeSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn speed(&self) -> SourceSpeed {
        self.speed
    }

    fn supported_content_types(&self) -> Vec<ContentType> {
        self.content_types.clone()
    }

    async fn is_available(&self) -> Result<bool, SourceError> {
        Ok(!matches!(self.behavior, SourceBehavior::Unavailable))
    }

    async fn search(
        &self,
        _book: &BookMetadata,
        query: &SearchQuery,
    ) -> Result<Vec<Release>, SourceError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if query.expand {
            self.expanded_calls.fetch_add(1, Ordering::SeqCst);
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.behavior {
            SourceBehavior::Results(releases) => Ok(releases.clone()),
            SourceBehavior::ResultsWhenExpanded(releases) if query.expand => Ok(releases.clone()),
            SourceBehavior::ResultsWhenExpanded(_) | SourceBehavior::Unavailable => Ok(Vec::new()),
            SourceBehavior::Fails(message) => Err(SourceError::request(&self.name, message.clone())),
            SourceBehavior::Hangs => {
                std::future::pending::<()>().await;
                Ok(Vec::new())
            }
            SourceBehavior::HangsOnce(releases) => {
                if call == 0 {
                    std::future::pending::<()>().await;
                }
                Ok(releases.clone())
            }
            SourceBehavior::Panics => panic!("{} exploded", self.name),
        }
    }
}

/// Builds `count` releases for `source`, ids `"{source}-{i}"`.
pub fn releases(source: &str, count: usize) -> Vec<Release> {
    (0..count)
        .map(|i| Release::new(source, format!("{source}-{i}"), format!("Book {i}")))
        .collect()
}

/// Behavior of a [`ScriptedExecutor`] for one task.
#[derive(Debug, Clone)]
pub enum Script {
    /// Report `steps` progress steps `step_delay` apart, then stage a file.
    Succeed { steps: u32, step_delay: Duration },
    /// Wait until the gate is notified, then stage a file.
    Gated(Arc<Notify>),
    /// Report downloading and a little progress, then wait for cancellation.
    UntilCancelled,
    /// Report a connection error through the reporter and return nothing.
    ConnectionError,
    /// Report an error through the reporter, then stage a file anyway.
    ErrorThenStage(String),
    /// Return an error.
    Fails(String),
    /// Panic inside `execute`.
    Panics,
    /// Report downloading once, then go silent forever.
    Silent,
    /// Report these progress values in order, then stage a file.
    Progress(Vec<f64>),
}

/// Executor whose behavior is chosen per task id.
#[derive(Debug)]
pub struct ScriptedExecutor {
    name: String,
    staging: PathBuf,
    default_script: Script,
    scripts: Mutex<HashMap<String, Script>>,
    invocations: Mutex<Vec<String>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
    cleanups: Mutex<Vec<(String, bool)>>,
}

impl ScriptedExecutor {
    pub fn new(name: &str, staging: &Path, default_script: Script) -> Self {
        Self {
            name: name.to_string(),
            staging: staging.to_path_buf(),
            default_script,
            scripts: Mutex::new(HashMap::new()),
            invocations: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
            cleanups: Mutex::new(Vec::new()),
        }
    }

    pub fn script(self, task_id: &str, script: Script) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(task_id.to_string(), script);
        self
    }

    pub fn invocations(&self) -> Vec<String> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn invocation_count(&self, task_id: &str) -> usize {
        self.invocations
            .lock()
            .unwrap()
            .iter()
            .filter(|id| *id == task_id)
            .count()
    }

    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    pub fn cleanups(&self) -> Vec<(String, bool)> {
        self.cleanups.lock().unwrap().clone()
    }

    fn script_for(&self, task_id: &str) -> Script {
        self.scripts
            .lock()
            .unwrap()
            .get(task_id)
            .cloned()
            .unwrap_or_else(|| self.default_script.clone())
    }

    async fn stage(&self, task: &DownloadTask) -> Result<Option<PathBuf>, ExecutorError> {
        tokio::fs::create_dir_all(&self.staging).await?;
        let path = self.staging.join(format!("{}.epub", task.id));
        tokio::fs::write(&path, task.title.as_bytes()).await?;
        Ok(Some(path))
    }

    async fn run(
        &self,
        task: &DownloadTask,
        cancel: CancellationToken,
        reporter: TaskReporter,
    ) -> Result<Option<PathBuf>, ExecutorError> {
        reporter.resolving("Looking up mirror");
        match self.script_for(&task.id) {
            Script::Succeed { steps, step_delay } => {
                reporter.downloading();
                for step in 1..=steps {
                    tokio::select! {
                        () = cancel.cancelled() => return Ok(None),
                        () = tokio::time::sleep(step_delay) => {}
                    }
                    reporter.progress(f64::from(step) * 100.0 / f64::from(steps));
                }
                self.stage(task).await
            }
            Script::Gated(gate) => {
                reporter.downloading();
                tokio::select! {
                    () = cancel.cancelled() => return Ok(None),
                    () = gate.notified() => {}
                }
                self.stage(task).await
            }
            Script::UntilCancelled => {
                reporter.downloading();
                reporter.progress(10.0);
                cancel.cancelled().await;
                Ok(None)
            }
            Script::ConnectionError => {
                reporter.error("Connection refused");
                Ok(None)
            }
            Script::ErrorThenStage(message) => {
                reporter.error(message);
                self.stage(task).await
            }
            Script::Fails(message) => Err(ExecutorError::failed(message)),
            Script::Panics => panic!("executor exploded"),
            Script::Silent => {
                reporter.downloading();
                cancel.cancelled().await;
                Ok(None)
            }
            Script::Progress(values) => {
                reporter.downloading();
                for value in values {
                    reporter.progress(value);
                    tokio::task::yield_now().await;
                }
                self.stage(task).await
            }
        }
    }
}

struct RunningGuard<'a>(&'a AtomicUsize);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl DownloadExecutor for ScriptedExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        task: &DownloadTask,
        cancel: CancellationToken,
        reporter: TaskReporter,
    ) -> Result<Option<PathBuf>, ExecutorError> {
        self.invocations.lock().unwrap().push(task.id.clone());
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        let _guard = RunningGuard(&self.running);
        self.run(task, cancel, reporter).await
    }

    async fn post_process_cleanup(
        &self,
        task: &DownloadTask,
        success: bool,
    ) -> Result<(), ExecutorError> {
        self.cleanups
            .lock()
            .unwrap()
            .push((task.id.clone(), success));
        Ok(())
    }
}

/// Orchestrator settings with staggering and stall detection off.
pub fn quiet_config(max_concurrent: usize) -> OrchestratorConfig {
    OrchestratorConfig {
        max_concurrent,
        status_timeout: Duration::from_secs(3600),
        stall_timeout: Duration::ZERO,
        stagger: StaggerRange::DISABLED,
        tick: Duration::from_millis(50),
        state_file: None,
    }
}

/// Broadcaster that pushes every progress update.
pub fn unthrottled_status() -> Arc<StatusBroadcaster> {
    Arc::new(StatusBroadcaster::new(4096, Duration::ZERO))
}

pub fn registry_with(executor: Arc<dyn DownloadExecutor>) -> Arc<PluginRegistry> {
    let mut builder = PluginRegistry::builder();
    builder.register_executor(executor).unwrap();
    Arc::new(builder.build())
}

pub async fn start_orchestrator(
    config: OrchestratorConfig,
    executor: Arc<dyn DownloadExecutor>,
    output: Arc<dyn OutputHandler>,
) -> Orchestrator {
    Orchestrator::start(config, registry_with(executor), output, unthrottled_status())
        .await
        .unwrap()
}

/// Polls until `task_id` satisfies `done`, panicking after five seconds.
pub async fn wait_for(
    orchestrator: &Orchestrator,
    task_id: &str,
    done: impl Fn(&DownloadTask) -> bool,
) -> DownloadTask {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(task) = orchestrator.get(task_id)
                && done(&task)
            {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {task_id}: {:?}", orchestrator.get(task_id)))
}

pub async fn wait_for_status(
    orchestrator: &Orchestrator,
    task_id: &str,
    status: TaskStatus,
) -> DownloadTask {
    wait_for(orchestrator, task_id, |task| task.status == status).await
}

pub async fn wait_terminal(orchestrator: &Orchestrator, task_id: &str) -> DownloadTask {
    wait_for(orchestrator, task_id, DownloadTask::is_terminal).await
}
