//! Test doubles and a scheduler harness shared by the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ae_core::config::AlertThresholds;
use ae_core::types::{
    ArtifactKind, DenoiseLevel, LoadSnapshot, Operation, OperationSpec, Resolution, StageSpec,
    Task, TaskId, ToolKind,
};
use ae_daemon::monitor::ResourceMonitor;
use ae_daemon::pipeline::PipelineBuilder;
use ae_daemon::registry::TaskRegistry;
use ae_daemon::scheduler::{Scheduler, SchedulerParts, SchedulerSettings};
use ae_daemon::store::{FileStore, LocalFileStore, StoreError};
use ae_harness::rate_limiter::{QuotaConfig, QuotaLimiter};
use ae_harness::tools::{
    ExecutionContext, StageOutcome, ToolAdapter, ToolError, ToolEvent, ToolRegistry, ToolRun,
};
use ae_telemetry::metrics::MetricsCollector;
use async_trait::async_trait;
use tempfile::TempDir;

// ===========================================================================
// FakeTool
// ===========================================================================

/// What one scripted tool invocation does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Succeed,
    Fail(&'static str),
    TimeOut,
    /// Runs until cancelled.
    Hang,
    /// Panics inside `execute`, taking the worker down with it.
    Panic,
}

#[derive(Debug, Default)]
pub struct ToolStats {
    pub calls: AtomicUsize,
    pub running: AtomicUsize,
    pub max_running: AtomicUsize,
    /// Task ids in the order their stages started.
    pub started: Mutex<Vec<TaskId>>,
}

/// Adapter that follows a script instead of spawning a process. Successful
/// runs write a small file at the requested output path.
pub struct FakeTool {
    kind: ToolKind,
    delay: Duration,
    script: Mutex<VecDeque<Behavior>>,
    fallback: Behavior,
    pub stats: Arc<ToolStats>,
}

impl FakeTool {
    pub fn new(kind: ToolKind) -> Self {
        Self {
            kind,
            delay: Duration::from_millis(20),
            script: Mutex::new(VecDeque::new()),
            fallback: Behavior::Succeed,
            stats: Arc::new(ToolStats::default()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Behaviors for the first calls, in order.
    pub fn with_script(self, steps: impl IntoIterator<Item = Behavior>) -> Self {
        self.script.lock().unwrap().extend(steps);
        self
    }

    /// Behavior once the script is used up.
    pub fn otherwise(mut self, behavior: Behavior) -> Self {
        self.fallback = behavior;
        self
    }

    pub fn calls(&self) -> usize {
        self.stats.calls.load(Ordering::SeqCst)
    }

    pub fn max_running(&self) -> usize {
        self.stats.max_running.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> Vec<TaskId> {
        self.stats.started.lock().unwrap().clone()
    }
}

async fn perform(behavior: Behavior, tool: ToolKind, output: &Path, deadline: Duration) -> StageOutcome {
    match behavior {
        Behavior::Succeed => {
            if let Some(parent) = output.parent() {
                tokio::fs::create_dir_all(parent).await.unwrap();
            }
            tokio::fs::write(output, b"enhanced").await.unwrap();
            StageOutcome::Success {
                output: output.to_path_buf(),
            }
        }
        Behavior::Fail(detail) => StageOutcome::Failed(ToolError::External {
            tool,
            detail: detail.into(),
        }),
        Behavior::TimeOut => StageOutcome::Failed(ToolError::Timeout {
            tool,
            elapsed: deadline,
            budget: deadline,
        }),
        Behavior::Hang | Behavior::Panic => std::future::pending().await,
    }
}

#[async_trait]
impl ToolAdapter for FakeTool {
    fn kind(&self) -> ToolKind {
        self.kind
    }

    async fn is_available(&self) -> bool {
        true
    }

    fn execute(&self, _stage: &StageSpec, _input: &Path, ctx: ExecutionContext) -> ToolRun {
        self.stats.calls.fetch_add(1, Ordering::SeqCst);
        self.stats.started.lock().unwrap().push(ctx.task_id);
        let behavior = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback);
        if behavior == Behavior::Panic {
            panic!("scripted adapter panic");
        }

        let (tx, run) = ToolRun::channel(self.kind);
        let tool = self.kind;
        let delay = self.delay;
        let stats = Arc::clone(&self.stats);
        tokio::spawn(async move {
            let now = stats.running.fetch_add(1, Ordering::SeqCst) + 1;
            stats.max_running.fetch_max(now, Ordering::SeqCst);
            let _ = tx.send(ToolEvent::Progress {
                fraction: 0.5,
                note: Some("halfway".into()),
            });
            let outcome = tokio::select! {
                _ = ctx.cancel.cancelled() => StageOutcome::Failed(ToolError::Cancelled { tool }),
                outcome = async {
                    tokio::time::sleep(delay).await;
                    perform(behavior, tool, &ctx.output, ctx.deadline).await
                } => outcome,
            };
            stats.running.fetch_sub(1, Ordering::SeqCst);
            let _ = tx.send(ToolEvent::Finished(outcome));
        });
        run
    }
}

// ===========================================================================
// FakeMonitor
// ===========================================================================

pub struct FakeMonitor {
    load: Mutex<LoadSnapshot>,
    pub samples: AtomicUsize,
}

impl FakeMonitor {
    pub fn calm() -> Self {
        Self {
            load: Mutex::new(LoadSnapshot::new(10.0, 20.0, 30.0)),
            samples: AtomicUsize::new(0),
        }
    }

    pub fn set_busy(&self) {
        *self.load.lock().unwrap() = LoadSnapshot::new(99.0, 20.0, 30.0);
    }

    pub fn set_calm(&self) {
        *self.load.lock().unwrap() = LoadSnapshot::new(10.0, 20.0, 30.0);
    }
}

#[async_trait]
impl ResourceMonitor for FakeMonitor {
    async fn current_load(&self) -> LoadSnapshot {
        self.samples.fetch_add(1, Ordering::SeqCst);
        *self.load.lock().unwrap()
    }
}

// ===========================================================================
// Stores
// ===========================================================================

/// Acquires like a local store but refuses to publish.
pub struct BrokenPublishStore {
    pub inner: LocalFileStore,
}

#[async_trait]
impl FileStore for BrokenPublishStore {
    async fn acquire(&self, input_ref: &str) -> Result<PathBuf, StoreError> {
        self.inner.acquire(input_ref).await
    }

    async fn publish(&self, _task_id: TaskId, path: &Path) -> Result<String, StoreError> {
        Err(StoreError::Io {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only media"),
        })
    }
}

// ===========================================================================
// Harness
// ===========================================================================

pub const INPUT: &str = "clip.mp4";

pub struct HarnessConfig {
    pub max_concurrent: usize,
    pub max_per_hour: u32,
    pub max_per_user: u32,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub cancel_grace: Duration,
    pub broken_publish: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            max_per_hour: 100,
            max_per_user: 100,
            max_retries: 1,
            retry_backoff: Duration::from_millis(10),
            cancel_grace: Duration::from_secs(5),
            broken_publish: false,
        }
    }
}

pub struct Harness {
    pub scheduler: Scheduler,
    pub tool: Arc<FakeTool>,
    pub monitor: Arc<FakeMonitor>,
    pub limiter: Arc<QuotaLimiter>,
    pub metrics: Arc<MetricsCollector>,
    pub media: PathBuf,
    pub work: PathBuf,
    pub dir: TempDir,
}

impl Harness {
    pub fn new(config: HarnessConfig, tool: FakeTool) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let inbox = dir.path().join("downloads");
        let media = dir.path().join("media");
        let work = dir.path().join("temp");
        std::fs::create_dir_all(&inbox).unwrap();
        std::fs::write(inbox.join(INPUT), b"source video").unwrap();

        let settings = SchedulerSettings {
            max_concurrent_tasks: config.max_concurrent,
            tick_interval: Duration::from_millis(50),
            retry_backoff: config.retry_backoff,
            cancel_grace: config.cancel_grace,
            terminate_grace: Duration::from_millis(100),
            progress_interval: Duration::ZERO,
            work_dir: work.clone(),
            thresholds: AlertThresholds::default(),
        };

        let tool = Arc::new(tool);
        let mut tools = ToolRegistry::new();
        tools.register(tool.clone());
        let planner = PipelineBuilder::new(tools.usable().clone()).with_max_retries(config.max_retries);
        let monitor = Arc::new(FakeMonitor::calm());
        let limiter = Arc::new(QuotaLimiter::new(
            QuotaConfig::per_hour(config.max_per_hour).with_max_concurrent(config.max_per_user),
        ));
        let metrics = Arc::new(MetricsCollector::new());
        let local = LocalFileStore::new(&inbox, &media);
        let store: Arc<dyn FileStore> = if config.broken_publish {
            Arc::new(BrokenPublishStore { inner: local })
        } else {
            Arc::new(local)
        };

        let scheduler = Scheduler::new(
            settings,
            SchedulerParts {
                registry: Arc::new(TaskRegistry::new(1000)),
                limiter: limiter.clone(),
                planner,
                tools,
                monitor: monitor.clone(),
                store,
                metrics: metrics.clone(),
            },
        );
        Self {
            scheduler,
            tool,
            monitor,
            limiter,
            metrics,
            media,
            work,
            dir,
        }
    }

    /// Harness with default settings around a plain FFmpeg stand-in.
    pub fn ffmpeg() -> Self {
        Self::new(HarnessConfig::default(), FakeTool::new(ToolKind::Ffmpeg))
    }

    pub fn published_files(&self) -> Vec<PathBuf> {
        match std::fs::read_dir(&self.media) {
            Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Poll until `condition` holds for the task, or panic after 10s.
    pub async fn wait_for(&self, id: TaskId, condition: impl Fn(&Task) -> bool) -> Task {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Some(task) = self.scheduler.status(id) {
                    if condition(&task) {
                        return task;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition reached in time")
    }

    pub async fn wait_terminal(&self, id: TaskId) -> Task {
        self.wait_for(id, Task::is_terminal).await
    }
}

// ===========================================================================
// Requests
// ===========================================================================

/// Single FFmpeg denoise stage.
pub fn denoise() -> OperationSpec {
    OperationSpec::new(
        ArtifactKind::Video,
        Operation::Denoise {
            level: DenoiseLevel::Medium,
        },
    )
}

/// Denoise then upscale, both on FFmpeg when it is the only tool.
pub fn two_stage() -> OperationSpec {
    OperationSpec::new(
        ArtifactKind::Video,
        Operation::Upscale {
            resolution: Resolution::P1080,
            denoise: true,
            refine: false,
            model: None,
        },
    )
}
