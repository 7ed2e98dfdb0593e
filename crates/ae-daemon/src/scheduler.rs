use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use ae_core::config::{AlertThresholds, Config, ThresholdBreach};
use ae_core::types::{
    FailureKind, OperationSpec, StageSpec, Task, TaskError, TaskEvent, TaskId, TaskStatus,
    UserId,
};
use ae_harness::rate_limiter::{DenyReason, QuotaLimiter};
use ae_harness::tools::{ExecutionContext, StageOutcome, ToolError, ToolEvent, ToolRegistry};
use ae_telemetry::metrics::MetricsCollector;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::monitor::ResourceMonitor;
use crate::pipeline::{PipelineBuilder, PlanError};
use crate::registry::{ProgressUpdate, RegistryError, TaskRegistry, TaskSubscription};
use crate::store::FileStore;

/// Worker pool size used when the configured ceiling is zero.
const DEFAULT_MAX_CONCURRENT: usize = 3;

/// Retry backoff stops doubling after this many attempts.
const MAX_BACKOFF_DOUBLINGS: u32 = 16;

// ---------------------------------------------------------------------------
// Settings / requests / errors
// ---------------------------------------------------------------------------

/// Scheduling knobs, resolved from [`Config`] once at startup.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub max_concurrent_tasks: usize,
    pub tick_interval: Duration,
    pub retry_backoff: Duration,
    /// How long `cancel` waits for a running task to finalise.
    pub cancel_grace: Duration,
    /// Passed to adapters: delay between SIGTERM and a forced kill.
    pub terminate_grace: Duration,
    pub progress_interval: Duration,
    /// Root of the per-task scratch directories.
    pub work_dir: PathBuf,
    pub thresholds: AlertThresholds,
}

impl SchedulerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_concurrent_tasks: config.max_concurrent_tasks,
            tick_interval: config.scheduler.tick_interval(),
            retry_backoff: config.scheduler.retry_backoff(),
            cancel_grace: config.scheduler.cancel_grace(),
            terminate_grace: config.scheduler.terminate_grace(),
            progress_interval: config.notifications.progress_interval(),
            work_dir: PathBuf::from(&config.storage.work_dir),
            thresholds: config.monitoring.alerts.clone(),
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Everything the scheduler talks to.
pub struct SchedulerParts {
    pub registry: Arc<TaskRegistry>,
    pub limiter: Arc<QuotaLimiter>,
    pub planner: PipelineBuilder,
    pub tools: ToolRegistry,
    pub monitor: Arc<dyn ResourceMonitor>,
    pub store: Arc<dyn FileStore>,
    pub metrics: Arc<MetricsCollector>,
}

/// One enhancement request as handed over by the front-end.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitRequest {
    pub user: UserId,
    pub input_ref: String,
    pub spec: OperationSpec,
}

impl SubmitRequest {
    pub fn new(user: impl Into<UserId>, input_ref: impl Into<String>, spec: OperationSpec) -> Self {
        Self {
            user: user.into(),
            input_ref: input_ref.into(),
            spec,
        }
    }
}

/// Synchronous rejection of a request. No task exists afterwards.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("cannot plan request: {0}")]
    Plan(#[from] PlanError),
    #[error("request denied: {0}")]
    Denied(#[from] DenyReason),
    #[error("scheduler is shutting down")]
    ShuttingDown,
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("task {0} not found")]
    NotFound(TaskId),
    #[error("task {id} already finished as {status}")]
    AlreadyFinished { id: TaskId, status: TaskStatus },
}

/// What a successful `cancel` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The task was waiting and has been removed from the queue.
    Removed,
    /// The task was running and its worker finalised it within the grace
    /// period.
    Stopped,
    /// The task was running and is still winding down; it will end as
    /// `Cancelled`.
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: usize,
    pub running: usize,
    pub paused: usize,
    pub capacity: usize,
    pub available_slots: usize,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub completed_last_24h: u64,
}

// ---------------------------------------------------------------------------
// Waiting queue
// ---------------------------------------------------------------------------

/// Priority of a waiting task: submission time, ties broken by sequence.
type QueueKey = (DateTime<Utc>, u64);

#[derive(Debug, Default)]
struct WaitQueue {
    order: BTreeMap<QueueKey, TaskId>,
    keys: HashMap<TaskId, QueueKey>,
}

impl WaitQueue {
    fn push(&mut self, id: TaskId, key: QueueKey) {
        if let Some(old) = self.keys.insert(id, key) {
            self.order.remove(&old);
        }
        self.order.insert(key, id);
    }

    fn pop_front(&mut self) -> Option<(TaskId, QueueKey)> {
        let (key, id) = self.order.pop_first()?;
        self.keys.remove(&id);
        Some((id, key))
    }

    fn remove(&mut self, id: TaskId) -> bool {
        match self.keys.remove(&id) {
            Some(key) => {
                self.order.remove(&key);
                true
            }
            None => false,
        }
    }

    fn drain(&mut self) -> Vec<TaskId> {
        self.keys.clear();
        std::mem::take(&mut self.order).into_values().collect()
    }

    fn len(&self) -> usize {
        self.order.len()
    }

    fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        warn!(lock = what, "lock poisoned, recovering");
        poisoned.into_inner()
    })
}

fn describe(breaches: &[ThresholdBreach]) -> String {
    breaches
        .iter()
        .map(|b| format!("{} {:.1}% > {:.1}%", b.resource, b.value, b.threshold))
        .collect::<Vec<_>>()
        .join(", ")
}

/// `base · 2^attempt`, saturating.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << attempt.min(MAX_BACKOFF_DOUBLINGS))
}

/// How a worker left its task.
enum WorkerExit {
    /// Every stage finished; the final artifact is ready to publish.
    Completed(PathBuf),
    /// Load check failed at a stage boundary; the task is `Paused`.
    Paused,
    Cancelled(String),
    Failed(TaskError),
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Admits requests, orders waiting tasks, and drives running tasks through
/// their stages on a bounded worker pool.
///
/// Every task holds one rate-limiter slot from admission until its
/// terminal transition. Running tasks hold one [`OwnedSemaphorePermit`];
/// paused tasks give theirs back and rejoin the queue at their original
/// position.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    settings: SchedulerSettings,
    registry: Arc<TaskRegistry>,
    limiter: Arc<QuotaLimiter>,
    planner: PipelineBuilder,
    tools: ToolRegistry,
    monitor: Arc<dyn ResourceMonitor>,
    store: Arc<dyn FileStore>,
    metrics: Arc<MetricsCollector>,
    workers: Arc<Semaphore>,
    capacity: usize,
    waiting: Mutex<WaitQueue>,
    /// Cancellation tokens of all live tasks, children of `shutdown`.
    tokens: Mutex<HashMap<TaskId, CancellationToken>>,
    shutdown: CancellationToken,
    /// Pinged when a worker frees its slot.
    wakeup: Notify,
    /// Serialises dispatch passes.
    dispatch_pass: tokio::sync::Mutex<()>,
    seq: AtomicU64,
}

impl Scheduler {
    pub fn new(settings: SchedulerSettings, parts: SchedulerParts) -> Self {
        let capacity = if settings.max_concurrent_tasks == 0 {
            warn!("max_concurrent_tasks was 0, defaulting to {DEFAULT_MAX_CONCURRENT}");
            DEFAULT_MAX_CONCURRENT
        } else {
            settings.max_concurrent_tasks
        };
        Self {
            inner: Arc::new(Inner {
                settings,
                registry: parts.registry,
                limiter: parts.limiter,
                planner: parts.planner,
                tools: parts.tools,
                monitor: parts.monitor,
                store: parts.store,
                metrics: parts.metrics,
                workers: Arc::new(Semaphore::new(capacity)),
                capacity,
                waiting: Mutex::new(WaitQueue::default()),
                tokens: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
                wakeup: Notify::new(),
                dispatch_pass: tokio::sync::Mutex::new(()),
                seq: AtomicU64::new(0),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.inner.registry
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.inner.metrics
    }

    pub fn limiter(&self) -> &Arc<QuotaLimiter> {
        &self.inner.limiter
    }

    /// Global ceiling on running tasks.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Plan, admit and enqueue a request.
    ///
    /// Planning and admission failures are returned here and leave no task
    /// behind. On success the task is `Queued` and a dispatch pass has run.
    pub async fn submit(&self, request: SubmitRequest) -> Result<TaskId, SubmitError> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(SubmitError::ShuttingDown);
        }
        let SubmitRequest {
            user,
            input_ref,
            spec,
        } = request;

        let stages = inner.planner.build(&spec).map_err(|e| {
            inner.record_denial(e.label());
            info!(user = %user, error = %e, "request could not be planned");
            e
        })?;

        if let Err(reason) = inner.limiter.try_admit(&user) {
            inner.record_denial(reason.label());
            info!(user = %user, reason = %reason, "request denied");
            return Err(reason.into());
        }

        let task = match Task::new(user.clone(), input_ref, stages) {
            Ok(task) => task,
            Err(e) => {
                inner.limiter.release(&user);
                return Err(SubmitError::Internal(e.to_string()));
            }
        };
        let id = task.id;
        let key = (task.created_at, inner.seq.fetch_add(1, Ordering::Relaxed));
        let stage_names: Vec<&str> = task.stages().iter().map(|s| s.name.as_str()).collect();
        info!(task_id = %id, user = %user, stages = ?stage_names, "task queued");

        lock(&inner.tokens, "tokens").insert(id, inner.shutdown.child_token());
        inner.registry.put(task);
        lock(&inner.waiting, "waiting").push(id, key);
        inner.metrics.increment_counter("tasks_submitted_total", &[]);

        if inner.shutdown.is_cancelled() {
            inner.cancel_if_waiting(id, "engine shutting down");
            return Err(SubmitError::ShuttingDown);
        }
        inner.dispatch().await;
        Ok(id)
    }

    /// Cancel a task.
    ///
    /// Waiting tasks are removed at once. For a running task the worker's
    /// token is cancelled and this waits up to the cancel grace period for
    /// the worker to finalise.
    pub async fn cancel(&self, id: TaskId) -> Result<CancelOutcome, SchedulerError> {
        let inner = &self.inner;
        let task = inner.registry.get(id).ok_or(SchedulerError::NotFound(id))?;
        if task.is_terminal() {
            return Err(SchedulerError::AlreadyFinished {
                id,
                status: task.status(),
            });
        }

        if let Some(token) = inner.token(id) {
            token.cancel();
        }
        if inner.cancel_if_waiting(id, "cancelled by user") {
            return Ok(CancelOutcome::Removed);
        }

        let Some(subscription) = inner.registry.subscribe(id) else {
            return Ok(CancelOutcome::Stopped);
        };
        match tokio::time::timeout(inner.settings.cancel_grace, subscription.terminal()).await {
            Ok(Some(TaskEvent::Terminal { status, .. })) if status != TaskStatus::Cancelled => {
                debug!(task_id = %id, %status, "task finished before it could be cancelled");
                Err(SchedulerError::AlreadyFinished { id, status })
            }
            Ok(_) => Ok(CancelOutcome::Stopped),
            Err(_) => {
                warn!(
                    task_id = %id,
                    grace = ?inner.settings.cancel_grace,
                    "task still stopping after cancel grace"
                );
                Ok(CancelOutcome::Stopping)
            }
        }
    }

    /// Cancel every unfinished task of `user`. Returns how many were
    /// cancelled.
    pub async fn cancel_user_tasks(&self, user: &UserId) -> usize {
        let ids: Vec<TaskId> = self
            .inner
            .registry
            .list_by_user(user)
            .into_iter()
            .filter(|task| !task.is_terminal())
            .map(|task| task.id)
            .collect();

        let mut cancels = JoinSet::new();
        for id in ids {
            let scheduler = self.clone();
            cancels.spawn(async move { scheduler.cancel(id).await });
        }
        let mut cancelled = 0;
        while let Some(result) = cancels.join_next().await {
            if matches!(result, Ok(Ok(_))) {
                cancelled += 1;
            }
        }
        info!(user = %user, cancelled, "cancelled user tasks");
        cancelled
    }

    pub fn status(&self, id: TaskId) -> Option<Task> {
        self.inner.registry.get(id)
    }

    pub fn subscribe(&self, id: TaskId) -> Option<TaskSubscription> {
        self.inner.registry.subscribe(id)
    }

    /// The user's tasks, newest first.
    pub fn list_user_tasks(&self, user: &UserId) -> Vec<Task> {
        self.inner.registry.list_by_user(user)
    }

    pub fn stats(&self) -> QueueStats {
        let inner = &self.inner;
        let counts = inner.registry.status_counts();
        let totals = inner.registry.totals();
        QueueStats {
            queued: counts.queued,
            running: counts.running,
            paused: counts.paused,
            capacity: inner.capacity,
            available_slots: inner.workers.available_permits(),
            processed: totals.processed,
            succeeded: totals.succeeded,
            failed: totals.failed,
            cancelled: totals.cancelled,
            completed_last_24h: totals.completed_last_24h,
        }
    }

    /// Run one dispatch pass now.
    pub async fn tick(&self) {
        self.inner.dispatch().await;
    }

    /// Spawn the background loop that dispatches on every tick and whenever
    /// a worker frees its slot. Ends on shutdown.
    pub fn start(&self) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.settings.tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            info!(
                interval = ?inner.settings.tick_interval,
                capacity = inner.capacity,
                "scheduler started"
            );
            loop {
                tokio::select! {
                    _ = inner.shutdown.cancelled() => {
                        debug!("scheduler loop stopping");
                        break;
                    }
                    _ = ticker.tick() => {}
                    _ = inner.wakeup.notified() => {}
                }
                inner.dispatch().await;
            }
        })
    }

    /// Cancel all work and wait up to `timeout` for workers to drain.
    /// Returns `true` when every worker finished in time.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let inner = &self.inner;
        info!("scheduler shutting down");
        inner.shutdown.cancel();

        let waiting = lock(&inner.waiting, "waiting").drain();
        for id in waiting {
            inner.cancel_task(id, "engine shutting down");
        }

        let all = u32::try_from(inner.capacity).unwrap_or(u32::MAX);
        match tokio::time::timeout(timeout, inner.workers.acquire_many(all)).await {
            Ok(Ok(_permits)) => {
                info!("all workers drained");
                true
            }
            Ok(Err(_)) => false,
            Err(_) => {
                let busy = inner.capacity.saturating_sub(inner.workers.available_permits());
                warn!(busy, ?timeout, "shutdown timed out with workers still running");
                false
            }
        }
    }
}

impl Inner {
    fn token(&self, id: TaskId) -> Option<CancellationToken> {
        lock(&self.tokens, "tokens").get(&id).cloned()
    }

    fn record_denial(&self, reason: &str) {
        self.metrics
            .increment_counter("tasks_denied_total", &[("reason", reason)]);
    }

    fn refresh_gauges(&self) {
        let waiting = lock(&self.waiting, "waiting").len();
        let running = self.capacity.saturating_sub(self.workers.available_permits());
        self.metrics.set_gauge("tasks_waiting", &[], waiting as i64);
        self.metrics.set_gauge("tasks_running", &[], running as i64);
    }

    fn work_dir(&self, id: TaskId) -> PathBuf {
        self.settings.work_dir.join(id.to_string())
    }

    fn stage_output(&self, id: TaskId, index: usize, stage: &StageSpec) -> PathBuf {
        self.work_dir(id).join(format!(
            "stage-{index}-{}.{}",
            stage.name,
            stage.output_extension()
        ))
    }

    // -- dispatch -----------------------------------------------------------

    /// Start waiting tasks oldest-first while slots are free, unless the
    /// host is over any load threshold.
    async fn dispatch(self: &Arc<Self>) {
        let _pass = self.dispatch_pass.lock().await;
        if self.shutdown.is_cancelled() {
            return;
        }
        if lock(&self.waiting, "waiting").is_empty() || self.workers.available_permits() == 0 {
            self.refresh_gauges();
            return;
        }

        let load = self.monitor.current_load().await;
        let breaches = self.settings.thresholds.breaches(&load);
        if !breaches.is_empty() {
            debug!(
                waiting = lock(&self.waiting, "waiting").len(),
                load = %describe(&breaches),
                "host over budget, holding waiting tasks"
            );
            self.refresh_gauges();
            return;
        }

        loop {
            let Ok(permit) = Arc::clone(&self.workers).try_acquire_owned() else {
                break;
            };
            let Some((id, key)) = lock(&self.waiting, "waiting").pop_front() else {
                break;
            };
            self.start_worker(id, key, permit);
        }
        self.refresh_gauges();
    }

    fn start_worker(self: &Arc<Self>, id: TaskId, key: QueueKey, permit: OwnedSemaphorePermit) {
        let worker = Arc::clone(self);
        let handle = tokio::spawn(async move { worker.run_task(id, key, permit).await });

        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            match handle.await {
                Ok(()) => {}
                Err(e) if e.is_panic() => {
                    error!(task_id = %id, "worker panicked");
                    supervisor.fail_task(
                        id,
                        TaskError::new(FailureKind::Internal, "worker panicked"),
                    );
                }
                Err(e) => debug!(task_id = %id, error = %e, "worker aborted"),
            }
            supervisor.refresh_gauges();
            supervisor.wakeup.notify_one();
        });
    }

    // -- worker -------------------------------------------------------------

    async fn run_task(self: Arc<Self>, id: TaskId, key: QueueKey, permit: OwnedSemaphorePermit) {
        let Some(token) = self.token(id) else {
            debug!(task_id = %id, "task finished before its worker started");
            return;
        };
        let Some(task) = self.registry.get(id) else {
            return;
        };
        if task.is_terminal() {
            return;
        }
        if token.is_cancelled() {
            self.cancel_task(id, "cancelled before start");
            return;
        }

        let index = task.current_stage_index();
        let resumed = task.status() == TaskStatus::Paused;
        let source = if index == 0 {
            match self.store.acquire(&task.input_ref).await {
                Ok(path) => path,
                Err(e) => {
                    warn!(task_id = %id, input = %task.input_ref, error = %e, "input unavailable");
                    let error = TaskError::new(FailureKind::InputUnavailable, e.to_string());
                    self.fail_task(id, error);
                    return;
                }
            }
        } else {
            self.stage_output(id, index - 1, &task.stages()[index - 1])
        };

        let note = if resumed { "resumed" } else { "started" };
        if let Err(e) = self.registry.transition(id, TaskStatus::Running, note) {
            debug!(task_id = %id, error = %e, "task could not start");
            return;
        }
        info!(task_id = %id, user = %task.owner, stage = index, "task {note}");

        let exit = self.run_stages(&task, source, &token).await;
        match exit {
            WorkerExit::Completed(output) => self.publish(id, &token, output).await,
            WorkerExit::Paused => {
                lock(&self.waiting, "waiting").push(id, key);
                // A cancel that raced the pause finds the task waiting.
                if token.is_cancelled() {
                    self.cancel_if_waiting(id, "cancelled while paused");
                }
            }
            WorkerExit::Cancelled(note) => self.cancel_task(id, note),
            WorkerExit::Failed(error) => self.fail_task(id, error),
        }
        drop(permit);
    }

    async fn run_stages(
        &self,
        task: &Task,
        mut source: PathBuf,
        token: &CancellationToken,
    ) -> WorkerExit {
        let id = task.id;
        let stages = task.stages();
        let mut index = task.current_stage_index();
        // The first stage of this run was admitted against a fresh sample.
        let mut check_load = false;

        while index < stages.len() {
            let stage = &stages[index];
            if check_load {
                if let Some(exit) = self.pause_if_overloaded(id, index).await {
                    return exit;
                }
            }
            check_load = true;
            if token.is_cancelled() {
                return WorkerExit::Cancelled(format!("cancelled before {}", stage.name));
            }

            match self.run_stage(task, index, &source, token).await {
                Ok(output) => {
                    if let Err(e) = self.registry.modify(id, |t| t.advance_stage().map(|_| ())) {
                        return WorkerExit::Failed(
                            TaskError::new(FailureKind::Internal, e.to_string())
                                .at_stage(index, &stage.name),
                        );
                    }
                    debug!(task_id = %id, stage = %stage.name, "stage completed");
                    source = output;
                    index += 1;
                }
                Err(exit) => return exit,
            }
        }
        WorkerExit::Completed(source)
    }

    async fn pause_if_overloaded(&self, id: TaskId, index: usize) -> Option<WorkerExit> {
        let load = self.monitor.current_load().await;
        let breaches = self.settings.thresholds.breaches(&load);
        if breaches.is_empty() {
            return None;
        }
        let note = format!("resource limits exceeded: {}", describe(&breaches));
        match self.registry.transition(id, TaskStatus::Paused, note.as_str()) {
            Ok(_) => {
                info!(task_id = %id, stage = index, load = %describe(&breaches), "task paused");
                Some(WorkerExit::Paused)
            }
            Err(e) => Some(WorkerExit::Failed(TaskError::new(
                FailureKind::Internal,
                format!("could not pause: {e}"),
            ))),
        }
    }

    /// Run one stage with retries. `Ok` carries the stage output.
    async fn run_stage(
        &self,
        task: &Task,
        index: usize,
        input: &Path,
        token: &CancellationToken,
    ) -> Result<PathBuf, WorkerExit> {
        let id = task.id;
        let stage = &task.stages()[index];
        let Some(adapter) = self.tools.get(stage.tool) else {
            return Err(WorkerExit::Failed(
                TaskError::new(
                    FailureKind::Internal,
                    format!("no adapter registered for {}", stage.tool),
                )
                .at_stage(index, &stage.name),
            ));
        };
        let output = self.stage_output(id, index, stage);
        let tool = [("tool", stage.tool.name())];
        let mut attempt: u32 = 0;

        loop {
            let ctx = ExecutionContext::new(id, &output, stage.timeout())
                .with_cancel(token.clone())
                .with_grace(self.settings.terminate_grace)
                .with_progress_interval(self.settings.progress_interval);
            debug!(
                task_id = %id,
                stage = %stage.name,
                tool = %stage.tool,
                attempt = attempt + 1,
                "stage attempt"
            );

            let started = Instant::now();
            let mut run = adapter.execute(stage, input, ctx);
            let mut finished = None;
            while let Some(event) = run.next().await {
                match event {
                    ToolEvent::Progress { fraction, note } => {
                        if let Err(e) = self
                            .registry
                            .update_progress(id, ProgressUpdate { fraction, note })
                        {
                            debug!(task_id = %id, error = %e, "progress dropped");
                        }
                    }
                    ToolEvent::Finished(outcome) => finished = Some(outcome),
                }
            }
            self.metrics.record_histogram(
                "stage_duration_seconds",
                &tool,
                started.elapsed().as_secs_f64(),
            );

            let error = match finished {
                Some(StageOutcome::Success { output }) => return Ok(output),
                Some(StageOutcome::Failed(error)) => error,
                None => ToolError::External {
                    tool: stage.tool,
                    detail: "tool run ended without a result".into(),
                },
            };
            if matches!(error, ToolError::Cancelled { .. }) {
                return Err(WorkerExit::Cancelled(format!("cancelled during {}", stage.name)));
            }
            if !error.is_retryable() || attempt >= stage.max_retries {
                let kind = error.failure_kind().unwrap_or(FailureKind::Internal);
                return Err(WorkerExit::Failed(
                    TaskError::new(kind, error.to_string()).at_stage(index, &stage.name),
                ));
            }

            attempt += 1;
            warn!(
                task_id = %id,
                stage = %stage.name,
                attempt,
                error = %error,
                "stage failed, retrying"
            );
            let detail = error.to_string();
            if let Err(e) = self.registry.modify(id, |t| {
                t.record_retry(&detail);
                Ok(())
            }) {
                debug!(task_id = %id, error = %e, "retry not recorded");
            }
            self.metrics.increment_counter("stage_retries_total", &tool);

            let backoff = backoff_delay(self.settings.retry_backoff, attempt - 1);
            tokio::select! {
                _ = token.cancelled() => {
                    return Err(WorkerExit::Cancelled(format!(
                        "cancelled while waiting to retry {}",
                        stage.name
                    )));
                }
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }

    async fn publish(&self, id: TaskId, token: &CancellationToken, output: PathBuf) {
        if token.is_cancelled() {
            self.cancel_task(id, "cancelled before publishing");
            return;
        }
        match self.store.publish(id, &output).await {
            Ok(result_ref) => {
                let result = self.registry.modify(id, |t| t.succeed(result_ref));
                self.finish(id, result);
            }
            Err(e) => {
                self.fail_task(id, TaskError::new(FailureKind::PublishFailed, e.to_string()));
            }
        }
    }

    // -- terminal transitions -----------------------------------------------

    /// Remove a waiting task from the queue and cancel it. `false` when the
    /// task was not waiting.
    fn cancel_if_waiting(&self, id: TaskId, note: &str) -> bool {
        let removed = lock(&self.waiting, "waiting").remove(id);
        if removed {
            self.cancel_task(id, note);
        }
        removed
    }

    fn cancel_task(&self, id: TaskId, note: impl Into<String>) {
        let result = self.registry.transition(id, TaskStatus::Cancelled, note);
        self.finish(id, result);
    }

    fn fail_task(&self, id: TaskId, error: TaskError) {
        let result = self.registry.modify(id, |t| t.fail(error));
        self.finish(id, result);
    }

    /// Bookkeeping after a terminal transition attempt. Only the call that
    /// actually moved the task into a terminal state releases its slot.
    fn finish(&self, id: TaskId, result: Result<Task, RegistryError>) {
        let task = match result {
            Ok(task) if task.is_terminal() => task,
            Ok(_) => return,
            Err(e) => {
                debug!(task_id = %id, error = %e, "terminal transition skipped");
                return;
            }
        };

        self.limiter.release(&task.owner);
        lock(&self.tokens, "tokens").remove(&id);
        let status = task.status().to_string();
        self.metrics
            .increment_counter("tasks_finished_total", &[("status", status.as_str())]);
        match (&task.error, &task.result_ref) {
            (Some(error), _) => {
                warn!(task_id = %id, user = %task.owner, error = %error, "task failed")
            }
            (None, Some(result)) => {
                info!(task_id = %id, user = %task.owner, result = %result, "task succeeded")
            }
            (None, None) => {
                info!(task_id = %id, user = %task.owner, status = %status, "task finished")
            }
        }

        let dir = self.work_dir(id);
        tokio::spawn(async move {
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => debug!(dir = %dir.display(), "work dir removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(dir = %dir.display(), error = %e, "failed to remove work dir"),
            }
        });
        self.refresh_gauges();
    }
}
