//! External tool adapters.
//!
//! Every processing step is one subprocess. Adapters translate a
//! [`StageSpec`] into a command line and a progress parser; the shared
//! runner in [`process`] owns spawning, cancellation, deadlines and the
//! partial-output discipline.

mod ffmpeg;
pub(crate) mod process;
mod realesrgan;
mod video2x;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ae_core::config::ToolsConfig;
use ae_core::types::{FailureKind, StageSpec, TaskId, ToolKind};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use ffmpeg::FfmpegAdapter;
pub use process::partial_path;
pub use realesrgan::RealEsrganAdapter;
pub use video2x::Video2xAdapter;

// ---------------------------------------------------------------------------
// Errors / outcomes
// ---------------------------------------------------------------------------

/// Why a single tool invocation did not produce an output.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolError {
    /// Missing binary, non-zero exit, or no usable output file. `detail`
    /// keeps the tail of the tool's stderr.
    #[error("{tool} failed: {detail}")]
    External { tool: ToolKind, detail: String },

    /// The stage ran past its time budget and was stopped.
    #[error("{tool} exceeded its {budget:?} budget after {elapsed:?}")]
    Timeout {
        tool: ToolKind,
        elapsed: Duration,
        budget: Duration,
    },

    #[error("{tool} was cancelled")]
    Cancelled { tool: ToolKind },
}

impl ToolError {
    pub fn tool(&self) -> ToolKind {
        match self {
            ToolError::External { tool, .. }
            | ToolError::Timeout { tool, .. }
            | ToolError::Cancelled { tool } => *tool,
        }
    }

    /// Classification recorded on a failed task. `None` for cancellation,
    /// which is a terminal status of its own rather than a failure.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            ToolError::External { .. } => Some(FailureKind::ExternalToolError),
            ToolError::Timeout { .. } => Some(FailureKind::Timeout),
            ToolError::Cancelled { .. } => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ToolError::External { .. })
    }
}

/// Final result of one stage attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// The output file exists, is non-empty, and sits at its final path.
    Success { output: PathBuf },
    Failed(ToolError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolEvent {
    Progress { fraction: f64, note: Option<String> },
    Finished(StageOutcome),
}

impl ToolEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ToolEvent::Finished(_))
    }
}

// ---------------------------------------------------------------------------
// ToolRun
// ---------------------------------------------------------------------------

/// Sending half handed to whatever drives the tool.
pub type ToolEventSender = flume::Sender<ToolEvent>;

/// The event stream of one stage attempt.
///
/// Yields zero or more `Progress` events and then exactly one `Finished`,
/// after which [`next`](Self::next) returns `None`. If the producer goes
/// away without finishing, the run ends with an `External` failure.
#[derive(Debug)]
pub struct ToolRun {
    tool: ToolKind,
    events: flume::Receiver<ToolEvent>,
    finished: bool,
}

impl ToolRun {
    /// A fresh run plus the sender its producer should use.
    pub fn channel(tool: ToolKind) -> (ToolEventSender, Self) {
        let (tx, rx) = flume::unbounded();
        (
            tx,
            Self {
                tool,
                events: rx,
                finished: false,
            },
        )
    }

    /// A run that has already failed, e.g. because the stage parameters
    /// could not be turned into a command line.
    pub fn failed(error: ToolError) -> Self {
        let (tx, run) = Self::channel(error.tool());
        let _ = tx.send(ToolEvent::Finished(StageOutcome::Failed(error)));
        run
    }

    pub fn tool(&self) -> ToolKind {
        self.tool
    }

    pub async fn next(&mut self) -> Option<ToolEvent> {
        if self.finished {
            return None;
        }
        match self.events.recv_async().await {
            Ok(event) => {
                if event.is_terminal() {
                    self.finished = true;
                }
                Some(event)
            }
            Err(_) => {
                self.finished = true;
                Some(ToolEvent::Finished(StageOutcome::Failed(
                    ToolError::External {
                        tool: self.tool,
                        detail: "tool runner stopped without reporting a result".into(),
                    },
                )))
            }
        }
    }

    /// Drain progress and return the outcome.
    pub async fn outcome(mut self) -> StageOutcome {
        while let Some(event) = self.next().await {
            if let ToolEvent::Finished(outcome) = event {
                return outcome;
            }
        }
        StageOutcome::Failed(ToolError::External {
            tool: self.tool,
            detail: "tool run already consumed".into(),
        })
    }
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Per-attempt execution parameters supplied by the scheduler.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub task_id: TaskId,
    pub cancel: CancellationToken,
    /// Time budget for this attempt.
    pub deadline: Duration,
    /// How long a terminated tool may take to exit before it is killed.
    pub grace: Duration,
    /// Minimum spacing between progress events.
    pub progress_interval: Duration,
    /// Where the stage result must end up.
    pub output: PathBuf,
}

impl ExecutionContext {
    pub fn new(task_id: TaskId, output: impl Into<PathBuf>, deadline: Duration) -> Self {
        Self {
            task_id,
            cancel: CancellationToken::new(),
            deadline,
            grace: Duration::from_secs(5),
            progress_interval: Duration::from_secs(5),
            output: output.into(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }
}

// ---------------------------------------------------------------------------
// ToolAdapter
// ---------------------------------------------------------------------------

/// One external processing tool.
///
/// `execute` starts work in the background and returns immediately; the
/// returned [`ToolRun`] is the only channel back. Each call is independent,
/// so a failed attempt can simply be executed again.
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    fn kind(&self) -> ToolKind;

    /// Whether the tool's binary can be run on this host.
    async fn is_available(&self) -> bool;

    fn execute(&self, stage: &StageSpec, input: &Path, ctx: ExecutionContext) -> ToolRun;
}

// ---------------------------------------------------------------------------
// ToolRegistry
// ---------------------------------------------------------------------------

/// Adapters by tool kind, plus the set of tools that are enabled in
/// configuration and were found on this host.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    adapters: HashMap<ToolKind, Arc<dyn ToolAdapter>>,
    usable: BTreeSet<ToolKind>,
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("registered", &self.adapters.keys().collect::<BTreeSet<_>>())
            .field("usable", &self.usable)
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `adapter` and mark it usable without probing.
    pub fn register(&mut self, adapter: Arc<dyn ToolAdapter>) {
        let kind = adapter.kind();
        self.adapters.insert(kind, adapter);
        self.usable.insert(kind);
    }

    /// Build the stock adapters from configuration, keeping only the ones
    /// that are enabled and whose binaries respond.
    pub async fn from_config(tools: &ToolsConfig) -> Self {
        let mut registry = Self::new();
        for kind in ToolKind::ALL {
            if !tools.is_enabled(kind) {
                info!(tool = %kind, "tool disabled in configuration");
                continue;
            }
            let adapter: Arc<dyn ToolAdapter> = match kind {
                ToolKind::Ffmpeg => Arc::new(FfmpegAdapter::new(
                    tools.binary(kind),
                    tools.ffprobe_path.clone(),
                )),
                ToolKind::RealEsrgan => {
                    let mut adapter = RealEsrganAdapter::new(tools.binary(kind))
                        .with_ffmpeg(tools.binary(ToolKind::Ffmpeg), tools.ffprobe_path.clone());
                    if let Some(gpu) = tools.gpu(kind) {
                        adapter = adapter.with_gpu(gpu);
                    }
                    Arc::new(adapter)
                }
                ToolKind::Video2x => {
                    let mut adapter = Video2xAdapter::new(tools.binary(kind));
                    if let Some(gpu) = tools.gpu(kind) {
                        adapter = adapter.with_gpu(gpu);
                    }
                    Arc::new(adapter)
                }
            };
            registry.adapters.insert(kind, Arc::clone(&adapter));
            if adapter.is_available().await {
                info!(tool = %kind, binary = %tools.binary(kind), "tool available");
                registry.usable.insert(kind);
            } else {
                warn!(
                    tool = %kind,
                    binary = %tools.binary(kind),
                    "tool not found, stages needing it will fall back or be rejected"
                );
            }
        }
        registry
    }

    pub fn get(&self, kind: ToolKind) -> Option<Arc<dyn ToolAdapter>> {
        self.adapters.get(&kind).cloned()
    }

    /// Tools the pipeline builder may plan with.
    pub fn usable(&self) -> &BTreeSet<ToolKind> {
        &self.usable
    }
}
