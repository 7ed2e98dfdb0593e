use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Process-unique task identifier.
pub type TaskId = Uuid;

/// Maximum number of history entries kept on a single task.
const MAX_TASK_HISTORY: usize = 64;

// ---------------------------------------------------------------------------
// UserId
// ---------------------------------------------------------------------------

/// Opaque user identifier handed over by the front-end.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for UserId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<i64> for UserId {
    fn from(value: i64) -> Self {
        Self(value.to_string())
    }
}

// ---------------------------------------------------------------------------
// ArtifactKind
// ---------------------------------------------------------------------------

/// The kind of media a stage consumes or produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Video stream with an audio track.
    Video,
    /// Video stream without audio.
    SilentVideo,
    Audio,
    Image,
}

impl ArtifactKind {
    /// Returns `true` when an artifact of kind `self` can feed a stage that
    /// requires `required`.
    ///
    /// A full video can stand in for a silent video (the audio track is
    /// ignored) or for audio (the track is extracted). Nothing else widens.
    pub fn satisfies(self, required: ArtifactKind) -> bool {
        self == required
            || matches!(
                (self, required),
                (ArtifactKind::Video, ArtifactKind::SilentVideo)
                    | (ArtifactKind::Video, ArtifactKind::Audio)
            )
    }

    /// Kind of media stored in a container with extension `ext`.
    ///
    /// Video containers report [`ArtifactKind::Video`]; whether the file
    /// actually carries audio is only known from its contents.
    pub fn from_extension(ext: &str) -> Option<ArtifactKind> {
        match ext.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "mp4" | "mkv" | "mov" | "avi" | "webm" | "m4v" => Some(ArtifactKind::Video),
            "mp3" | "wav" | "aac" | "m4a" | "flac" | "ogg" | "oga" | "opus" => {
                Some(ArtifactKind::Audio)
            }
            "png" | "jpg" | "jpeg" | "webp" | "bmp" | "tiff" => Some(ArtifactKind::Image),
            _ => None,
        }
    }

    /// File extension used for intermediate and published artifacts.
    pub fn default_extension(self) -> &'static str {
        match self {
            ArtifactKind::Video | ArtifactKind::SilentVideo => "mp4",
            ArtifactKind::Audio => "m4a",
            ArtifactKind::Image => "png",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ArtifactKind::Video => "video+audio",
            ArtifactKind::SilentVideo => "video",
            ArtifactKind::Audio => "audio-only",
            ArtifactKind::Image => "image",
        };
        f.write_str(label)
    }
}

// ---------------------------------------------------------------------------
// ToolKind
// ---------------------------------------------------------------------------

/// The closed set of external tools a stage can run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ToolKind {
    #[serde(rename = "ffmpeg")]
    Ffmpeg,
    #[serde(rename = "realesrgan")]
    RealEsrgan,
    #[serde(rename = "video2x")]
    Video2x,
}

impl ToolKind {
    pub const ALL: [ToolKind; 3] = [ToolKind::Ffmpeg, ToolKind::RealEsrgan, ToolKind::Video2x];

    pub fn name(self) -> &'static str {
        match self {
            ToolKind::Ffmpeg => "ffmpeg",
            ToolKind::RealEsrgan => "realesrgan",
            ToolKind::Video2x => "video2x",
        }
    }

    /// Binary looked up on `PATH` when the configuration does not name one.
    pub fn default_binary(self) -> &'static str {
        match self {
            ToolKind::Ffmpeg => "ffmpeg",
            ToolKind::RealEsrgan => "realesrgan-ncnn-vulkan",
            ToolKind::Video2x => "video2x",
        }
    }

    /// Default per-stage time budget.
    pub fn default_timeout(self) -> Duration {
        match self {
            ToolKind::Ffmpeg => Duration::from_secs(30 * 60),
            ToolKind::RealEsrgan | ToolKind::Video2x => Duration::from_secs(60 * 60),
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// StageSpec
// ---------------------------------------------------------------------------

/// One step of a task pipeline: a single external tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    /// Human-readable step name, e.g. `denoise` or `upscale`.
    pub name: String,
    pub tool: ToolKind,
    pub input: ArtifactKind,
    pub output: ArtifactKind,
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
    /// How many times the stage is retried after an external tool error.
    pub max_retries: u32,
    pub timeout_secs: u64,
    /// Relative share of this stage in overall task progress.
    pub weight: f64,
}

impl StageSpec {
    pub fn new(
        name: impl Into<String>,
        tool: ToolKind,
        input: ArtifactKind,
        output: ArtifactKind,
    ) -> Self {
        Self {
            name: name.into(),
            tool,
            input,
            output,
            params: BTreeMap::new(),
            max_retries: 1,
            timeout_secs: tool.default_timeout().as_secs(),
            weight: 1.0,
        }
    }

    pub fn with_param(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        // Sub-second budgets round up so a stage never gets a zero deadline.
        self.timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight.max(0.0);
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }

    pub fn param_bool(&self, key: &str) -> Option<bool> {
        self.params.get(key).and_then(|v| v.as_bool())
    }

    pub fn param_u64(&self, key: &str) -> Option<u64> {
        self.params.get(key).and_then(|v| v.as_u64())
    }

    /// File extension of this stage's output: an explicit `format` param
    /// wins over the artifact kind's default.
    pub fn output_extension(&self) -> String {
        self.param_str("format")
            .map(|f| f.trim_start_matches('.').to_ascii_lowercase())
            .filter(|f| !f.is_empty())
            .unwrap_or_else(|| self.output.default_extension().to_string())
    }
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resolution {
    #[serde(rename = "720p")]
    P720,
    #[serde(rename = "1080p")]
    P1080,
    #[serde(rename = "2k")]
    K2,
    #[serde(rename = "4k")]
    K4,
}

impl Resolution {
    /// Target frame size in pixels.
    pub fn dimensions(self) -> (u32, u32) {
        match self {
            Resolution::P720 => (1280, 720),
            Resolution::P1080 => (1920, 1080),
            Resolution::K2 => (2560, 1440),
            Resolution::K4 => (3840, 2160),
        }
    }

    /// Integer model scale for super-resolution networks.
    pub fn scale_factor(self) -> u32 {
        match self {
            Resolution::K4 => 4,
            _ => 2,
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Resolution::P720 => "720p",
            Resolution::P1080 => "1080p",
            Resolution::K2 => "2k",
            Resolution::K4 => "4k",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenoiseLevel {
    Light,
    #[default]
    Medium,
    Strong,
}

impl DenoiseLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            DenoiseLevel::Light => "light",
            DenoiseLevel::Medium => "medium",
            DenoiseLevel::Strong => "strong",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    Low,
    Medium,
    #[default]
    High,
}

impl Quality {
    pub fn as_str(self) -> &'static str {
        match self {
            Quality::Low => "low",
            Quality::Medium => "medium",
            Quality::High => "high",
        }
    }
}

/// One requested transformation, as emitted by the intent resolver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    Upscale {
        resolution: Resolution,
        #[serde(default)]
        denoise: bool,
        #[serde(default)]
        refine: bool,
        #[serde(default)]
        model: Option<String>,
    },
    Denoise {
        #[serde(default)]
        level: DenoiseLevel,
    },
    Enhance {
        #[serde(default = "default_true")]
        denoise: bool,
        #[serde(default = "default_true")]
        sharpen: bool,
        #[serde(default = "default_true")]
        enhance_colors: bool,
        #[serde(default)]
        stabilize: bool,
    },
    Convert {
        format: String,
        #[serde(default)]
        quality: Quality,
    },
    ExtractAudio {
        #[serde(default = "default_audio_format")]
        format: String,
    },
}

impl Operation {
    pub fn label(&self) -> &'static str {
        match self {
            Operation::Upscale { .. } => "upscale",
            Operation::Denoise { .. } => "denoise",
            Operation::Enhance { .. } => "enhance",
            Operation::Convert { .. } => "convert",
            Operation::ExtractAudio { .. } => "extract_audio",
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_audio_format() -> String {
    "m4a".into()
}

/// A full request plan: the kind of the input plus the operations to apply
/// to it, in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationSpec {
    pub input_kind: ArtifactKind,
    pub operations: Vec<Operation>,
    /// Task-level override of every stage's time budget.
    #[serde(default)]
    pub timeout_override_secs: Option<u64>,
}

impl OperationSpec {
    pub fn new(input_kind: ArtifactKind, operation: Operation) -> Self {
        Self {
            input_kind,
            operations: vec![operation],
            timeout_override_secs: None,
        }
    }

    /// Append another operation to the chain.
    pub fn then(mut self, operation: Operation) -> Self {
        self.operations.push(operation);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_override_secs = Some(timeout.as_secs().max(1));
        self
    }

    pub fn timeout_override(&self) -> Option<Duration> {
        self.timeout_override_secs.map(Duration::from_secs)
    }
}

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    /// Resource-limited: waiting for load to drop before the next stage.
    Paused,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// `true` for tasks that sit in the scheduling queue without a worker.
    pub fn is_waiting(self) -> bool {
        matches!(self, TaskStatus::Queued | TaskStatus::Paused)
    }

    /// Returns `true` when a transition from `self` to `target` is valid.
    pub fn can_transition_to(self, target: TaskStatus) -> bool {
        matches!(
            (self, target),
            (TaskStatus::Queued, TaskStatus::Running)
                | (TaskStatus::Queued, TaskStatus::Cancelled)
                | (TaskStatus::Queued, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Paused)
                | (TaskStatus::Running, TaskStatus::Succeeded)
                | (TaskStatus::Running, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Cancelled)
                | (TaskStatus::Paused, TaskStatus::Running)
                | (TaskStatus::Paused, TaskStatus::Cancelled)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

/// Classified reason a task ended in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ExternalToolError,
    Timeout,
    InputUnavailable,
    PublishFailed,
    Internal,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureKind::ExternalToolError => "external tool error",
            FailureKind::Timeout => "timed out",
            FailureKind::InputUnavailable => "input file is no longer available",
            FailureKind::PublishFailed => "result could not be published",
            FailureKind::Internal => "internal error",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub stage_index: Option<usize>,
    pub stage_name: Option<String>,
    pub kind: FailureKind,
    /// Raw detail for operators; never shown to the user verbatim.
    pub detail: String,
}

impl TaskError {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            stage_index: None,
            stage_name: None,
            kind,
            detail: detail.into(),
        }
    }

    pub fn at_stage(mut self, index: usize, name: impl Into<String>) -> Self {
        self.stage_index = Some(index);
        self.stage_name = Some(name.into());
        self
    }

    /// Short classified message safe to show to the requesting user.
    pub fn user_message(&self) -> String {
        match (&self.stage_index, &self.stage_name) {
            (Some(index), Some(name)) => {
                format!("stage {} ({}) failed: {}", index + 1, name, self.kind)
            }
            _ => format!("processing failed: {}", self.kind),
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.user_message(), self.detail)
    }
}

// ---------------------------------------------------------------------------
// Progress / history
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaskProgress {
    /// Fraction of the current stage, in [0, 1].
    pub stage_fraction: f64,
    /// Weighted fraction of the whole pipeline, in [0, 1].
    pub overall: f64,
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub at: DateTime<Utc>,
    pub status: TaskStatus,
    pub note: String,
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum TaskStateError {
    #[error("a task needs at least one stage")]
    EmptyPipeline,
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },
    #[error("operation requires a running task, task is {0}")]
    NotRunning(TaskStatus),
    #[error("all {0} stages already completed")]
    StagesExhausted(usize),
    #[error("{remaining} stage(s) still pending")]
    StagesPending { remaining: usize },
}

/// One user-initiated enhancement job.
///
/// Status, stage index and stages are private: every mutation goes through
/// the methods below, which enforce the lifecycle rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub owner: UserId,
    pub input_ref: String,
    stages: Vec<StageSpec>,
    status: TaskStatus,
    current_stage_index: usize,
    /// Attempts already made on the current stage.
    pub attempts: u32,
    pub progress: TaskProgress,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<TaskError>,
    pub result_ref: Option<String>,
    pub history: Vec<HistoryEntry>,
}

impl Task {
    pub fn new(
        owner: UserId,
        input_ref: impl Into<String>,
        stages: Vec<StageSpec>,
    ) -> Result<Self, TaskStateError> {
        if stages.is_empty() {
            return Err(TaskStateError::EmptyPipeline);
        }
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            owner,
            input_ref: input_ref.into(),
            stages,
            status: TaskStatus::Queued,
            current_stage_index: 0,
            attempts: 0,
            progress: TaskProgress::default(),
            created_at: now,
            started_at: None,
            finished_at: None,
            error: None,
            result_ref: None,
            history: vec![HistoryEntry {
                at: now,
                status: TaskStatus::Queued,
                note: "admitted".into(),
            }],
        })
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    pub fn current_stage_index(&self) -> usize {
        self.current_stage_index
    }

    pub fn current_stage(&self) -> Option<&StageSpec> {
        self.stages.get(self.current_stage_index)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to `to`, stamping timestamps and recording history.
    pub fn transition(
        &mut self,
        to: TaskStatus,
        note: impl Into<String>,
    ) -> Result<(), TaskStateError> {
        if !self.status.can_transition_to(to) {
            return Err(TaskStateError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        let now = Utc::now();
        if to == TaskStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if to.is_terminal() {
            self.finished_at = Some(now);
        }
        tracing::debug!(task_id = %self.id, from = %self.status, to = %to, "task state transition");
        self.status = to;
        self.push_history(to, note.into());
        Ok(())
    }

    /// Mark the current stage finished and move to the next one.
    ///
    /// Returns the new stage index, which equals `stages().len()` once the
    /// last stage has completed.
    pub fn advance_stage(&mut self) -> Result<usize, TaskStateError> {
        if self.status != TaskStatus::Running {
            return Err(TaskStateError::NotRunning(self.status));
        }
        if self.current_stage_index >= self.stages.len() {
            return Err(TaskStateError::StagesExhausted(self.stages.len()));
        }
        self.current_stage_index += 1;
        self.attempts = 0;
        self.progress.stage_fraction = 0.0;
        self.progress.note = None;
        self.progress.overall = self.weighted_overall();
        Ok(self.current_stage_index)
    }

    /// Record progress reported by the active stage.
    ///
    /// Fractions are clamped to [0, 1] and never move backwards within one
    /// attempt. Ignored unless the task is running.
    pub fn record_progress(&mut self, fraction: f64, note: Option<String>) {
        if self.status != TaskStatus::Running {
            return;
        }
        let fraction = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self.progress.stage_fraction = self.progress.stage_fraction.max(fraction);
        if note.is_some() {
            self.progress.note = note;
        }
        self.progress.overall = self.weighted_overall();
    }

    /// Record a failed attempt of the current stage that is about to be
    /// retried.
    pub fn record_retry(&mut self, detail: &str) {
        self.attempts += 1;
        self.progress.stage_fraction = 0.0;
        self.progress.overall = self.weighted_overall();
        let stage = self
            .current_stage()
            .map(|s| s.name.clone())
            .unwrap_or_default();
        let note = format!("retrying stage {stage} (attempt {}): {detail}", self.attempts + 1);
        self.push_history(self.status, note);
    }

    /// Record the classified error and move to `Failed`.
    pub fn fail(&mut self, error: TaskError) -> Result<(), TaskStateError> {
        let note = error.user_message();
        self.transition(TaskStatus::Failed, note)?;
        self.error = Some(error);
        Ok(())
    }

    /// Record the published result and move to `Succeeded`.
    pub fn succeed(&mut self, result_ref: impl Into<String>) -> Result<(), TaskStateError> {
        let remaining = self.stages.len() - self.current_stage_index.min(self.stages.len());
        if remaining > 0 {
            return Err(TaskStateError::StagesPending { remaining });
        }
        self.transition(TaskStatus::Succeeded, "all stages completed")?;
        self.result_ref = Some(result_ref.into());
        self.progress.stage_fraction = 1.0;
        self.progress.overall = 1.0;
        Ok(())
    }

    fn weighted_overall(&self) -> f64 {
        let total: f64 = self.stages.iter().map(|s| s.weight).sum();
        if total <= 0.0 {
            return self.current_stage_index as f64 / self.stages.len() as f64;
        }
        let done: f64 = self.stages[..self.current_stage_index]
            .iter()
            .map(|s| s.weight)
            .sum();
        let current = self
            .current_stage()
            .map(|s| s.weight * self.progress.stage_fraction)
            .unwrap_or(0.0);
        ((done + current) / total).clamp(0.0, 1.0)
    }

    fn push_history(&mut self, status: TaskStatus, note: String) {
        if self.history.len() >= MAX_TASK_HISTORY {
            self.history.remove(0);
        }
        self.history.push(HistoryEntry {
            at: Utc::now(),
            status,
            note,
        });
    }
}

// ---------------------------------------------------------------------------
// TaskEvent
// ---------------------------------------------------------------------------

/// What a subscriber sees: progress snapshots followed by exactly one
/// terminal event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    Progress {
        task_id: TaskId,
        status: TaskStatus,
        stage_index: usize,
        stage_name: Option<String>,
        stage_fraction: f64,
        overall: f64,
        note: Option<String>,
    },
    Terminal {
        task_id: TaskId,
        status: TaskStatus,
        result_ref: Option<String>,
        error: Option<TaskError>,
    },
}

impl TaskEvent {
    pub fn from_task(task: &Task) -> Self {
        if task.is_terminal() {
            TaskEvent::Terminal {
                task_id: task.id,
                status: task.status,
                result_ref: task.result_ref.clone(),
                error: task.error.clone(),
            }
        } else {
            TaskEvent::Progress {
                task_id: task.id,
                status: task.status,
                stage_index: task.current_stage_index,
                stage_name: task.current_stage().map(|s| s.name.clone()),
                stage_fraction: task.progress.stage_fraction,
                overall: task.progress.overall,
                note: task.progress.note.clone(),
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskEvent::Terminal { .. })
    }
}

// ---------------------------------------------------------------------------
// LoadSnapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    Cpu,
    Memory,
    GpuMemory,
    Disk,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Resource::Cpu => "cpu",
            Resource::Memory => "memory",
            Resource::GpuMemory => "gpu_memory",
            Resource::Disk => "disk",
        };
        f.write_str(label)
    }
}

/// Point-in-time resource reading. Immutable once sampled.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoadSnapshot {
    pub cpu_pct: f64,
    pub mem_pct: f64,
    /// `None` when no GPU could be queried.
    pub gpu_mem_pct: Option<f64>,
    pub disk_pct: f64,
    pub sampled_at: DateTime<Utc>,
}

impl LoadSnapshot {
    pub fn new(cpu_pct: f64, mem_pct: f64, disk_pct: f64) -> Self {
        Self {
            cpu_pct,
            mem_pct,
            gpu_mem_pct: None,
            disk_pct,
            sampled_at: Utc::now(),
        }
    }

    pub fn with_gpu(mut self, gpu_mem_pct: f64) -> Self {
        self.gpu_mem_pct = Some(gpu_mem_pct);
        self
    }

    /// Reading for `resource`, if one was taken.
    pub fn value(&self, resource: Resource) -> Option<f64> {
        match resource {
            Resource::Cpu => Some(self.cpu_pct),
            Resource::Memory => Some(self.mem_pct),
            Resource::GpuMemory => self.gpu_mem_pct,
            Resource::Disk => Some(self.disk_pct),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_stage_task() -> Task {
        Task::new(
            UserId::from("u1"),
            "clip.mp4",
            vec![
                StageSpec::new(
                    "denoise",
                    ToolKind::Ffmpeg,
                    ArtifactKind::Video,
                    ArtifactKind::Video,
                ),
                StageSpec::new(
                    "upscale",
                    ToolKind::RealEsrgan,
                    ArtifactKind::Video,
                    ArtifactKind::Video,
                )
                .with_weight(3.0),
            ],
        )
        .expect("non-empty pipeline")
    }

    #[test]
    fn empty_pipeline_is_rejected() {
        let err = Task::new(UserId::from("u1"), "x", vec![]).unwrap_err();
        assert_eq!(err, TaskStateError::EmptyPipeline);
    }

    #[test]
    fn artifact_compatibility() {
        assert!(ArtifactKind::Video.satisfies(ArtifactKind::Video));
        assert!(ArtifactKind::Video.satisfies(ArtifactKind::SilentVideo));
        assert!(ArtifactKind::Video.satisfies(ArtifactKind::Audio));
        assert!(!ArtifactKind::Audio.satisfies(ArtifactKind::Video));
        assert!(!ArtifactKind::SilentVideo.satisfies(ArtifactKind::Video));
        assert!(!ArtifactKind::Image.satisfies(ArtifactKind::SilentVideo));
    }

    #[test]
    fn terminal_states_never_transition() {
        for terminal in [TaskStatus::Succeeded, TaskStatus::Failed, TaskStatus::Cancelled] {
            for target in [
                TaskStatus::Queued,
                TaskStatus::Running,
                TaskStatus::Paused,
                TaskStatus::Succeeded,
                TaskStatus::Failed,
                TaskStatus::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(target), "{terminal} -> {target}");
            }
        }
    }

    #[test]
    fn running_and_paused_alternate() {
        let mut task = two_stage_task();
        task.transition(TaskStatus::Running, "start").unwrap();
        task.transition(TaskStatus::Paused, "load").unwrap();
        task.transition(TaskStatus::Running, "resume").unwrap();
        assert!(task.started_at.is_some());
        assert!(task.transition(TaskStatus::Queued, "back").is_err());
    }

    #[test]
    fn weighted_progress() {
        let mut task = two_stage_task();
        task.transition(TaskStatus::Running, "start").unwrap();
        task.record_progress(0.5, None);
        assert!((task.progress.overall - 0.125).abs() < 1e-9);

        task.advance_stage().unwrap();
        assert!((task.progress.overall - 0.25).abs() < 1e-9);

        task.record_progress(0.5, Some("frames".into()));
        assert!((task.progress.overall - 0.625).abs() < 1e-9);

        // Backwards reports within the same attempt are ignored.
        task.record_progress(0.1, None);
        assert!((task.progress.stage_fraction - 0.5).abs() < 1e-9);
    }

    #[test]
    fn stage_index_never_exceeds_len() {
        let mut task = two_stage_task();
        task.transition(TaskStatus::Running, "start").unwrap();
        assert_eq!(task.advance_stage().unwrap(), 1);
        assert_eq!(task.advance_stage().unwrap(), 2);
        assert_eq!(
            task.advance_stage().unwrap_err(),
            TaskStateError::StagesExhausted(2)
        );
        assert_eq!(task.current_stage_index(), 2);
    }

    #[test]
    fn succeed_requires_all_stages() {
        let mut task = two_stage_task();
        task.transition(TaskStatus::Running, "start").unwrap();
        task.advance_stage().unwrap();
        assert_eq!(
            task.succeed("out.mp4").unwrap_err(),
            TaskStateError::StagesPending { remaining: 1 }
        );
        task.advance_stage().unwrap();
        task.succeed("out.mp4").unwrap();
        assert_eq!(task.result_ref.as_deref(), Some("out.mp4"));
        assert!(task.finished_at.is_some());
        assert!((task.progress.overall - 1.0).abs() < 1e-9);
    }

    #[test]
    fn user_message_hides_detail() {
        let err = TaskError::new(FailureKind::Timeout, "killed after 3600s, stderr: ...")
            .at_stage(1, "upscale");
        let msg = err.user_message();
        assert_eq!(msg, "stage 2 (upscale) failed: timed out");
        assert!(!msg.contains("stderr"));
    }

    #[test]
    fn operation_spec_parses_from_json() {
        let json = r#"{
            "input_kind": "video",
            "operations": [
                {"op": "upscale", "resolution": "4k", "denoise": true},
                {"op": "convert", "format": "mkv"}
            ]
        }"#;
        let spec: OperationSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.operations.len(), 2);
        assert_eq!(
            spec.operations[1],
            Operation::Convert {
                format: "mkv".into(),
                quality: Quality::High
            }
        );
        assert!(spec.timeout_override().is_none());
    }
}
