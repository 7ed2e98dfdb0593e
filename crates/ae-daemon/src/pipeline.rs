//! Planning: turns an [`OperationSpec`] into the ordered stages a task runs.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use ae_core::config::Config;
use ae_core::types::{ArtifactKind, Operation, OperationSpec, StageSpec, ToolKind};
use tracing::debug;

/// Upscaling tools in preference order.
const UPSCALE_TOOLS: &[ToolKind] = &[ToolKind::RealEsrgan, ToolKind::Video2x, ToolKind::Ffmpeg];
const FFMPEG_ONLY: &[ToolKind] = &[ToolKind::Ffmpeg];

/// Share of overall progress given to an upscale stage relative to the
/// lighter filter stages around it.
const UPSCALE_WEIGHT: f64 = 3.0;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("no operations requested")]
    EmptyPipeline,
    #[error("no available tool can run the {stage} stage")]
    NoToolAvailable { stage: String },
    #[error("stage {index} needs {required} input but receives {produced}")]
    IncompatiblePipeline {
        index: usize,
        produced: ArtifactKind,
        required: ArtifactKind,
    },
    #[error("unsupported output format {0:?}")]
    UnsupportedFormat(String),
}

impl PlanError {
    /// Stable label used in metrics.
    pub fn label(&self) -> &'static str {
        match self {
            PlanError::EmptyPipeline => "empty_pipeline",
            PlanError::NoToolAvailable { .. } => "no_tool_available",
            PlanError::IncompatiblePipeline { .. } => "incompatible_pipeline",
            PlanError::UnsupportedFormat(_) => "unsupported_format",
        }
    }
}

// ---------------------------------------------------------------------------
// Rule table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Denoise,
    Upscale,
    Refine,
    Enhance,
    Convert,
    ExtractAudio,
}

/// One entry of an operation's stage chain.
#[derive(Debug, Clone, Copy)]
struct StageRule {
    name: &'static str,
    step: Step,
    tools: &'static [ToolKind],
    /// Optional stages are dropped when none of their tools is usable.
    optional: bool,
}

impl StageRule {
    const fn required(name: &'static str, step: Step, tools: &'static [ToolKind]) -> Self {
        Self {
            name,
            step,
            tools,
            optional: false,
        }
    }

    const fn optional(name: &'static str, step: Step, tools: &'static [ToolKind]) -> Self {
        Self {
            name,
            step,
            tools,
            optional: true,
        }
    }
}

fn rules(operation: &Operation) -> Vec<StageRule> {
    match operation {
        Operation::Upscale {
            denoise, refine, ..
        } => {
            let mut chain = Vec::with_capacity(3);
            if *denoise {
                chain.push(StageRule::optional("denoise", Step::Denoise, FFMPEG_ONLY));
            }
            chain.push(StageRule::required("upscale", Step::Upscale, UPSCALE_TOOLS));
            if *refine {
                chain.push(StageRule::optional("refine", Step::Refine, FFMPEG_ONLY));
            }
            chain
        }
        Operation::Denoise { .. } => {
            vec![StageRule::required("denoise", Step::Denoise, FFMPEG_ONLY)]
        }
        Operation::Enhance { .. } => {
            vec![StageRule::required("enhance", Step::Enhance, FFMPEG_ONLY)]
        }
        Operation::Convert { .. } => {
            vec![StageRule::required("convert", Step::Convert, FFMPEG_ONLY)]
        }
        Operation::ExtractAudio { .. } => vec![StageRule::required(
            "extract_audio",
            Step::ExtractAudio,
            FFMPEG_ONLY,
        )],
    }
}

/// Whether `tool` can take an artifact of kind `kind` at all.
fn tool_accepts(tool: ToolKind, kind: ArtifactKind) -> bool {
    match tool {
        ToolKind::Ffmpeg => true,
        ToolKind::RealEsrgan => kind != ArtifactKind::Audio,
        ToolKind::Video2x => matches!(kind, ArtifactKind::Video | ArtifactKind::SilentVideo),
    }
}

/// Input requirement of a picture-processing step given what flows in:
/// images stay images, anything else must carry a video stream.
fn visual(current: ArtifactKind) -> (ArtifactKind, ArtifactKind) {
    match current {
        ArtifactKind::Image => (ArtifactKind::Image, ArtifactKind::Image),
        ArtifactKind::Video => (ArtifactKind::SilentVideo, ArtifactKind::Video),
        _ => (ArtifactKind::SilentVideo, ArtifactKind::SilentVideo),
    }
}

fn normalized_format(format: &str) -> String {
    format.trim_start_matches('.').to_ascii_lowercase()
}

/// `(required input, produced output)` of one step.
fn step_kinds(
    step: Step,
    operation: &Operation,
    current: ArtifactKind,
) -> Result<(ArtifactKind, ArtifactKind), PlanError> {
    Ok(match step {
        Step::Denoise => (current, current),
        Step::Upscale | Step::Refine | Step::Enhance => visual(current),
        Step::ExtractAudio => (ArtifactKind::Audio, ArtifactKind::Audio),
        Step::Convert => {
            let format = match operation {
                Operation::Convert { format, .. } => normalized_format(format),
                _ => String::new(),
            };
            match ArtifactKind::from_extension(&format) {
                Some(ArtifactKind::Audio) => (ArtifactKind::Audio, ArtifactKind::Audio),
                Some(ArtifactKind::Image) => (ArtifactKind::Image, ArtifactKind::Image),
                // A video container needs a video stream to fill it.
                Some(_) if current == ArtifactKind::Image => {
                    (ArtifactKind::SilentVideo, ArtifactKind::SilentVideo)
                }
                Some(_) => visual(current),
                None => return Err(PlanError::UnsupportedFormat(format)),
            }
        }
    })
}

// ---------------------------------------------------------------------------
// PipelineBuilder
// ---------------------------------------------------------------------------

/// Maps requested operations onto tool stages.
///
/// Planning is a pure function of the request and the set of usable tools
/// captured at construction.
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    usable: BTreeSet<ToolKind>,
    timeouts: HashMap<ToolKind, Duration>,
    max_retries: u32,
}

impl PipelineBuilder {
    pub fn new(usable: BTreeSet<ToolKind>) -> Self {
        Self {
            usable,
            timeouts: ToolKind::ALL
                .into_iter()
                .map(|kind| (kind, kind.default_timeout()))
                .collect(),
            max_retries: 1,
        }
    }

    /// Builder using the configured tool budgets and retry count.
    pub fn from_config(config: &Config, usable: &BTreeSet<ToolKind>) -> Self {
        let mut builder = Self::new(usable.clone())
            .with_max_retries(config.scheduler.default_max_retries);
        for kind in ToolKind::ALL {
            builder = builder.with_timeout(kind, config.tools.timeout(kind));
        }
        builder
    }

    pub fn with_timeout(mut self, tool: ToolKind, timeout: Duration) -> Self {
        self.timeouts.insert(tool, timeout);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn usable(&self) -> &BTreeSet<ToolKind> {
        &self.usable
    }

    pub fn build(&self, spec: &OperationSpec) -> Result<Vec<StageSpec>, PlanError> {
        if spec.operations.is_empty() {
            return Err(PlanError::EmptyPipeline);
        }

        let mut stages: Vec<StageSpec> = Vec::new();
        let mut current = spec.input_kind;
        for operation in &spec.operations {
            for rule in rules(operation) {
                let (required, produced) = step_kinds(rule.step, operation, current)?;
                if !current.satisfies(required) {
                    return Err(PlanError::IncompatiblePipeline {
                        index: stages.len(),
                        produced: current,
                        required,
                    });
                }
                let tool = rule
                    .tools
                    .iter()
                    .copied()
                    .find(|tool| self.usable.contains(tool) && tool_accepts(*tool, required));
                let Some(tool) = tool else {
                    if rule.optional {
                        debug!(stage = rule.name, "skipping optional stage, no tool available");
                        continue;
                    }
                    return Err(PlanError::NoToolAvailable {
                        stage: rule.name.to_string(),
                    });
                };

                let timeout = spec
                    .timeout_override()
                    .or_else(|| self.timeouts.get(&tool).copied())
                    .unwrap_or_else(|| tool.default_timeout());
                let stage = StageSpec::new(rule.name, tool, required, produced)
                    .with_retries(self.max_retries)
                    .with_timeout(timeout);
                stages.push(with_params(stage, rule.step, operation));
                current = produced;
            }
        }
        debug!(stages = stages.len(), output = %current, "pipeline planned");
        Ok(stages)
    }
}

fn with_params(stage: StageSpec, step: Step, operation: &Operation) -> StageSpec {
    match (step, operation) {
        (Step::Upscale, Operation::Upscale {
            resolution, model, ..
        }) => {
            let (width, height) = resolution.dimensions();
            let stage = stage
                .with_weight(UPSCALE_WEIGHT)
                .with_param("width", width)
                .with_param("height", height)
                .with_param("resolution", resolution.to_string());
            match stage.tool {
                ToolKind::Ffmpeg => stage.with_param("action", "scale"),
                ToolKind::RealEsrgan => {
                    let stage = stage.with_param("scale", resolution.scale_factor());
                    match model {
                        Some(model) => stage.with_param("model", model.as_str()),
                        None => stage,
                    }
                }
                ToolKind::Video2x => stage,
            }
        }
        (Step::Denoise, Operation::Denoise { level }) => stage
            .with_param("action", "denoise")
            .with_param("level", level.as_str()),
        // Pre-upscale cleanup uses the default strength.
        (Step::Denoise, _) => stage
            .with_param("action", "denoise")
            .with_param("level", "medium"),
        (Step::Refine, _) => stage.with_param("action", "refine"),
        (
            Step::Enhance,
            Operation::Enhance {
                denoise,
                sharpen,
                enhance_colors,
                stabilize,
            },
        ) => stage
            .with_param("action", "enhance")
            .with_param("denoise", *denoise)
            .with_param("sharpen", *sharpen)
            .with_param("enhance_colors", *enhance_colors)
            .with_param("stabilize", *stabilize),
        (Step::Convert, Operation::Convert { format, quality }) => stage
            .with_param("action", "convert")
            .with_param("format", normalized_format(format))
            .with_param("quality", quality.as_str()),
        (Step::ExtractAudio, Operation::ExtractAudio { format }) => stage
            .with_param("action", "extract_audio")
            .with_param("format", normalized_format(format)),
        (step, _) => {
            debug!(?step, "stage has no parameters for this operation");
            stage
        }
    }
}
