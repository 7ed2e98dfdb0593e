use std::path::Path;
use std::time::Duration;

use ae_core::types::{ArtifactKind, StageSpec, ToolKind};
use async_trait::async_trait;

use super::ffmpeg::{probe_duration, progress_parser};
use super::process::{self, Phase, Runner};
use super::{ExecutionContext, ToolAdapter, ToolError, ToolRun};

const FRAME_PATTERN: &str = "frame_%06d.png";

/// Real-ESRGAN (ncnn/Vulkan build) super-resolution.
///
/// Images go through the binary directly. Videos are split into frames with
/// FFmpeg, upscaled as a directory, and reassembled with the original audio
/// track.
#[derive(Debug, Clone)]
pub struct RealEsrganAdapter {
    binary: String,
    ffmpeg: String,
    ffprobe: String,
    gpu: Option<u32>,
}

impl RealEsrganAdapter {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            ffmpeg: "ffmpeg".into(),
            ffprobe: "ffprobe".into(),
            gpu: None,
        }
    }

    /// Binaries used to split and reassemble video.
    pub fn with_ffmpeg(mut self, ffmpeg: impl Into<String>, ffprobe: impl Into<String>) -> Self {
        self.ffmpeg = ffmpeg.into();
        self.ffprobe = ffprobe.into();
        self
    }

    pub fn with_gpu(mut self, gpu: u32) -> Self {
        self.gpu = Some(gpu);
        self
    }
}

/// Upscale parameters read from the stage.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct UpscaleParams {
    pub scale: u64,
    pub model: String,
    /// Exact output frame size, applied when reassembling video.
    pub target: Option<(u64, u64)>,
}

impl UpscaleParams {
    pub fn from_stage(stage: &StageSpec) -> Self {
        let scale = stage.param_u64("scale").filter(|s| (2..=4).contains(s)).unwrap_or(4);
        let model = stage
            .param_str("model")
            .map(str::to_string)
            .unwrap_or_else(|| default_model(scale).to_string());
        let target = stage.param_u64("width").zip(stage.param_u64("height"));
        Self {
            scale,
            model,
            target,
        }
    }
}

fn default_model(scale: u64) -> &'static str {
    if scale == 2 {
        "RealESRGAN_x2plus"
    } else {
        "RealESRGAN_x4plus"
    }
}

pub(crate) fn upscale_args(
    params: &UpscaleParams,
    input: &Path,
    output: &Path,
    gpu: Option<u32>,
) -> Vec<String> {
    let mut args = vec![
        "-i".to_string(),
        input.to_string_lossy().into_owned(),
        "-o".to_string(),
        output.to_string_lossy().into_owned(),
        "-n".to_string(),
        params.model.clone(),
        "-s".to_string(),
        params.scale.to_string(),
        "-f".to_string(),
        "png".to_string(),
    ];
    if let Some(gpu) = gpu {
        args.push("-g".into());
        args.push(gpu.to_string());
    }
    args
}

pub(crate) fn reassemble_args(
    params: &UpscaleParams,
    frames: &Path,
    original: &Path,
    framerate: &str,
    with_audio: bool,
    output: &Path,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-nostats".into(),
        "-progress".into(),
        "pipe:1".into(),
        "-y".into(),
        "-framerate".into(),
        framerate.into(),
        "-i".into(),
        frames.join(FRAME_PATTERN).to_string_lossy().into_owned(),
    ];
    if with_audio {
        args.push("-i".to_string());
        args.push(original.to_string_lossy().into_owned());
        args.extend(["-map", "0:v:0", "-map", "1:a:0?"].map(String::from));
    }
    if let Some((w, h)) = params.target {
        args.push("-vf".to_string());
        args.push(format!("scale={w}:{h}:flags=lanczos"));
    }
    args.extend(
        [
            "-c:v", "libx264", "-crf", "18", "-preset", "slow", "-pix_fmt", "yuv420p",
        ]
        .map(String::from),
    );
    if with_audio {
        args.extend(["-c:a", "copy", "-shortest"].map(String::from));
    }
    args.push(output.to_string_lossy().into_owned());
    args
}

/// Directory-mode progress: the binary prints a percentage per image, so
/// count the ones that reach 100%.
fn frame_counter(total: usize) -> process::LineParser {
    let mut done = 0usize;
    Box::new(move |line: &str| {
        let pct = process::parse_percent(line)?;
        if pct < 1.0 || total == 0 {
            return None;
        }
        done += 1;
        Some((done as f64 / total as f64).min(1.0))
    })
}

async fn count_frames(dir: &Path) -> usize {
    let mut count = 0;
    if let Ok(mut entries) = tokio::fs::read_dir(dir).await {
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.path().extension().is_some_and(|e| e == "png") {
                count += 1;
            }
        }
    }
    count
}

async fn probe_framerate(ffprobe: &str, input: &Path) -> String {
    let input = input.to_string_lossy();
    process::capture_stdout(
        ffprobe,
        &[
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=r_frame_rate",
            "-of",
            "csv=p=0",
            input.as_ref(),
        ],
        Duration::from_secs(30),
    )
    .await
    .map(|s| s.trim().to_string())
    .filter(|s| !s.is_empty() && s != "0/0")
    .unwrap_or_else(|| "24".into())
}

#[async_trait]
impl ToolAdapter for RealEsrganAdapter {
    fn kind(&self) -> ToolKind {
        ToolKind::RealEsrgan
    }

    async fn is_available(&self) -> bool {
        process::probe_binary(&self.binary, "-h").await
    }

    fn execute(&self, stage: &StageSpec, input: &Path, ctx: ExecutionContext) -> ToolRun {
        let (tx, run) = ToolRun::channel(ToolKind::RealEsrgan);
        let params = UpscaleParams::from_stage(stage);
        let adapter = self.clone();
        let input = input.to_path_buf();
        let kind = stage.input;

        tokio::spawn(async move {
            let mut runner = Runner::new(ToolKind::RealEsrgan, ctx, tx);
            let result = match kind {
                ArtifactKind::Image => {
                    let args = upscale_args(&params, &input, runner.partial(), adapter.gpu);
                    let phase = Phase::new("upscale", adapter.binary.clone(), args)
                        .with_parser(Box::new(process::parse_percent));
                    runner.run(phase).await
                }
                ArtifactKind::Video | ArtifactKind::SilentVideo => {
                    adapter.upscale_video(&mut runner, &params, &input, kind).await
                }
                ArtifactKind::Audio => Err(ToolError::External {
                    tool: ToolKind::RealEsrgan,
                    detail: "cannot upscale an audio-only input".into(),
                }),
            };
            runner.finish(result).await;
        });
        run
    }
}

impl RealEsrganAdapter {
    async fn upscale_video(
        &self,
        runner: &mut Runner,
        params: &UpscaleParams,
        input: &Path,
        kind: ArtifactKind,
    ) -> Result<(), ToolError> {
        let frames = runner.scratch_dir("frames").await?;
        let upscaled = runner.scratch_dir("upscaled").await?;
        let duration = probe_duration(&self.ffprobe, input).await;
        let framerate = probe_framerate(&self.ffprobe, input).await;

        let extract = Phase::new(
            "extract_frames",
            self.ffmpeg.clone(),
            vec![
                "-hide_banner".into(),
                "-nostats".into(),
                "-progress".into(),
                "pipe:1".into(),
                "-y".into(),
                "-i".into(),
                input.to_string_lossy().into_owned(),
                frames.join(FRAME_PATTERN).to_string_lossy().into_owned(),
            ],
        )
        .with_parser(progress_parser(duration))
        .with_span(0.0, 0.1);
        runner.run(extract).await?;

        let total = count_frames(&frames).await;
        if total == 0 {
            return Err(runner.external("no frames extracted from input"));
        }
        let upscale = Phase::new(
            "upscale",
            self.binary.clone(),
            upscale_args(params, &frames, &upscaled, self.gpu),
        )
        .with_parser(frame_counter(total))
        .with_span(0.1, 0.9);
        runner.run(upscale).await?;

        let with_audio = kind == ArtifactKind::Video;
        let partial = runner.partial().to_path_buf();
        let reassemble = Phase::new(
            "reassemble",
            self.ffmpeg.clone(),
            reassemble_args(params, &upscaled, input, &framerate, with_audio, &partial),
        )
        .with_parser(progress_parser(duration))
        .with_span(0.9, 1.0);
        runner.run(reassemble).await
    }
}
