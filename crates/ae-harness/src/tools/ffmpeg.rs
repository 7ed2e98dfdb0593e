use std::path::Path;
use std::time::Duration;

use ae_core::types::{ArtifactKind, DenoiseLevel, Quality, StageSpec, ToolKind};
use async_trait::async_trait;

use super::process::{self, Phase, Runner};
use super::{ExecutionContext, ToolAdapter, ToolError, ToolRun};

const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// FFmpeg-backed filters, conversions and the plain-scale upscale fallback.
///
/// What runs is chosen by the stage's `action` parameter:
/// `denoise`, `enhance`, `refine`, `scale`, `convert` or `extract_audio`.
#[derive(Debug, Clone)]
pub struct FfmpegAdapter {
    binary: String,
    ffprobe: String,
}

impl FfmpegAdapter {
    pub fn new(binary: impl Into<String>, ffprobe: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            ffprobe: ffprobe.into(),
        }
    }
}

#[async_trait]
impl ToolAdapter for FfmpegAdapter {
    fn kind(&self) -> ToolKind {
        ToolKind::Ffmpeg
    }

    async fn is_available(&self) -> bool {
        process::probe_binary(&self.binary, "-version").await
    }

    fn execute(&self, stage: &StageSpec, input: &Path, ctx: ExecutionContext) -> ToolRun {
        let partial = process::partial_path(&ctx.output);
        let args = match build_args(stage, input, &partial) {
            Ok(args) => args,
            Err(detail) => {
                return ToolRun::failed(ToolError::External {
                    tool: ToolKind::Ffmpeg,
                    detail,
                })
            }
        };
        let (tx, run) = ToolRun::channel(ToolKind::Ffmpeg);
        let binary = self.binary.clone();
        let ffprobe = self.ffprobe.clone();
        let input = input.to_path_buf();
        let label = stage_label(stage);

        tokio::spawn(async move {
            let mut runner = Runner::new(ToolKind::Ffmpeg, ctx, tx);
            let duration = probe_duration(&ffprobe, &input).await;
            let phase = Phase::new(label, binary, args).with_parser(progress_parser(duration));
            let result = runner.run(phase).await;
            runner.finish(result).await;
        });
        run
    }
}

fn stage_label(stage: &StageSpec) -> &'static str {
    match stage.param_str("action") {
        Some("denoise") => "denoise",
        Some("enhance") => "enhance",
        Some("refine") => "refine",
        Some("scale") => "scale",
        Some("convert") => "convert",
        Some("extract_audio") => "extract_audio",
        _ => "ffmpeg",
    }
}

/// Media duration in seconds, as reported by ffprobe.
pub(crate) async fn probe_duration(ffprobe: &str, input: &Path) -> Option<f64> {
    let input = input.to_string_lossy();
    let out = process::capture_stdout(
        ffprobe,
        &[
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
            input.as_ref(),
        ],
        PROBE_TIMEOUT,
    )
    .await?;
    out.trim().parse::<f64>().ok().filter(|d| *d > 0.0)
}

/// Parser for `-progress pipe:1` output. Without a known duration only the
/// final `progress=end` line is reported.
pub(crate) fn progress_parser(duration_secs: Option<f64>) -> process::LineParser {
    Box::new(move |line: &str| {
        let (key, value) = line.trim().split_once('=')?;
        match key {
            // Both keys are in microseconds.
            "out_time_us" | "out_time_ms" => {
                let total = duration_secs?;
                let micros: f64 = value.trim().parse().ok()?;
                Some((micros / 1_000_000.0 / total).clamp(0.0, 1.0))
            }
            "progress" if value.trim() == "end" => Some(1.0),
            _ => None,
        }
    })
}

fn denoise_filters(level: DenoiseLevel) -> (&'static str, &'static str) {
    match level {
        DenoiseLevel::Light => ("hqdn3d=2:1:2:3", "afftdn=nr=10:nf=-20"),
        DenoiseLevel::Medium => ("hqdn3d=3:2:4:3", "afftdn=nr=20:nf=-25"),
        DenoiseLevel::Strong => ("hqdn3d=4:3:6:4.5", "afftdn=nr=25:nf=-25"),
    }
}

fn parse_level(stage: &StageSpec) -> DenoiseLevel {
    match stage.param_str("level") {
        Some("light") => DenoiseLevel::Light,
        Some("strong") => DenoiseLevel::Strong,
        _ => DenoiseLevel::Medium,
    }
}

fn parse_quality(stage: &StageSpec) -> Quality {
    match stage.param_str("quality") {
        Some("low") => Quality::Low,
        Some("medium") => Quality::Medium,
        _ => Quality::High,
    }
}

fn quality_args(quality: Quality) -> [&'static str; 4] {
    match quality {
        Quality::Low => ["-crf", "28", "-preset", "fast"],
        Quality::Medium => ["-crf", "23", "-preset", "medium"],
        Quality::High => ["-crf", "18", "-preset", "slow"],
    }
}

fn audio_codec(format: &str) -> &'static str {
    match format {
        "mp3" => "libmp3lame",
        "wav" => "pcm_s16le",
        "flac" => "flac",
        "ogg" | "oga" => "libvorbis",
        "opus" => "libopus",
        "avi" => "libmp3lame",
        "webm" => "libopus",
        _ => "aac",
    }
}

fn push(args: &mut Vec<String>, items: &[&str]) {
    args.extend(items.iter().map(|s| s.to_string()));
}

/// Full FFmpeg argument list for `stage`, writing to `output`.
pub(crate) fn build_args(
    stage: &StageSpec,
    input: &Path,
    output: &Path,
) -> Result<Vec<String>, String> {
    let mut args: Vec<String> = ["-hide_banner", "-nostats", "-progress", "pipe:1", "-y", "-i"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    args.push(input.to_string_lossy().into_owned());

    let action = stage
        .param_str("action")
        .ok_or_else(|| format!("stage {} has no ffmpeg action", stage.name))?;
    match action {
        "denoise" => {
            let (video, audio) = denoise_filters(parse_level(stage));
            match stage.input {
                ArtifactKind::Audio => push(&mut args, &["-af", audio, "-c:a", "aac"]),
                ArtifactKind::SilentVideo => {
                    push(&mut args, &["-vf", video, "-an", "-c:v", "libx264"])
                }
                ArtifactKind::Image => push(&mut args, &["-vf", video]),
                ArtifactKind::Video => push(
                    &mut args,
                    &["-vf", video, "-af", audio, "-c:v", "libx264", "-c:a", "aac"],
                ),
            }
        }
        "enhance" => {
            let mut filters = Vec::new();
            if stage.param_bool("denoise").unwrap_or(true) {
                filters.push("hqdn3d=2:1:2:3");
            }
            if stage.param_bool("sharpen").unwrap_or(true) {
                filters.push("unsharp=5:5:1.0:5:5:0.0");
            }
            if stage.param_bool("enhance_colors").unwrap_or(true) {
                filters.push("eq=contrast=1.1:brightness=0.1:saturation=1.2");
            }
            if stage.param_bool("stabilize").unwrap_or(false) {
                filters.push("deshake");
            }
            if filters.is_empty() {
                push(&mut args, &["-c", "copy"]);
            } else {
                let chain = filters.join(",");
                push(&mut args, &["-vf", chain.as_str(), "-c:v", "libx264", "-c:a", "copy"]);
            }
        }
        "refine" => push(
            &mut args,
            &[
                "-vf",
                "unsharp=3:3:0.6:3:3:0.0",
                "-c:v",
                "libx264",
                "-crf",
                "18",
                "-preset",
                "slow",
                "-c:a",
                "copy",
            ],
        ),
        "scale" => {
            let width = stage
                .param_u64("width")
                .ok_or_else(|| format!("stage {} has no target width", stage.name))?;
            let height = stage
                .param_u64("height")
                .ok_or_else(|| format!("stage {} has no target height", stage.name))?;
            let filter = format!("scale={width}:{height}:flags=lanczos");
            push(&mut args, &["-vf", filter.as_str()]);
            if stage.input != ArtifactKind::Image {
                push(
                    &mut args,
                    &["-c:v", "libx264", "-crf", "18", "-preset", "slow", "-c:a", "copy"],
                );
            }
        }
        "convert" => {
            let format = stage.output_extension();
            match ArtifactKind::from_extension(&format) {
                Some(ArtifactKind::Audio) => {
                    push(&mut args, &["-vn", "-c:a", audio_codec(&format)])
                }
                // The image muxer picks its encoder from the extension.
                Some(ArtifactKind::Image) => {}
                _ => {
                    push(&mut args, &["-c:v", "libx264"]);
                    push(&mut args, &quality_args(parse_quality(stage)));
                    push(&mut args, &["-c:a", audio_codec(&format)]);
                }
            }
        }
        "extract_audio" => {
            let format = stage.output_extension();
            push(&mut args, &["-vn", "-c:a", audio_codec(&format)]);
        }
        other => return Err(format!("unknown ffmpeg action {other:?}")),
    }

    args.push(output.to_string_lossy().into_owned());
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn stage(action: &str, input: ArtifactKind, output: ArtifactKind) -> StageSpec {
        StageSpec::new(action, ToolKind::Ffmpeg, input, output).with_param("action", action)
    }

    fn args_for(stage: &StageSpec) -> Vec<String> {
        build_args(stage, &PathBuf::from("in.mp4"), &PathBuf::from("out.partial.mp4")).unwrap()
    }

    fn has_pair(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    #[test]
    fn common_prefix_and_output_last() {
        let args = args_for(&stage("refine", ArtifactKind::Video, ArtifactKind::Video));
        assert!(has_pair(&args, "-progress", "pipe:1"));
        assert!(has_pair(&args, "-i", "in.mp4"));
        assert_eq!(args.last().map(String::as_str), Some("out.partial.mp4"));
    }

    #[test]
    fn denoise_levels() {
        let strong = stage("denoise", ArtifactKind::Video, ArtifactKind::Video)
            .with_param("level", "strong");
        let args = args_for(&strong);
        assert!(has_pair(&args, "-vf", "hqdn3d=4:3:6:4.5"));
        assert!(has_pair(&args, "-af", "afftdn=nr=25:nf=-25"));

        let audio = stage("denoise", ArtifactKind::Audio, ArtifactKind::Audio)
            .with_param("level", "light");
        let args = args_for(&audio);
        assert!(!args.iter().any(|a| a == "-vf"));
        assert!(has_pair(&args, "-af", "afftdn=nr=10:nf=-20"));
    }

    #[test]
    fn enhance_chain_follows_flags() {
        let s = stage("enhance", ArtifactKind::Video, ArtifactKind::Video)
            .with_param("sharpen", false)
            .with_param("stabilize", true);
        let args = args_for(&s);
        assert!(has_pair(
            &args,
            "-vf",
            "hqdn3d=2:1:2:3,eq=contrast=1.1:brightness=0.1:saturation=1.2,deshake"
        ));
    }

    #[test]
    fn scale_requires_dimensions() {
        let missing = stage("scale", ArtifactKind::Video, ArtifactKind::Video);
        assert!(build_args(&missing, Path::new("a"), Path::new("b")).is_err());

        let s = stage("scale", ArtifactKind::Video, ArtifactKind::Video)
            .with_param("width", 3840)
            .with_param("height", 2160);
        assert!(has_pair(&args_for(&s), "-vf", "scale=3840:2160:flags=lanczos"));
    }

    #[test]
    fn convert_to_audio_drops_video() {
        let s = stage("convert", ArtifactKind::Video, ArtifactKind::Audio)
            .with_param("format", "mp3");
        let args = args_for(&s);
        assert!(args.iter().any(|a| a == "-vn"));
        assert!(has_pair(&args, "-c:a", "libmp3lame"));

        let s = stage("convert", ArtifactKind::Video, ArtifactKind::Video)
            .with_param("format", "mkv")
            .with_param("quality", "low");
        let args = args_for(&s);
        assert!(has_pair(&args, "-crf", "28"));
    }

    #[test]
    fn unknown_action_is_rejected() {
        let s = stage("sparkle", ArtifactKind::Video, ArtifactKind::Video);
        let err = build_args(&s, Path::new("a"), Path::new("b")).unwrap_err();
        assert!(err.contains("sparkle"));
    }

    #[test]
    fn progress_from_out_time() {
        let mut parse = progress_parser(Some(10.0));
        assert_eq!(parse("frame=10"), None);
        assert_eq!(parse("out_time_us=5000000"), Some(0.5));
        assert_eq!(parse("out_time_ms=20000000"), Some(1.0));
        assert_eq!(parse("progress=continue"), None);
        assert_eq!(parse("progress=end"), Some(1.0));

        let mut unknown = progress_parser(None);
        assert_eq!(unknown("out_time_us=5000000"), None);
        assert_eq!(unknown("progress=end"), Some(1.0));
    }
}
