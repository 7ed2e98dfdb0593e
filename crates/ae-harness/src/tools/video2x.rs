use std::path::Path;

use ae_core::types::{StageSpec, ToolKind};
use async_trait::async_trait;

use super::process::{self, Phase, Runner};
use super::{ExecutionContext, ToolAdapter, ToolError, ToolRun};

const DEFAULT_DRIVER: &str = "waifu2x_caffe";

/// Video2X whole-video upscaling, used when Real-ESRGAN is not installed.
#[derive(Debug, Clone)]
pub struct Video2xAdapter {
    binary: String,
    gpu: Option<u32>,
}

impl Video2xAdapter {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            gpu: None,
        }
    }

    pub fn with_gpu(mut self, gpu: u32) -> Self {
        self.gpu = Some(gpu);
        self
    }
}

pub(crate) fn build_args(
    stage: &StageSpec,
    input: &Path,
    output: &Path,
    gpu: Option<u32>,
) -> Result<Vec<String>, String> {
    let width = stage
        .param_u64("width")
        .ok_or_else(|| format!("stage {} has no target width", stage.name))?;
    let height = stage
        .param_u64("height")
        .ok_or_else(|| format!("stage {} has no target height", stage.name))?;
    let driver = stage.param_str("driver").unwrap_or(DEFAULT_DRIVER);

    let mut args = vec![
        "-i".to_string(),
        input.to_string_lossy().into_owned(),
        "-o".to_string(),
        output.to_string_lossy().into_owned(),
        "--width".to_string(),
        width.to_string(),
        "--height".to_string(),
        height.to_string(),
        "--driver".to_string(),
        driver.to_string(),
        "--processes".to_string(),
        "1".to_string(),
    ];
    if let Some(gpu) = gpu {
        args.push("--gpu".into());
        args.push(gpu.to_string());
    }
    Ok(args)
}

#[async_trait]
impl ToolAdapter for Video2xAdapter {
    fn kind(&self) -> ToolKind {
        ToolKind::Video2x
    }

    async fn is_available(&self) -> bool {
        process::probe_binary(&self.binary, "--help").await
    }

    fn execute(&self, stage: &StageSpec, input: &Path, ctx: ExecutionContext) -> ToolRun {
        let partial = process::partial_path(&ctx.output);
        let args = match build_args(stage, input, &partial, self.gpu) {
            Ok(args) => args,
            Err(detail) => {
                return ToolRun::failed(ToolError::External {
                    tool: ToolKind::Video2x,
                    detail,
                })
            }
        };
        let (tx, run) = ToolRun::channel(ToolKind::Video2x);
        let binary = self.binary.clone();

        tokio::spawn(async move {
            let mut runner = Runner::new(ToolKind::Video2x, ctx, tx);
            let phase = Phase::new("upscale", binary, args)
                .with_parser(Box::new(process::parse_percent));
            let result = runner.run(phase).await;
            runner.finish(result).await;
        });
        run
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ae_core::types::ArtifactKind;

    #[test]
    fn args_carry_target_size() {
        let stage = StageSpec::new(
            "upscale",
            ToolKind::Video2x,
            ArtifactKind::Video,
            ArtifactKind::Video,
        )
        .with_param("width", 2560)
        .with_param("height", 1440);
        let args = build_args(&stage, Path::new("in.mp4"), Path::new("out.mp4"), None).unwrap();
        assert_eq!(
            args,
            vec![
                "-i", "in.mp4", "-o", "out.mp4", "--width", "2560", "--height", "1440", "--driver",
                "waifu2x_caffe", "--processes", "1"
            ]
        );
    }

    #[test]
    fn configured_gpu_is_passed_through() {
        let stage = StageSpec::new(
            "upscale",
            ToolKind::Video2x,
            ArtifactKind::Video,
            ArtifactKind::Video,
        )
        .with_param("width", 1920)
        .with_param("height", 1080);
        let args = build_args(&stage, Path::new("in.mp4"), Path::new("out.mp4"), Some(1)).unwrap();
        assert_eq!(&args[args.len() - 2..], ["--gpu", "1"]);

        let args = build_args(&stage, Path::new("in.mp4"), Path::new("out.mp4"), None).unwrap();
        assert!(!args.iter().any(|a| a == "--gpu"));
    }

    #[test]
    fn missing_size_is_an_error() {
        let stage = StageSpec::new(
            "upscale",
            ToolKind::Video2x,
            ArtifactKind::Video,
            ArtifactKind::Video,
        );
        assert!(build_args(&stage, Path::new("a"), Path::new("b"), Some(0)).is_err());
    }
}
