#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ae_core::config::ToolsConfig;
use ae_core::types::{ArtifactKind, StageSpec, ToolKind};
use ae_harness::tools::{
    partial_path, ExecutionContext, FfmpegAdapter, RealEsrganAdapter, StageOutcome, ToolAdapter,
    ToolError, ToolEvent, ToolRegistry, Video2xAdapter,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn script(dir: &Path, name: &str, body: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
    let mut perms = std::fs::metadata(&path).expect("metadata").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod");
    path.to_string_lossy().into_owned()
}

/// Prints ffmpeg-style progress and writes its last argument.
const FAKE_FFMPEG: &str = r#"for out in "$@"; do :; done
echo "frame=1"
echo "out_time_us=5000000"
echo "progress=continue"
echo "payload" > "$out"
echo "progress=end""#;

fn ctx(dir: &Path, name: &str, deadline: Duration) -> ExecutionContext {
    ExecutionContext::new(Uuid::new_v4(), dir.join(name), deadline)
        .with_grace(Duration::from_millis(500))
        .with_progress_interval(Duration::ZERO)
}

fn input_file(dir: &Path) -> PathBuf {
    let input = dir.join("input.mp4");
    std::fs::write(&input, b"not really a video").expect("write input");
    input
}

fn denoise_stage() -> StageSpec {
    StageSpec::new("denoise", ToolKind::Ffmpeg, ArtifactKind::Video, ArtifactKind::Video)
        .with_param("action", "denoise")
}

#[tokio::test]
async fn ffmpeg_success_commits_output_and_reports_progress() {
    let dir = tempfile::tempdir().unwrap();
    let ffmpeg = script(dir.path(), "ffmpeg", FAKE_FFMPEG);
    let ffprobe = script(dir.path(), "ffprobe", "echo 10.0");
    let adapter = FfmpegAdapter::new(ffmpeg, ffprobe);
    let input = input_file(dir.path());
    let ctx = ctx(dir.path(), "stage-0.mp4", Duration::from_secs(10));
    let output = ctx.output.clone();

    let mut run = adapter.execute(&denoise_stage(), &input, ctx);
    let mut fractions = Vec::new();
    let mut outcome = None;
    while let Some(event) = run.next().await {
        match event {
            ToolEvent::Progress { fraction, .. } => fractions.push(fraction),
            ToolEvent::Finished(o) => outcome = Some(o),
        }
    }

    assert_eq!(outcome, Some(StageOutcome::Success { output: output.clone() }));
    assert_eq!(fractions, vec![0.5, 1.0]);
    assert_eq!(std::fs::read_to_string(&output).unwrap().trim(), "payload");
    assert!(!partial_path(&output).exists());
    // Nothing after the terminal event.
    assert!(run.next().await.is_none());
}

#[tokio::test]
async fn non_zero_exit_keeps_stderr_tail() {
    let dir = tempfile::tempdir().unwrap();
    let ffmpeg = script(
        dir.path(),
        "ffmpeg",
        r#"echo "input.mp4: Invalid data found when processing input" >&2
exit 1"#,
    );
    let adapter = FfmpegAdapter::new(ffmpeg, "/nonexistent/ffprobe");
    let input = input_file(dir.path());
    let ctx = ctx(dir.path(), "stage-0.mp4", Duration::from_secs(10));
    let output = ctx.output.clone();

    match adapter.execute(&denoise_stage(), &input, ctx).outcome().await {
        StageOutcome::Failed(ToolError::External { tool, detail }) => {
            assert_eq!(tool, ToolKind::Ffmpeg);
            assert!(detail.contains("Invalid data"), "{detail}");
        }
        other => panic!("expected External failure, got {other:?}"),
    }
    assert!(!output.exists());
}

#[tokio::test]
async fn clean_exit_without_output_is_a_failure() {
    let dir = tempfile::tempdir().unwrap();
    let ffmpeg = script(dir.path(), "ffmpeg", "exit 0");
    let adapter = FfmpegAdapter::new(ffmpeg, "/nonexistent/ffprobe");
    let input = input_file(dir.path());
    let ctx = ctx(dir.path(), "stage-0.mp4", Duration::from_secs(10));

    let outcome = adapter.execute(&denoise_stage(), &input, ctx).outcome().await;
    assert!(matches!(
        outcome,
        StageOutcome::Failed(ToolError::External { ref detail, .. }) if detail.contains("no output")
    ));
}

#[tokio::test]
async fn deadline_stops_the_tool() {
    let dir = tempfile::tempdir().unwrap();
    let ffmpeg = script(
        dir.path(),
        "ffmpeg",
        r#"for out in "$@"; do :; done
echo "half" > "$out"
exec sleep 30"#,
    );
    let adapter = FfmpegAdapter::new(ffmpeg, "/nonexistent/ffprobe");
    let input = input_file(dir.path());
    let ctx = ctx(dir.path(), "stage-0.mp4", Duration::from_millis(300));
    let output = ctx.output.clone();

    let started = std::time::Instant::now();
    match adapter.execute(&denoise_stage(), &input, ctx).outcome().await {
        StageOutcome::Failed(ToolError::Timeout { elapsed, budget, .. }) => {
            assert_eq!(budget, Duration::from_millis(300));
            assert!(elapsed >= Duration::from_millis(300));
        }
        other => panic!("expected Timeout, got {other:?}"),
    }
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(!output.exists());
    assert!(!partial_path(&output).exists());
}

#[tokio::test]
async fn cancellation_discards_partial_output() {
    let dir = tempfile::tempdir().unwrap();
    let ffmpeg = script(
        dir.path(),
        "ffmpeg",
        r#"for out in "$@"; do :; done
echo "half" > "$out"
exec sleep 30"#,
    );
    let adapter = FfmpegAdapter::new(ffmpeg, "/nonexistent/ffprobe");
    let input = input_file(dir.path());
    let cancel = CancellationToken::new();
    let ctx = ctx(dir.path(), "stage-0.mp4", Duration::from_secs(60)).with_cancel(cancel.clone());
    let output = ctx.output.clone();

    let run = adapter.execute(&denoise_stage(), &input, ctx);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
    });

    let outcome = tokio::time::timeout(Duration::from_secs(5), run.outcome())
        .await
        .expect("cancel is prompt");
    assert_eq!(
        outcome,
        StageOutcome::Failed(ToolError::Cancelled {
            tool: ToolKind::Ffmpeg
        })
    );
    assert!(!output.exists());
    assert!(!partial_path(&output).exists());
}

/// Whether `pid` is a live process. Zombies count as gone.
fn is_running(pid: i32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        // The state follows the parenthesised command name.
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.trim_start().chars().next())
            .is_some_and(|state| state != 'Z'),
        Err(_) if Path::new("/proc/self").exists() => false,
        // SAFETY: signal 0 only checks that the pid exists.
        Err(_) => unsafe { libc::kill(pid, 0) == 0 },
    }
}

#[tokio::test]
async fn cancellation_reaches_processes_the_tool_spawned() {
    let dir = tempfile::tempdir().unwrap();
    let pidfile = dir.path().join("helper.pid");
    let video2x = script(
        dir.path(),
        "video2x",
        &format!(
            r#"sleep 30 &
echo $! > "{}"
echo "Upscaling:  10%" >&2
wait"#,
            pidfile.display()
        ),
    );
    let adapter = Video2xAdapter::new(video2x);
    let input = input_file(dir.path());
    let stage = StageSpec::new(
        "upscale",
        ToolKind::Video2x,
        ArtifactKind::Video,
        ArtifactKind::Video,
    )
    .with_param("width", 1920)
    .with_param("height", 1080);
    let cancel = CancellationToken::new();
    let ctx = ctx(dir.path(), "stage-1.mp4", Duration::from_secs(60)).with_cancel(cancel.clone());
    let run = tokio::spawn(adapter.execute(&stage, &input, ctx).outcome());

    let helper: i32 = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(text) = std::fs::read_to_string(&pidfile) {
                if let Ok(pid) = text.trim().parse() {
                    return pid;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("helper started");
    assert!(is_running(helper));

    cancel.cancel();
    let outcome = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("cancel is prompt")
        .unwrap();
    assert_eq!(
        outcome,
        StageOutcome::Failed(ToolError::Cancelled {
            tool: ToolKind::Video2x
        })
    );

    tokio::time::timeout(Duration::from_secs(5), async {
        while is_running(helper) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("helper process was stopped with the tool");
}

#[tokio::test]
async fn deadline_reaches_processes_the_tool_spawned() {
    let dir = tempfile::tempdir().unwrap();
    let pidfile = dir.path().join("helper.pid");
    let ffmpeg = script(
        dir.path(),
        "ffmpeg",
        &format!(
            r#"sleep 30 &
echo $! > "{}"
wait"#,
            pidfile.display()
        ),
    );
    let adapter = FfmpegAdapter::new(ffmpeg, "/nonexistent/ffprobe");
    let input = input_file(dir.path());
    let ctx = ctx(dir.path(), "stage-0.mp4", Duration::from_millis(500));

    let outcome = adapter.execute(&denoise_stage(), &input, ctx).outcome().await;
    assert!(matches!(
        outcome,
        StageOutcome::Failed(ToolError::Timeout { .. })
    ));
    let helper: i32 = std::fs::read_to_string(&pidfile)
        .expect("helper pid recorded")
        .trim()
        .parse()
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while is_running(helper) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("helper process was stopped with the tool");
}

#[tokio::test]
async fn missing_binary_is_an_external_error() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = FfmpegAdapter::new("/nonexistent/ffmpeg", "/nonexistent/ffprobe");
    assert!(!adapter.is_available().await);

    let input = input_file(dir.path());
    let ctx = ctx(dir.path(), "stage-0.mp4", Duration::from_secs(5));
    let outcome = adapter.execute(&denoise_stage(), &input, ctx).outcome().await;
    assert!(matches!(
        outcome,
        StageOutcome::Failed(ToolError::External { ref detail, .. }) if detail.contains("failed to start")
    ));
}

#[tokio::test]
async fn unplannable_stage_fails_without_spawning() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = FfmpegAdapter::new("/nonexistent/ffmpeg", "/nonexistent/ffprobe");
    let stage = StageSpec::new("mystery", ToolKind::Ffmpeg, ArtifactKind::Video, ArtifactKind::Video);
    let ctx = ctx(dir.path(), "stage-0.mp4", Duration::from_secs(5));

    let mut run = adapter.execute(&stage, Path::new("in.mp4"), ctx);
    assert!(matches!(
        run.next().await,
        Some(ToolEvent::Finished(StageOutcome::Failed(ToolError::External { .. })))
    ));
    assert!(run.next().await.is_none());
}

#[tokio::test]
async fn video2x_percent_progress() {
    let dir = tempfile::tempdir().unwrap();
    let video2x = script(
        dir.path(),
        "video2x",
        r#"out=""
while [ $# -gt 0 ]; do
  if [ "$1" = "-o" ]; then out="$2"; fi
  shift
done
echo "Upscaling:  25%" >&2
echo "Upscaling:  75%" >&2
echo "upscaled" > "$out""#,
    );
    let adapter = Video2xAdapter::new(video2x);
    let input = input_file(dir.path());
    let stage = StageSpec::new("upscale", ToolKind::Video2x, ArtifactKind::Video, ArtifactKind::Video)
        .with_param("width", 1920)
        .with_param("height", 1080);
    let ctx = ctx(dir.path(), "stage-1.mp4", Duration::from_secs(10));
    let output = ctx.output.clone();

    let mut run = adapter.execute(&stage, &input, ctx);
    let mut fractions = Vec::new();
    while let Some(event) = run.next().await {
        match event {
            ToolEvent::Progress { fraction, .. } => fractions.push(fraction),
            ToolEvent::Finished(outcome) => {
                assert_eq!(outcome, StageOutcome::Success { output: output.clone() })
            }
        }
    }
    assert_eq!(fractions, vec![0.25, 0.75]);
}

#[tokio::test]
async fn realesrgan_image_mode() {
    let dir = tempfile::tempdir().unwrap();
    let realesrgan = script(
        dir.path(),
        "realesrgan",
        r#"out=""
while [ $# -gt 0 ]; do
  if [ "$1" = "-o" ]; then out="$2"; fi
  shift
done
echo "50.00%" >&2
echo "100.00%" >&2
echo "pixels" > "$out""#,
    );
    let adapter = RealEsrganAdapter::new(realesrgan);
    let input = dir.path().join("photo.png");
    std::fs::write(&input, b"png").unwrap();
    let stage = StageSpec::new("upscale", ToolKind::RealEsrgan, ArtifactKind::Image, ArtifactKind::Image)
        .with_param("scale", 4);
    let ctx = ctx(dir.path(), "stage-0.png", Duration::from_secs(10));
    let output = ctx.output.clone();

    let outcome = adapter.execute(&stage, &input, ctx).outcome().await;
    assert_eq!(outcome, StageOutcome::Success { output: output.clone() });
    assert_eq!(std::fs::read_to_string(output).unwrap().trim(), "pixels");
}

#[tokio::test]
async fn registry_from_config_skips_disabled_and_missing_tools() {
    let mut tools = ToolsConfig::default();
    tools.ffmpeg.path = Some("/nonexistent/ffmpeg".into());
    tools.realesrgan.enabled = false;
    tools.video2x.path = Some("/nonexistent/video2x".into());

    let registry = ToolRegistry::from_config(&tools).await;
    assert!(registry.usable().is_empty());
    assert!(registry.get(ToolKind::RealEsrgan).is_none());
    // Registered but not usable.
    assert!(registry.get(ToolKind::Ffmpeg).is_some());
    assert!(!registry.usable().contains(&ToolKind::Ffmpeg));
}

/// Writes its whole argument list to the file after `-o`.
const ARG_ECHO: &str = r#"out=""
args="$*"
while [ $# -gt 0 ]; do
  if [ "$1" = "-o" ]; then out="$2"; fi
  shift
done
[ -n "$out" ] && echo "$args" > "$out""#;

#[tokio::test]
async fn registry_passes_configured_gpu_to_tools() {
    let dir = tempfile::tempdir().unwrap();
    let mut tools = ToolsConfig::default();
    tools.ffmpeg.path = Some("/nonexistent/ffmpeg".into());
    tools.video2x.path = Some(script(dir.path(), "video2x", ARG_ECHO));
    tools.video2x.gpu = Some(2);
    tools.realesrgan.path = Some(script(dir.path(), "realesrgan", ARG_ECHO));
    tools.realesrgan.gpu = Some(1);

    let registry = ToolRegistry::from_config(&tools).await;
    assert!(registry.usable().contains(&ToolKind::Video2x));
    assert!(registry.usable().contains(&ToolKind::RealEsrgan));

    let input = input_file(dir.path());
    let stage = StageSpec::new(
        "upscale",
        ToolKind::Video2x,
        ArtifactKind::Video,
        ArtifactKind::Video,
    )
    .with_param("width", 1920)
    .with_param("height", 1080);
    let ctx = ctx(dir.path(), "stage-0.mp4", Duration::from_secs(10));
    let output = ctx.output.clone();
    let video2x = registry.get(ToolKind::Video2x).unwrap();
    let outcome = video2x.execute(&stage, &input, ctx).outcome().await;
    assert_eq!(outcome, StageOutcome::Success { output: output.clone() });
    assert!(std::fs::read_to_string(&output).unwrap().contains("--gpu 2"));

    let photo = dir.path().join("photo.png");
    std::fs::write(&photo, b"png").unwrap();
    let stage = StageSpec::new(
        "upscale",
        ToolKind::RealEsrgan,
        ArtifactKind::Image,
        ArtifactKind::Image,
    );
    let ctx = crate::ctx(dir.path(), "stage-1.png", Duration::from_secs(10));
    let output = ctx.output.clone();
    let realesrgan = registry.get(ToolKind::RealEsrgan).unwrap();
    let outcome = realesrgan.execute(&stage, &photo, ctx).outcome().await;
    assert_eq!(outcome, StageOutcome::Success { output: output.clone() });
    assert!(std::fs::read_to_string(&output).unwrap().contains("-g 1"));
}

#[tokio::test]
async fn registry_register_marks_usable() {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(Video2xAdapter::new("video2x")));
    assert!(registry.usable().contains(&ToolKind::Video2x));
    assert_eq!(registry.usable().len(), 1);
    assert_eq!(
        registry.get(ToolKind::Video2x).map(|a| a.kind()),
        Some(ToolKind::Video2x)
    );
}
