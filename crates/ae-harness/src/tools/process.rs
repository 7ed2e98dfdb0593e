use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use ae_core::types::ToolKind;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{ExecutionContext, StageOutcome, ToolError, ToolEvent, ToolEventSender};

/// Lines of stderr kept for error details.
const STDERR_TAIL_LINES: usize = 12;

/// How long to wait for output readers after the process exited.
const READER_DRAIN: Duration = Duration::from_millis(250);

/// Turns one line of tool output into a fraction of the current phase.
pub(crate) type LineParser = Box<dyn FnMut(&str) -> Option<f64> + Send>;

/// The `.partial` sibling a tool writes to before the result is committed.
///
/// The extension is kept last so tools that pick a container from the file
/// name still see the right one: `out.mp4` becomes `out.partial.mp4`.
pub fn partial_path(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".into());
    let name = match output.extension() {
        Some(ext) => format!("{stem}.partial.{}", ext.to_string_lossy()),
        None => format!("{stem}.partial"),
    };
    output.with_file_name(name)
}

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// One subprocess within a stage.
pub(crate) struct Phase {
    pub label: &'static str,
    pub program: String,
    pub args: Vec<String>,
    pub parser: Option<LineParser>,
    /// Slice of the stage's progress covered by this phase.
    pub span: (f64, f64),
}

impl Phase {
    pub fn new(label: &'static str, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            label,
            program: program.into(),
            args,
            parser: None,
            span: (0.0, 1.0),
        }
    }

    pub fn with_parser(mut self, parser: LineParser) -> Self {
        self.parser = Some(parser);
        self
    }

    pub fn with_span(mut self, start: f64, end: f64) -> Self {
        self.span = (start, end);
        self
    }
}

// ---------------------------------------------------------------------------
// Progress throttle
// ---------------------------------------------------------------------------

/// Coalesces progress so events are at least `interval` apart and never
/// repeat or go backwards.
#[derive(Debug)]
pub(crate) struct ProgressThrottle {
    interval: Duration,
    last_sent: Option<Instant>,
    last_fraction: f64,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_sent: None,
            last_fraction: 0.0,
        }
    }

    pub fn admit(&mut self, fraction: f64, now: Instant) -> bool {
        if !fraction.is_finite() || fraction <= self.last_fraction {
            return false;
        }
        if let Some(last) = self.last_sent {
            if now.saturating_duration_since(last) < self.interval {
                return false;
            }
        }
        self.last_sent = Some(now);
        self.last_fraction = fraction;
        true
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

/// Drives the subprocesses of one stage attempt and reports through a
/// [`ToolRun`](super::ToolRun) channel.
///
/// The final phase writes to [`partial`](Self::partial); [`finish`](Self::finish)
/// either commits that file to the context's output path or removes it.
pub(crate) struct Runner {
    tool: ToolKind,
    ctx: ExecutionContext,
    events: ToolEventSender,
    started: Instant,
    deadline_at: Instant,
    throttle: ProgressThrottle,
    partial: PathBuf,
    scratch: Vec<PathBuf>,
}

impl Runner {
    pub fn new(tool: ToolKind, ctx: ExecutionContext, events: ToolEventSender) -> Self {
        let started = Instant::now();
        Self {
            tool,
            partial: partial_path(&ctx.output),
            deadline_at: started + ctx.deadline,
            throttle: ProgressThrottle::new(ctx.progress_interval),
            started,
            ctx,
            events,
            scratch: Vec::new(),
        }
    }

    pub fn partial(&self) -> &Path {
        &self.partial
    }

    pub fn ctx(&self) -> &ExecutionContext {
        &self.ctx
    }

    /// Create a scratch directory next to the output. Removed by `finish`.
    pub async fn scratch_dir(&mut self, name: &str) -> Result<PathBuf, ToolError> {
        let base = self
            .ctx
            .output
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "stage".into());
        let dir = self.ctx.output.with_file_name(format!("{base}.{name}"));
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| self.external(format!("cannot create {}: {e}", dir.display())))?;
        self.scratch.push(dir.clone());
        Ok(dir)
    }

    pub fn external(&self, detail: impl Into<String>) -> ToolError {
        ToolError::External {
            tool: self.tool,
            detail: detail.into(),
        }
    }

    fn emit_progress(&mut self, fraction: f64, note: &str) {
        let fraction = fraction.clamp(0.0, 1.0);
        if self.throttle.admit(fraction, Instant::now()) {
            let _ = self.events.send(ToolEvent::Progress {
                fraction,
                note: Some(note.to_string()),
            });
        }
    }

    /// Run one phase to completion, honouring cancellation and the stage
    /// deadline.
    pub async fn run(&mut self, mut phase: Phase) -> Result<(), ToolError> {
        if self.ctx.cancel.is_cancelled() {
            return Err(ToolError::Cancelled { tool: self.tool });
        }
        if let Some(parent) = self.partial.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.external(format!("cannot create {}: {e}", parent.display())))?;
        }

        debug!(
            task_id = %self.ctx.task_id,
            tool = %self.tool,
            phase = phase.label,
            program = %phase.program,
            args = ?phase.args,
            "spawning tool"
        );
        let mut command = Command::new(&phase.program);
        command
            .args(&phase.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so stopping the stage also reaches whatever
        // the tool spawned itself.
        #[cfg(unix)]
        command.process_group(0);
        let mut child = command
            .spawn()
            .map_err(|e| self.external(format!("failed to start {}: {e}", phase.program)))?;

        let (line_tx, lines) = flume::unbounded::<(Stream, String)>();
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, Stream::Stdout, line_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, Stream::Stderr, line_tx.clone());
        }
        drop(line_tx);

        let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
        let mut lines_open = true;
        let deadline = tokio::time::sleep_until(self.deadline_at);
        tokio::pin!(deadline);
        let cancel = self.ctx.cancel.clone();

        let status = loop {
            tokio::select! {
                status = child.wait() => {
                    break status.map_err(|e| self.external(format!("waiting for {}: {e}", phase.program)))?;
                }
                line = lines.recv_async(), if lines_open => match line {
                    Ok((stream, line)) => self.handle_line(&mut phase, &mut tail, stream, line),
                    Err(_) => lines_open = false,
                },
                _ = cancel.cancelled() => {
                    info!(task_id = %self.ctx.task_id, tool = %self.tool, phase = phase.label, "cancelling tool");
                    terminate(&mut child, self.ctx.grace).await;
                    return Err(ToolError::Cancelled { tool: self.tool });
                }
                _ = &mut deadline => {
                    warn!(task_id = %self.ctx.task_id, tool = %self.tool, phase = phase.label, budget = ?self.ctx.deadline, "tool deadline reached");
                    terminate(&mut child, self.ctx.grace).await;
                    return Err(ToolError::Timeout {
                        tool: self.tool,
                        elapsed: self.started.elapsed(),
                        budget: self.ctx.deadline,
                    });
                }
            }
        };

        if lines_open {
            let _ = tokio::time::timeout(READER_DRAIN, async {
                while let Ok((stream, line)) = lines.recv_async().await {
                    self.handle_line(&mut phase, &mut tail, stream, line);
                }
            })
            .await;
        }

        if !status.success() {
            let tail: Vec<String> = tail.into_iter().collect();
            return Err(self.external(format!(
                "{} exited with {status}: {}",
                phase.label,
                tail.join(" | ")
            )));
        }
        debug!(
            task_id = %self.ctx.task_id,
            tool = %self.tool,
            phase = phase.label,
            "phase finished"
        );
        Ok(())
    }

    fn handle_line(
        &mut self,
        phase: &mut Phase,
        tail: &mut VecDeque<String>,
        stream: Stream,
        line: String,
    ) {
        if let Some(parser) = phase.parser.as_mut() {
            if let Some(fraction) = parser(&line) {
                let (start, end) = phase.span;
                let overall = start + (end - start) * fraction.clamp(0.0, 1.0);
                self.emit_progress(overall, phase.label);
                return;
            }
        }
        if matches!(stream, Stream::Stderr) && !line.trim().is_empty() {
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    }

    /// Commit or discard the partial output and send the terminal event.
    pub async fn finish(self, result: Result<(), ToolError>) {
        let outcome = match result {
            Ok(()) => self.commit().await,
            Err(e) => Err(e),
        };
        let outcome = match outcome {
            Ok(output) => {
                info!(
                    task_id = %self.ctx.task_id,
                    tool = %self.tool,
                    output = %output.display(),
                    elapsed = ?self.started.elapsed(),
                    "stage output committed"
                );
                StageOutcome::Success { output }
            }
            Err(e) => {
                remove_file_quietly(&self.partial).await;
                StageOutcome::Failed(e)
            }
        };
        for dir in &self.scratch {
            if let Err(e) = tokio::fs::remove_dir_all(dir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(dir = %dir.display(), error = %e, "failed to remove scratch directory");
                }
            }
        }
        let _ = self.events.send(ToolEvent::Finished(outcome));
    }

    async fn commit(&self) -> Result<PathBuf, ToolError> {
        let len = match tokio::fs::metadata(&self.partial).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        if len == 0 {
            return Err(self.external(format!(
                "tool produced no output at {}",
                self.partial.display()
            )));
        }
        tokio::fs::rename(&self.partial, &self.ctx.output)
            .await
            .map_err(|e| self.external(format!("cannot commit output: {e}")))?;
        Ok(self.ctx.output.clone())
    }
}

fn spawn_reader<R>(pipe: R, stream: Stream, tx: flume::Sender<(Stream, String)>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            // Tools that redraw a single line use carriage returns.
            for part in line.split('\r') {
                if tx.send((stream, part.to_string())).is_err() {
                    return;
                }
            }
        }
    });
}

/// SIGTERM to the tool's process group, then SIGKILL to the group once
/// `grace` has passed or the tool itself has exited.
async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            let group = -(pid as libc::pid_t);
            signal_group(group, libc::SIGTERM);
            if tokio::time::timeout(grace, child.wait()).await.is_err() {
                warn!(pid, ?grace, "tool ignored SIGTERM, killing");
            }
            // Children that outlived the leader are still in the group.
            signal_group(group, libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = grace;
    let _ = child.kill().await;
}

#[cfg(unix)]
fn signal_group(group: libc::pid_t, signal: libc::c_int) {
    // SAFETY: signal delivery to a process group we created at spawn time.
    let rc = unsafe { libc::kill(group, signal) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            debug!(group, signal, error = %err, "signalling tool process group failed");
        }
    }
}

async fn remove_file_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove partial output");
        }
    }
}

/// Run `program args` briefly and return its stdout, or `None` if it could
/// not be run or failed.
pub(crate) async fn capture_stdout(
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Option<String> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .output();
    match tokio::time::timeout(timeout, output).await {
        Ok(Ok(out)) if out.status.success() => {
            Some(String::from_utf8_lossy(&out.stdout).into_owned())
        }
        _ => None,
    }
}

/// Whether `program` can be started at all. The exit status is ignored;
/// several tools exit non-zero on `-h`.
pub(crate) async fn probe_binary(program: &str, arg: &str) -> bool {
    let status = Command::new(program)
        .arg(arg)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status();
    match tokio::time::timeout(Duration::from_secs(10), status).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            debug!(program, error = %e, "tool probe failed");
            false
        }
        // Started but hung on a help flag: it exists.
        Err(_) => true,
    }
}

/// Last `<number>%` on a line, as a fraction.
pub(crate) fn parse_percent(line: &str) -> Option<f64> {
    let idx = line.rfind('%')?;
    let head = &line[..idx];
    let number = &head[head
        .trim_end_matches(|c: char| c.is_ascii_digit() || c == '.')
        .len()..];
    let value: f64 = number.parse().ok()?;
    (0.0..=100.0).contains(&value).then_some(value / 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_keeps_extension_last() {
        assert_eq!(
            partial_path(Path::new("/w/t/stage-1.mp4")),
            PathBuf::from("/w/t/stage-1.partial.mp4")
        );
        assert_eq!(
            partial_path(Path::new("/w/out")),
            PathBuf::from("/w/out.partial")
        );
    }

    #[test]
    fn percent_lines() {
        assert_eq!(parse_percent("45.00%"), Some(0.45));
        assert_eq!(parse_percent("frame 12/40  30%|███"), Some(0.3));
        assert_eq!(parse_percent("100%"), Some(1.0));
        assert_eq!(parse_percent("no percent here"), None);
        assert_eq!(parse_percent("ratio 250%"), None);
        assert_eq!(parse_percent("%"), None);
        // Bar glyphs right before the number are multi-byte.
        assert_eq!(parse_percent("▕██▏45%"), Some(0.45));
        assert_eq!(parse_percent("██████▏100%"), Some(1.0));
    }

    #[test]
    fn throttle_coalesces() {
        let start = Instant::now();
        let mut throttle = ProgressThrottle::new(Duration::from_secs(5));
        assert!(throttle.admit(0.1, start));
        assert!(!throttle.admit(0.2, start + Duration::from_secs(1)));
        assert!(throttle.admit(0.3, start + Duration::from_secs(6)));
        // Never backwards, even after the interval.
        assert!(!throttle.admit(0.25, start + Duration::from_secs(20)));
    }
}
