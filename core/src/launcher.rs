//! Detached child process launcher.
//!
//! Runs exactly one child agent process per task and turns its output
//! stream into a resolved `ExecutionResult`. The child is started in its
//! own process group with output redirected to files, so it keeps running
//! even if the coordinator exits; all post-start knowledge comes from
//! polling the output file and, for external tools, the pid sidecar.

use std::io::SeekFrom;
use std::path::Path;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use factory_protocol::ExecutionResult;
use factory_protocol::StreamEvent;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncSeekExt;
use tokio::io::AsyncWriteExt;
use tokio::process::Child;
use tokio::process::Command;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::DEPTH_ENV_VAR;
use crate::config::FactoryConfig;
use crate::config::RUN_ID_ENV_VAR;
use crate::error::FactoryError;

/// Callback receiving a snapshot of the in-progress result after each
/// recognized stream event.
pub type ProgressFn = Arc<dyn Fn(ExecutionResult) + Send + Sync>;

/// What to run and where.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub agent: String,
    pub task: String,
    pub prompt: Option<String>,
    pub model: String,
    pub cwd: PathBuf,
    pub tools: Vec<String>,
    pub step: Option<String>,
}

/// One launch, bound to a run and a task id.
#[derive(Debug, Clone)]
pub struct Launch {
    pub run_id: String,
    pub task_id: u64,
    pub spec: LaunchSpec,
    pub run_dir: PathBuf,
    /// Depth the child will carry in its environment.
    pub child_depth: u32,
}

pub fn stdout_path(run_dir: &Path, task_id: u64) -> PathBuf {
    run_dir.join(format!("{task_id}.stdout.jsonl"))
}

pub fn stderr_path(run_dir: &Path, task_id: u64) -> PathBuf {
    run_dir.join(format!("{task_id}.stderr.log"))
}

pub fn pid_path(run_dir: &Path, task_id: u64) -> PathBuf {
    run_dir.join(format!("{task_id}.pid"))
}

pub fn transcript_path(run_dir: &Path, task_id: u64) -> PathBuf {
    run_dir.join(format!("{task_id}.jsonl"))
}

/// Runs the child to completion and resolves its result.
///
/// Per-child failures are captured into the returned result rather than
/// propagated: an OS-level spawn refusal resolves with `exit_code = 1`
/// and an error message, never a panic or an `Err` that could abort
/// siblings.
pub async fn launch(
    launch: Launch,
    config: Arc<FactoryConfig>,
    cancel: CancellationToken,
    on_progress: Option<ProgressFn>,
) -> ExecutionResult {
    let mut result =
        ExecutionResult::pending(launch.task_id, launch.spec.agent.clone(), launch.spec.task.clone());
    if let Err(err) = run_child(&launch, &config, cancel, on_progress.as_ref(), &mut result).await {
        tracing::warn!(
            run_id = launch.run_id,
            task_id = launch.task_id,
            "launch failed: {err}"
        );
        result.exit_code = 1;
        result.error_message = Some(err.to_string());
    }
    result
}

async fn run_child(
    launch: &Launch,
    config: &FactoryConfig,
    cancel: CancellationToken,
    on_progress: Option<&ProgressFn>,
    result: &mut ExecutionResult,
) -> Result<(), FactoryError> {
    tokio::fs::create_dir_all(&launch.run_dir)
        .await
        .map_err(|err| FactoryError::io(&launch.run_dir, err))?;

    let out_path = stdout_path(&launch.run_dir, launch.task_id);
    let err_path = stderr_path(&launch.run_dir, launch.task_id);
    let pid_file = pid_path(&launch.run_dir, launch.task_id);

    let out_file = std::fs::File::create(&out_path).map_err(|err| FactoryError::io(&out_path, err))?;
    let err_file = std::fs::File::create(&err_path).map_err(|err| FactoryError::io(&err_path, err))?;

    let mut command = Command::new(&config.agent_program);
    command.args(&config.agent_args);
    command.arg("--model").arg(&launch.spec.model);
    command.arg("--agent").arg(&launch.spec.agent);
    if let Some(prompt) = &launch.spec.prompt {
        command.arg("--system-prompt").arg(prompt);
    }
    if !launch.spec.tools.is_empty() {
        command.arg("--tools").arg(launch.spec.tools.join(","));
    }
    if let Some(step) = &launch.spec.step {
        command.arg("--step").arg(step);
    }
    command.arg(&launch.spec.task);
    command.current_dir(&launch.spec.cwd);
    command.env(DEPTH_ENV_VAR, launch.child_depth.to_string());
    command.env(RUN_ID_ENV_VAR, &launch.run_id);
    command.stdin(Stdio::null());
    command.stdout(Stdio::from(out_file));
    command.stderr(Stdio::from(err_file));
    // The child must outlive the coordinator: its own process group, and
    // no kill on drop.
    command.kill_on_drop(false);
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command
        .spawn()
        .map_err(|err| FactoryError::io(&config.agent_program, err))?;
    let pid = child.id();
    if let Some(pid) = pid {
        if let Err(err) = tokio::fs::write(&pid_file, pid.to_string()).await {
            tracing::warn!(task_id = launch.task_id, "failed to write pid file: {err}");
        }
    }
    tracing::debug!(
        run_id = launch.run_id,
        task_id = launch.task_id,
        pid,
        "child started"
    );

    let mut tail = OutputTail::new(out_path);
    let mut transcript = config
        .persist_transcripts
        .then(|| TranscriptWriter::new(transcript_path(&launch.run_dir, launch.task_id)));
    if let Some(writer) = &transcript {
        result.session_path = Some(writer.path.clone());
    }
    let mut assistant_parts: Vec<String> = Vec::new();

    let mut ticker = tokio::time::interval(config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let status = loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                let status = terminate(&mut child, pid, config.grace_period).await?;
                result.stop_reason = Some("cancelled".to_string());
                break status;
            }
            status = child.wait() => {
                break status.map_err(FactoryError::Process)?;
            }
            _ = ticker.tick() => {
                let events = tail.poll().await;
                apply_events(events, result, &mut assistant_parts, &mut transcript, on_progress)
                    .await;
            }
        }
    };

    // Polling has stopped; parse whatever was written after the last tick.
    let events = tail.drain_remaining().await;
    apply_events(events, result, &mut assistant_parts, &mut transcript, on_progress).await;

    result.exit_code = exit_code_of(status);
    result.stderr = tokio::fs::read_to_string(stderr_path(&launch.run_dir, launch.task_id))
        .await
        .unwrap_or_default();
    if let Err(err) = tokio::fs::remove_file(&pid_file).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(task_id = launch.task_id, "failed to remove pid file: {err}");
        }
    }
    tracing::debug!(
        run_id = launch.run_id,
        task_id = launch.task_id,
        exit_code = result.exit_code,
        "child finished"
    );
    Ok(())
}

async fn apply_events(
    events: Vec<StreamEvent>,
    result: &mut ExecutionResult,
    assistant_parts: &mut Vec<String>,
    transcript: &mut Option<TranscriptWriter>,
    on_progress: Option<&ProgressFn>,
) {
    for event in events {
        if let Some(writer) = transcript {
            writer.append(&event).await;
        }
        match &event {
            StreamEvent::Assistant { message } => {
                if let Some(usage) = &message.usage {
                    result.usage.absorb(usage);
                }
                result.usage.turns += 1;
                assistant_parts.push(message.text());
                result.text = assistant_parts.concat();
                if message.stop_reason.is_some() {
                    result.stop_reason = message.stop_reason.clone();
                }
            }
            StreamEvent::ToolResult { .. } => {}
        }
        if let Some(progress) = on_progress {
            progress(result.clone());
        }
    }
}

/// Graceful termination, escalating to a forceful kill after the grace
/// period. The child leads its own process group, so signals go to the
/// whole group and reach grandchildren too.
async fn terminate(
    child: &mut Child,
    pid: Option<u32>,
    grace: Duration,
) -> Result<ExitStatus, FactoryError> {
    signal_group(pid, TERM_SIGNAL);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status.map_err(FactoryError::Process),
        Err(_elapsed) => {
            signal_group(pid, KILL_SIGNAL);
            if let Err(err) = child.start_kill() {
                tracing::warn!("forceful kill failed: {err}");
            }
            child.wait().await.map_err(FactoryError::Process)
        }
    }
}

#[cfg(unix)]
const TERM_SIGNAL: i32 = libc::SIGTERM;
#[cfg(unix)]
const KILL_SIGNAL: i32 = libc::SIGKILL;
#[cfg(not(unix))]
const TERM_SIGNAL: i32 = 15;
#[cfg(not(unix))]
const KILL_SIGNAL: i32 = 9;

#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: i32) {
    if let Some(pid) = pid {
        // SAFETY: plain signal delivery; negative pid addresses the
        // process group the child leads.
        unsafe {
            libc::kill(-(pid as libc::pid_t), signal);
        }
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _signal: i32) {}

fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

/// Incremental tail over the child's output file.
///
/// Tracks only a byte offset and a partial-line carry; the file is
/// reopened and seeked on every poll, never held open across ticks, so
/// the tail stays robust to a briefly missing file at process start.
/// The carry is raw bytes: a poll can end mid-character, so UTF-8
/// decoding happens per complete line, never per chunk.
struct OutputTail {
    path: PathBuf,
    offset: u64,
    partial: Vec<u8>,
}

impl OutputTail {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            offset: 0,
            partial: Vec::new(),
        }
    }

    /// Reads the byte range written since the last poll and returns the
    /// complete-line events it contained.
    async fn poll(&mut self) -> Vec<StreamEvent> {
        let Ok(mut file) = tokio::fs::File::open(&self.path).await else {
            // Race at process start: the file may not exist yet.
            return Vec::new();
        };
        if file.seek(SeekFrom::Start(self.offset)).await.is_err() {
            return Vec::new();
        }
        let mut buf = Vec::new();
        let Ok(read) = file.read_to_end(&mut buf).await else {
            return Vec::new();
        };
        self.offset += read as u64;
        self.partial.extend_from_slice(&buf);

        let mut events = Vec::new();
        while let Some(newline) = self.partial.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(event) = parse_line(line.trim()) {
                events.push(event);
            }
        }
        events
    }

    /// Final drain after process exit: includes a trailing line without a
    /// newline terminator.
    async fn drain_remaining(&mut self) -> Vec<StreamEvent> {
        let mut events = self.poll().await;
        let rest = std::mem::take(&mut self.partial);
        let rest = String::from_utf8_lossy(&rest);
        if let Some(event) = parse_line(rest.trim()) {
            events.push(event);
        }
        events
    }
}

/// Malformed lines are skipped: child output is semi-structured streaming
/// data, and robustness wins over strictness here.
fn parse_line(line: &str) -> Option<StreamEvent> {
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str(line) {
        Ok(event) => Some(event),
        Err(err) => {
            tracing::debug!("skipping unparseable output line: {err}");
            None
        }
    }
}

struct TranscriptWriter {
    path: PathBuf,
}

impl TranscriptWriter {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }

    async fn append(&self, event: &StreamEvent) {
        let Ok(mut line) = serde_json::to_string(event) else {
            return;
        };
        line.push('\n');
        let opened = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await;
        match opened {
            Ok(mut file) => {
                if let Err(err) = file.write_all(line.as_bytes()).await {
                    tracing::warn!("failed to append transcript line: {err}");
                }
            }
            Err(err) => tracing::warn!("failed to open transcript file: {err}"),
        }
    }
}
