//! Process runner: one external process per call, with a wall-clock timeout.
//!
//! Key responsibilities:
//! - Reject deny-listed commands before anything is spawned
//! - Drain stdout/stderr concurrently with the wait for exit
//! - Kill the whole process group on timeout and reap it on every exit path
//! - Classify the outcome into an [`ExecutionResult`]

use cogloop_core::events::SharedSink;
use cogloop_core::{Config, Event, ExecutionResult, Outcome, TracingSink};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout_at;
use tracing::{debug, info, warn};

use crate::policy;

/// Interval between heartbeat log messages while a process is running.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Default grace period for joining output readers after exit or kill.
///
/// Readers normally finish as soon as the pipes close; the bound only matters
/// when something outside the process group still holds a pipe open.
pub const DEFAULT_IO_GRACE: Duration = Duration::from_secs(1);

/// Maximum bytes to capture per stream. Excess output is drained and dropped.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to open output log {path}: {source}")]
    LogSink {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed waiting for child process: {0}")]
    Internal(std::io::Error),
}

pub type Result<T> = std::result::Result<T, RunnerError>;

/// What to run: a shell string (`sh -c`) or an argument vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandLine {
    Shell(String),
    Argv(Vec<String>),
}

impl CommandLine {
    /// Human-readable form, also the string checked against the deny-list.
    pub fn render(&self) -> String {
        match self {
            Self::Shell(cmd) => cmd.clone(),
            Self::Argv(args) => args.join(" "),
        }
    }

    /// None for an empty argument vector.
    fn to_command(&self) -> Option<Command> {
        match self {
            Self::Shell(cmd) => {
                let mut command = Command::new("sh");
                command.arg("-c").arg(cmd);
                Some(command)
            }
            Self::Argv(args) => {
                let (program, rest) = args.split_first()?;
                let mut command = Command::new(program);
                command.args(rest);
                Some(command)
            }
        }
    }
}

/// A single execution request. Consumed by [`ProcessRunner::execute`].
#[derive(Debug, Clone)]
pub struct Invocation {
    pub command: CommandLine,
    pub timeout: Duration,
    pub working_dir: Option<PathBuf>,
    /// Merged onto the inherited environment.
    pub env: BTreeMap<String, String>,
    /// Written to stdin right after spawn; stdin is closed afterwards.
    pub input: Option<Vec<u8>>,
    pub check_policy: bool,
    /// Mirror both streams to this file as output arrives.
    pub log_file: Option<PathBuf>,
    /// Mirror both streams to the console as output arrives.
    pub echo: bool,
}

impl Invocation {
    pub fn new(command: CommandLine, timeout: Duration) -> Self {
        Self {
            command,
            timeout,
            working_dir: None,
            env: BTreeMap::new(),
            input: None,
            check_policy: true,
            log_file: None,
            echo: false,
        }
    }

    pub fn shell(command: impl Into<String>, timeout: Duration) -> Self {
        Self::new(CommandLine::Shell(command.into()), timeout)
    }

    pub fn argv<I, S>(args: I, timeout: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            CommandLine::Argv(args.into_iter().map(Into::into).collect()),
            timeout,
        )
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn input(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn check_policy(mut self, check: bool) -> Self {
        self.check_policy = check;
        self
    }

    pub fn log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    pub fn echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }
}

/// Runner configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub io_grace: Duration,
    pub max_output_bytes: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            io_grace: DEFAULT_IO_GRACE,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

impl RunnerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            io_grace: config.io_grace(),
            max_output_bytes: config.max_output_bytes,
        }
    }
}

/// How the wait loop terminated.
enum ProcessOutcome {
    Completed(ExitStatus),
    TimedOut,
}

/// Which output stream a reader drains.
#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// Optional live copies of child output.
#[derive(Debug, Clone, Default)]
struct OutputMirror {
    log: Option<Arc<tokio::sync::Mutex<tokio::fs::File>>>,
    echo: bool,
}

impl OutputMirror {
    async fn open(log_file: Option<&Path>, echo: bool) -> Result<Self> {
        let log = match log_file {
            Some(path) => {
                let open = async {
                    if let Some(parent) = path.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                    tokio::fs::File::create(path).await
                };
                let file = open.await.map_err(|source| RunnerError::LogSink {
                    path: path.to_path_buf(),
                    source,
                })?;
                Some(Arc::new(tokio::sync::Mutex::new(file)))
            }
            None => None,
        };
        Ok(Self { log, echo })
    }

    async fn write(&self, stream: Stream, bytes: &[u8]) {
        if self.echo {
            let echoed = match stream {
                Stream::Stdout => tokio::io::stdout().write_all(bytes).await,
                Stream::Stderr => tokio::io::stderr().write_all(bytes).await,
            };
            if let Err(err) = echoed {
                debug!(stream = stream.as_str(), error = %err, "console mirror write failed");
            }
        }
        if let Some(log) = &self.log {
            let mut file = log.lock().await;
            if let Err(err) = file.write_all(bytes).await {
                debug!(stream = stream.as_str(), error = %err, "log mirror write failed");
            }
        }
    }

    async fn flush(&self) {
        if let Some(log) = &self.log {
            let mut file = log.lock().await;
            if let Err(err) = file.flush().await {
                debug!(error = %err, "log mirror flush failed");
            }
        }
    }
}

/// Read a stream in fixed chunks into a shared buffer capped at `max_bytes`.
///
/// The buffer is shared so that output captured before a reader is abandoned
/// (grace period exceeded) is still available to the caller. Chunks past the
/// cap are mirrored and then discarded, so memory stays bounded even when the
/// child never writes a newline.
async fn drain<R: AsyncRead + Unpin>(
    mut reader: R,
    stream: Stream,
    buffer: Arc<Mutex<Vec<u8>>>,
    max_bytes: usize,
    mirror: OutputMirror,
) -> std::io::Result<()> {
    let mut chunk = [0u8; 8192];
    let mut truncated = false;

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }

        if !truncated {
            let Ok(mut buf) = buffer.lock() else {
                break;
            };
            let remaining = max_bytes.saturating_sub(buf.len());
            let to_take = n.min(remaining);
            buf.extend_from_slice(&chunk[..to_take]);
            if to_take < n {
                warn!(stream = stream.as_str(), max_bytes, "output exceeded limit, truncating");
                truncated = true;
            }
        }

        mirror.write(stream, &chunk[..n]).await;
    }

    Ok(())
}

/// Owns the child for the duration of one execution.
///
/// Dropping the guard before the child was reaped kills the child and its
/// process group, so no exit path (error, panic, cancelled future) leaves a
/// process behind.
struct ChildGuard {
    child: Child,
    pgid: Option<u32>,
    reaped: bool,
}

impl ChildGuard {
    fn new(child: Child) -> Self {
        let pgid = child.id();
        Self {
            child,
            pgid,
            reaped: false,
        }
    }

    fn signal_group(&self) {
        #[cfg(unix)]
        if let Some(pgid) = self.pgid {
            // SAFETY: killpg only sends a signal; the group was created for this
            // child at spawn (process_group(0)), so it holds nothing else.
            let rc = unsafe { libc::killpg(pgid as libc::pid_t, libc::SIGKILL) };
            if rc != 0 {
                debug!(pgid, "process group already gone");
            }
        }
        #[cfg(not(unix))]
        let _ = self.pgid;
    }

    /// Kill the group and the child, then reap the child.
    async fn terminate(&mut self) {
        self.signal_group();
        if let Err(err) = self.child.start_kill() {
            debug!(error = %err, "child already exited before kill");
        }
        if let Err(err) = self.child.wait().await {
            warn!(error = %err, "failed to reap killed process");
        }
        self.reaped = true;
    }

    /// After a normal exit: kill any descendants left in the group.
    fn release(&mut self) {
        self.signal_group();
        self.reaped = true;
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if !self.reaped {
            self.signal_group();
            let _ = self.child.start_kill();
        }
    }
}

/// Join a reader, abandoning it at `deadline`.
async fn join_reader(
    task: Option<JoinHandle<std::io::Result<()>>>,
    stream: Stream,
    deadline: tokio::time::Instant,
) {
    let Some(mut task) = task else {
        return;
    };
    match timeout_at(deadline, &mut task).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(err))) => {
            warn!(stream = stream.as_str(), error = %err, "output capture failed");
        }
        Ok(Err(err)) => {
            warn!(stream = stream.as_str(), error = %err, "output reader panicked");
        }
        Err(_) => {
            warn!(stream = stream.as_str(), "output capture timed out; keeping partial output");
            task.abort();
        }
    }
}

async fn join_writer(task: Option<JoinHandle<()>>, deadline: tokio::time::Instant) {
    let Some(mut task) = task else {
        return;
    };
    if timeout_at(deadline, &mut task).await.is_err() {
        debug!("stdin writer still blocked; abandoning");
        task.abort();
    }
}

fn take_output(buffer: &Arc<Mutex<Vec<u8>>>) -> String {
    let bytes = buffer
        .lock()
        .map(|mut buf| std::mem::take(&mut *buf))
        .unwrap_or_default();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Runs external processes.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    config: RunnerConfig,
    sink: SharedSink,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(RunnerConfig::default(), TracingSink::shared())
    }
}

impl ProcessRunner {
    pub fn new(config: RunnerConfig, sink: SharedSink) -> Self {
        Self { config, sink }
    }

    pub fn from_config(config: &Config, sink: SharedSink) -> Self {
        Self::new(RunnerConfig::from_config(config), sink)
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Execute with stdin seeded from `input`, then closed.
    pub async fn execute_interactive(
        &self,
        invocation: Invocation,
        input: impl Into<Vec<u8>>,
    ) -> Result<ExecutionResult> {
        self.execute(invocation.input(input)).await
    }

    /// Execute one invocation to completion, timeout, or rejection.
    ///
    /// Expected conditions (blocked, spawn failure, timeout, non-zero exit)
    /// are reported through [`Outcome`]; `Err` is reserved for failures of
    /// the runner itself.
    pub async fn execute(&self, invocation: Invocation) -> Result<ExecutionResult> {
        let Invocation {
            command,
            timeout: timeout_duration,
            working_dir,
            env,
            input,
            check_policy,
            log_file,
            echo,
        } = invocation;
        let rendered = command.render();

        if check_policy {
            if let Some(rule) = policy::check(&rendered) {
                self.sink.emit(Event::CommandBlocked {
                    command: rendered.clone(),
                    rule: rule.to_string(),
                });
                return Ok(ExecutionResult::blocked(rendered, timeout_duration));
            }
        }

        let mirror = OutputMirror::open(log_file.as_deref(), echo).await?;
        let started = Instant::now();

        let Some(mut cmd) = command.to_command() else {
            return Ok(ExecutionResult::spawn_error(
                rendered,
                timeout_duration,
                "empty command",
                started.elapsed(),
            ));
        };
        cmd.envs(&env)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &working_dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!(command = %rendered, error = %err, "failed to spawn process");
                return Ok(ExecutionResult::spawn_error(
                    rendered,
                    timeout_duration,
                    format!("failed to spawn: {err}"),
                    started.elapsed(),
                ));
            }
        };
        let mut guard = ChildGuard::new(child);

        self.sink.emit(Event::ExecutionStarted {
            command: rendered.clone(),
            pid: guard.pgid,
            timeout_ms: timeout_duration.as_millis() as u64,
        });

        // Readers start before the wait: a full pipe would otherwise stall the child.
        let stdout_buf = Arc::new(Mutex::new(Vec::new()));
        let stderr_buf = Arc::new(Mutex::new(Vec::new()));
        let stdout_task = guard.child.stdout.take().map(|stdout| {
            tokio::spawn(drain(
                stdout,
                Stream::Stdout,
                Arc::clone(&stdout_buf),
                self.config.max_output_bytes,
                mirror.clone(),
            ))
        });
        let stderr_task = guard.child.stderr.take().map(|stderr| {
            tokio::spawn(drain(
                stderr,
                Stream::Stderr,
                Arc::clone(&stderr_buf),
                self.config.max_output_bytes,
                mirror.clone(),
            ))
        });
        let stdin_task = guard
            .child
            .stdin
            .take()
            .zip(input)
            .map(|(mut stdin, input)| {
                tokio::spawn(async move {
                    match stdin.write_all(&input).await {
                        Ok(()) => {}
                        Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => {
                            debug!("child closed stdin before reading all input");
                        }
                        Err(err) => warn!(error = %err, "failed to write child stdin"),
                    }
                    // Dropping the handle closes the pipe.
                    drop(stdin);
                })
            });

        let outcome = loop {
            let elapsed = started.elapsed();
            if elapsed >= timeout_duration {
                warn!(
                    command = %rendered,
                    timeout_ms = timeout_duration.as_millis() as u64,
                    "process timed out; killing"
                );
                guard.terminate().await;
                break ProcessOutcome::TimedOut;
            }
            let sleep_duration = HEARTBEAT_INTERVAL.min(timeout_duration - elapsed);

            tokio::select! {
                result = guard.child.wait() => {
                    let status = result.map_err(RunnerError::Internal)?;
                    guard.release();
                    break ProcessOutcome::Completed(status);
                }
                () = tokio::time::sleep(sleep_duration) => {
                    if started.elapsed() < timeout_duration {
                        info!(
                            command = %rendered,
                            elapsed_sec = started.elapsed().as_secs(),
                            timeout_sec = timeout_duration.as_secs(),
                            "process still running"
                        );
                    }
                }
            }
        };

        // One grace period shared by all pipes, not one each.
        let deadline = tokio::time::Instant::now() + self.config.io_grace;
        tokio::join!(
            join_reader(stdout_task, Stream::Stdout, deadline),
            join_reader(stderr_task, Stream::Stderr, deadline),
            join_writer(stdin_task, deadline),
        );
        mirror.flush().await;

        let duration = started.elapsed();
        let stdout = take_output(&stdout_buf);
        let stderr = take_output(&stderr_buf);

        let (outcome, message) = match outcome {
            ProcessOutcome::TimedOut => (
                Outcome::TimedOut,
                Some(format!(
                    "command timed out after {:.1}s",
                    timeout_duration.as_secs_f64()
                )),
            ),
            ProcessOutcome::Completed(status) => match status.code().unwrap_or(-1) {
                0 => (Outcome::Success, None),
                code => (
                    Outcome::NonZeroExit(code),
                    Some(format!("command failed with exit code {code}")),
                ),
            },
        };

        self.sink.emit(Event::ExecutionFinished {
            command: rendered.clone(),
            outcome: outcome.as_str().to_string(),
            exit_code: outcome.exit_code(),
            duration_ms: duration.as_millis() as u64,
            stdout_bytes: stdout.len(),
            stderr_bytes: stderr.len(),
        });

        Ok(ExecutionResult {
            command: rendered,
            outcome,
            stdout,
            stderr,
            duration_ms: duration.as_millis() as u64,
            timeout_ms: timeout_duration.as_millis() as u64,
            message,
        })
    }
}
