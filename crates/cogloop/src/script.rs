//! Script runner: materializes source text as a file and executes it through
//! the process runner.
//!
//! Ephemeral artifacts are `builder_*` temp files removed when the run ends,
//! on every exit path. Archived artifacts are written once per call and never
//! overwritten. [`ScriptRunner::run_function`] calls a single Python function
//! through a generated wrapper and decodes its JSON report.

use chrono::Utc;
use cogloop_core::artifacts::{archive_dir, archive_file_name, checksum_bytes};
use cogloop_core::events::SharedSink;
use cogloop_core::{
    ArchiveRecord, Config, Event, ExecutionResult, Id, Interpreter, ScriptArtifact, StoreKeys,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::runner::{Invocation, ProcessRunner, RunnerError};
use crate::store::{DurableStore, StoreError};

/// Prefix of ephemeral artifact file names.
pub const EPHEMERAL_PREFIX: &str = "builder_";

/// Prefix of function-call wrapper file names.
const FUNCTION_PREFIX: &str = "builder_func_";

/// Upper bound on same-second archive name collisions before giving up.
const MAX_ARCHIVE_COLLISIONS: u32 = 1000;

/// Default address-space cap for [`ScriptRunner::run_function`] (1 GiB).
pub const DEFAULT_FUNCTION_MEMORY_LIMIT: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("artifact I/O error at {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("script not found: {0}")]
    ArtifactNotFound(PathBuf),
    #[error("task id {0:?} cannot name an archive directory")]
    InvalidTaskId(Id),
    #[error("invalid function name: {0:?}")]
    InvalidFunctionName(String),
    #[error("failed to encode function arguments: {0}")]
    Arguments(#[source] serde_json::Error),
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error("failed to update archive index: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, ScriptError>;

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> ScriptError + '_ {
    move |source| ScriptError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Result of running source text.
#[derive(Debug, Clone)]
pub struct ScriptRun {
    pub result: ExecutionResult,
    pub artifact: ScriptArtifact,
}

/// Per-call options for [`ScriptRunner::run_source`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Keep the artifact at this path instead of an ephemeral temp file.
    pub target_path: Option<PathBuf>,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    /// Overrides the runner's `exec_log_dir` naming for this call.
    pub log_file: Option<PathBuf>,
    pub args: Vec<String>,
}

impl RunOptions {
    pub fn target_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.target_path = Some(path.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// Result of [`ScriptRunner::run_function`].
#[derive(Debug, Clone, Serialize)]
pub struct FunctionRun {
    pub result: ExecutionResult,
    /// Return value, when the function returned normally.
    pub value: Option<Value>,
    /// Why no value is available: a Python exception, a failed execution or
    /// output that could not be decoded.
    pub error: Option<String>,
    pub traceback: Option<String>,
}

impl FunctionRun {
    pub fn is_success(&self) -> bool {
        self.result.is_success() && self.error.is_none()
    }
}

/// Report line printed by the function wrapper.
#[derive(Debug, Deserialize)]
struct FunctionReport {
    success: bool,
    #[serde(default)]
    result: Value,
    error: Option<String>,
    traceback: Option<String>,
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

/// Python wrapper that defines `code`, calls `name` and prints one JSON line.
///
/// Arguments travel as a JSON string literal decoded inside the wrapper, so
/// values are never spliced into Python syntax.
fn function_wrapper(
    code: &str,
    name: &str,
    args: &[Value],
    kwargs: &Map<String, Value>,
    memory_limit: Option<u64>,
) -> Result<String> {
    let payload = serde_json::json!({
        "args": args,
        "kwargs": kwargs,
        "memory_limit": memory_limit,
    });
    let literal = serde_json::to_string(&payload)
        .and_then(|encoded| serde_json::to_string(&encoded))
        .map_err(ScriptError::Arguments)?;

    Ok(format!(
        r#"import json
import resource
import traceback

_cogloop_call = json.loads({literal})
if _cogloop_call["memory_limit"]:
    try:
        _limit = _cogloop_call["memory_limit"]
        resource.setrlimit(resource.RLIMIT_AS, (_limit, _limit))
    except (ValueError, OSError):
        pass

{code}

try:
    _cogloop_result = {name}(*_cogloop_call["args"], **_cogloop_call["kwargs"])
    print(json.dumps({{"success": True, "result": _cogloop_result}}))
except Exception as e:
    print(json.dumps({{"success": False, "error": str(e), "traceback": traceback.format_exc()}}))
"#
    ))
}

/// Decode the wrapper's report from the last non-empty stdout line.
fn decode_function_report(result: ExecutionResult) -> FunctionRun {
    if !result.is_success() {
        let error = result
            .message
            .clone()
            .unwrap_or_else(|| format!("execution {}", result.outcome.as_str()));
        return FunctionRun {
            result,
            value: None,
            error: Some(error),
            traceback: None,
        };
    }

    let report = result
        .stdout
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .and_then(|line| serde_json::from_str::<FunctionReport>(line).ok());
    match report {
        Some(report) if report.success => FunctionRun {
            result,
            value: Some(report.result),
            error: None,
            traceback: None,
        },
        Some(report) => FunctionRun {
            result,
            value: None,
            error: Some(report.error.unwrap_or_else(|| "function raised".to_string())),
            traceback: report.traceback,
        },
        None => FunctionRun {
            result,
            value: None,
            error: Some("failed to parse function output as JSON".to_string()),
            traceback: None,
        },
    }
}

/// Where archive bookkeeping rows are written.
#[derive(Debug, Clone)]
struct ArchiveIndex {
    store: DurableStore,
    keys: StoreKeys,
}

#[derive(Debug, Clone)]
pub struct ScriptRunner {
    runner: ProcessRunner,
    archive_root: PathBuf,
    python_bin: String,
    check_policy: bool,
    echo: bool,
    exec_log_dir: Option<PathBuf>,
    index: Option<ArchiveIndex>,
    sink: SharedSink,
}

impl ScriptRunner {
    pub fn new(runner: ProcessRunner, archive_root: impl Into<PathBuf>, sink: SharedSink) -> Self {
        Self {
            runner,
            archive_root: archive_root.into(),
            python_bin: "python3".to_string(),
            check_policy: true,
            echo: false,
            exec_log_dir: None,
            index: None,
            sink,
        }
    }

    pub fn from_config(config: &Config, runner: ProcessRunner, sink: SharedSink) -> Self {
        let mut script_runner = Self::new(runner, &config.archive_root, sink)
            .python_bin(&config.python_bin)
            .check_policy(config.check_dangerous)
            .echo(config.echo_output);
        script_runner.exec_log_dir = config.exec_log_dir.clone();
        script_runner
    }

    pub fn python_bin(mut self, python_bin: impl Into<String>) -> Self {
        self.python_bin = python_bin.into();
        self
    }

    pub fn check_policy(mut self, check: bool) -> Self {
        self.check_policy = check;
        self
    }

    pub fn echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    pub fn exec_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.exec_log_dir = Some(dir.into());
        self
    }

    /// Record every archived artifact in the task's archive index document.
    pub fn with_index(mut self, store: DurableStore, keys: StoreKeys) -> Self {
        self.index = Some(ArchiveIndex { store, keys });
        self
    }

    pub fn archive_root(&self) -> &Path {
        &self.archive_root
    }

    pub fn process_runner(&self) -> &ProcessRunner {
        &self.runner
    }

    fn invocation(
        &self,
        interpreter: &Interpreter,
        script: &Path,
        options: &RunOptions,
        timeout: Duration,
    ) -> Invocation {
        let mut argv = vec![
            interpreter.program(&self.python_bin),
            script.display().to_string(),
        ];
        argv.extend(options.args.iter().cloned());

        let mut invocation = Invocation::argv(argv, timeout)
            .check_policy(self.check_policy)
            .echo(self.echo);
        for (key, value) in &options.env {
            invocation = invocation.env(key, value);
        }
        if let Some(dir) = &options.working_dir {
            invocation = invocation.working_dir(dir);
        }
        if let Some(log_file) = &options.log_file {
            invocation = invocation.log_file(log_file);
        } else if let Some(dir) = &self.exec_log_dir {
            let stem = script
                .file_stem()
                .map_or_else(|| "script".to_string(), |s| s.to_string_lossy().to_string());
            invocation = invocation.log_file(dir.join(format!("{stem}.log")));
        }
        invocation
    }

    /// Write `text` to an artifact and execute it.
    ///
    /// With `options.target_path` the artifact is kept there. Without it an
    /// ephemeral file is used and deleted before this returns, whatever the
    /// outcome.
    pub async fn run_source(
        &self,
        text: &str,
        interpreter: &Interpreter,
        timeout: Duration,
        options: &RunOptions,
    ) -> Result<ScriptRun> {
        let Some(path) = &options.target_path else {
            return self
                .run_ephemeral(text, interpreter, EPHEMERAL_PREFIX, timeout, options)
                .await;
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(io_error(parent))?;
        }
        tokio::fs::write(path, text).await.map_err(io_error(path))?;

        let result = self
            .runner
            .execute(self.invocation(interpreter, path, options, timeout))
            .await?;
        Ok(ScriptRun {
            result,
            artifact: ScriptArtifact {
                source: text.to_string(),
                path: path.clone(),
                task_id: None,
                interpreter: interpreter.clone(),
                persistent: true,
            },
        })
    }

    async fn run_ephemeral(
        &self,
        text: &str,
        interpreter: &Interpreter,
        prefix: &str,
        timeout: Duration,
        options: &RunOptions,
    ) -> Result<ScriptRun> {
        let suffix = format!(".{}", interpreter.extension());
        let temp_dir = std::env::temp_dir();
        // Removed on drop, which covers early returns and cancellation.
        let mut temp = tempfile::Builder::new()
            .prefix(prefix)
            .suffix(&suffix)
            .tempfile()
            .map_err(io_error(&temp_dir))?;
        temp.write_all(text.as_bytes())
            .map_err(io_error(temp.path()))?;
        temp.flush().map_err(io_error(temp.path()))?;
        let path = temp.path().to_path_buf();
        debug!(path = %path.display(), "created ephemeral artifact");

        let outcome = self
            .runner
            .execute(self.invocation(interpreter, &path, options, timeout))
            .await;

        if let Err(err) = temp.close() {
            debug!(path = %path.display(), error = %err, "failed to remove ephemeral artifact");
        }

        Ok(ScriptRun {
            result: outcome?,
            artifact: ScriptArtifact {
                source: text.to_string(),
                path,
                task_id: None,
                interpreter: interpreter.clone(),
                persistent: false,
            },
        })
    }

    /// Call the Python function `name` defined by `code` in a subprocess.
    ///
    /// `args` and `kwargs` must be JSON values; the return value must be JSON
    /// serializable. `memory_limit` caps the interpreter's address space
    /// (`RLIMIT_AS`) where the platform allows it. Exceptions raised by the
    /// function are reported in [`FunctionRun::error`], not as `Err`.
    pub async fn run_function(
        &self,
        code: &str,
        name: &str,
        args: &[Value],
        kwargs: &Map<String, Value>,
        timeout: Duration,
        memory_limit: Option<u64>,
    ) -> Result<FunctionRun> {
        if !is_identifier(name) {
            return Err(ScriptError::InvalidFunctionName(name.to_string()));
        }
        let wrapper = function_wrapper(code, name, args, kwargs, memory_limit)?;
        let run = self
            .run_ephemeral(
                &wrapper,
                &Interpreter::Python,
                FUNCTION_PREFIX,
                timeout,
                &RunOptions::default(),
            )
            .await?;

        let call = decode_function_report(run.result);
        if let Some(error) = &call.error {
            warn!(function = name, error = %error, "function call failed");
        }
        Ok(call)
    }

    /// Run an existing script file.
    ///
    /// The interpreter defaults to the one implied by the file extension.
    pub async fn run_file(
        &self,
        path: &Path,
        interpreter: Option<Interpreter>,
        timeout: Duration,
        args: &[String],
    ) -> Result<ExecutionResult> {
        if !path.is_file() {
            return Err(ScriptError::ArtifactNotFound(path.to_path_buf()));
        }
        let interpreter = interpreter
            .or_else(|| Interpreter::from_path(path))
            .unwrap_or_default();
        let options = RunOptions::default().args(args.iter().cloned());
        let result = self
            .runner
            .execute(self.invocation(&interpreter, path, &options, timeout))
            .await?;
        Ok(result)
    }

    /// Write `text` as a new archived artifact for `task_id`.
    ///
    /// The file lands at `<archive_root>/<task_id>/<stem>_<unix_ts>.<ext>`;
    /// a name already taken within the same second gets a `_<n>` suffix.
    /// Nothing is written for a task id that is not a single path component.
    pub fn archive(
        &self,
        text: &str,
        task_id: &Id,
        file_name: &str,
        interpreter: &Interpreter,
    ) -> Result<PathBuf> {
        let dir = archive_dir(&self.archive_root, task_id)
            .ok_or_else(|| ScriptError::InvalidTaskId(task_id.clone()))?;
        fs::create_dir_all(&dir).map_err(io_error(&dir))?;

        let timestamp = Utc::now().timestamp();
        let (path, mut file) = (0..MAX_ARCHIVE_COLLISIONS)
            .find_map(|collision| {
                let path = dir.join(archive_file_name(file_name, timestamp, collision));
                match OpenOptions::new().write(true).create_new(true).open(&path) {
                    Ok(file) => Some(Ok((path, file))),
                    Err(err) if err.kind() == io::ErrorKind::AlreadyExists => None,
                    Err(err) => Some(Err(io_error(&path)(err))),
                }
            })
            .unwrap_or_else(|| {
                Err(ScriptError::Io {
                    path: dir.clone(),
                    source: io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        "too many archives within one second",
                    ),
                })
            })?;

        file.write_all(text.as_bytes()).map_err(io_error(&path))?;
        file.sync_all().map_err(io_error(&path))?;

        let sha256 = checksum_bytes(text.as_bytes());
        info!(task_id = %task_id, path = %path.display(), "archived script");
        self.sink.emit(Event::ArtifactArchived {
            task_id: task_id.clone(),
            path: path.display().to_string(),
            sha256: sha256.clone(),
        });

        if let Some(index) = &self.index {
            let record = ArchiveRecord {
                task_id: task_id.clone(),
                path: path.display().to_string(),
                sha256,
                bytes: text.len() as u64,
                interpreter: interpreter.clone(),
                created_at: Utc::now(),
            };
            let key = index.keys.archive_index(task_id);
            let value = DurableStore::encode(&key, &record)?;
            index.store.append(&key, value)?;
        }

        Ok(path)
    }

    /// Archived records for a task, oldest first. Empty without an index.
    pub fn archived(&self, task_id: &Id) -> Result<Vec<ArchiveRecord>> {
        let Some(index) = &self.index else {
            return Ok(Vec::new());
        };
        match index.store.load_as(&index.keys.archive_index(task_id)) {
            Ok(records) => Ok(records),
            Err(err) if err.is_not_found() => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::runner::RunnerConfig;
    use cogloop_core::artifacts::compute_checksum;
    use cogloop_core::{EventType, MemorySink, Outcome};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn script_runner(root: &Path) -> (ScriptRunner, Arc<MemorySink>) {
        let sink = MemorySink::new();
        let runner = ProcessRunner::new(RunnerConfig::default(), sink.clone());
        let store = DurableStore::new(root, sink.clone());
        let script_runner = ScriptRunner::new(runner, root.join("archive"), sink.clone())
            .with_index(store, StoreKeys::default());
        (script_runner, sink)
    }

    #[tokio::test]
    async fn ephemeral_artifact_is_removed_after_success() {
        let dir = TempDir::new().unwrap();
        let (runner, _) = script_runner(dir.path());

        let run = runner
            .run_source(
                "echo hi",
                &Interpreter::Sh,
                Duration::from_secs(5),
                &RunOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(run.result.outcome, Outcome::Success);
        assert_eq!(run.result.stdout, "hi\n");
        assert!(!run.artifact.persistent);
        assert!(!run.artifact.path.exists());
        let name = run.artifact.path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with(EPHEMERAL_PREFIX));
        assert!(name.ends_with(".sh"));
    }

    #[tokio::test]
    async fn ephemeral_artifact_is_removed_after_failure_and_timeout() {
        let dir = TempDir::new().unwrap();
        let (runner, _) = script_runner(dir.path());

        let failed = runner
            .run_source(
                "exit 4",
                &Interpreter::Sh,
                Duration::from_secs(5),
                &RunOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(failed.result.outcome, Outcome::NonZeroExit(4));
        assert!(!failed.artifact.path.exists());

        let timed_out = runner
            .run_source(
                "sleep 10",
                &Interpreter::Sh,
                Duration::from_millis(300),
                &RunOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(timed_out.result.outcome, Outcome::TimedOut);
        assert!(!timed_out.artifact.path.exists());
    }

    #[tokio::test]
    async fn missing_interpreter_is_spawn_error_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        let (runner, _) = script_runner(dir.path());

        let run = runner
            .run_source(
                "print(1)",
                &Interpreter::Other("cogloop-no-such-interpreter".into()),
                Duration::from_secs(5),
                &RunOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(run.result.outcome, Outcome::SpawnError);
        assert!(!run.artifact.path.exists());
    }

    #[tokio::test]
    async fn target_path_is_kept() {
        let dir = TempDir::new().unwrap();
        let (runner, _) = script_runner(dir.path());
        let target = dir.path().join("work/nested/run.sh");

        let run = runner
            .run_source(
                "echo kept",
                &Interpreter::Sh,
                Duration::from_secs(5),
                &RunOptions::default().target_path(&target),
            )
            .await
            .unwrap();

        assert_eq!(run.result.stdout, "kept\n");
        assert!(run.artifact.persistent);
        assert_eq!(fs::read_to_string(&target).unwrap(), "echo kept");
    }

    #[tokio::test]
    async fn run_file_passes_args_and_infers_interpreter() {
        let dir = TempDir::new().unwrap();
        let (runner, _) = script_runner(dir.path());
        let script = dir.path().join("greet.sh");
        fs::write(&script, "echo \"hello $1\"\n").unwrap();

        let result = runner
            .run_file(&script, None, Duration::from_secs(5), &["world".to_string()])
            .await
            .unwrap();
        assert_eq!(result.outcome, Outcome::Success);
        assert_eq!(result.stdout, "hello world\n");
    }

    #[tokio::test]
    async fn run_file_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let (runner, sink) = script_runner(dir.path());

        let err = runner
            .run_file(&dir.path().join("nope.py"), None, Duration::from_secs(5), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ScriptError::ArtifactNotFound(_)));
        assert_eq!(sink.count(EventType::ExecutionStarted), 0);
    }

    #[tokio::test]
    async fn exec_log_dir_receives_output() {
        let dir = TempDir::new().unwrap();
        let (runner, _) = script_runner(dir.path());
        let runner = runner.exec_log_dir(dir.path().join("logs"));
        let script = dir.path().join("noisy.sh");
        fs::write(&script, "echo logged\n").unwrap();

        runner
            .run_file(&script, Some(Interpreter::Sh), Duration::from_secs(5), &[])
            .await
            .unwrap();
        let log = fs::read_to_string(dir.path().join("logs/noisy.log")).unwrap();
        assert_eq!(log, "logged\n");
    }

    #[test]
    fn archive_never_overwrites() {
        let dir = TempDir::new().unwrap();
        let (runner, sink) = script_runner(dir.path());
        let task_id = Id::from_string("task-7");

        let first = runner.archive("print('v1')\n", &task_id, "code.py", &Interpreter::Python).unwrap();
        let second = runner.archive("print('v2')\n", &task_id, "code.py", &Interpreter::Python).unwrap();

        assert_ne!(first, second);
        assert_eq!(first.parent(), Some(dir.path().join("archive/task-7").as_path()));
        assert_eq!(fs::read_to_string(&first).unwrap(), "print('v1')\n");
        assert_eq!(fs::read_to_string(&second).unwrap(), "print('v2')\n");
        assert_eq!(sink.count(EventType::ArtifactArchived), 2);

        let name = first.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("code_"));
        assert!(name.ends_with(".py"));
    }

    #[test]
    fn archive_index_records_checksums() {
        let dir = TempDir::new().unwrap();
        let (runner, _) = script_runner(dir.path());
        let task_id = Id::from_string("task-8");

        let path = runner.archive("echo one\n", &task_id, "step.sh", &Interpreter::Sh).unwrap();
        runner.archive("echo two\n", &task_id, "step.sh", &Interpreter::Sh).unwrap();

        let records = runner.archived(&task_id).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].path, path.display().to_string());
        assert_eq!(records[0].sha256, compute_checksum(&path).unwrap());
        assert_eq!(records[0].bytes, 9);
        assert_eq!(records[0].interpreter, Interpreter::Sh);
        assert!(runner.archived(&Id::from_string("other")).unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_source_applies_cwd_env_args_and_log_file() {
        let dir = TempDir::new().unwrap();
        let (runner, _) = script_runner(dir.path());
        let work = dir.path().join("work");
        fs::create_dir_all(&work).unwrap();
        let log = dir.path().join("logs/call.log");

        let options = RunOptions::default()
            .working_dir(&work)
            .env("COGLOOP_GREETING", "hello")
            .args(["first", "second"])
            .log_file(&log);
        let run = runner
            .run_source(
                "echo \"$COGLOOP_GREETING $1 $2\"; pwd",
                &Interpreter::Sh,
                Duration::from_secs(5),
                &options,
            )
            .await
            .unwrap();

        assert_eq!(run.result.outcome, Outcome::Success);
        let mut lines = run.result.stdout.lines();
        assert_eq!(lines.next(), Some("hello first second"));
        assert_eq!(
            PathBuf::from(lines.next().unwrap()).canonicalize().unwrap(),
            work.canonicalize().unwrap()
        );
        assert_eq!(fs::read_to_string(&log).unwrap(), run.result.stdout);
        assert!(!run.artifact.path.exists());
    }

    #[test]
    fn archive_rejects_task_ids_outside_the_root() {
        let dir = TempDir::new().unwrap();
        let (runner, sink) = script_runner(dir.path());

        let err = runner
            .archive("echo x", &Id::from_string("../../escaped"), "code.sh", &Interpreter::Sh)
            .unwrap_err();

        assert!(matches!(err, ScriptError::InvalidTaskId(_)));
        assert!(!dir.path().join("escaped").exists());
        assert!(!dir.path().parent().unwrap().join("escaped").exists());
        assert_eq!(sink.count(EventType::ArtifactArchived), 0);
    }

    #[test]
    fn archive_records_the_callers_interpreter() {
        let dir = TempDir::new().unwrap();
        let (runner, _) = script_runner(dir.path());
        let task_id = Id::from_string("task-js");

        runner
            .archive("console.log(1)\n", &task_id, "step.js", &Interpreter::from("node"))
            .unwrap();

        let records = runner.archived(&task_id).unwrap();
        assert_eq!(records[0].interpreter, Interpreter::Other("node".into()));
    }

    #[test]
    fn function_names_must_be_identifiers() {
        assert!(is_identifier("add"));
        assert!(is_identifier("_private2"));
        assert!(!is_identifier("2fast"));
        assert!(!is_identifier("f(); import os"));
        assert!(!is_identifier(""));
    }

    #[test]
    fn function_wrapper_embeds_arguments_as_json() {
        let kwargs = Map::from_iter([("scale".to_string(), serde_json::json!(true))]);
        let wrapper = function_wrapper(
            "def add(a, b, scale=False):\n    return a + b\n",
            "add",
            &[serde_json::json!("it's \"quoted\""), serde_json::json!(null)],
            &kwargs,
            Some(1024),
        )
        .unwrap();

        assert!(wrapper.contains("def add(a, b, scale=False):"));
        assert!(wrapper.contains("_cogloop_result = add(*_cogloop_call"));
        // The payload is a JSON string literal, so JSON true/null never reach
        // Python syntax directly.
        assert!(wrapper.contains(r#"json.loads("{\"args\":[\"it's \\\"quoted\\\"\",null]"#));
    }

    fn execution(outcome: Outcome, stdout: &str) -> ExecutionResult {
        let message = (!outcome.is_success()).then(|| "command failed with exit code 1".to_string());
        ExecutionResult {
            command: "python3 wrapper.py".into(),
            outcome,
            stdout: stdout.into(),
            stderr: String::new(),
            duration_ms: 1,
            timeout_ms: 1000,
            message,
        }
    }

    #[test]
    fn function_report_is_read_from_last_line() {
        let call = decode_function_report(execution(
            Outcome::Success,
            "chatty\n{\"success\": true, \"result\": [1, 2]}\n",
        ));
        assert!(call.is_success());
        assert_eq!(call.value, Some(serde_json::json!([1, 2])));

        let raised = decode_function_report(execution(
            Outcome::Success,
            "{\"success\": false, \"error\": \"boom\", \"traceback\": \"Traceback\"}\n",
        ));
        assert!(!raised.is_success());
        assert_eq!(raised.error.as_deref(), Some("boom"));
        assert_eq!(raised.traceback.as_deref(), Some("Traceback"));

        let garbled = decode_function_report(execution(Outcome::Success, "not json\n"));
        assert_eq!(
            garbled.error.as_deref(),
            Some("failed to parse function output as JSON")
        );

        let failed = decode_function_report(execution(Outcome::NonZeroExit(1), ""));
        assert_eq!(
            failed.error.as_deref(),
            Some("command failed with exit code 1")
        );
    }

    fn python_available() -> bool {
        std::process::Command::new("python3")
            .arg("--version")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .is_ok_and(|status| status.success())
    }

    #[tokio::test]
    async fn run_function_returns_json_value() {
        if !python_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let (runner, _) = script_runner(dir.path());
        let kwargs = Map::from_iter([("times".to_string(), serde_json::json!(3))]);

        let call = runner
            .run_function(
                "def repeat(word, times=1):\n    print('side output')\n    return [word] * times\n",
                "repeat",
                &[serde_json::json!("hi")],
                &kwargs,
                Duration::from_secs(10),
                Some(DEFAULT_FUNCTION_MEMORY_LIMIT),
            )
            .await
            .unwrap();

        assert!(call.is_success(), "{:?}", call.error);
        assert_eq!(call.value, Some(serde_json::json!(["hi", "hi", "hi"])));
    }

    #[tokio::test]
    async fn run_function_reports_exceptions() {
        if !python_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let (runner, _) = script_runner(dir.path());

        let call = runner
            .run_function(
                "def fail():\n    raise ValueError('bad input')\n",
                "fail",
                &[],
                &Map::new(),
                Duration::from_secs(10),
                None,
            )
            .await
            .unwrap();

        assert_eq!(call.result.outcome, Outcome::Success);
        assert_eq!(call.error.as_deref(), Some("bad input"));
        assert!(call.traceback.unwrap().contains("ValueError"));
    }

    #[tokio::test]
    async fn run_function_rejects_bad_names_without_spawning() {
        let dir = TempDir::new().unwrap();
        let (runner, sink) = script_runner(dir.path());

        let err = runner
            .run_function("", "x; import os", &[], &Map::new(), Duration::from_secs(5), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ScriptError::InvalidFunctionName(_)));
        assert_eq!(sink.count(EventType::ExecutionStarted), 0);
    }
}
