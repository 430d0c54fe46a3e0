//! cogloop - command-line front end for the execution engine.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use clap::{Parser, Subcommand};
use cogloop::{policy, CommandLine, Engine, Invocation};
use cogloop_core::{Config, Id, Interpreter, TaskRecord, TracingSink};
use eyre::{eyre, Result, WrapErr};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::{fmt, EnvFilter};

/// Sandboxed execution engine with a durable task queue.
#[derive(Parser)]
#[command(name = "cogloop", version)]
struct Cli {
    /// Config file path (overrides .cogloop/config)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Workspace root that relative config paths resolve against
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Execution timeout in seconds (overrides exec_timeout_sec)
    #[arg(long, global = true)]
    timeout: Option<u32>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Test a command against the deny-list without running it
    Check {
        command: String,
    },

    /// Run a command; a single argument runs through `sh -c`
    Exec {
        /// Working directory for the child
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Text written to the child's stdin
        #[arg(long)]
        input: Option<String>,

        /// Skip the deny-list check
        #[arg(long)]
        no_policy: bool,

        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Run a script file
    Run {
        path: PathBuf,

        /// python, bash, sh or a program name (default: from extension)
        #[arg(long)]
        interpreter: Option<String>,

        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Copy a script into the archive for a task
    Archive {
        path: PathBuf,

        #[arg(long)]
        task: String,

        /// Base file name (default: the script's own name)
        #[arg(long)]
        name: Option<String>,

        /// Interpreter recorded in the archive index (default: from extension)
        #[arg(long)]
        interpreter: Option<String>,
    },

    /// Inspect and drive the task queue
    Queue {
        #[command(subcommand)]
        command: QueueCommand,
    },

    /// Read store documents
    Store {
        #[command(subcommand)]
        command: StoreCommand,
    },
}

#[derive(Subcommand)]
enum QueueCommand {
    /// Add a task
    Push {
        title: String,

        /// Lower runs first (default: default_priority)
        #[arg(long)]
        priority: Option<i32>,

        /// Script to attach as the task's source
        #[arg(long)]
        source: Option<PathBuf>,

        #[arg(long)]
        interpreter: Option<String>,

        #[arg(long)]
        max_attempts: Option<u32>,
    },

    /// Remove and print the most urgent task
    Pop {
        /// Hold the queue lock across the whole pop
        #[arg(long)]
        exclusive: bool,
    },

    /// Print queued tasks in dequeue order
    List,

    /// Dequeue the most urgent task and run its source
    Work,
}

#[derive(Subcommand)]
enum StoreCommand {
    /// Print a document
    Get { key: String },
}

fn load_config(cli: &Cli) -> Result<Config> {
    let root = match &cli.root {
        Some(root) => root.clone(),
        None => std::env::current_dir().wrap_err("failed to resolve working directory")?,
    };
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)
            .wrap_err_with(|| format!("failed to load config {}", path.display()))?,
        None => Config::discover(&root)?,
    };
    if let Some(timeout) = cli.timeout {
        if timeout == 0 {
            return Err(eyre!("--timeout must be greater than zero"));
        }
        config.exec_timeout_sec = timeout;
    }
    config.resolve_paths(&root);
    Ok(config)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn read_source(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).wrap_err_with(|| format!("failed to read {}", path.display()))
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Initialize tracing.
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&cli)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("failed to create tokio runtime")?;

    runtime.block_on(run(cli.command, config))
}

async fn run(command: Command, config: Config) -> Result<ExitCode> {
    let engine = Engine::new(config, TracingSink::shared());
    let timeout = engine.config().exec_timeout();

    match command {
        Command::Check { command } => {
            let rule = policy::check(&command);
            print_json(&serde_json::json!({
                "command": command,
                "dangerous": rule.is_some(),
                "rule": rule,
            }))?;
            Ok(exit_code(rule.is_none()))
        }

        Command::Exec {
            cwd,
            input,
            no_policy,
            mut command,
        } => {
            let command_line = if command.len() == 1 {
                CommandLine::Shell(command.remove(0))
            } else {
                CommandLine::Argv(command)
            };
            let mut invocation = Invocation::new(command_line, timeout)
                .check_policy(engine.config().check_dangerous && !no_policy)
                .echo(engine.config().echo_output);
            if let Some(cwd) = cwd {
                invocation = invocation.working_dir(cwd);
            }
            if let Some(dir) = &engine.config().exec_log_dir {
                let name = format!("exec_{}.log", chrono::Utc::now().timestamp_millis());
                invocation = invocation.log_file(dir.join(name));
            }

            let result = match input {
                Some(input) => {
                    engine
                        .runner()
                        .execute_interactive(invocation, input)
                        .await?
                }
                None => engine.runner().execute(invocation).await?,
            };
            print_json(&result)?;
            Ok(exit_code(result.is_success()))
        }

        Command::Run {
            path,
            interpreter,
            args,
        } => {
            let interpreter = interpreter.map(Interpreter::from);
            let result = engine
                .scripts()
                .run_file(&path, interpreter, timeout, &args)
                .await?;
            print_json(&result)?;
            Ok(exit_code(result.is_success()))
        }

        Command::Archive {
            path,
            task,
            name,
            interpreter,
        } => {
            let interpreter = interpreter
                .map(Interpreter::from)
                .or_else(|| Interpreter::from_path(&path))
                .ok_or_else(|| {
                    eyre!("cannot infer interpreter for {}; pass --interpreter", path.display())
                })?;
            let source = read_source(&path)?;
            let file_name = match name {
                Some(name) => name,
                None => path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .ok_or_else(|| eyre!("{} has no file name", path.display()))?,
            };
            let task_id = Id::from_string(task);
            let archived = engine
                .scripts()
                .archive(&source, &task_id, &file_name, &interpreter)?;
            print_json(&serde_json::json!({
                "task_id": task_id,
                "path": archived,
            }))?;
            Ok(ExitCode::SUCCESS)
        }

        Command::Queue { command } => run_queue(&engine, command).await,

        Command::Store {
            command: StoreCommand::Get { key },
        } => {
            let document = engine.store().load(&key, None)?;
            print_json(&document)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_queue(engine: &Engine, command: QueueCommand) -> Result<ExitCode> {
    match command {
        QueueCommand::Push {
            title,
            priority,
            source,
            interpreter,
            max_attempts,
        } => {
            let mut task = TaskRecord::new(title)
                .max_attempts(max_attempts.unwrap_or(engine.config().max_attempts));
            if let Some(path) = &source {
                task.source = Some(read_source(path)?);
                if let Some(inferred) = Interpreter::from_path(path) {
                    task.interpreter = inferred;
                }
            }
            if let Some(interpreter) = interpreter {
                task.interpreter = Interpreter::from(interpreter);
            }
            let entry = engine.submit(task, priority)?;
            print_json(&entry)?;
            Ok(ExitCode::SUCCESS)
        }

        QueueCommand::Pop { exclusive } => {
            let entry = if exclusive {
                engine.queue().dequeue_exclusive()?
            } else {
                engine.queue().dequeue()?
            };
            print_json(&entry)?;
            Ok(exit_code(entry.is_some()))
        }

        QueueCommand::List => {
            print_json(&engine.queue().entries()?)?;
            Ok(ExitCode::SUCCESS)
        }

        QueueCommand::Work => match engine.run_next().await? {
            Some(run) => {
                print_json(&run)?;
                Ok(exit_code(run.result.is_success()))
            }
            None => {
                tracing::info!("queue is empty");
                Ok(ExitCode::SUCCESS)
            }
        },
    }
}
