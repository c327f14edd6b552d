use anyhow::{anyhow, bail};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use drudge::control::{ControlClient, ControlClientOptions};
use drudge::drudge::{Drudge, DrudgeOptions};
use drudge::messaging::{ContextMap, TaskId, TaskSpec};
use drudge::pool::{WorkerPool, WorkerPoolOptions};
use drudge::scheduler::SchedulerOptions;
use drudge::store::{MemoryStore, SqliteStore, TaskStore};
use drudge::worker::{exec_child, WorkerRegistry};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio::net::UnixStream;

#[derive(Parser)]
#[command(name = "drudge", about = "Background task manager", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Clone)]
struct ConnectArgs {
    /// Path of the scheduler's control socket.
    #[arg(long, default_value = "drudge.sock")]
    socket: PathBuf,

    /// Shared secret expected by the scheduler.
    #[arg(long)]
    token: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler and its worker pool.
    Serve {
        #[command(flatten)]
        connect: ConnectArgs,

        /// Path of the task store database.
        #[arg(long, default_value = "drudge.db")]
        store: PathBuf,

        /// Keep tasks in memory instead of on disk.
        #[arg(long)]
        in_memory: bool,

        /// Sweep cadence in milliseconds.
        #[arg(long, default_value_t = 1000)]
        tick_ms: u64,
    },

    /// Inspect and manage tasks through a running scheduler.
    #[command(subcommand)]
    Task(TaskCommand),

    /// Read or extend the ambient worker context.
    #[command(subcommand)]
    Context(ContextCommand),

    /// Work with the registered worker table.
    #[command(subcommand)]
    Worker(WorkerCommand),

    /// Internal re-exec mode: the worker pool process.
    #[command(hide = true)]
    Pool,

    /// Internal re-exec mode: execute one worker function.
    #[command(hide = true)]
    Exec { worker: String },
}

#[derive(Subcommand)]
enum TaskCommand {
    /// Submit a task for a registered worker.
    Schedule {
        #[command(flatten)]
        connect: ConnectArgs,

        /// Worker to run.
        worker: String,

        /// JSON payload handed to the worker.
        #[arg(long, default_value = "null", value_parser = parse_json)]
        options: Value,

        /// Caller-chosen task id.
        #[arg(long)]
        id: Option<String>,

        /// RFC 3339 time before which the task will not run.
        #[arg(long, value_parser = parse_datetime)]
        start: Option<DateTime<Utc>>,

        /// Re-arm this many seconds after each completion.
        #[arg(long)]
        redo: Option<u64>,

        /// Seconds to keep the finished record before purging.
        #[arg(long)]
        expire: Option<u64>,
    },

    /// List every task in the store.
    List {
        #[command(flatten)]
        connect: ConnectArgs,
    },

    /// Cancel a task before it starts, or terminate it if running.
    Cancel {
        #[command(flatten)]
        connect: ConnectArgs,
        id: String,
    },

    /// Hard-kill a running task. Queued tasks are unaffected.
    Abort {
        #[command(flatten)]
        connect: ConnectArgs,
        id: String,
    },

    /// Delete every task record. The scheduler must be stopped.
    Flush {
        #[command(flatten)]
        connect: ConnectArgs,

        /// Path of the task store database.
        #[arg(long, default_value = "drudge.db")]
        store: PathBuf,
    },
}

#[derive(Subcommand)]
enum ContextCommand {
    /// Merge key=value pairs (values parsed as JSON when possible).
    Set {
        #[command(flatten)]
        connect: ConnectArgs,

        #[arg(required = true, value_parser = parse_pair)]
        pairs: Vec<(String, Value)>,
    },

    /// Print the current context.
    Get {
        #[command(flatten)]
        connect: ConnectArgs,
    },
}

#[derive(Subcommand)]
enum WorkerCommand {
    /// Run a worker in the foreground, bypassing the queue. Diagnostics.
    Run {
        /// Worker to run.
        worker: String,

        /// JSON payload handed to the worker.
        #[arg(long, default_value = "null", value_parser = parse_json)]
        options: Value,
    },

    /// Print the registered worker names.
    List,
}

/// Workers shipped with the binary; a real deployment registers its own
/// table here during bootstrap.
fn build_registry() -> WorkerRegistry {
    let mut registry = WorkerRegistry::new();

    registry.register("echo", 4, |options, _| Ok(options));

    registry.register("sleep", 1, |options, _| {
        let seconds = options.get("seconds").and_then(Value::as_f64).unwrap_or(1.0).max(0.0);
        std::thread::sleep(Duration::from_secs_f64(seconds));
        Ok(json!({ "slept": seconds }))
    });

    registry.register("fail", 2, |options, _| {
        let message =
            options.get("message").and_then(Value::as_str).unwrap_or("worker failed").to_owned();
        Err(anyhow!(message))
    });

    registry
}

fn client(connect: ConnectArgs) -> ControlClient {
    ControlClient::new(ControlClientOptions { socket_path: connect.socket, token: connect.token })
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    let registry = build_registry();

    match run(cli.command, registry).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("drudge: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command, registry: WorkerRegistry) -> Result<ExitCode, anyhow::Error> {
    match command {
        Command::Serve { connect, store, in_memory, tick_ms } => {
            let store: Box<dyn TaskStore> = if in_memory {
                Box::new(MemoryStore::new())
            } else {
                Box::new(SqliteStore::open(&store)?)
            };
            let options = DrudgeOptions {
                socket_path: connect.socket,
                token: connect.token,
                scheduler: SchedulerOptions {
                    tick_interval: Duration::from_millis(tick_ms.max(10)),
                    ..SchedulerOptions::default()
                },
                ..DrudgeOptions::default()
            };
            Drudge::new(options, store, registry).run().await?;
            Ok(ExitCode::SUCCESS)
        }

        Command::Pool => {
            WorkerPool::new(registry, WorkerPoolOptions::default()).run().await?;
            Ok(ExitCode::SUCCESS)
        }

        Command::Exec { worker } => {
            let code = exec_child(&registry, &worker).await;
            Ok(ExitCode::from(code as u8))
        }

        Command::Task(command) => task_command(command).await,
        Command::Context(command) => context_command(command).await,
        Command::Worker(command) => worker_command(command, registry),
    }
}

async fn task_command(command: TaskCommand) -> Result<ExitCode, anyhow::Error> {
    match command {
        TaskCommand::Schedule { connect, worker, options, id, start, redo, expire } => {
            let mut spec = TaskSpec::new(worker, options);
            spec.id = id.map(TaskId::new);
            spec.start_datetime = start;
            spec.redo_interval = redo;
            spec.expire = expire;

            let id = client(connect).submit(spec).await?;
            println!("{id}");
        }

        TaskCommand::List { connect } => {
            let tasks = client(connect).list().await?;
            println!(
                "{:<20} {:<12} {:<10} {:<32} OUTPUT",
                "ID", "WORKER", "STATUS", "STOPPED"
            );
            for task in tasks {
                let stopped =
                    task.stop_datetime.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".to_owned());
                let output = task.output.map(|o| o.to_string()).unwrap_or_else(|| "-".to_owned());
                println!(
                    "{:<20} {:<12} {:<10} {:<32} {}",
                    task.id, task.worker_name, task.status, stopped, output
                );
            }
        }

        TaskCommand::Cancel { connect, id } => {
            let applied = client(connect).cancel(TaskId::new(id)).await?;
            if !applied {
                println!("already canceled");
            }
        }

        TaskCommand::Abort { connect, id } => {
            client(connect).abort(TaskId::new(id)).await?;
        }

        TaskCommand::Flush { connect, store } => {
            if UnixStream::connect(&connect.socket).await.is_ok() {
                bail!(
                    "a scheduler is answering on {}; stop it before flushing",
                    connect.socket.display()
                );
            }
            let mut store = SqliteStore::open(&store)?;
            store.bootstrap()?;
            let flushed = store.flush()?;
            println!("{flushed} tasks deleted");
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn context_command(command: ContextCommand) -> Result<ExitCode, anyhow::Error> {
    let context = match command {
        ContextCommand::Set { connect, pairs } => {
            client(connect).set_context(pairs.into_iter().collect::<ContextMap>()).await?
        }
        ContextCommand::Get { connect } => client(connect).get_context().await?,
    };
    println!("{}", serde_json::to_string_pretty(&context)?);
    Ok(ExitCode::SUCCESS)
}

fn worker_command(command: WorkerCommand, registry: WorkerRegistry) -> Result<ExitCode, anyhow::Error> {
    match command {
        WorkerCommand::Run { worker, options } => {
            let output = registry.run(&worker, options, &ContextMap::new())?;
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        WorkerCommand::List => {
            for name in registry.names() {
                println!("{name}");
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn parse_json(raw: &str) -> Result<Value, serde_json::Error> {
    serde_json::from_str(raw)
}

fn parse_datetime(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

fn parse_pair(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw.split_once('=').ok_or_else(|| format!("expected key=value, got {raw:?}"))?;
    let value =
        serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_owned()));
    Ok((key.to_owned(), value))
}
