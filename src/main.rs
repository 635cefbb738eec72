use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::engine::{ArgValueCompleter, CompletionCandidate};

mod config;
mod control;
mod error;
mod id;
mod job;
mod lock;
mod machine;
mod paths;
mod queue;
mod store;
mod worker;

use job::{Job, JobState};

#[derive(Parser)]
#[command(
    name = "queuectl",
    about = "A background job queue for shell commands",
    version
)]
struct Cli {
    #[arg(long, global = true, env = "QUEUECTL_DEBUG")]
    debug: bool,

    /// Directory holding the job store, config and runtime files
    #[arg(long, global = true, env = "QUEUECTL_HOME")]
    home: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Add a shell command to the queue and print its job id
    Enqueue {
        /// Command to run (joined with spaces, executed via `sh -c`)
        #[arg(required = true, num_args = 1..)]
        command: Vec<String>,

        /// Retry budget for this job (defaults to config max_retries)
        #[arg(long)]
        max_retries: Option<u32>,
    },

    /// List jobs in one state
    #[command(alias = "ls")]
    List {
        /// State to list
        #[arg(long, default_value = "pending")]
        state: JobState,

        /// Output format
        #[arg(long, default_value = "human")]
        format: OutputFormat,
    },

    /// Show job counts per state
    Status {
        /// Output format
        #[arg(long, default_value = "human")]
        format: OutputFormat,
    },

    /// Manage workers
    Worker {
        #[command(subcommand)]
        command: WorkerCommand,
    },

    /// Inspect and retry the dead letter queue
    Dlq {
        #[command(subcommand)]
        command: DlqCommand,
    },

    /// Inspect and update queue configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },

    /// Print the output captured from a job's latest attempt
    Logs {
        /// Job ID
        #[arg(add = ArgValueCompleter::new(complete_job_ids))]
        id: id::JobId,
    },

    /// Print version information
    Version,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::aot::Shell,
    },
}

#[derive(Clone, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Plain,
    Json,
}

#[derive(Subcommand)]
enum WorkerCommand {
    /// Start worker processes and wait for them to exit
    Start {
        /// Number of worker processes
        #[arg(long, default_value_t = 1)]
        count: usize,
    },

    /// Ask all workers to stop after their current job
    Stop,

    /// Run a single worker in this process
    #[command(hide = true)]
    Run {
        /// Worker id (random if not given)
        #[arg(long)]
        id: Option<String>,
    },
}

#[derive(Subcommand)]
enum DlqCommand {
    /// List dead jobs
    #[command(alias = "ls")]
    List {
        /// Print JSON
        #[arg(long)]
        json: bool,
    },

    /// Move a dead job back to pending with a fresh retry budget
    Retry {
        /// Job ID
        #[arg(add = ArgValueCompleter::new(complete_job_ids))]
        id: id::JobId,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Print configuration (all keys, or one)
    Get {
        /// Key to print
        key: Option<String>,
    },

    /// Update one configuration key
    Set {
        /// One of max_retries, backoff_base, poll_interval_ms, job_timeout_ms
        key: String,

        /// New value
        value: String,
    },
}

#[tokio::main]
async fn main() {
    clap_complete::env::CompleteEnv::with_factory(Cli::command).complete();

    if let Err(e) = run().await {
        eprintln!("\x1b[1;31merror:\x1b[0m {e}");

        // Print the chain of causes, if any.
        let mut source = e.source();
        while let Some(cause) = source {
            eprintln!("  \x1b[1;31mcaused by:\x1b[0m {cause}");
            source = std::error::Error::source(cause);
        }

        std::process::exit(1);
    }
}

fn complete_job_ids(current: &std::ffi::OsStr) -> Vec<CompletionCandidate> {
    let current = current.to_str().unwrap_or_default();
    let Ok(layout) = paths::Layout::resolve(None) else {
        return Vec::new();
    };

    queue::Queue::open(&layout)
        .job_ids()
        .unwrap_or_default()
        .into_iter()
        .filter(|(id, _)| id.as_str().starts_with(current))
        .map(|(id, state)| CompletionCandidate::new(id.to_string()).help(Some(state.as_str().into())))
        .collect()
}

fn print_jobs(jobs: &[Job], format: &OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Human => {
            if jobs.is_empty() {
                return Ok(());
            }
            println!(
                "{:<22}  {:<10}  {:<8}  {:<20}  COMMAND",
                "ID", "STATE", "ATTEMPTS", "NEXT RUN"
            );
            for j in jobs {
                let next = j
                    .next_run_at
                    .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<22}  {:<10}  {:<8}  {:<20}  {}",
                    j.id,
                    j.state,
                    format!("{}/{}", j.attempts, j.max_retries + 1),
                    next,
                    j.command
                );
            }
        }
        OutputFormat::Plain => {
            for j in jobs {
                println!("{}\t{}\t{}\t{}", j.id, j.state, j.attempts, j.command);
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string(jobs)?);
        }
    }
    Ok(())
}

fn first_line(text: Option<&str>) -> &str {
    text.and_then(|t| t.lines().next()).unwrap_or("-")
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let is_worker = matches!(
        cli.command,
        Some(Command::Worker {
            command: WorkerCommand::Start { .. } | WorkerCommand::Run { .. }
        })
    );

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(if cli.debug {
            tracing::Level::DEBUG
        } else if is_worker {
            tracing::Level::INFO
        } else {
            tracing::Level::WARN
        })
        .init();

    let layout = paths::Layout::resolve(cli.home.clone())?;
    layout.ensure_dirs()?;
    let queue = queue::Queue::open(&layout);

    let Some(command) = cli.command else {
        return Ok(());
    };

    match command {
        Command::Enqueue {
            command,
            max_retries,
        } => {
            let job = queue.enqueue(&command.join(" "), max_retries)?;
            println!("{}", job.id);
        }
        Command::List { state, format } => {
            let jobs = queue.list_by_state(state)?;
            print_jobs(&jobs, &format)?;
        }
        Command::Status { format } => {
            let summary = queue.summary()?;
            let stopping = control::StopSignal::new(&layout).is_requested();
            match format {
                OutputFormat::Human => {
                    for state in JobState::ALL {
                        println!("{:<12}{}", state, summary.counts.get(state));
                    }
                    println!("{:<12}{}", "dlq", summary.dlq);
                    if stopping {
                        println!("\nstop requested; workers exit after their current job");
                    } else {
                        println!("\nno stop requested");
                    }
                }
                OutputFormat::Plain => {
                    for state in JobState::ALL {
                        println!("{}\t{}", state, summary.counts.get(state));
                    }
                    println!("dlq\t{}", summary.dlq);
                    println!("stop_requested\t{stopping}");
                }
                OutputFormat::Json => {
                    let mut value = serde_json::to_value(&summary)?;
                    value["stop_requested"] = serde_json::Value::Bool(stopping);
                    println!("{value}");
                }
            }
        }
        Command::Worker { command } => match command {
            WorkerCommand::Start { count } => {
                worker::start_pool(&layout, cli.home, cli.debug, count).await?;
            }
            WorkerCommand::Stop => {
                control::StopSignal::new(&layout).request()?;
                println!("stop requested; workers exit after their current job");
            }
            WorkerCommand::Run { id } => {
                let id = id.unwrap_or_else(worker::default_worker_id);
                let shutdown = worker::shutdown_signal().await?;
                worker::Worker::new(id, &layout).run(shutdown).await?;
            }
        },
        Command::Dlq { command } => match command {
            DlqCommand::List { json } => {
                let entries = queue.dlq()?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&entries)?);
                } else if !entries.is_empty() {
                    println!("{:<22}  {:<20}  {:<30}  LAST ERROR", "ID", "MOVED AT", "COMMAND");
                    for e in &entries {
                        println!(
                            "{:<22}  {:<20}  {:<30}  {}",
                            e.id,
                            e.moved_at.format("%Y-%m-%d %H:%M:%S"),
                            e.command,
                            first_line(e.last_error.as_deref())
                        );
                    }
                }
            }
            DlqCommand::Retry { id } => {
                let job = queue.requeue_from_dead(&id)?;
                println!("job {} moved back to pending", job.id);
            }
        },
        Command::Config { command } => match command {
            ConfigCommand::Get { key } => {
                let config = queue.config()?;
                match key {
                    Some(key) => println!("{}", config.get(&key)?),
                    None => {
                        for (key, value) in config.entries() {
                            println!("{key} = {value}");
                        }
                    }
                }
            }
            ConfigCommand::Set { key, value } => {
                let config = queue.set_config(&key, &value)?;
                println!("{key} = {}", config.get(&key)?);
            }
        },
        Command::Logs { id } => {
            let log_path = layout.job_log_path(id.as_str());
            if !log_path.exists() {
                anyhow::bail!("no logs found for job {id}");
            }
            let contents = std::fs::read_to_string(&log_path)?;
            print!("{contents}");
        }
        Command::Version => {
            println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        }
        Command::Completions { shell } => {
            let status = std::process::Command::new(std::env::current_exe()?)
                .env("COMPLETE", shell.to_string())
                .status()?;
            std::process::exit(status.code().unwrap_or(1));
        }
    }

    Ok(())
}
