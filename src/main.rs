use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use batchloop::controller::{BatchOutcome, IterationController};
use batchloop::logging::{init_logging, LoggingConfig};
use batchloop::settings::BatchSettings;
use batchloop::store::{FileStore, StateStore};
use batchloop::task::CommandTask;
use batchloop::BatchError;

#[derive(Parser, Debug)]
#[command(name = "batchloop")]
#[command(version)]
#[command(about = "Run a command repeatedly with retries, skips and resumable state")]
struct Cli {
    /// Suppress all output except errors
    #[arg(long, short, global = true)]
    quiet: bool,

    /// Increase verbosity (-v, -vv)
    #[arg(long, short, action = ArgAction::Count, global = true, conflicts_with = "quiet")]
    verbose: u8,

    /// Omit timestamps from log lines
    #[arg(long, global = true)]
    no_log_time: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a new batch
    Run {
        /// Params for the first iteration (JSON object)
        #[arg(long, default_value = "{}")]
        params: String,

        #[command(flatten)]
        batch: BatchArgs,
    },
    /// Start a new batch from the params saved by the last attempt
    Resume {
        #[command(flatten)]
        batch: BatchArgs,
    },
    /// Print the params saved by the last attempt
    Show {
        #[command(flatten)]
        store: StoreArgs,
    },
}

#[derive(Args, Debug)]
struct StoreArgs {
    /// Settings file (TOML)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Directory holding the .batchloop state directory [default: current dir]
    #[arg(long, short = 'd')]
    state_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct BatchArgs {
    #[command(flatten)]
    store: StoreArgs,

    /// Successful iterations per batch (0 = unlimited)
    #[arg(long)]
    max_iterations: Option<u32>,

    /// Attempts per iteration before it counts as failed
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Delay between attempts, in milliseconds
    #[arg(long, value_name = "MS")]
    delay_ms: Option<u64>,

    /// Skip iterations that exhaust their attempts instead of stopping
    #[arg(long)]
    allow_fail: bool,

    /// Working directory for the command [default: current dir]
    #[arg(long, value_name = "DIR")]
    cwd: Option<PathBuf>,

    /// Command to run for every attempt
    #[arg(last = true, required = true, value_name = "COMMAND")]
    command: Vec<String>,
}

impl StoreArgs {
    fn settings(&self) -> Result<BatchSettings, Box<dyn std::error::Error>> {
        Ok(match &self.config {
            Some(path) => BatchSettings::load(path)?,
            None => BatchSettings::default(),
        })
    }

    fn open_store(&self) -> Result<FileStore, Box<dyn std::error::Error>> {
        let base = match &self.state_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()?,
        };
        Ok(FileStore::new(base)?)
    }
}

impl BatchArgs {
    fn settings(&self) -> Result<BatchSettings, Box<dyn std::error::Error>> {
        let mut settings = self.store.settings()?;
        if let Some(max) = self.max_iterations {
            settings.max_iterations = max;
        }
        if let Some(max) = self.max_attempts {
            settings.max_attempts = max;
        }
        if let Some(ms) = self.delay_ms {
            settings.delay_attempts_ms = ms;
        }
        if self.allow_fail {
            settings.allow_fail = true;
        }
        Ok(settings)
    }

    fn controller(&self) -> Result<IterationController, Box<dyn std::error::Error>> {
        let mut task = CommandTask::from_argv(&self.command).ok_or("no command given")?;
        if let Some(dir) = &self.cwd {
            task = task.with_working_dir(dir);
        }
        let controller = IterationController::builder(task)
            .settings(self.settings()?)
            .store(self.store.open_store()?)
            .build()?;

        let stop = controller.stop_handle();
        if let Err(e) = ctrlc::set_handler(move || stop.stop()) {
            tracing::warn!("could not install Ctrl+C handler: {}", e);
        }
        Ok(controller)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(
        LoggingConfig::from_flags(cli.verbose, cli.quiet).with_timestamps(!cli.no_log_time),
    );

    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> Result<ExitCode, Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Run { params, batch } => {
            let params: serde_json::Value = match serde_json::from_str(&params) {
                Ok(params) => params,
                Err(e) => {
                    eprintln!("invalid --params: {}", e);
                    return Ok(ExitCode::FAILURE);
                }
            };
            let controller = batch.controller()?;
            Ok(report(controller.start(params).await, cli.quiet))
        }
        Commands::Resume { batch } => {
            let controller = batch.controller()?;
            Ok(report(controller.resume().await, cli.quiet))
        }
        Commands::Show { store } => {
            let settings = store.settings()?;
            match store.open_store()?.get(&settings.state_key).await? {
                Some(raw) => {
                    println!("{}", raw);
                    Ok(ExitCode::SUCCESS)
                }
                None => {
                    if !cli.quiet {
                        eprintln!("no saved params under '{}'", settings.state_key);
                    }
                    Ok(ExitCode::FAILURE)
                }
            }
        }
    }
}

/// Print a one-line summary and map the outcome to an exit code.
fn report(result: Result<BatchOutcome, BatchError>, quiet: bool) -> ExitCode {
    match result {
        Ok(outcome) => {
            if !quiet {
                println!(
                    "{}: {} completed, {} failed",
                    if outcome.is_finished() {
                        "finished"
                    } else {
                        "aborted"
                    },
                    outcome.state.completed,
                    outcome.state.failed
                );
            }
            if outcome.is_finished() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
