use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use dupctl::core::{BackupMode, OutputChunk, RunError, StatusReport};
use dupctl::{config, context, logging};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Exit status used when the operation was interrupted, as a shell would report SIGINT.
const EXIT_CANCELLED: i32 = 130;

#[derive(Parser)]
#[command(name = "dupctl")]
#[command(about = "Run duplicity backups, restores and status queries", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (default: ./dupctl.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Print the duplicity command line(s) and exit without running them
    #[arg(long, global = true)]
    print_command: bool,

    /// Relay output on stdout only, wrapping stderr chunks in error sentinels
    #[arg(long, global = true)]
    tagged: bool,

    #[command(flatten)]
    overrides: Overrides,
}

#[derive(Subcommand)]
enum Commands {
    /// Back up the job path to the job URL
    Backup {
        /// Force a full backup instead of letting duplicity pick incremental
        #[arg(long)]
        full: bool,
    },
    /// Restore a single file or directory from the archive
    RestoreFile { source: String, dest: String },
    /// Restore the whole archive into a directory
    RestoreTree { dest: String },
    /// List files in the latest backup set
    List {
        #[arg(long)]
        json: bool,
    },
    /// Show chain times, set/volume counts and source statistics
    Status {
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Serialize)]
struct Overrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    duplicity_bin: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    verbosity: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    max_output_bytes: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true, num_args = 0..=1, default_missing_value = "true")]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true, num_args = 0..=1, default_missing_value = "true")]
    log_json: Option<bool>,

    #[command(flatten)]
    job: JobArgs,
}

#[derive(Args, Serialize)]
struct JobArgs {
    /// Source directory
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    path: Option<String>,

    /// Archive URL
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    url: Option<String>,

    /// Extra duplicity flags, e.g. --cli-options="--volsize 50"
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true, allow_hyphen_values = true)]
    cli_options: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = config::AppConfig::new(cli.config.as_deref(), Some(&cli.overrides))?;
    if config.job.passphrase.is_empty() {
        if let Ok(passphrase) = std::env::var("PASSPHRASE") {
            config.job.passphrase = passphrase;
        }
    }

    logging::init(config.log_config());
    let ctx = context::AppContext::new(config);

    if cli.print_command {
        return print_commands(&ctx, &cli.command);
    }

    let (tx, rx) = mpsc::unbounded_channel();
    ctx.runner.on_output(tx);
    let quiet_stdout = matches!(
        cli.command,
        Commands::List { json: true } | Commands::Status { json: true }
    );
    let relay = tokio::spawn(relay_output(rx, cli.tagged, quiet_stdout));

    // First Ctrl-C interrupts duplicity, the next one kills its process group.
    let interrupt = tokio::spawn({
        let runner = ctx.runner.clone();
        async move {
            let mut interrupted = false;
            while tokio::signal::ctrl_c().await.is_ok() {
                let stopping = if interrupted {
                    warn!("Interrupted again, killing duplicity");
                    runner.kill()
                } else {
                    runner.cancel()
                };
                if !stopping {
                    std::process::exit(EXIT_CANCELLED);
                }
                interrupted = true;
            }
        }
    });

    let result = run_command(&ctx, &cli.command).await;

    interrupt.abort();
    ctx.runner.clear_output();
    relay.await.context("Output relay task failed")?;

    match result {
        Ok(()) => Ok(()),
        Err(RunError::Cancelled) => {
            info!("Cancelled");
            std::process::exit(EXIT_CANCELLED);
        }
        Err(e) => {
            if let RunError::ProcessExit { stderr, .. } = &e {
                if !stderr.is_empty() {
                    error!(%stderr, "duplicity reported an error");
                }
            }
            Err(e).context("duplicity operation failed")
        }
    }
}

async fn run_command(ctx: &context::AppContext, command: &Commands) -> Result<(), RunError> {
    let job = &ctx.config.job;
    let runner = &ctx.runner;

    match command {
        Commands::Backup { full } => {
            let mode = if *full {
                BackupMode::Full
            } else {
                BackupMode::Incremental
            };
            runner.backup(job, mode).await
        }
        Commands::RestoreFile { source, dest } => runner.restore_file(job, source, dest).await,
        Commands::RestoreTree { dest } => runner.restore_tree(job, dest).await,
        Commands::List { json } => {
            let outcome = runner.get_files(job).await;
            if !outcome.is_failed() || !outcome.data.is_empty() {
                if *json {
                    print_json(&outcome.data);
                } else {
                    for entry in &outcome.data {
                        println!("{}", entry.path);
                    }
                }
            }
            outcome.into_result().map(drop)
        }
        Commands::Status { json } => {
            let outcome = runner.get_status(job).await;
            if !outcome.is_failed() || !outcome.data.is_empty() {
                if *json {
                    print_json(&outcome.data);
                } else {
                    print_status(&outcome.data);
                }
            }
            outcome.into_result().map(drop)
        }
    }
}

fn print_commands(ctx: &context::AppContext, command: &Commands) -> Result<()> {
    let job = &ctx.config.job;
    let builder = ctx.runner.commands();

    let invocations = match command {
        Commands::Backup { full: true } => vec![builder.backup(job, BackupMode::Full)?],
        Commands::Backup { full: false } => vec![builder.backup(job, BackupMode::Incremental)?],
        Commands::RestoreFile { source, dest } => vec![builder.restore_file(job, source, dest)?],
        Commands::RestoreTree { dest } => vec![builder.restore_tree(job, dest)?],
        Commands::List { .. } => vec![builder.list_current_files(job)?],
        Commands::Status { .. } => builder.status(job)?.to_vec(),
    };

    for invocation in invocations {
        println!("{invocation}");
    }
    Ok(())
}

async fn relay_output(mut rx: mpsc::UnboundedReceiver<OutputChunk>, tagged: bool, quiet_stdout: bool) {
    while let Some(chunk) = rx.recv().await {
        if tagged && !quiet_stdout {
            print!("{}", chunk.tagged());
        } else if chunk.is_error() || quiet_stdout {
            eprint!("{}", chunk.text);
        } else {
            print!("{}", chunk.text);
        }
    }
    if let Err(e) = std::io::stdout().flush() {
        warn!(error = %e, "Failed to flush relayed output");
    }
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{json}"),
        Err(e) => error!(error = %e, "Failed to serialize output"),
    }
}

fn print_status(report: &StatusReport) {
    let rows = [
        ("Chain start time", &report.chain_start_time),
        ("Chain end time", &report.chain_end_time),
        ("Backup sets", &report.backup_sets),
        ("Backup volumes", &report.backup_volumes),
        ("Source files", &report.source_files),
        ("Source file size", &report.source_file_size),
    ];
    for (label, value) in rows {
        let value = if value.is_empty() { "-" } else { value.as_str() };
        println!("{label:<18}{value}");
    }
}
