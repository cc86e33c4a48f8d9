use clap::Parser;
use colored::*;
use eyre::{Context, Result, eyre};
use log::{info, warn};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use batchwise::cli::Cli;
use batchwise::cli::commands::{Commands, EngineArgs};
use batchwise::client::{OpenAiClient, OperationRegistry, StubInvocable};
use batchwise::config::{ApiConfig, Config, EngineConfig};
use batchwise::engine::{
    Batch, EngineState, Job, ProgressSnapshot, ResultRow, ResultSet, RunStatus, StopHandle, callback, run_sharded,
};
use tokio::io::AsyncBufReadExt;
use tokio::task::JoinHandle;

/// Token cost charged by the dry-run stub per call.
const DRY_RUN_TOKENS: u64 = 50;

fn setup_logging() -> Result<()> {
    // Create log directory
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("batchwise")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("batchwise.log");

    // Setup env_logger with file output
    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

/// `batchwise.log` -> `batchwise-2.log` for the second of several engines.
fn shard_log_path(path: &Path, shard: usize) -> PathBuf {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("batchwise");
    let name = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{}-{}.{}", stem, shard, ext),
        None => format!("{}-{}", stem, shard),
    };
    path.with_file_name(name)
}

/// One engine per Azure deployment, otherwise a single OpenAI (or stub) engine.
fn build_batches(engine: &EngineConfig, api: &ApiConfig, dry_run: bool) -> Result<Vec<Batch>> {
    let registries: Vec<OperationRegistry> = if dry_run {
        info!("Dry run: answering every call with a {}-token stub", DRY_RUN_TOKENS);
        vec![StubInvocable::new(DRY_RUN_TOKENS).into_registry()]
    } else if !api.azure.is_empty() {
        api.azure
            .iter()
            .map(|azure| {
                let azure = azure.clone().or_env();
                info!("Using Azure deployment: {}", azure);
                OpenAiClient::azure(&azure).map(OpenAiClient::into_registry)
            })
            .collect::<batchwise::Result<_>>()
            .context("Failed to configure Azure clients")?
    } else {
        let client = OpenAiClient::from_env_var(&api.api_key_env, &api.base_url)
            .context("Failed to configure OpenAI client")?;
        vec![client.into_registry()]
    };

    let sharded = registries.len() > 1;
    registries
        .into_iter()
        .enumerate()
        .map(|(i, registry)| {
            let mut config = engine.clone();
            if sharded {
                config.log_path = config.log_path.as_deref().map(|p| shard_log_path(p, i + 1));
            }
            Batch::new(config, registry).context("Invalid engine configuration")
        })
        .collect()
}

/// Stop every engine with exit code 1 on Ctrl-C.
fn watch_interrupt(handles: Vec<StopHandle>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!();
            eprintln!("{}", "Interrupted, stopping...".yellow());
            for handle in &handles {
                handle.stop(1);
            }
        }
    })
}

fn render_progress(label: &str, p: &ProgressSnapshot) -> String {
    let status = match p.status {
        RunStatus::Running => p.status.to_string().green(),
        RunStatus::Waiting => p.status.to_string().yellow(),
        RunStatus::Done => p.status.to_string().cyan(),
        RunStatus::Stopped => p.status.to_string().red(),
    };
    format!(
        "{}{:>8} {}/{} ({:.0}%) | {:.0}/{} rpm | {:.0}/{} tpm",
        label,
        status,
        p.completed,
        p.queued,
        p.fraction() * 100.0,
        p.current_rpm,
        p.rpm_limit,
        p.current_tpm,
        p.tpm_limit
    )
}

/// Print progress snapshots to stderr as they are published.
fn spawn_progress(batches: &[Batch]) -> Vec<JoinHandle<()>> {
    let sharded = batches.len() > 1;
    batches
        .iter()
        .enumerate()
        .map(|(i, batch)| {
            let mut rx = batch.progress();
            let label = if sharded { format!("[{}] ", i + 1) } else { String::new() };
            tokio::spawn(async move {
                while rx.changed().await.is_ok() {
                    let snapshot = rx.borrow_and_update().clone();
                    if snapshot.state == EngineState::Idle {
                        continue;
                    }
                    eprintln!("{}", render_progress(&label, &snapshot));
                }
            })
        })
        .collect()
}

fn print_summary(results: &ResultSet, output: &Path) {
    let summary = results.summary();
    let headline = if summary.exit_code == 0 {
        "Done:".green()
    } else {
        "Stopped:".red()
    };
    println!(
        "{} {} of {} requests succeeded, {} tokens used",
        headline, summary.succeeded, summary.queued, summary.tokens
    );
    if summary.timed_out > 0 || summary.failed > 0 {
        println!(
            "  {} timed out, {} failed (dropped)",
            summary.timed_out.to_string().yellow(),
            summary.failed.to_string().red()
        );
    }
    println!("  Results written to {}", output.display());
}

async fn run_command(input: &Path, output: &Path, engine: &EngineConfig, api: &ApiConfig, args: &EngineArgs) -> Result<i32> {
    let jobs = Job::read_jsonl(input).context(format!("Failed to read jobs from {}", input.display()))?;
    info!("Loaded {} jobs from {}", jobs.len(), input.display());

    let batches = build_batches(engine, api, args.dry_run)?;
    let interrupt = watch_interrupt(batches.iter().map(Batch::stop_handle).collect());
    let renderers = if engine.log_verbosity > 0 {
        spawn_progress(&batches)
    } else {
        Vec::new()
    };

    let results = run_sharded(&batches, jobs).await.context("Batch run failed")?;
    interrupt.abort();
    for renderer in renderers {
        renderer.abort();
    }

    results
        .write_jsonl(output)
        .context(format!("Failed to write results to {}", output.display()))?;
    print_summary(&results, output);
    Ok(results.summary().exit_code)
}

/// Feed stdin lines to the engine; on EOF wait for the engine to go idle,
/// then stop it cleanly.
async fn feed_stdin(batch: Arc<Batch>) {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => match serde_json::from_str::<Job>(&line) {
                Ok(job) => {
                    if let Err(e) = batch.add_job(job).await {
                        warn!("Skipping job: {}", e);
                    }
                }
                Err(e) => warn!("Skipping malformed job line: {}", e),
            },
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read stdin: {}", e);
                break;
            }
        }
    }

    info!("End of input, waiting for in-flight requests");
    while batch.state() != EngineState::Listening || !batch.is_idle() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    batch.stop(0);
}

async fn listen_command(output: &Path, engine: &EngineConfig, api: &ApiConfig, args: &EngineArgs) -> Result<i32> {
    let batches = build_batches(engine, api, args.dry_run)?;
    if batches.len() > 1 {
        warn!("Listening uses only the first of {} configured engines", batches.len());
    }
    let batch = Arc::new(batches.into_iter().next().ok_or_else(|| eyre!("No engine configured"))?);

    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(output)
        .context(format!("Failed to open {}", output.display()))?;
    let sink = Arc::new(Mutex::new(file));
    let on_row = callback(move |row: ResultRow| {
        let sink = sink.clone();
        async move {
            let line = match serde_json::to_string(&row) {
                Ok(line) => line,
                Err(e) => {
                    warn!("Failed to serialize row: {}", e);
                    return;
                }
            };
            let mut file = sink.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(e) = writeln!(file, "{}", line) {
                warn!("Failed to write row: {}", e);
            }
        }
    });

    let interrupt = watch_interrupt(vec![batch.stop_handle()]);
    let renderers = if engine.log_verbosity > 0 {
        spawn_progress(std::slice::from_ref(batch.as_ref()))
    } else {
        Vec::new()
    };
    let reader = tokio::spawn(feed_stdin(batch.clone()));

    let results = batch.listen(Some(on_row)).await.context("Listening failed")?;
    reader.abort();
    interrupt.abort();
    for renderer in renderers {
        renderer.abort();
    }

    print_summary(&results, output);
    Ok(results.summary().exit_code)
}

async fn run_application(cli: &Cli, config: &Config) -> Result<i32> {
    info!("Starting application");

    if cli.is_verbose() {
        println!("{}", "Verbose mode enabled".yellow());
    }

    let engine = cli.command.engine().apply(config.engine.clone());
    match &cli.command {
        Commands::Run { input, output, engine: args } => run_command(input, output, &engine, &config.api, args).await,
        Commands::Listen { output, engine: args } => listen_command(output, &engine, &config.api, args).await,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Setup logging first
    setup_logging().context("Failed to setup logging")?;

    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    info!("Starting with config from: {:?}", cli.config);

    // Run the main application logic
    let exit_code = run_application(&cli, &config).await.context("Application failed")?;
    if exit_code != 0 {
        std::process::exit(exit_code);
    }

    Ok(())
}
