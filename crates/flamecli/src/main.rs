// crates/flamecli/src/main.rs

use anyhow::{Context, Result};
use clap::Parser;
use flameruntime::{ExecuteOptions, Metadata, RunStatus, Supervisor};
use std::path::PathBuf;

/// Flame executor of parametrized workflows
#[derive(Parser)]
#[command(name = "flame-execute")]
#[command(about = "Flame executor of parametrized workflows", long_about = None)]
struct Cli {
    /// File that defines the workflow (default workflow.json)
    #[arg(short, long, default_value = "workflow.json")]
    workflow: PathBuf,

    /// JSON file that resolves workflow parameters
    #[arg(short, long, default_value = "parameters.json")]
    parameters: PathBuf,

    /// Maximal execution time in s (0 = unbounded)
    #[arg(short = 't', long, default_value_t = 0)]
    max_execution_time: u64,

    /// Node status check interval in s
    #[arg(short = 'd', long, default_value_t = 1)]
    status_check_interval: u64,

    /// Metadata about the executed job as a JSON object: project prefix,
    /// runtime id, job eui, workflow eui, parameters eui, commit ids,
    /// job description
    #[arg(
        short,
        long,
        default_value = r#"{"project": "test_from_command_line", "job_description": "Flame execution from command line"}"#
    )]
    metadata: String,

    /// How long in seconds to wait for successful establishment of
    /// communication between nodes before timeout
    #[arg(short, long, default_value_t = 60)]
    connection_wait: u64,
}

fn init_logging(run_dir: &std::path::Path) -> Result<()> {
    use tracing_subscriber::EnvFilter;

    // stdout is reserved for the report line; everything else goes to the
    // log directory
    let log_dir = run_dir.join("entropylogs");
    std::fs::create_dir_all(&log_dir)?;
    let file = std::fs::File::create(log_dir.join("executor.log"))?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_ansi(false)
        .with_writer(std::sync::Arc::new(file))
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let run_dir = std::env::current_dir()?;
    init_logging(&run_dir)?;

    let metadata = Metadata::from_json_str(&cli.metadata).context("invalid --metadata")?;
    let mut opts = ExecuteOptions::new(cli.workflow, cli.parameters);
    opts.max_execution_time = cli.max_execution_time;
    opts.status_check_interval = cli.status_check_interval;
    opts.connection_wait = cli.connection_wait;
    opts.metadata = metadata;
    opts.run_dir = run_dir;

    let supervisor = Supervisor::new(opts)
        .await
        .context("failed to set up execution")?;

    // SIGINT/SIGTERM request a clean wind-down observed by the run loop
    let cancel = supervisor.cancel_token();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut terminate =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(signal) => signal,
                    Err(e) => {
                        tracing::warn!("Cannot install SIGTERM handler: {e}");
                        let _ = ctrl_c.await;
                        cancel.cancel();
                        return;
                    }
                };
            tokio::select! {
                _ = ctrl_c => {}
                _ = terminate.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        tracing::info!("Termination signal received");
        cancel.cancel();
    });

    let outcome = supervisor.execute().await?;
    println!("{}", serde_json::to_string(&outcome.report)?);

    if outcome.report.status != RunStatus::Success || outcome.archive_failed {
        std::process::exit(1);
    }
    Ok(())
}
