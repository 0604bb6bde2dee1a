use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tap_hotjar::commands::{discover, run_sync};
use tap_hotjar::{Config, SingerSink, SurveyCatalog, SurveyScheduler, SurveyStreamRunner};

/// Extract Hotjar survey responses as Singer records.
#[derive(Parser, Debug)]
#[command(name = "tap-hotjar", version, about)]
struct Cli {
    /// Path to the JSON config file
    #[arg(long)]
    config: PathBuf,

    /// Path to the survey catalog (overrides `catalog_path` from the config)
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Print the stream catalog and exit
    #[arg(long)]
    discover: bool,

    /// Only sync these streams (repeatable). Defaults to all.
    #[arg(long = "stream", value_name = "STREAM")]
    streams: Vec<String>,

    /// Emit log lines as JSON
    #[arg(long)]
    log_json: bool,
}

fn init_logging(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tap_hotjar=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    let config = Config::from_path(&cli.config)
        .map_err(|e| anyhow::anyhow!(e.operator_message()))
        .with_context(|| format!("Failed to load config {}", cli.config.display()))?;

    let catalog_path = cli
        .catalog
        .clone()
        .or_else(|| config.catalog_path.clone())
        .context("No catalog given: pass --catalog or set catalog_path in the config")?;
    let catalog = SurveyCatalog::from_path(&catalog_path)
        .map_err(|e| anyhow::anyhow!(e.operator_message()))?;

    if cli.discover {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        serde_json::to_writer_pretty(&mut out, &discover(&catalog))
            .context("Failed to write catalog")?;
        writeln!(out).context("Failed to write catalog")?;
        return Ok(ExitCode::SUCCESS);
    }

    let surveys = catalog
        .select(&cli.streams)
        .map_err(|e| anyhow::anyhow!(e.operator_message()))?;

    let cancel = CancellationToken::new();
    let ctrl_c_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("[SYNC] Interrupted, cancelling in-flight surveys");
            ctrl_c_token.cancel();
        }
    });

    let runner = SurveyStreamRunner::from_config(&config)
        .map_err(|e| anyhow::anyhow!(e.operator_message()))?
        .with_cancellation(cancel);
    let scheduler = SurveyScheduler::new(config.max_concurrent_surveys);

    let mut sink = SingerSink::new(io::stdout().lock());
    let summary = run_sync(&runner, &scheduler, surveys, &mut sink)
        .await
        .map_err(|e| anyhow::anyhow!(e.operator_message()))?;

    info!(
        "[SYNC] {} login(s) performed",
        runner.session().logins_performed()
    );

    if summary.is_success() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
