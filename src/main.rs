// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Maestro entry point.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::{info, Level};

use maestro::config::Config;
use maestro::orchestrator::Orchestrator;
use maestro::telemetry::{init_telemetry, TelemetryConfig};

/// Maestro - autonomous coding swarm orchestrator.
#[derive(Parser)]
#[command(name = "maestro")]
#[command(author, version, about = "Autonomous coding swarm orchestrator", long_about = None)]
struct Cli {
    /// The build request driving this run
    #[arg(short, long, env = "SWARM_REQUEST")]
    request: Option<String>,

    /// Read the build request from a file
    #[arg(long, conflicts_with = "request")]
    request_file: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Show debug output
    #[arg(short, long)]
    verbose: bool,

    /// Seconds to wait for an LLM endpoint to become ready
    #[arg(long, default_value_t = 180)]
    ready_timeout: u64,

    /// Skip the LLM readiness probe
    #[arg(long)]
    no_wait: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut telemetry = if cli.json_logs {
        TelemetryConfig::headless()
    } else {
        TelemetryConfig::default()
    };
    if cli.verbose {
        telemetry = telemetry.with_level(Level::DEBUG);
    }
    let _guard = init_telemetry(&telemetry)?;

    let request = match (&cli.request, &cli.request_file) {
        (Some(request), _) => request.clone(),
        (None, Some(path)) => std::fs::read_to_string(path)?,
        (None, None) => anyhow::bail!(
            "no build request; pass --request, --request-file, or set SWARM_REQUEST"
        ),
    };

    let config = Config::from_env()?;
    info!(
        repo = %config.git.repo_url,
        max_workers = config.worker.max_workers,
        strategy = %config.git.merge_strategy,
        "maestro {} starting",
        maestro::VERSION
    );

    let orchestrator = Orchestrator::new(config)?;

    if !cli.no_wait {
        orchestrator
            .llm()
            .wait_ready(Duration::from_secs(cli.ready_timeout))
            .await?;
    }

    tokio::select! {
        result = orchestrator.run(&request) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received");
            orchestrator.shutdown().await;
        }
    }

    Ok(())
}
