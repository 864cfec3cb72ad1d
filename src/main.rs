//! tripflow command line entry point

use clap::{Parser, Subcommand};
use futures::StreamExt;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tripflow::agent::PromptAgentFactory;
use tripflow::config::PipelineConfig;
use tripflow::observability::{
    init_default_logging, init_logging, metrics, HealthServer, LogFormat, ObserverHandle,
    TracingObserver,
};
use tripflow::pipeline::{Session, SessionStore, WorkflowState};
use tripflow::registry::{spawn_health_probes, ProviderRegistry};

/// Staged LLM agent pipeline for travel itineraries
#[derive(Parser)]
#[command(name = "tripflow")]
#[command(about = "Run the four-stage travel planning pipeline")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace); overrides LOG_LEVEL
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one session and stream its snapshots as JSON lines
    Run {
        /// Request payload as inline JSON
        #[arg(long, conflicts_with = "request_file", required_unless_present = "request_file")]
        request: Option<String>,

        /// Read the request payload from a JSON file
        #[arg(long, value_name = "FILE")]
        request_file: Option<PathBuf>,

        /// Print one progress line per snapshot instead of full JSON
        #[arg(long)]
        summary: bool,

        /// Serve health and metrics endpoints on this port during the run
        #[arg(long)]
        health_port: Option<u16>,
    },
    /// Show configured providers
    Providers {
        /// Probe every provider once before printing
        #[arg(long)]
        probe: bool,
    },
    /// Validate the configuration
    Config {
        /// Print the parsed configuration
        #[arg(long)]
        show: bool,
    },
}

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.verbose {
        0 => init_default_logging(),
        1 => init_logging(tracing::Level::DEBUG, log_format(), false),
        _ => init_logging(tracing::Level::TRACE, log_format(), true),
    };

    let config = match PipelineConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            process::exit(2);
        }
    };

    let result = match cli.command {
        Commands::Run {
            request,
            request_file,
            summary,
            health_port,
        } => run_session(config, request, request_file, summary, health_port).await,
        Commands::Providers { probe } => show_providers(config, probe).await,
        Commands::Config { show } => handle_config_command(config, show),
    };

    match result {
        Ok(code) => process::exit(code),
        Err(e) => {
            error!(error = %e, "Command failed");
            process::exit(1);
        }
    }
}

fn log_format() -> LogFormat {
    LogFormat::parse(&std::env::var("LOG_FORMAT").unwrap_or_default())
}

fn read_request(inline: Option<String>, file: Option<&Path>) -> CliResult<Value> {
    let text = match (inline, file) {
        (Some(inline), _) => inline,
        (None, Some(path)) => std::fs::read_to_string(path)?,
        (None, None) => return Err("a request is required (--request or --request-file)".into()),
    };
    Ok(serde_json::from_str(&text)?)
}

fn print_snapshot(session: &Session, summary: bool) -> CliResult<()> {
    if summary {
        let stage = session
            .metadata
            .current_stage
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<13} {:>5.1}%  stage={:<10} cost={:.4} retries={}/{}",
            session.state.to_string(),
            session.metadata.progress.percentage,
            stage,
            session.metadata.total_cost,
            session.retry_budget.retry_count,
            session.retry_budget.max_retries,
        );
    } else {
        println!("{}", serde_json::to_string(session)?);
    }
    Ok(())
}

async fn run_session(
    config: PipelineConfig,
    request: Option<String>,
    request_file: Option<PathBuf>,
    summary: bool,
    health_port: Option<u16>,
) -> CliResult<i32> {
    let request = read_request(request, request_file.as_deref())?;
    let registry = build_registry(&config)?;
    let session_config = config.session_config()?;

    let probes = spawn_health_probes(registry.clone(), config.failover.health_check_interval());
    let health = health_port.map(|port| {
        let server = Arc::new(HealthServer::new("tripflow", port, registry.clone()));
        tokio::spawn(server.start())
    });

    let factory = PromptAgentFactory::new(registry.clone(), config.agents.clone());
    let store = SessionStore::new(Arc::new(factory), session_config)
        .with_observer(ObserverHandle::new(Arc::new(TracingObserver)));

    let session_id = store.start(request)?;
    info!(session_id = %session_id, providers = registry.len(), "Session started");

    let mut snapshots = store.stream_session(&session_id)?;
    let mut cancel_sent = false;
    loop {
        tokio::select! {
            snapshot = snapshots.next() => match snapshot {
                Some(session) => print_snapshot(&session, summary)?,
                None => break,
            },
            _ = signal::ctrl_c(), if !cancel_sent => {
                warn!(session_id = %session_id, "Interrupted, cancelling session");
                store.cancel_session(&session_id)?;
                cancel_sent = true;
            }
        }
    }

    let terminal = store.wait(&session_id).await?;
    probes.abort();
    if let Some(health) = health {
        health.abort();
    }

    let stats = metrics().get_metrics();
    info!(
        session_id = %session_id,
        state = %terminal.state,
        total_cost = terminal.metadata.total_cost,
        provider_fallbacks = stats.providers.fallbacks,
        "Run finished"
    );

    Ok(match terminal.state {
        WorkflowState::Completed => 0,
        WorkflowState::Cancelled => 130,
        _ => 1,
    })
}

fn build_registry(config: &PipelineConfig) -> CliResult<Arc<ProviderRegistry>> {
    Ok(Arc::new(config.build_registry()?))
}

async fn show_providers(config: PipelineConfig, probe: bool) -> CliResult<i32> {
    let registry = build_registry(&config)?;

    if probe {
        if let Some(reports) = registry.probe_all().await {
            for report in reports {
                println!("{}", serde_json::to_string(&report)?);
            }
        }
    }

    for snapshot in registry.snapshots() {
        println!("{}", serde_json::to_string(&snapshot)?);
    }
    Ok(0)
}

fn handle_config_command(config: PipelineConfig, show: bool) -> CliResult<i32> {
    if show {
        println!("{}", toml::to_string_pretty(&config)?);
    }

    info!(providers = config.providers.len(), "Configuration is valid");
    Ok(0)
}
