//! surge - profile-driven traffic generator
//!
//! Usage:
//!   surge run --profile baseline --target 10.0.0.5 --count 1000
//!   surge run --profile web-mix --target lab.local:8080 --duration 30s --dry-run
//!   surge profiles --config surge.json
//!   surge monitor --target 10.0.0.5 --ports 22,80,443 --interval 10s
//!   surge serve --port 8080

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use surge_core::emitter::raw_sockets_available;
use surge_core::{CampaignRequest, Engine, ExitStatus, MonitorRequest, SurgeConfig};
use surge_sim::{ApiConfig, parse_duration, print_api_docs, router};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "surge")]
#[command(about = "Profile-driven network traffic generation with telemetry delivery")]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one campaign to completion
    Run {
        /// Profile name
        #[arg(short, long)]
        profile: String,

        /// host or host:port
        #[arg(short, long)]
        target: String,

        /// Stop after this many units
        #[arg(short = 'n', long)]
        count: Option<u64>,

        /// Stop after this long (e.g. 500ms, 30s, 5m)
        #[arg(short, long, value_parser = parse_duration, conflicts_with = "count")]
        duration: Option<Duration>,

        /// Seed for a reproducible unit sequence
        #[arg(long)]
        seed: Option<u64>,

        /// Build and record units without touching the network
        #[arg(long)]
        dry_run: bool,
    },

    /// List profiles and report entries that failed validation
    Profiles,

    /// Check a target's TCP ports on an interval until interrupted
    Monitor {
        /// host or host:port
        #[arg(short, long)]
        target: String,

        /// Comma-separated ports (default from config)
        #[arg(short, long, value_delimiter = ',')]
        ports: Option<Vec<u16>>,

        /// Time between rounds (e.g. 10s, 1m)
        #[arg(short, long, value_parser = parse_duration)]
        interval: Option<Duration>,
    },

    /// Serve the HTTP control API
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8080")]
        port: u16,

        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Build and record units without touching the network
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = cli.config;

    let result = match cli.command {
        Commands::Run {
            profile,
            target,
            count,
            duration,
            seed,
            dry_run,
        } => {
            let request = CampaignRequest {
                profile,
                target,
                count,
                duration_secs: duration.map(|d| d.as_secs_f64()),
                seed,
            };
            run_campaign(config_path, request, dry_run).await
        }
        Commands::Profiles => run_profiles(config_path),
        Commands::Monitor {
            target,
            ports,
            interval,
        } => {
            let request = MonitorRequest {
                target,
                ports,
                interval_ms: interval.map(|d| d.as_millis() as u64),
            };
            run_monitor(config_path, request).await
        }
        Commands::Serve {
            port,
            host,
            dry_run,
        } => run_serve(config_path, ApiConfig { host, port }, dry_run).await,
    };

    match result {
        Ok(status) => ExitCode::from(status.code() as u8),
        Err(err) => {
            error!("surge failed: {err:#}");
            ExitCode::from(ExitStatus::Failure.code() as u8)
        }
    }
}

fn load_config(path: Option<PathBuf>, dry_run: bool) -> anyhow::Result<SurgeConfig> {
    let mut config = match path {
        Some(path) => SurgeConfig::load(&path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => {
            let mut config = SurgeConfig::default();
            config.sink.resolve_token();
            config
        }
    };
    if dry_run {
        config.emitter.dry_run = true;
    }
    Ok(config)
}

fn start_engine(config: SurgeConfig) -> anyhow::Result<Engine> {
    if !config.emitter.dry_run && !raw_sockets_available() {
        warn!("Raw sockets unavailable (needs root or CAP_NET_RAW); TCP/UDP/ICMP units will fail");
    }
    let engine = Engine::from_config(config).context("starting engine")?;
    for (name, reason) in engine.rejected_profiles() {
        warn!(profile = %name, %reason, "Profile rejected");
    }
    Ok(engine)
}

async fn run_campaign(
    config_path: Option<PathBuf>,
    request: CampaignRequest,
    dry_run: bool,
) -> anyhow::Result<ExitStatus> {
    let engine = start_engine(load_config(config_path, dry_run)?)?;

    let outcome = tokio::select! {
        result = engine.run_campaign(request) => Some(result),
        _ = signal::ctrl_c() => {
            warn!("Interrupt received, stopping campaign");
            None
        }
    };

    let report = engine.shutdown().await;
    println!("{}", serde_json::to_string_pretty(&report)?);

    match outcome {
        Some(Err(err)) => {
            error!(error = %err, "Campaign could not run");
            Ok(ExitStatus::from(&err))
        }
        _ => Ok(report.status),
    }
}

fn run_profiles(config_path: Option<PathBuf>) -> anyhow::Result<ExitStatus> {
    let config = load_config(config_path, false)?;
    let (catalog, rejected) = config.catalog();

    for name in catalog.names() {
        let profile = catalog.get(&name)?;
        let mix: Vec<String> = profile
            .protocol_mix()
            .iter()
            .map(|(protocol, weight)| format!("{}={weight}", protocol.as_str()))
            .collect();
        println!(
            "{:16} {:>8.1}/s  limit={:?}  mix=[{}]  anomaly={}",
            name,
            profile.target_rate_per_second(),
            profile.limit(),
            mix.join(" "),
            profile.anomaly_rate()
        );
    }
    for (name, err) in &rejected {
        println!("{:16} REJECTED: {err}", name);
    }

    Ok(if rejected.is_empty() {
        ExitStatus::Success
    } else {
        ExitStatus::ValidationError
    })
}

async fn run_monitor(
    config_path: Option<PathBuf>,
    request: MonitorRequest,
) -> anyhow::Result<ExitStatus> {
    let engine = start_engine(load_config(config_path, false)?)?;

    let id = match engine.monitors().start(request).await {
        Ok(id) => id,
        Err(err) => {
            error!(error = %err, "Monitor could not start");
            engine.shutdown().await;
            return Ok(ExitStatus::from(&err));
        }
    };
    info!(monitor = %id, "Monitoring until interrupted");
    let _ = signal::ctrl_c().await;
    warn!("Interrupt received, stopping monitor");

    let report = engine.shutdown().await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(ExitStatus::Success)
}

async fn run_serve(
    config_path: Option<PathBuf>,
    api: ApiConfig,
    dry_run: bool,
) -> anyhow::Result<ExitStatus> {
    let engine = Arc::new(start_engine(load_config(config_path, dry_run)?)?);

    let listener = tokio::net::TcpListener::bind(api.bind_address())
        .await
        .with_context(|| format!("binding {}", api.bind_address()))?;
    print_api_docs(&api);
    info!(address = %api.bind_address(), "Control API listening");

    axum::serve(listener, router(Arc::clone(&engine)))
        .with_graceful_shutdown(async {
            let _ = signal::ctrl_c().await;
            info!("Interrupt received, shutting down");
        })
        .await
        .context("serving control API")?;

    let report = engine.shutdown().await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(report.status)
}
