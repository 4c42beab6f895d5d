use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use sensorbridge::agent::datalog::{ExportRequest, ExportWindow};
use sensorbridge::agent::Agent;
use sensorbridge::config::{self, SinkKind, TransportKind};
use sensorbridge::observability::{LogRing, RingLayer};
use sensorbridge::sink::{InfluxSink, MemorySink, SinkBackend};
use sensorbridge::transport::simulated::SimulatedBaseStation;

/// Wireless sensor base station to time-series bridge.
#[derive(Parser)]
#[command(name = "sensorbridge", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,

    /// Download one node's datalog, print the report and exit.
    Export {
        /// Node address.
        #[arg(long)]
        node: u32,

        /// Datalog session; all sessions when omitted.
        #[arg(long)]
        session: Option<u32>,

        /// Only report, do not write to the sink.
        #[arg(long)]
        dry_run: bool,

        /// Keep node timestamps as-is instead of aligning to host time.
        #[arg(long)]
        no_align: bool,

        /// Restrict to the last N hours of host time.
        #[arg(long)]
        hours: Option<f64>,
    },
}

/// Build-time version info, injected via RUSTFLAGS.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("sensorbridge {}", version::full());
        return Ok(());
    }

    // Config is required for everything else.
    let config_path = cli
        .config
        .clone()
        .context("--config is required (use --help for usage)")?;

    let cfg = config::Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    // Initialize tracing: stdout plus the in-process ring served on /logs.
    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;
    let logs = Arc::new(LogRing::new(cfg.observability.log_capacity));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .with(RingLayer::new(Arc::clone(&logs)))
        .init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting sensorbridge",
    );

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async {
        match cli.command {
            Some(Command::Export {
                node,
                session,
                dry_run,
                no_align,
                hours,
            }) => {
                let req = ExportRequest {
                    session,
                    ingest: !dry_run,
                    align_clock: !no_align,
                    window: hours.map_or(ExportWindow::All, ExportWindow::HostHours),
                    source_tag: None,
                };
                export(cfg, logs, node, req).await
            }
            _ => run(cfg, logs).await,
        }
    })
}

fn build_agent(
    cfg: config::Config,
    logs: Arc<LogRing>,
) -> Result<Agent<SimulatedBaseStation, SinkBackend>> {
    let sink = match cfg.sink.kind {
        SinkKind::Influx => SinkBackend::Influx(
            InfluxSink::new(cfg.sink.influx.clone()).context("creating influx sink")?,
        ),
        SinkKind::Memory => SinkBackend::Memory(MemorySink::new()),
    };

    let transport = match cfg.transport.kind {
        TransportKind::Simulated => SimulatedBaseStation::new(cfg.transport.simulated.clone()),
    };

    Agent::new(cfg, transport, sink, logs)
}

async fn run(cfg: config::Config, logs: Arc<LogRing>) -> Result<()> {
    // Set up signal handling.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    // Start the agent.
    let mut agent = build_agent(cfg, logs)?;
    agent.start().await?;

    // Wait for shutdown signal.
    let _ = shutdown_rx.await;

    // Graceful shutdown.
    agent.stop().await?;

    tracing::info!("sensorbridge stopped");

    Ok(())
}

async fn export(
    mut cfg: config::Config,
    logs: Arc<LogRing>,
    node: u32,
    req: ExportRequest,
) -> Result<()> {
    cfg.stream.enabled = false;
    let mut agent = build_agent(cfg, logs)?;
    agent.start().await?;

    let result = agent.export_datalog(node, &req).await;
    agent.stop().await?;

    match result {
        Ok(report) => {
            let body = serde_json::to_string_pretty(&report).context("encoding report")?;
            println!("{body}");
            Ok(())
        }
        Err(e) => bail!("export of node {node} failed: {e}"),
    }
}
