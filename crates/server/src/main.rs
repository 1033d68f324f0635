//! Venture Server
//!
//! CLI entry point: `venture serve` runs the HTTP API, `venture run` drives a
//! single idea through the pipeline and prints the final snapshot.

use clap::{Parser, Subcommand};
use std::{net::SocketAddr, path::PathBuf};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use venture_core::pipeline::JobSnapshot;
use venture_core::state::JobStatus;
use venture_core::VentureConfig;
use venture_server::{bootstrap, build_router, ServerOptions};

#[derive(Parser)]
#[command(author, version, about = "Venture - AI business idea validation")]
struct Args {
    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Start the HTTP API
    Serve {
        /// Port to bind
        #[arg(short, long, default_value = "8080")]
        port: u16,
        /// Config file (defaults to .venture/config.json)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Use the canned inference backend
        #[arg(long)]
        offline: bool,
        /// Keep jobs in memory only
        #[arg(long)]
        ephemeral: bool,
    },
    /// Validate one idea without starting the server
    Run {
        /// Idea text
        idea: String,
        /// Config file (defaults to .venture/config.json)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Use the canned inference backend
        #[arg(long)]
        offline: bool,
    },
}

async fn load_config(path: Option<PathBuf>) -> anyhow::Result<VentureConfig> {
    match path {
        Some(path) => VentureConfig::load_from(path).await,
        None => VentureConfig::load().await,
    }
}

async fn run_server(port: u16, config: VentureConfig, options: ServerOptions) -> anyhow::Result<()> {
    let retention = config.retention();
    let sweep_interval = config.sweep_interval();

    let state = bootstrap(config, &options).await?;
    let _sweeper = state
        .controller
        .registry()
        .clone()
        .spawn_sweeper(sweep_interval, retention);

    let app = build_router(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    println!("🚀 Venture Server running at http://{}", addr);
    println!("   Jobs:     POST /jobs, GET /jobs/:id, /jobs/:id/history");
    println!("   Live:     /jobs/:id/events (SSE), /jobs/:id/ws (WebSocket)");
    println!("   Analysis: /analysis/:id");
    println!("   System:   /health, /openapi.json");
    if options.offline {
        println!("   Backend:  canned (offline)");
    }

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn run_once(idea: String, config: VentureConfig, offline: bool) -> anyhow::Result<()> {
    let options = ServerOptions {
        offline,
        ephemeral: false,
    };
    let state = bootstrap(config, &options).await?;

    println!("🚀 Validating idea: {}", idea);
    let job_id = uuid::Uuid::new_v4().to_string();
    let job = state.controller.run(&idea, &job_id).await?;

    let snapshot = JobSnapshot::of(&job);
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    match job.status {
        JobStatus::Completed => println!("✅ Job {} completed", job.id),
        status => eprintln!("❌ Job {} finished as {}", job.id, status),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::from_path(".venture/.env");
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    println!("╔══════════════════════════════════════╗");
    println!("║           VENTURE SERVER             ║");
    println!("╚══════════════════════════════════════╝");

    let args = Args::parse();

    match args.command {
        Some(CliCommand::Run {
            idea,
            config,
            offline,
        }) => {
            let config = load_config(config).await?;
            run_once(idea, config, offline).await
        }
        Some(CliCommand::Serve {
            port,
            config,
            offline,
            ephemeral,
        }) => {
            let config = load_config(config).await?;
            run_server(port, config, ServerOptions { offline, ephemeral }).await
        }
        None => {
            let config = VentureConfig::load().await?;
            run_server(8080, config, ServerOptions::default()).await
        }
    }
}
