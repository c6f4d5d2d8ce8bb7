//! Tachyon CLI
//!
//! Download speed test server and client

mod client;
mod config;
mod progress;

use anyhow::Context;
use clap::{Parser, Subcommand};
use console::style;
use std::net::SocketAddr;
use std::path::PathBuf;
use tachyon_core::{LifecycleEngine, SizeSelector};
use tachyon_server::AppState;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use client::{RunOptions, SpeedTestClient};
use config::{Config, ConfigSource};
use progress::{client_mbps, format_bytes, format_duration};

/// Tachyon - download speed testing with verified payloads
#[derive(Parser)]
#[command(name = "tachyon")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, default_value = "tachyon.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the speed test server
    Serve {
        /// Listen address (overrides the config file)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Run one speed test against a server
    Run {
        /// Server base URL
        #[arg(short, long, default_value = "http://127.0.0.1:8080")]
        server: String,

        /// Download size in MiB
        #[arg(short = 'm', long, default_value_t = 10)]
        size: u32,

        /// Keep the downloaded artifact at this path
        #[arg(short, long)]
        keep: Option<PathBuf>,
    },

    /// List the allowed download sizes
    Sizes,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let (config, source) = Config::load_or_default(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;

    // Validate configuration
    config.validate()?;

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match source {
        ConfigSource::File => tracing::debug!("Loaded config from {}", cli.config.display()),
        ConfigSource::Defaults => {
            tracing::debug!("No config at {}, using defaults", cli.config.display());
        }
    }

    match cli.command {
        Commands::Serve { bind } => {
            run_server(bind, &config).await?;
        }
        Commands::Run { server, size, keep } => {
            run_client(RunOptions {
                server,
                size_mb: size,
                keep,
            })
            .await?;
        }
        Commands::Sizes => {
            list_sizes();
        }
    }

    Ok(())
}

/// Run the HTTP server until Ctrl+C
async fn run_server(bind: Option<String>, config: &Config) -> anyhow::Result<()> {
    let addr: SocketAddr = match bind {
        Some(bind) => bind
            .parse()
            .with_context(|| format!("invalid bind address: {bind}"))?,
        None => config.parse_listen_addr()?,
    };

    let engine = LifecycleEngine::start(config.engine_config())
        .await
        .context("failed to prepare artifact directory")?;
    let reaper = engine.spawn_reaper();

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    println!("Listening on: {}", listener.local_addr()?);
    println!(
        "Artifact directory: {}",
        config.storage.artifact_dir.display()
    );
    println!("Rate limit: 1 session per {}s", config.limits.cooldown_secs);
    println!("Press Ctrl+C to stop");

    let state = AppState::new(engine).trust_forwarded_for(config.server.trust_forwarded_for);
    let served = tachyon_server::serve(listener, state, shutdown_signal()).await;

    reaper.shutdown().await;
    served.context("HTTP server error")?;

    println!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Received Ctrl+C, shutting down"),
        Err(e) => {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

/// Run one client session and print a summary
async fn run_client(options: RunOptions) -> anyhow::Result<()> {
    println!("Server: {}", options.server);
    println!("Size: {} MiB", options.size_mb);

    let summary = SpeedTestClient::new(&options.server).run(&options).await?;

    println!();
    println!("Session: {}", summary.session_id);
    println!(
        "Received: {} of {}",
        format_bytes(summary.received),
        format_bytes(summary.size)
    );
    println!("Client time: {}", format_duration(summary.client_elapsed));
    println!(
        "Client speed: {:.2} Mbps",
        client_mbps(summary.received, summary.client_elapsed)
    );
    println!(
        "Server speed: {}",
        style(format!("{:.2} Mbps", summary.server_speed_mbps)).bold()
    );

    if summary.digest_matches() {
        println!("Hash: {}", style("match").green());
    } else {
        println!("Hash: {}", style("MISMATCH").red().bold());
        println!("  expected {}", summary.expected_hash);
        println!("  computed {}", summary.computed_hash);
    }
    println!(
        "Verified: {}",
        if summary.verified { "yes" } else { "no (skipped)" }
    );

    if let Some(path) = &options.keep {
        println!("Saved to: {}", path.display());
    }

    if !summary.digest_matches() {
        anyhow::bail!("downloaded data did not match the expected hash");
    }
    Ok(())
}

/// Print the allowed download sizes
fn list_sizes() {
    println!("Allowed sizes:");
    for selector in SizeSelector::ALL {
        println!(
            "  {:>5} MiB  ({} bytes)",
            selector.mebibytes(),
            selector.bytes()
        );
    }
}
