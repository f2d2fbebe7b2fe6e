//! tenantdb-gateway - Multi-tenant PostgreSQL wire-protocol gateway
//!
//! `serve` runs the gateway; `scram-verifier` produces the credential bundle
//! a tenant's directory record stores as `auth_data`.

use clap::{Parser, Subcommand};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info};

use tenantdb_gateway::protocol::postgres::{ScramVerifier, DEFAULT_SCRAM_ITERATIONS};
use tenantdb_gateway::{config, GatewayError, GatewayServices, Listener, Result};

#[derive(Parser)]
#[command(name = "tenantdb-gateway")]
#[command(version)]
#[command(about = "Multi-tenant PostgreSQL gateway with SNI routing")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway
    Serve {
        /// Path to configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Override listen address
        #[arg(long)]
        listen_address: Option<String>,

        /// Override listen port
        #[arg(long)]
        listen_port: Option<u16>,

        /// Enable verbose/debug logging
        #[arg(short, long)]
        verbose: bool,
    },

    /// Read a password from stdin and print its SCRAM-SHA-256 verifier bundle
    ScramVerifier {
        /// PBKDF2 iteration count
        #[arg(long, default_value_t = DEFAULT_SCRAM_ITERATIONS)]
        iterations: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    match Cli::parse().command {
        Command::Serve {
            config,
            listen_address,
            listen_port,
            verbose,
        } => serve(config, listen_address, listen_port, verbose).await,
        Command::ScramVerifier { iterations } => print_verifier(iterations),
    }
}

async fn serve(
    config_path: PathBuf,
    listen_address: Option<String>,
    listen_port: Option<u16>,
    verbose: bool,
) -> Result<()> {
    let mut config = config::load_config(&config_path)?;

    // Priority: --verbose flag, then RUST_LOG env var, then logging.level
    let log_level = if verbose {
        "debug".to_string()
    } else {
        std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone())
    };
    tracing_subscriber::fmt().with_env_filter(&log_level).init();

    info!("Starting tenantdb-gateway v{}", env!("CARGO_PKG_VERSION"));
    info!("Loaded configuration from {:?}", config_path);

    if let Some(addr) = listen_address {
        config.server.listen_address = addr;
    }
    if let Some(port) = listen_port {
        config.server.listen_port = port;
    }

    let config = Arc::new(config);
    let services = GatewayServices::from_config(&config)?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
    let listener = Listener::bind(Arc::clone(&config), services, shutdown_rx).await?;
    let metrics = listener.metrics();

    info!(
        "Gateway ready: listening on {}:{}, archives in {:?}, cache in {:?}",
        config.server.listen_address,
        config.server.listen_port,
        config.archive.root,
        config.cache.root
    );

    let listener_handle = tokio::spawn(async move {
        if let Err(e) = listener.run().await {
            error!("Listener error: {}", e);
        }
    });

    wait_for_shutdown_signal().await?;

    if shutdown_tx.send(()).is_err() {
        info!("Listener already stopped");
    }
    if let Err(e) = listener_handle.await {
        error!("Listener task failed: {}", e);
    }

    info!("Shutdown complete.\n{}", metrics.snapshot());
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => {
                result?;
                info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating shutdown...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        info!("Received Ctrl+C, initiating shutdown...");
    }
    Ok(())
}

fn print_verifier(iterations: u32) -> Result<()> {
    if iterations == 0 {
        return Err(GatewayError::Config("iterations must be greater than 0".into()));
    }

    let mut password = String::new();
    std::io::stdin().lock().read_line(&mut password)?;
    let password = password.trim_end_matches(|c| c == '\r' || c == '\n');
    if password.is_empty() {
        return Err(GatewayError::Config("empty password on stdin".into()));
    }

    let verifier = ScramVerifier::from_password(password, iterations);
    println!("{}", serde_json::to_string_pretty(&verifier.to_bundle())?);
    Ok(())
}
