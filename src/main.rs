//! Mock Stub Server - CLI Entry Point

use anyhow::Result;
use clap::Parser;
use mock_stub_server::{StubServer, StubServerConfig};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(
    name = "mock-stub-server",
    about = "Standalone HTTP stub server - request stubbing, journaling and verification",
    version
)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "mock-stub-server.yaml")]
    config: PathBuf,

    /// Address to bind (overrides the configuration file)
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (overrides the configuration file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Log every received request
    #[arg(short, long)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: Level,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if args.print_config {
        let default_config = include_str!("../demos/default-config.yaml");
        println!("{}", default_config);
        return Ok(());
    }

    let mut config = if args.config.exists() {
        info!(path = ?args.config, "Loading configuration");
        StubServerConfig::from_file(&args.config)?
    } else if args.validate {
        anyhow::bail!("Configuration file not found: {:?}", args.config);
    } else {
        info!("Using default configuration (no stubs)");
        let mut config = StubServerConfig::default();
        config.server.port = 8080;
        config
    };

    if args.validate {
        config.validate()?;
        println!(
            "Configuration is valid ({} stubs defined)",
            config.stubs.len()
        );
        return Ok(());
    }

    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if args.verbose {
        config.server.verbose = true;
    }

    let mut server = StubServer::from_config(config)?;
    let addr = server.start().await?;
    info!(address = %addr, "Mock stub server ready, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!(
        requests = server.state().total_requests(),
        matched = server.state().total_matched(),
        unmatched = server.state().total_unmatched(),
        "Shutting down"
    );
    server.stop().await;

    Ok(())
}
