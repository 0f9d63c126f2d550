//! DSO Server - Distributed Shared Object Server
//!
//! Sequences, persists and replicates client transactions across an
//! active/passive server group.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dsoserver::config::DsoConfig;
use dsoserver::error::{Error, Result};
use dsoserver::server::DsoServer;
use dsoserver::tuning;

/// DSO Server - Distributed Shared Object Server
#[derive(Parser)]
#[command(name = "dsoserver")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "dsoserver.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server
    Start {
        /// Start as the active server of the group
        #[arg(long)]
        bootstrap: bool,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "dsoserver.toml")]
        output: PathBuf,

        /// Server ID
        #[arg(long, default_value = "server-1")]
        node_id: String,
    },

    /// Validate configuration file
    Validate,

    /// Show server information
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { bootstrap } => run_start(cli.config, &cli.log_level, bootstrap).await,
        Commands::Init { output, node_id } => {
            init_logging(&cli.log_level, "pretty");
            run_init(output, node_id)
        }
        Commands::Validate => {
            init_logging(&cli.log_level, "pretty");
            run_validate(cli.config)
        }
        Commands::Info => {
            init_logging(&cli.log_level, "pretty");
            run_info(cli.config)
        }
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Start the server
async fn run_start(config_path: PathBuf, log_level: &str, bootstrap: bool) -> Result<()> {
    let mut config = match DsoConfig::from_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            init_logging(log_level, "pretty");
            tracing::error!("Failed to load configuration: {}", e);
            return Err(e);
        }
    };
    init_logging(log_level, &config.logging.format);
    tracing::info!("Starting DSO server...");

    if bootstrap {
        config.group.bootstrap_active = true;
    }

    let server = DsoServer::new(config).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut running = tokio::spawn(server.run(shutdown_rx));

    let result = tokio::select! {
        result = &mut running => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
            let _ = shutdown_tx.send(true);
            running.await
        }
    };

    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::error!("Server error: {}", e);
            return Err(e);
        }
        Err(e) => {
            tracing::error!("Server task failed: {}", e);
            return Err(Error::IllegalState(format!("server task failed: {}", e)));
        }
    }

    tracing::info!("DSO server shutdown complete");
    Ok(())
}

/// Initialize configuration file
fn run_init(output: PathBuf, node_id: String) -> Result<()> {
    let config_content = format!(r#"# DSO Server Configuration
# Generated configuration file

[node]
id = "{node_id}"
group_bind_address = "0.0.0.0:9530"
client_bind_address = "0.0.0.0:9510"
data_dir = "/var/lib/dsoserver/{node_id}"
persistent = true
# advertise_address = "my-public-ip:9530"

[group]
id = 0
bootstrap_active = false
peers = []
# peers = [{{ id = "server-2", address = "server-2.example.com:9530" }}]
low_watermark_interval_ms = 1000
request_timeout_ms = 5000
connect_timeout_ms = 2000

[transactions]
max_frame_size = 16777216

[dna]
string_compression = true
string_compress_min_size = 512
intern_strings = true

[handshake]
reconnect_enabled = true
reconnect_timeout_ms = 120000
object_id_batch_size = 1000

[stages]
queue_size = 1024
transaction_workers = 0   # 0 = auto
persistence_workers = 0   # 0 = auto

[logging]
level = "info"
format = "pretty"
"#);

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to configure the server group.");
    println!("Then start with: dsoserver --config {} start", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match DsoConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Server ID: {}", config.node.id);
            println!("  Group: {}", config.group_id());
            println!("  Group Address: {}", config.node.group_bind_address);
            println!("  Client Address: {}", config.node.client_bind_address);
            println!("  Peers: {}", config.group.peers.len());
            println!("  Persistent: {}", config.node.persistent);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show server information
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = DsoConfig::from_file(&config_path)?;
    let tuned = tuning::auto_tune(&config.stages);

    println!("DSO Server Information");
    println!("======================");
    println!();
    println!("Server ID:        {}", config.node.id);
    println!("Group Address:    {}", config.node.group_bind_address);
    println!("Advertise:        {}", config.advertise_address());
    println!("Client Address:   {}", config.node.client_bind_address);
    println!("Data Directory:   {}", config.data_dir().display());
    println!("Database:         {}", config.database_path().display());
    println!();
    println!("Group Configuration:");
    println!("  Group ID:       {}", config.group_id());
    println!("  Bootstrap:      {}", config.group.bootstrap_active);
    for peer in &config.group.peers {
        println!("  Peer:           {} @ {}", peer.id, peer.address);
    }
    println!("  Low Watermark:  {} ms", config.group.low_watermark_interval_ms);
    println!();
    println!("Handshake Configuration:");
    match config.reconnect_timeout() {
        Some(timeout) => println!("  Reconnect:      {} ms", timeout.as_millis()),
        None => println!("  Reconnect:      disabled"),
    }
    println!("  Object IDs:     {} per handshake", config.handshake.object_id_batch_size);
    println!();
    println!("{}", tuning::tuning_summary(&tuned));

    Ok(())
}
