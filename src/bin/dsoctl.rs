//! DsoCtl - Offline inspection of a DSO server's persisted state
//!
//! Usage:
//!   dsoctl status            - Summary of the persistence database
//!   dsoctl descriptors       - List global transaction descriptors
//!   dsoctl clients           - List clients expected to reconnect
//!   dsoctl check-config      - Validate a configuration file
//!
//! Run it against a stopped server; SQLite allows concurrent readers but the
//! numbers are only consistent while nothing writes.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;

use dsoserver::config::DsoConfig;
use dsoserver::gtx::{DescriptorState, GlobalTransactionDescriptor};
use dsoserver::persistence::{ClientStatePersistor, SqlitePersistor, TransactionPersistor};

/// DSO Server Control Tool
#[derive(Parser)]
#[command(name = "dsoctl")]
#[command(about = "Inspect the persisted state of a DSO server", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "/etc/dsoserver/config.toml")]
    config: PathBuf,

    /// Database file to open (overrides config)
    #[arg(short, long)]
    database: Option<PathBuf>,

    /// Print JSON instead of tables
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Summary of the persistence database
    Status,
    /// List global transaction descriptors
    Descriptors {
        /// Only descriptors of this group
        #[arg(short, long)]
        group: Option<u32>,
        /// Show at most this many, lowest global id first
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },
    /// List clients the server will wait for after a restart
    Clients,
    /// Check configuration file for errors
    CheckConfig {
        /// Path to config file to check (defaults to --config path)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match &cli.command {
        Commands::CheckConfig { file } => {
            let config_path = file.clone().unwrap_or_else(|| cli.config.clone());
            check_config(&config_path)
        }
        command => match open_database(&cli) {
            Ok(db) => match command {
                Commands::Status => show_status(&db, cli.json).await,
                Commands::Descriptors { group, limit } => {
                    list_descriptors(&db, *group, *limit, cli.json).await
                }
                Commands::Clients => list_clients(&db, cli.json).await,
                Commands::CheckConfig { .. } => Ok(()),
            },
            Err(e) => Err(e),
        },
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn open_database(cli: &Cli) -> anyhow::Result<SqlitePersistor> {
    let path = match &cli.database {
        Some(path) => path.clone(),
        None => DsoConfig::from_file(&cli.config)
            .with_context(|| format!("loading {}", cli.config.display()))?
            .database_path(),
    };
    if !path.exists() {
        bail!("database {} does not exist", path.display());
    }
    SqlitePersistor::open(&path).with_context(|| format!("opening {}", path.display()))
}

async fn show_status(db: &SqlitePersistor, json: bool) -> anyhow::Result<()> {
    let descriptors = db.load_all_global_transaction_descriptors().await?;
    let clients = db.loaded_client_ids().await?;
    let sequences = db.all_sequences().await?;

    let mut by_state: BTreeMap<&'static str, usize> = BTreeMap::new();
    for d in &descriptors {
        *by_state.entry(state_name(d.state)).or_default() += 1;
    }
    let max_gid = descriptors.iter().map(|d| d.global_txn_id).max();

    if json {
        let status = serde_json::json!({
            "database": db.path().display().to_string(),
            "descriptors": db.descriptor_count().await?,
            "by_state": by_state,
            "max_gid": max_gid.map(|g| g.as_i64()),
            "clients": clients.len(),
            "sequences": sequences.into_iter().collect::<BTreeMap<_, _>>(),
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("DSO Server State");
    println!("================");
    println!();
    println!("Database:         {}", db.path().display());
    println!("Descriptors:      {}", db.descriptor_count().await?);
    for (state, count) in &by_state {
        println!("  {:<16}{}", state, count);
    }
    match max_gid {
        Some(gid) => println!("Highest gid:      {}", gid.as_i64()),
        None => println!("Highest gid:      -"),
    }
    println!("Known clients:    {}", clients.len());
    println!();
    println!("Sequences:");
    if sequences.is_empty() {
        println!("  (none)");
    }
    for (name, next) in sequences {
        println!("  {:<24} next {}", name, next);
    }
    Ok(())
}

async fn list_descriptors(
    db: &SqlitePersistor,
    group: Option<u32>,
    limit: usize,
    json: bool,
) -> anyhow::Result<()> {
    let mut descriptors: Vec<GlobalTransactionDescriptor> = db
        .load_all_global_transaction_descriptors()
        .await?
        .into_iter()
        .filter(|d| group.map_or(true, |g| d.group.0 == g))
        .collect();
    descriptors.sort_by_key(|d| d.global_txn_id);
    let total = descriptors.len();
    descriptors.truncate(limit);

    if json {
        println!("{}", serde_json::to_string_pretty(&descriptors)?);
        return Ok(());
    }

    println!("{:<12} {:<8} {:<10} {:<24} {:>12}", "GID", "GROUP", "STATE", "SOURCE", "TXN");
    println!("{}", "-".repeat(70));
    for d in &descriptors {
        println!(
            "{:<12} {:<8} {:<10} {:<24} {:>12}",
            d.global_txn_id.as_i64(),
            d.group.0,
            state_name(d.state),
            d.server_txn_id.source.to_string(),
            d.server_txn_id.txn.as_i64()
        );
    }
    if total > descriptors.len() {
        println!("... {} more", total - descriptors.len());
    }
    Ok(())
}

async fn list_clients(db: &SqlitePersistor, json: bool) -> anyhow::Result<()> {
    let mut clients = db.loaded_client_ids().await?;
    clients.sort();

    if json {
        println!("{}", serde_json::to_string_pretty(&clients)?);
        return Ok(());
    }
    if clients.is_empty() {
        println!("No clients recorded; the server starts without a reconnect window.");
        return Ok(());
    }
    println!("{} client(s) expected to reconnect:", clients.len());
    for client in clients {
        println!("  {}", client);
    }
    Ok(())
}

fn check_config(path: &PathBuf) -> anyhow::Result<()> {
    let config = DsoConfig::from_file(path).with_context(|| format!("checking {}", path.display()))?;
    println!("✓ {} is valid", path.display());
    println!("  Server ID:      {}", config.node.id);
    println!("  Group:          {}", config.group_id());
    println!("  Active:         {}", config.group.bootstrap_active);
    println!("  Peers:          {}", config.group.peers.len());
    println!("  Database:       {}", config.database_path().display());
    Ok(())
}

fn state_name(state: DescriptorState) -> &'static str {
    match state {
        DescriptorState::Assigned => "assigned",
        DescriptorState::Applying => "applying",
        DescriptorState::Applied => "applied",
    }
}
