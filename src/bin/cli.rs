//! Tracksync CLI
//!
//! Inspection helpers around the synchronization core, plus an in-memory
//! demo session.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tracksync::batch::{snapshot_directory, BatchInfo};
use tracksync::error::{Result, SyncError};
use tracksync::provider::memory::InMemoryProvider;
use tracksync::scope::DEFAULT_SCOPE_NAME;
use tracksync::upgrade::{parse_version, upgrade_path, CURRENT_VERSION, UPGRADE_CHAIN};
use tracksync::{
    LocalOrchestrator, RemoteOrchestrator, SyncAgent, SyncColumn, SyncOptions, SyncParameters,
    SyncSetup, SyncTable,
};

#[derive(Parser)]
#[command(name = "tracksync")]
#[command(about = "Change-tracking synchronization toolkit")]
#[command(version)]
struct Cli {
    /// Options file (TOML)
    #[arg(long, env = "TRACKSYNC_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective options
    Config,
    /// Print the summary of a batch directory
    Inspect {
        /// Batch directory
        dir: PathBuf,
        /// Print the raw summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// List the upgrade chain, or the steps from a scope version
    Versions {
        /// Recorded scope version
        #[arg(long)]
        from: Option<String>,
    },
    /// Resolve the directory of a snapshot
    SnapshotPath {
        /// Snapshots root, defaults to the configured one
        #[arg(long)]
        root: Option<PathBuf>,
        /// Scope name
        #[arg(short, long, default_value = DEFAULT_SCOPE_NAME)]
        scope: String,
        /// Filter parameters (name=value)
        #[arg(short, long = "param")]
        params: Vec<String>,
    },
    /// Synchronize two in-memory databases
    Demo {
        /// Rows created on the server
        #[arg(long, default_value = "100")]
        rows: i64,
        /// Rows created on the client
        #[arg(long, default_value = "10")]
        client_rows: i64,
        /// Batch size in KB
        #[arg(long)]
        batch_size: Option<usize>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false),
        )
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let options = match &cli.config {
        Some(path) => SyncOptions::from_toml_file(path)?,
        None => SyncOptions::default(),
    };

    match cli.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&options)?);
        }

        Commands::Inspect { dir, json } => {
            let dir = PathBuf::from(shellexpand::tilde(&dir.to_string_lossy()).to_string());
            let rt = tokio::runtime::Runtime::new()?;
            let batch = rt.block_on(BatchInfo::load(&dir))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&batch)?);
            } else {
                println!("{}", batch.directory_path().display());
                println!(
                    "timestamp {}, {} rows in {} parts, serializer {}{}",
                    batch.timestamp,
                    batch.rows_count,
                    batch.parts.len(),
                    batch.serializer,
                    if batch.is_snapshot { ", snapshot" } else { "" }
                );
                for part in &batch.parts {
                    let tables: Vec<String> = part
                        .tables
                        .iter()
                        .map(|t| match &t.schema_name {
                            Some(schema) => format!("{}.{}", schema, t.table_name),
                            None => t.table_name.clone(),
                        })
                        .collect();
                    println!(
                        "#{:<4} {:<40} {:<24} {:>8} rows{}",
                        part.index,
                        part.file_name,
                        tables.join(", "),
                        part.rows_count,
                        if part.is_last_batch { "  (last)" } else { "" }
                    );
                }
            }
        }

        Commands::Versions { from } => {
            let steps = match from {
                Some(from) => {
                    let version = parse_version(&from)?;
                    let path = upgrade_path(version)?;
                    if path.is_empty() {
                        println!("{} is current", version);
                    }
                    path
                }
                None => UPGRADE_CHAIN.iter().collect(),
            };
            for step in steps {
                println!("{} -> {}  {:?}", step.from, step.to, step.action);
            }
            println!("current: {}", CURRENT_VERSION);
        }

        Commands::SnapshotPath {
            root,
            scope,
            params,
        } => {
            let root = root
                .or_else(|| options.snapshots_directory.clone())
                .ok_or_else(|| {
                    SyncError::Config("snapshots_directory is not configured".to_string())
                })?;
            let parameters = parse_parameters(&params)?;
            println!("{}", snapshot_directory(&root, &scope, &parameters).display());
        }

        Commands::Demo {
            rows,
            client_rows,
            batch_size,
        } => {
            let mut options = options;
            if let Some(kb) = batch_size {
                options = options.with_batch_size(kb);
            }
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_demo(options, rows, client_rows))?;
        }
    }

    Ok(())
}

fn parse_parameters(params: &[String]) -> Result<SyncParameters> {
    let mut parameters = SyncParameters::new();
    for param in params {
        let (name, value) = param.split_once('=').ok_or_else(|| {
            SyncError::Config(format!("parameter '{}' is not name=value", param))
        })?;
        let value = value
            .parse::<i64>()
            .map(serde_json::Value::from)
            .unwrap_or_else(|_| serde_json::Value::from(value));
        parameters.insert(name.trim(), value);
    }
    Ok(parameters)
}

async fn run_demo(options: SyncOptions, server_rows: i64, client_rows: i64) -> Result<()> {
    let root = options.batch_directory.join("demo");
    let table = SyncTable::new("Customer")
        .with_key_column(SyncColumn::new("Id", "int"))
        .with_column(SyncColumn::new("Name", "text").nullable());

    let server = InMemoryProvider::new();
    server.create_table(table);
    for id in 0..server_rows {
        server.upsert_row("Customer", json!({"Id": id, "Name": format!("server {}", id)}))?;
    }
    let client = InMemoryProvider::new();

    let setup = SyncSetup::new(["Customer"]);
    let remote = RemoteOrchestrator::new(
        Arc::new(server.clone()),
        setup.clone(),
        options.clone().with_batch_directory(root.join("server")),
    )?;
    let local = LocalOrchestrator::new(
        Arc::new(client.clone()),
        setup,
        options.with_batch_directory(root.join("client")),
    )?;
    let agent = SyncAgent::new(local, Arc::new(remote));

    let first = agent.synchronize().await?;
    println!("{}", serde_json::to_string_pretty(&first)?);

    for id in 0..client_rows {
        let id = server_rows + id;
        client.upsert_row("Customer", json!({"Id": id, "Name": format!("client {}", id)}))?;
    }
    let second = agent.synchronize().await?;
    println!("{}", serde_json::to_string_pretty(&second)?);

    println!(
        "server: {} rows, client: {} rows",
        server.row_count("Customer"),
        client.row_count("Customer")
    );
    Ok(())
}
