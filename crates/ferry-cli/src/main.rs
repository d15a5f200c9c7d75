//! Ferry CLI
//!
//! Command-line interface for Ferry - local-first records with background sync.

use std::fs::File;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use ferry_core::{CacheError, Config, DeviceIdentity, Ferry, StorageError, SyncError, Table};

mod commands;
mod output;

use commands::record::ListFilter;
use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "ferry")]
#[command(about = "Ferry - Local-first records with background sync")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Use a specific config file
    #[arg(long, global = true, value_name = "PATH")]
    config_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize Ferry (create the device identity and store)
    Init,
    /// Device identity management
    Device {
        #[command(subcommand)]
        command: Option<DeviceCommands>,
    },
    /// Manage records
    Record {
        #[command(subcommand)]
        command: RecordCommands,
    },
    /// Find a record by natural key (asks the server while online)
    Lookup {
        /// Table name (patients, appointments, documents)
        table: Table,
        /// Natural key value
        key: String,
    },
    /// List records belonging to a patient, refreshed from the server
    Related {
        /// Child table name
        table: Table,
        /// Parent record ID
        parent_id: String,
    },
    /// Inspect the sync queue
    Queue {
        #[command(subcommand)]
        command: Option<QueueCommands>,
    },
    /// Push pending changes and pull from the server
    Sync,
    /// Re-pull every table from the beginning
    Bootstrap,
    /// Run background sync and print a table as it changes
    Watch {
        /// Table name
        table: Table,
    },
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Show status (sync state, queue, cursors)
    Status,
}

#[derive(Subcommand, Clone)]
enum DeviceCommands {
    /// Show device ID
    Show,
}

#[derive(Subcommand)]
enum RecordCommands {
    /// Create or update a record from a JSON object
    #[command(alias = "save")]
    Put {
        /// Table name
        table: Table,
        /// Record as JSON (an "id" member updates that record)
        #[arg(value_name = "JSON")]
        data: String,
    },
    /// Show a record
    Get {
        /// Table name
        table: Table,
        /// Record ID
        id: String,
    },
    /// List records, newest first
    #[command(alias = "ls")]
    List {
        /// Table name
        table: Table,
        /// Only children of this parent
        #[arg(long)]
        parent: Option<String>,
        /// Only records with this natural key
        #[arg(long)]
        key: Option<String>,
        /// Only records not yet acknowledged by the server
        #[arg(long)]
        unsynced: bool,
    },
    /// Delete a record
    #[command(alias = "rm")]
    Delete {
        /// Table name
        table: Table,
        /// Record ID
        id: String,
    },
}

#[derive(Subcommand)]
enum QueueCommands {
    /// List queue items
    #[command(alias = "ls")]
    List {
        /// Filter by status (pending, synced, failed)
        #[arg(short, long)]
        status: Option<String>,
    },
    /// Return failed items to pending
    Retry {
        /// Queue item ID (all failed items if omitted)
        id: Option<i64>,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (data_dir, sync_url, sync_enabled, ...)
        key: String,
        /// Configuration value
        value: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {:?}", e);
        if let Some(suggestion) = recovery_suggestion(&e) {
            eprintln!("\nHint: {}", suggestion);
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));
    let config_path = cli.config_file.as_ref();

    // Config commands work without an initialized device
    if let Some(Commands::Config { command }) = &cli.command {
        return handle_config_command(command.clone(), config_path, &output);
    }

    let config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;
    init_logging(&config);

    match &cli.command {
        Some(Commands::Init) => return commands::device::init(&config, &output),
        Some(Commands::Device { .. }) => return commands::device::show(&config, &output),
        _ => {}
    }

    if !DeviceIdentity::is_initialized(&config) {
        commands::device::init(&config, &output)?;
    }

    let ferry = Ferry::open_with_config(config)?;

    let is_write = matches!(
        &cli.command,
        Some(Commands::Record {
            command: RecordCommands::Put { .. } | RecordCommands::Delete { .. }
        }) | Some(Commands::Queue {
            command: Some(QueueCommands::Retry { .. })
        })
    );
    let is_local_read = matches!(
        &cli.command,
        Some(Commands::Record {
            command: RecordCommands::Get { .. } | RecordCommands::List { .. }
        })
    );

    // Pull before local reads (to get latest data)
    if is_local_read {
        commands::sync::pull_quiet(&ferry, &output).await;
    }

    let result = match cli.command {
        Some(Commands::Record { command }) => handle_record_command(command, &ferry, &output),
        Some(Commands::Lookup { table, key }) => {
            commands::lookup::lookup(&ferry, table, &key, &output).await
        }
        Some(Commands::Related { table, parent_id }) => {
            commands::lookup::related(&ferry, table, &parent_id, &output).await
        }
        Some(Commands::Queue { command }) => handle_queue_command(command, &ferry, &output),
        Some(Commands::Sync) => commands::sync::sync(&ferry, &output).await,
        Some(Commands::Bootstrap) => commands::sync::bootstrap(&ferry, &output).await,
        Some(Commands::Watch { table }) => commands::watch::watch(&ferry, table, &output).await,
        Some(Commands::Status) | None => commands::status::show(&ferry, &output),
        Some(Commands::Init) | Some(Commands::Device { .. }) | Some(Commands::Config { .. }) => {
            Ok(())
        }
    };

    // Push after write commands
    if is_write && result.is_ok() {
        commands::sync::flush_quiet(&ferry, &output).await;
    }

    result
}

/// Recovery advice for a storage failure anywhere in the error chain
fn recovery_suggestion(error: &anyhow::Error) -> Option<&'static str> {
    error.chain().find_map(|cause| {
        let storage = cause.downcast_ref::<StorageError>().or_else(|| {
            match (cause.downcast_ref::<SyncError>(), cause.downcast_ref::<CacheError>()) {
                (Some(SyncError::Storage(e)), _) | (_, Some(CacheError::Storage(e))) => Some(e),
                _ => None,
            }
        })?;
        storage.recovery_suggestion()
    })
}

fn handle_record_command(command: RecordCommands, ferry: &Ferry, output: &Output) -> Result<()> {
    match command {
        RecordCommands::Put { table, data } => commands::record::put(ferry, table, &data, output),
        RecordCommands::Get { table, id } => commands::record::get(ferry, table, &id, output),
        RecordCommands::List {
            table,
            parent,
            key,
            unsynced,
        } => {
            let filter = ListFilter {
                parent,
                key,
                unsynced,
            };
            commands::record::list(ferry, table, &filter, output)
        }
        RecordCommands::Delete { table, id } => commands::record::delete(ferry, table, &id, output),
    }
}

fn handle_queue_command(
    command: Option<QueueCommands>,
    ferry: &Ferry,
    output: &Output,
) -> Result<()> {
    match command {
        Some(QueueCommands::List { status }) => {
            commands::queue::list(ferry, status.as_deref(), output)
        }
        None => commands::queue::list(ferry, None, output),
        Some(QueueCommands::Retry { id }) => commands::queue::retry(ferry, id, output),
    }
}

fn handle_config_command(
    command: Option<ConfigCommands>,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    match command {
        Some(ConfigCommands::Show) | None => commands::config::show(config_path, output),
        Some(ConfigCommands::Set { key, value }) => {
            commands::config::set(key, value, config_path, output)
        }
    }
}

/// File-based logging, enabled by setting FERRY_LOG to a level
fn init_logging(config: &Config) {
    let Ok(log_level) = std::env::var("FERRY_LOG") else {
        return;
    };

    let log_path = config
        .log_file
        .clone()
        .unwrap_or_else(|| config.data_dir.join("debug.log"));

    let log_file = match File::create(&log_path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Warning: Could not create log file {:?}: {}", log_path, e);
            return;
        }
    };

    let env_filter = EnvFilter::new(format!("ferry_core={},ferry_cli={}", log_level, log_level));

    // Ignore the error if a subscriber is already installed
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(log_file)
        .try_init();

    info!("Logging initialized to {:?}", log_path);
}
