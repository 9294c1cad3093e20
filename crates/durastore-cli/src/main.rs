//! DuraStore CLI
//!
//! Thin wrapper around durastore-core functions for command-line usage.
//!
//! ## Usage
//!
//! ```bash
//! # Show store information and layer health
//! durastore info
//!
//! # Save a JSON value under a logical key
//! durastore save tasks '[{"id": 1, "title": "water the beds"}]'
//!
//! # Load a logical key
//! durastore load tasks
//!
//! # Create a manual backup
//! durastore backup create
//!
//! # List retained backups
//! durastore backup list
//!
//! # Restore a backup
//! durastore backup restore <backup_id>
//!
//! # Export a backup to a portable file
//! durastore backup export <backup_id> -o backup.json
//!
//! # Import a portable backup file
//! durastore backup import backup.json
//!
//! # Show sync status
//! durastore sync status
//!
//! # Show or initialize the config file
//! durastore config show
//! ```

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Result;
use clap::{Parser, Subcommand};
use durastore_core::{
    BackupId, DuraStore, LogicalKey, RestoreOptions, StoreConfig, SyncStatus,
};

/// DuraStore - Offline-First Data Durability
#[derive(Parser)]
#[command(name = "durastore")]
#[command(version = "0.1.0")]
#[command(about = "DuraStore - Offline-First Data Durability")]
#[command(
    long_about = "A local-first durability store with layered failover persistence, bounded backup history, and optional replication to a remote replica."
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Data directory (default: ~/.durastore/data)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show store information and layer health
    Info,

    /// Save a JSON value under a logical key
    Save {
        /// Logical key (tasks, projects, canvas, settings)
        key: String,
        /// JSON value, read from stdin when omitted
        value: Option<String>,
    },

    /// Load the value stored under a logical key
    Load {
        /// Logical key (tasks, projects, canvas, settings)
        key: String,
    },

    /// Backup management
    Backup {
        #[command(subcommand)]
        action: BackupAction,
    },

    /// Replication management
    Sync {
        #[command(subcommand)]
        action: SyncAction,
    },

    /// Config file management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum BackupAction {
    /// Create a manual backup now
    Create,
    /// List retained backups, newest first
    List,
    /// Show one backup's metadata
    Show {
        /// Backup ID (backup_<ULID>)
        backup_id: String,
    },
    /// Restore a backup over the current data
    Restore {
        /// Backup ID (backup_<ULID>)
        backup_id: String,
        /// Skip the pre-restore safety snapshot
        #[arg(long)]
        no_safety_snapshot: bool,
        /// Skip checksum validation
        #[arg(long)]
        no_checksum: bool,
    },
    /// Delete a backup from history
    Delete {
        /// Backup ID (backup_<ULID>)
        backup_id: String,
    },
    /// Export a backup to a portable JSON file
    Export {
        /// Backup ID (backup_<ULID>)
        backup_id: String,
        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Import a portable JSON backup file into history
    Import {
        /// Path to the exported file
        file: PathBuf,
    },
}

#[derive(Subcommand)]
enum SyncAction {
    /// Show current sync status and pending changes
    Status,
    /// Run a one-shot sync now (push then pull)
    Now,
    /// Show accumulated sync errors
    Errors,
    /// Clear accumulated sync errors
    ClearErrors,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Write a default config file if none exists
    Init,
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();
}

/// Get the default data directory (~/.durastore/data)
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".durastore")
        .join("data")
}

fn config_path(data_dir: &PathBuf) -> PathBuf {
    data_dir.join("config.json")
}

/// Parse a logical key name
fn parse_key(s: &str) -> Result<LogicalKey> {
    LogicalKey::from_str(s).map_err(|e| anyhow::anyhow!("Invalid key '{}': {}", s, e))
}

/// Parse a backup ID
fn parse_backup_id(s: &str) -> Result<BackupId> {
    BackupId::from_str(s).map_err(|e| anyhow::anyhow!("Invalid backup ID '{}': {}", s, e))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    let config = StoreConfig::load(config_path(&data_dir))?;
    let store = DuraStore::open(&data_dir, config).await?;

    match cli.command {
        Commands::Info => {
            println!("DuraStore v0.1.0");
            println!();
            println!("Data directory: {}", store.data_dir().display());
            println!();
            println!("Storage layers:");
            for desc in store.layer_descriptors() {
                let status = if desc.is_available { "ok" } else { "unavailable" };
                println!("  [{}] {:<12} {}", desc.reliability_rank, desc.name, status);
            }
            println!();
            let backups = store.list_backups()?;
            println!("Backups retained: {}", backups.len());
            println!(
                "Auto-backup: {}",
                if store.is_auto_backup_running() {
                    "running"
                } else {
                    "stopped"
                }
            );
            println!(
                "Replication: {}",
                if store.is_local_only() {
                    "local-only"
                } else {
                    "remote attached"
                }
            );
        }

        Commands::Save { key, value } => {
            let key = parse_key(&key)?;
            let raw = match value {
                Some(v) => v,
                None => std::io::read_to_string(std::io::stdin())?,
            };
            let value: serde_json::Value = serde_json::from_str(&raw)
                .map_err(|e| anyhow::anyhow!("Value is not valid JSON: {}", e))?;

            let outcome = store.save(key, value).await?;
            if outcome.report.is_success() {
                println!(
                    "Saved '{}' to {} layer(s): {}",
                    key,
                    outcome.report.success_count(),
                    outcome.report.succeeded.join(", ")
                );
            } else {
                anyhow::bail!("Save of '{}' failed on every layer", key);
            }
            for (layer, error) in &outcome.report.failed {
                println!("warning: layer '{}' failed: {}", layer, error);
            }
            for race in &outcome.races {
                println!(
                    "warning: instance {} wrote '{}' concurrently",
                    race.other_tab, race.doc_id
                );
            }
            if outcome.degraded {
                println!("warning: write coordination unavailable, saved without it");
            }
        }

        Commands::Load { key } => {
            let key = parse_key(&key)?;
            match store.load(key)? {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => println!("(no data stored under '{}')", key),
            }
        }

        Commands::Backup { action } => match action {
            BackupAction::Create => {
                let backup = store.create_manual_backup()?;
                println!("Created backup {}", backup.id);
                println!("  kind:     {}", backup.kind);
                println!("  size:     {} bytes", backup.size_bytes);
                println!("  checksum: {}", backup.checksum);
            }

            BackupAction::List => {
                let backups = store.list_backups()?;
                if backups.is_empty() {
                    println!("No backups retained.");
                } else {
                    for backup in backups {
                        println!(
                            "{}  {:<12} {:>10} bytes  created {}",
                            backup.id, backup.kind, backup.size_bytes, backup.created_at
                        );
                    }
                }
            }

            BackupAction::Show { backup_id } => {
                let id = parse_backup_id(&backup_id)?;
                match store.get_backup(&id)? {
                    Some(backup) => {
                        println!("Backup {}", backup.id);
                        println!("  kind:       {}", backup.kind);
                        println!("  created at: {}", backup.created_at);
                        println!("  size:       {} bytes", backup.size_bytes);
                        println!("  checksum:   {}", backup.checksum);
                        println!(
                            "  integrity:  {}",
                            if backup.verify_checksum() {
                                "ok"
                            } else {
                                "MISMATCH"
                            }
                        );
                    }
                    None => anyhow::bail!("No backup with ID '{}'", backup_id),
                }
            }

            BackupAction::Restore {
                backup_id,
                no_safety_snapshot,
                no_checksum,
            } => {
                let id = parse_backup_id(&backup_id)?;
                let options = RestoreOptions {
                    pre_restore_snapshot: !no_safety_snapshot,
                    validate_checksum: !no_checksum,
                    ..RestoreOptions::default()
                };
                let report = store.restore_backup(&id, &options)?;

                if report.success {
                    println!("Restore complete.");
                } else {
                    println!("Restore finished with errors.");
                }
                for (key, count) in &report.per_key_counts {
                    println!("  {}: {} item(s)", key, count);
                }
                if let Some(safety_id) = &report.pre_restore_backup_id {
                    println!("Pre-restore snapshot: {}", safety_id);
                }
                for warning in &report.warnings {
                    println!("warning: {}", warning);
                }
                for error in &report.errors {
                    println!("error: {}", error);
                }
                if !report.success {
                    anyhow::bail!("Restore of '{}' did not fully succeed", backup_id);
                }
            }

            BackupAction::Delete { backup_id } => {
                let id = parse_backup_id(&backup_id)?;
                store.delete_backup(&id)?;
                println!("Deleted backup {}", backup_id);
            }

            BackupAction::Export { backup_id, output } => {
                let id = parse_backup_id(&backup_id)?;
                let serialized = store.export_backup(&id)?;
                match output {
                    Some(path) => {
                        std::fs::write(&path, serialized)?;
                        println!("Exported backup {} to {}", backup_id, path.display());
                    }
                    None => println!("{}", serialized),
                }
            }

            BackupAction::Import { file } => {
                let serialized = std::fs::read_to_string(&file)?;
                let backup = store.import_backup(&serialized)?;
                println!("Imported backup {} ({} bytes)", backup.id, backup.size_bytes);
            }
        },

        Commands::Sync { action } => match action {
            SyncAction::Status => {
                let state = store.sync_status();
                let status = match &state.status {
                    SyncStatus::Idle => "idle".to_string(),
                    SyncStatus::Syncing => "syncing".to_string(),
                    SyncStatus::Paused => "paused".to_string(),
                    SyncStatus::Complete => "complete".to_string(),
                    SyncStatus::Error(msg) => format!("error ({})", msg),
                };
                println!("Status: {}", status);
                println!("Pending changes: {}", state.pending_changes);
                match state.last_sync {
                    Some(ts) => println!("Last sync: {}", ts),
                    None => println!("Last sync: never"),
                }
                if store.is_local_only() {
                    println!("Mode: local-only (no remote replica configured)");
                }
            }

            SyncAction::Now => {
                let report = store.trigger_manual_sync()?;
                println!("Pushed {} change(s), pulled {}.", report.pushed, report.pulled);
            }

            SyncAction::Errors => {
                let state = store.sync_status();
                if state.error_log.is_empty() {
                    println!("No sync errors.");
                } else {
                    for error in &state.error_log {
                        println!("{}", error);
                    }
                }
            }

            SyncAction::ClearErrors => {
                store.clear_sync_errors();
                println!("Sync errors cleared.");
            }
        },

        Commands::Config { action } => match action {
            ConfigAction::Show => {
                println!("{}", serde_json::to_string_pretty(store.config())?);
            }

            ConfigAction::Init => {
                let path = config_path(&data_dir);
                if path.exists() {
                    println!("Config already exists at {}", path.display());
                } else {
                    StoreConfig::default().save(&path)?;
                    println!("Wrote default config to {}", path.display());
                }
            }
        },
    }

    store.shutdown();
    Ok(())
}
