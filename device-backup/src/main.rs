//! Device Backup - Main entry point
//!
//! Command line front end for device backups, backup decryption and the
//! local backup catalog.

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use device_backup::{
    config::Config,
    daemon::shutdown::ShutdownCoordinator,
    transfer::progress::{format_bytes, format_duration},
    utils, BackupCatalog, BackupEvent, BackupOptions, BackupOrchestrator, DecryptionEngine,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use zeroize::Zeroizing;

/// Backup password source; never taken from the command line.
const PASSWORD_ENV: &str = "DEVICE_BACKUP_PASSWORD";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Report whether the device will encrypt its backup
    Status {
        #[arg(short, long)]
        device: String,
    },

    /// Back up a device (password from DEVICE_BACKUP_PASSWORD)
    Backup {
        #[arg(short, long)]
        device: String,

        /// Output directory (defaults to the backup root)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Force a full backup
        #[arg(long)]
        full: bool,

        /// Include application data
        #[arg(long)]
        include_apps: bool,
    },

    /// Decrypt the messages and contacts stores of an encrypted backup
    Decrypt { path: PathBuf },

    /// Check the backup password without writing anything
    Verify { path: PathBuf },

    /// Scrub and remove a decrypted output directory
    Cleanup { path: PathBuf },

    /// List backups under the backup root
    List,

    /// Delete one backup under the backup root
    Delete { path: PathBuf },

    /// Keep only the newest backups of each device
    Prune {
        #[arg(short, long)]
        keep: Option<usize>,
    },
}

fn password_from_env() -> Option<Zeroizing<String>> {
    std::env::var(PASSWORD_ENV)
        .ok()
        .filter(|p| !p.is_empty())
        .map(Zeroizing::new)
}

fn require_password() -> Result<Zeroizing<String>> {
    match password_from_env() {
        Some(password) => Ok(password),
        None => bail!("{} is not set", PASSWORD_ENV),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        Config::from_file(config_path)?
    } else {
        Config::default()
    };
    config.apply_env_overrides();

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::debug!("Starting device-backup v{}", env!("CARGO_PKG_VERSION"));

    let catalog = BackupCatalog::new(&config.backup.root);
    let engine = DecryptionEngine::new();

    match args.command {
        Command::Status { device } => {
            let orchestrator = BackupOrchestrator::new(config);
            let will_encrypt = orchestrator.check_encryption_status(&device).await;
            println!("{}", if will_encrypt { "encrypted" } else { "not encrypted" });
        }

        Command::Backup {
            device,
            output,
            full,
            include_apps,
        } => {
            let output = output.unwrap_or_else(|| config.backup.root.clone());
            let mut options = BackupOptions::new(device, output)
                .with_force_full(full)
                .with_skip_apps(!include_apps);
            options.password = password_from_env();

            if !run_backup(config, options).await? {
                std::process::exit(1);
            }
        }

        Command::Decrypt { path } => {
            let password = require_password()?;
            let outcome =
                tokio::task::spawn_blocking(move || engine.decrypt(&path, &password)).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if !outcome.success {
                std::process::exit(1);
            }
        }

        Command::Verify { path } => {
            let password = require_password()?;
            let valid =
                tokio::task::spawn_blocking(move || engine.verify_password(&path, &password))
                    .await?;
            println!("{}", if valid { "password ok" } else { "password incorrect" });
            if !valid {
                std::process::exit(1);
            }
        }

        Command::Cleanup { path } => {
            let removed = tokio::task::spawn_blocking(move || engine.cleanup(&path)).await??;
            println!("Removed {} decrypted file(s)", removed);
        }

        Command::List => {
            let backups = tokio::task::spawn_blocking(move || catalog.list_backups()).await?;
            for backup in &backups {
                tracing::debug!(
                    "{} {} ({})",
                    backup.device_id,
                    backup.path.display(),
                    format_bytes(backup.size_bytes)
                );
            }
            println!("{}", serde_json::to_string_pretty(&backups)?);
        }

        Command::Delete { path } => {
            catalog.delete_backup(&path).await?;
            println!("Deleted {}", path.display());
        }

        Command::Prune { keep } => {
            let keep = keep.unwrap_or(config.backup.keep_per_device);
            let deleted = catalog.cleanup_old_backups(keep).await;
            for path in &deleted {
                println!("Deleted {}", path.display());
            }
        }
    }

    Ok(())
}

/// Runs one backup, logging its events, and prints the result.
/// Returns whether it succeeded.
async fn run_backup(config: Config, options: BackupOptions) -> Result<bool> {
    let orchestrator = Arc::new(BackupOrchestrator::new(config));
    let mut events = orchestrator.subscribe();

    let reporter = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(BackupEvent::Progress(progress)) => {
                    let eta = progress
                        .estimated_seconds_remaining
                        .map(format_duration)
                        .unwrap_or_else(|| "-".to_string());
                    tracing::info!(
                        "{:?} {:.0}% ({} files, {}, eta {})",
                        progress.phase,
                        progress.percent,
                        progress.files_transferred,
                        format_bytes(progress.bytes_transferred),
                        eta
                    );
                }
                Ok(BackupEvent::PasswordRequired { device_id }) => {
                    tracing::warn!(
                        "Device {} encrypts its backups; set {}",
                        device_id,
                        PASSWORD_ENV
                    );
                }
                Ok(BackupEvent::Error { code, message }) => {
                    tracing::error!("{}: {}", code, message);
                }
                Ok(BackupEvent::Complete(_)) | Err(RecvError::Closed) => break,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!("Skipped {} progress event(s)", skipped);
                }
            }
        }
    });

    // Ctrl+C / SIGTERM cancels the run
    let shutdown = Arc::new(ShutdownCoordinator::new());
    let mut shutdown_rx = shutdown.subscribe();
    let canceller = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            if shutdown_rx.recv().await.is_ok() {
                orchestrator.cancel_backup();
            }
        })
    };
    let signals = {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move { shutdown.wait_for_signal().await })
    };

    let result = orchestrator.start_backup(options).await;
    signals.abort();
    canceller.abort();
    let result = result?;

    if let Err(e) = reporter.await {
        tracing::debug!("Event reporter ended abnormally: {}", e);
    }

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(result.success)
}
