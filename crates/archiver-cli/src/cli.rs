//! Command line interface
//!
//! Every command builds an [`ArchiveManager`] from the global path options,
//! runs one operation and renders job progress from a [`ChannelSink`].

use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context};
use archiver_core::{
    default_catalog_dir, format_size, ArchiveManager, ArchivePaths, ChannelSink, JobEvent,
    JobHandle, JobOutcome, JobState,
};
use chrono::{Local, Utc};
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "archiver",
    version,
    about = "Back up and restore a file-based data store",
    long_about = "Creates versioned, self-describing archives of a data store file and \
                  its resource directory, keeps a bounded catalog of them and restores \
                  them with a safety copy of the current data."
)]
pub struct Cli {
    /// Data store file to back up and restore
    #[arg(long, env = "ARCHIVER_DATA_STORE", default_value = "database.db", global = true)]
    pub data_store: PathBuf,

    /// Resource directory included in full backups
    #[arg(long, env = "ARCHIVER_RESOURCES", global = true)]
    pub resources: Option<PathBuf>,

    /// Directory holding the archives and settings
    #[arg(long, env = "ARCHIVER_CATALOG", global = true)]
    pub catalog: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a backup now
    Backup {
        /// Include the resource directory
        #[arg(short, long)]
        full: bool,

        /// Write the archive here instead of the catalog
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Cancel the backup if it runs longer than this
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Restore an archive over the data store
    Restore {
        /// Archive path, catalog file name, or 'latest'
        archive: String,

        /// Restore into this directory instead of the configured locations
        #[arg(long)]
        to: Option<PathBuf>,

        /// Skip the confirmation notice
        #[arg(short, long)]
        yes: bool,

        /// Cancel the restore if it does not reach the data store step in time
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// List archives in the catalog, newest first
    #[command(alias = "ls")]
    List {
        #[arg(long)]
        json: bool,
    },

    /// Check an archive's integrity
    Verify {
        /// Archive path, catalog file name, or 'latest'
        archive: String,

        #[arg(long)]
        json: bool,
    },

    /// Delete an archive from the catalog
    #[command(alias = "rm")]
    Delete {
        /// Archive path or catalog file name
        archive: String,
    },

    /// Show the data store, catalog and schedule
    Info,

    /// Show or change archiver settings
    Settings {
        #[command(subcommand)]
        action: Option<SettingsCommand>,
    },

    /// Run one scheduler tick; backs up if one is due
    Tick,

    /// Run scheduler ticks until interrupted
    Schedule {
        /// Seconds between ticks
        #[arg(long, default_value = "60")]
        poll_secs: u64,
    },
}

#[derive(Subcommand, Debug)]
pub enum SettingsCommand {
    /// Print the current settings
    Show,

    /// Change one or more settings
    Set {
        /// Enable or disable scheduled backups
        #[arg(long)]
        enabled: Option<bool>,

        /// Hours between scheduled backups
        #[arg(long)]
        interval_hours: Option<u32>,

        /// Maximum number of archives to keep
        #[arg(long)]
        max_backups: Option<u32>,
    },
}

/// Run a parsed command line
pub fn run(cli: Cli) -> anyhow::Result<()> {
    let manager = build_manager(&cli)?;

    match cli.command {
        Commands::Backup {
            full,
            output,
            timeout_secs,
        } => run_backup(&manager, full, output, timeout_secs),
        Commands::Restore {
            archive,
            to,
            yes,
            timeout_secs,
        } => run_restore(&manager, &archive, to, yes, timeout_secs),
        Commands::List { json } => run_list(&manager, json),
        Commands::Verify { archive, json } => run_verify(&manager, &archive, json),
        Commands::Delete { archive } => {
            let path = resolve_archive(&manager, &archive)?;
            manager.delete_archive(&path)?;
            println!("Deleted {}", path.display());
            Ok(())
        }
        Commands::Info => run_info(&manager),
        Commands::Settings { action } => run_settings(&manager, action),
        Commands::Tick => run_tick(&manager),
        Commands::Schedule { poll_secs } => run_schedule(&manager, poll_secs),
    }
}

fn build_manager(cli: &Cli) -> anyhow::Result<ArchiveManager> {
    let catalog_dir = match &cli.catalog {
        Some(dir) => dir.clone(),
        None => default_catalog_dir()
            .ok_or_else(|| anyhow!("No local data directory; pass --catalog"))?,
    };

    Ok(ArchiveManager::with_json_settings(ArchivePaths {
        data_store: cli.data_store.clone(),
        resources: cli.resources.clone(),
        catalog_dir,
    }))
}

/// Accept a path, a file name inside the catalog, or `latest`
fn resolve_archive(manager: &ArchiveManager, archive: &str) -> anyhow::Result<PathBuf> {
    if archive == "latest" {
        return manager
            .list_archives()?
            .into_iter()
            .next()
            .map(|record| record.path)
            .ok_or_else(|| anyhow!("No archives in {}", manager.catalog_dir().display()));
    }

    let direct = PathBuf::from(archive);
    if direct.is_file() {
        return Ok(direct);
    }
    let in_catalog = manager.catalog_dir().join(archive);
    if in_catalog.is_file() {
        return Ok(in_catalog);
    }
    bail!("Archive not found: {}", archive)
}

/// Render job events until the job completes, cancelling at the deadline
fn drive(handle: JobHandle, events: Receiver<JobEvent>, timeout: Option<Duration>) -> JobOutcome {
    let deadline = timeout.map(|t| Instant::now() + t);
    let mut cancelled = false;

    loop {
        match events.recv_timeout(Duration::from_millis(100)) {
            Ok(JobEvent::Progress { percent, message }) => {
                eprint!("\r[{:>3}%] {:<40}", percent, message);
            }
            Ok(JobEvent::Completed { .. }) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        if let Some(deadline) = deadline {
            if !cancelled && Instant::now() >= deadline {
                tracing::warn!("{} timed out, cancelling", handle.kind());
                handle.cancel();
                cancelled = true;
            }
        }
    }
    eprintln!();

    handle.wait()
}

fn finish(outcome: JobOutcome) -> anyhow::Result<()> {
    match outcome.state {
        JobState::Completed => {
            println!("{}", outcome.message);
            Ok(())
        }
        _ => Err(anyhow!(outcome.message)),
    }
}

fn channel() -> (Arc<ChannelSink>, Receiver<JobEvent>) {
    let (tx, rx) = mpsc::channel();
    (Arc::new(ChannelSink::new(tx)), rx)
}

fn run_backup(
    manager: &ArchiveManager,
    full: bool,
    output: Option<PathBuf>,
    timeout_secs: Option<u64>,
) -> anyhow::Result<()> {
    let (sink, events) = channel();
    let handle = manager
        .create_backup(full, output, sink)
        .context("Failed to start backup")?;
    finish(drive(handle, events, timeout_secs.map(Duration::from_secs)))
}

fn run_restore(
    manager: &ArchiveManager,
    archive: &str,
    to: Option<PathBuf>,
    yes: bool,
    timeout_secs: Option<u64>,
) -> anyhow::Result<()> {
    let path = resolve_archive(manager, archive)?;

    let report = manager.verify_archive(&path);
    if !report.valid {
        bail!(
            "Cannot restore {}: {}",
            path.display(),
            report.error.unwrap_or_else(|| "archive is invalid".to_string())
        );
    }

    if let Some(metadata) = &report.metadata {
        println!("Archive: {}", path.display());
        println!(
            "  Created: {}",
            metadata.created_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
        );
        println!("  Kind:    {}", metadata.kind);
        println!("  Version: {}", metadata.app_version);
    }

    if !yes {
        let target = match &to {
            Some(dir) => dir.display().to_string(),
            None => manager.paths().data_store.display().to_string(),
        };
        println!();
        println!("WARNING: This will overwrite {}.", target);
        println!("The current data store is kept as a .backup copy beside it.");
        println!("To proceed, run again with --yes:");
        println!("  archiver restore {} --yes", archive);
        return Ok(());
    }

    let (sink, events) = channel();
    let handle = manager
        .restore_from_backup(&path, to, sink)
        .context("Failed to start restore")?;
    finish(drive(handle, events, timeout_secs.map(Duration::from_secs)))
}

fn run_list(manager: &ArchiveManager, json: bool) -> anyhow::Result<()> {
    let records = manager.list_archives()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No backups found in {}", manager.catalog_dir().display());
        println!("Create one with: archiver backup");
        return Ok(());
    }

    let now = Utc::now();
    for (i, record) in records.iter().enumerate() {
        println!(
            "  {:>2}. {}  {:<8} {:>10}  {}",
            i + 1,
            record.name,
            record.kind_display(),
            record.size_display(),
            record.age_display(now)
        );
    }
    println!();
    println!("Total: {} backup(s)", records.len());
    Ok(())
}

fn run_verify(manager: &ArchiveManager, archive: &str, json: bool) -> anyhow::Result<()> {
    let path = resolve_archive(manager, archive)?;
    let report = manager.verify_archive(&path);

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if report.valid {
        println!("OK: {}", path.display());
        println!("  Entries: {}", report.files.len());
        println!("  Resources: {}", if report.has_resources() { "yes" } else { "no" });
        match &report.metadata {
            Some(metadata) => {
                println!("  Created: {}", metadata.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
                println!("  Data store: {}", format_size(metadata.source_size_bytes));
                println!("  Format version: {}", metadata.format_version);
            }
            None => println!("  No metadata (older archive)"),
        }
    }

    if !report.valid {
        bail!(
            "{} is not a valid archive: {}",
            path.display(),
            report.error.unwrap_or_default()
        );
    }
    Ok(())
}

fn run_info(manager: &ArchiveManager) -> anyhow::Result<()> {
    let paths = manager.paths();
    let settings = manager.settings();

    println!("Data store: {}", paths.data_store.display());
    match manager.store_info() {
        Ok(info) => {
            println!("  Size: {}", info.size_display());
            if let Some(modified) = info.last_modified {
                println!(
                    "  Modified: {}",
                    modified.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        Err(e) => println!("  {}", e),
    }
    if let Some(resources) = &paths.resources {
        println!("Resources:  {}", resources.display());
    }
    println!("Catalog:    {}", paths.catalog_dir.display());
    println!("  Archives: {}", manager.list_archives()?.len());
    println!();
    println!("{}", manager.auto_backup_status());
    match settings.last_backup_at {
        Some(last) => println!(
            "Last backup: {}",
            last.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
        ),
        None => println!("Last backup: never"),
    }
    Ok(())
}

fn run_settings(manager: &ArchiveManager, action: Option<SettingsCommand>) -> anyhow::Result<()> {
    if let Some(SettingsCommand::Set {
        enabled,
        interval_hours,
        max_backups,
    }) = action
    {
        if let Some(enabled) = enabled {
            manager.set_auto_backup_enabled(enabled);
        }
        if let Some(hours) = interval_hours {
            manager.set_interval_hours(hours)?;
        }
        if let Some(count) = max_backups {
            manager.set_max_backups(count)?;
        }
    }

    println!("{}", serde_json::to_string_pretty(&manager.settings())?);
    Ok(())
}

fn run_tick(manager: &ArchiveManager) -> anyhow::Result<()> {
    let (sink, events) = channel();
    match manager.tick(Utc::now(), sink) {
        Some(handle) => finish(drive(handle, events, None)),
        None => {
            println!("No backup due. {}", manager.auto_backup_status());
            Ok(())
        }
    }
}

fn run_schedule(manager: &ArchiveManager, poll_secs: u64) -> anyhow::Result<()> {
    let poll = Duration::from_secs(poll_secs.max(1));
    tracing::info!("Scheduler started, polling every {}s", poll.as_secs());
    println!("{}", manager.auto_backup_status());

    loop {
        let (sink, events) = channel();
        if let Some(handle) = manager.tick(Utc::now(), sink) {
            // Failures are retried on a later tick
            if let Err(e) = finish(drive(handle, events, None)) {
                eprintln!("Scheduled backup failed: {}", e);
            }
        }
        thread::sleep(poll);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_backup() {
        let cli = Cli::try_parse_from([
            "archiver",
            "--data-store",
            "/srv/app/db.bin",
            "backup",
            "--full",
            "--timeout-secs",
            "30",
        ])
        .unwrap();

        assert_eq!(cli.data_store, PathBuf::from("/srv/app/db.bin"));
        assert!(matches!(
            cli.command,
            Commands::Backup {
                full: true,
                output: None,
                timeout_secs: Some(30)
            }
        ));
    }

    #[test]
    fn test_parse_restore_and_settings() {
        let cli = Cli::try_parse_from(["archiver", "restore", "latest", "--to", "/tmp/out", "-y"])
            .unwrap();
        match cli.command {
            Commands::Restore { archive, to, yes, .. } => {
                assert_eq!(archive, "latest");
                assert_eq!(to, Some(PathBuf::from("/tmp/out")));
                assert!(yes);
            }
            other => panic!("unexpected command: {:?}", other),
        }

        let cli = Cli::try_parse_from([
            "archiver",
            "settings",
            "set",
            "--enabled",
            "false",
            "--max-backups",
            "5",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Settings {
                action: Some(SettingsCommand::Set {
                    enabled: Some(false),
                    interval_hours: None,
                    max_backups: Some(5)
                })
            }
        ));
    }

    #[test]
    fn test_global_options_after_subcommand() {
        let cli = Cli::try_parse_from(["archiver", "list", "--json", "--catalog", "/b", "-vv"])
            .unwrap();
        assert_eq!(cli.catalog, Some(PathBuf::from("/b")));
        assert_eq!(cli.verbose, 2);
    }
}
