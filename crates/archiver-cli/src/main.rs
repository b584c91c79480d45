//! archiver - Backup and restore for a file-based data store
//!
//! Usage:
//!   archiver backup [--full]          Create a backup in the catalog
//!   archiver restore <ARCHIVE> --yes  Restore an archive over the data store
//!   archiver list                     List archives, newest first
//!   archiver schedule                 Run scheduled backups until stopped

use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;

use cli::Cli;

fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    init_logging(args.verbose);
    cli::run(args)
}

/// Log to stderr so stdout stays clean for `--json` output.
/// `RUST_LOG` wins over `-v`.
fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
