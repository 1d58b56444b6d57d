//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};

use shelfdl_core::config::MAX_CONCURRENT_DOWNLOADS_LIMIT;

/// Find and download books and audiobooks.
///
/// shelfdl queues downloads onto a bounded worker pool and shows live
/// progress until every task finishes.
#[derive(Parser, Debug)]
#[command(name = "shelfdl")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (default: $XDG_CONFIG_HOME/shelfdl/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Download one or more direct URLs
    Fetch(FetchArgs),
    /// List registered release sources and whether they are available
    Sources,
}

#[derive(ClapArgs, Debug)]
pub struct FetchArgs {
    /// URLs to download
    #[arg(required = true, value_name = "URL")]
    pub urls: Vec<String>,

    /// Destination directory (overrides DESTINATION_DIR)
    #[arg(short, long, value_name = "DIR")]
    pub dest: Option<PathBuf>,

    /// Maximum concurrent downloads (overrides MAX_CONCURRENT_DOWNLOADS)
    #[arg(
        short = 'c',
        long,
        value_parser = clap::value_parser!(u8).range(1..=MAX_CONCURRENT_DOWNLOADS_LIMIT as i64)
    )]
    pub concurrency: Option<u8>,
}
