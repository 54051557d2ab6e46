//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};

use match_archiver::fetch::{MAX_CONCURRENCY, MIN_CONCURRENCY};

/// Resumable acquisition of Lc0 match archives.
///
/// Discovers matches from the public listing, fetches each archive from
/// whichever historical storage layout still serves it, and files the games
/// by month. Every command is a bounded batch that can be re-run safely.
#[derive(Parser, Debug)]
#[command(name = "match-archiver")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to a TOML config file (default: $XDG_CONFIG_HOME/match-archiver/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// State database path (overrides the config file)
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Scrape listing pages and record newly seen matches as pending
    Discover(PageRange),

    /// Fetch pending matches
    Fetch(FetchArgs),

    /// Transform fetched matches into month-filed PGN
    Transform,

    /// Discover, fetch until idle, then transform
    Run(PageRange),

    /// Show record counts by state
    Stats {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Move failed matches back to pending (attempt counts are kept)
    RequeueFailed,

    /// Write every discovered match to a CSV file (id, occurred_at, source_filename)
    ExportCsv {
        /// Output file
        #[arg(short, long, default_value = "lc0_matches_full.csv")]
        output: PathBuf,
    },
}

#[derive(ClapArgs, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRange {
    /// First listing page
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    pub start_page: u32,

    /// Last listing page (inclusive)
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    pub end_page: u32,
}

#[derive(ClapArgs, Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchArgs {
    /// Maximum records to take from the pending set
    #[arg(short = 'n', long, value_parser = clap::value_parser!(u64).range(1..))]
    pub limit: Option<u64>,

    /// Maximum concurrent fetches (1-100, default from config)
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u8).range(MIN_CONCURRENCY as i64..=MAX_CONCURRENCY as i64))]
    pub concurrency: Option<u8>,

    /// Keep running batches until nothing is eligible
    #[arg(long)]
    pub until_idle: bool,
}
