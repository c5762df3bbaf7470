//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

use manuscript_core::PageRange;

/// Download digitized manuscripts from online libraries as PDFs.
///
/// Queue viewer or IIIF manifest URLs with `add`, then `run` the queue. Progress
/// is kept in a local database, so an interrupted run picks up where it left off.
#[derive(Parser, Debug)]
#[command(name = "manuscript-downloader")]
#[command(author, version, about)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Settings shared by every subcommand.
///
/// `None` means "not given on the command line", so config file values apply.
#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Queue database path
    #[arg(long, value_name = "PATH", global = true)]
    pub db: Option<PathBuf>,

    /// Directory for finished PDFs
    #[arg(short = 'o', long, value_name = "DIR", global = true)]
    pub output_dir: Option<PathBuf>,

    /// Ignore the config file
    #[arg(long, global = true)]
    pub no_config: bool,

    /// Maximum concurrent page downloads (1-32)
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u8).range(1..=32))]
    pub concurrency: Option<u8>,

    /// Maximum attempts for transient failures (0-10)
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u8).range(0..=10))]
    pub max_retries: Option<u8>,

    /// Minimum delay between requests to the same host in milliseconds (0 to disable, max 60000)
    #[arg(short = 'l', long, value_parser = clap::value_parser!(u64).range(0..=60000))]
    pub rate_limit: Option<u64>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Queue manuscripts by viewer or manifest URL
    Add(AddArgs),
    /// Show queued items and their progress
    List(ListArgs),
    /// Download queued items until each one is completed or failed
    Run,
    /// Resolve a URL and print its pages without queueing it
    Resolve(ResolveArgs),
    /// Remove an item and its staged pages
    Remove {
        /// Item id as shown by `list`
        id: i64,
    },
    /// Change the options of a queued item
    Edit(EditArgs),
    /// Re-queue a failed item, resolving its manifest again
    Retry {
        /// Item id as shown by `list`
        id: i64,
    },
}

#[derive(Args, Debug)]
pub struct AddArgs {
    /// Viewer, ARK or IIIF manifest URLs
    #[arg(required = true, value_name = "URL")]
    pub urls: Vec<String>,

    /// Only download these pages, e.g. `10-20`, `5`, `40-`
    #[arg(long, value_name = "RANGE")]
    pub pages: Option<PageRange>,

    /// Page concurrency for these items (1-32)
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=32))]
    pub concurrency: Option<u8>,

    /// Start a new PDF part once this many megabytes are staged
    #[arg(long, value_name = "MB", value_parser = clap::value_parser!(u64).range(1..))]
    pub split_mb: Option<u64>,

    /// Always write a single PDF
    #[arg(long)]
    pub no_split: bool,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Print items as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct ResolveArgs {
    /// Viewer, ARK or IIIF manifest URL
    #[arg(value_name = "URL")]
    pub url: String,

    /// Print every page instead of the first few
    #[arg(long)]
    pub all: bool,
}

#[derive(Args, Debug)]
pub struct EditArgs {
    /// Item id as shown by `list`
    pub id: i64,

    /// Only download these pages
    #[arg(long, value_name = "RANGE", conflicts_with = "all_pages")]
    pub pages: Option<PageRange>,

    /// Download every page again
    #[arg(long)]
    pub all_pages: bool,

    /// Page concurrency for this item (1-32)
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=32), conflicts_with = "default_concurrency")]
    pub concurrency: Option<u8>,

    /// Use the global concurrency for this item
    #[arg(long)]
    pub default_concurrency: bool,

    /// Part size bound in megabytes
    #[arg(long, value_name = "MB", value_parser = clap::value_parser!(u64).range(1..))]
    pub split_mb: Option<u64>,

    /// Split large items into several PDFs
    #[arg(long, conflicts_with = "no_split")]
    pub split: bool,

    /// Always write a single PDF
    #[arg(long)]
    pub no_split: bool,
}

impl EditArgs {
    /// True when at least one option was given.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.pages.is_some()
            || self.all_pages
            || self.concurrency.is_some()
            || self.default_concurrency
            || self.split_mb.is_some()
            || self.split
            || self.no_split
    }
}
