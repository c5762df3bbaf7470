//! Remove, edit and retry command handlers.

use anyhow::{Context, Result, bail};
use manuscript_core::{ItemOptions, QueueItemView};

use crate::app::context::AppContext;
use crate::cli::EditArgs;
use crate::commands::add::BYTES_PER_MB;

pub(crate) async fn run_remove_command(ctx: &AppContext, id: i64) -> Result<()> {
    let removed = ctx
        .orchestrator
        .remove(id)
        .await
        .with_context(|| format!("Failed to remove item #{id}"))?;
    println!("Removed #{id} {}", display_name(&removed));
    if removed.parts.iter().any(|part| part.artifact.is_some()) {
        println!("Written PDFs were kept.");
    }
    Ok(())
}

pub(crate) async fn run_edit_command(ctx: &AppContext, args: &EditArgs) -> Result<()> {
    if !args.has_changes() {
        bail!("Nothing to change for item #{}; see `manuscript-downloader edit --help`", args.id);
    }
    let current = ctx
        .orchestrator
        .item(args.id)
        .with_context(|| format!("No queue item with id {}", args.id))?;
    let options = edited_options(&current.options, args);
    let updated = ctx
        .orchestrator
        .edit_options(args.id, options)
        .await
        .with_context(|| format!("Failed to edit item #{}", args.id))?;
    println!(
        "Updated #{} {} ({})",
        updated.id,
        display_name(&updated),
        updated.state
    );
    Ok(())
}

pub(crate) async fn run_retry_command(ctx: &AppContext, id: i64) -> Result<()> {
    let item = ctx
        .orchestrator
        .retry(id)
        .await
        .with_context(|| format!("Failed to retry item #{id}"))?;
    println!(
        "Re-queued #{id} {}; run `manuscript-downloader run` to download it",
        display_name(&item)
    );
    Ok(())
}

/// Applies the flags given to `edit` on top of the item's current options.
pub(crate) fn edited_options(current: &ItemOptions, args: &EditArgs) -> ItemOptions {
    let mut options = current.clone();
    if args.all_pages {
        options.page_range = None;
    } else if let Some(range) = args.pages {
        options.page_range = Some(range);
    }
    if args.default_concurrency {
        options.concurrency = None;
    } else if let Some(concurrency) = args.concurrency {
        options.concurrency = Some(usize::from(concurrency));
    }
    if let Some(mb) = args.split_mb {
        options.split_threshold_bytes = mb.saturating_mul(BYTES_PER_MB);
    }
    if args.split {
        options.split_enabled = true;
    } else if args.no_split {
        options.split_enabled = false;
    }
    options
}

fn display_name(item: &QueueItemView) -> &str {
    item.title.as_deref().unwrap_or(&item.url)
}
