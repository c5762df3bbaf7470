//! List command handler: show queued items and their progress.

use std::fmt::Write as _;

use anyhow::{Context, Result};
use manuscript_core::QueueItemView;

use crate::app::context::AppContext;
use crate::cli::ListArgs;

pub(crate) fn run_list_command(ctx: &AppContext, args: &ListArgs) -> Result<()> {
    let items = ctx.orchestrator.items();
    if args.json {
        let json = serde_json::to_string_pretty(&items).context("Failed to encode queue as JSON")?;
        println!("{json}");
        return Ok(());
    }

    if items.is_empty() {
        println!("Queue is empty. Add a manuscript with `manuscript-downloader add <URL>`.");
        return Ok(());
    }

    println!("{:>4}  {:<16}  {:>11}  {:>6}  TITLE", "ID", "STATE", "PAGES", "FAILED");
    for item in &items {
        print!("{}", render_item(item));
    }
    Ok(())
}

/// One summary row plus indented detail lines.
pub(crate) fn render_item(item: &QueueItemView) -> String {
    let progress = &item.progress;
    let pages = if progress.total_pages == 0 {
        "-".to_string()
    } else {
        format!("{}/{}", progress.succeeded, progress.total_pages)
    };
    let name = item.title.as_deref().unwrap_or(&item.url);

    let mut out = format!(
        "{:>4}  {:<16}  {:>11}  {:>6}  {name}\n",
        item.id,
        item.state.as_str(),
        pages,
        progress.failed
    );
    if item.title.is_some() {
        let _ = writeln!(out, "      url: {} [{}]", item.url, item.adapter_id);
    }
    if let Some(range) = item.options.page_range {
        let _ = writeln!(out, "      pages: {range}");
    }
    if let Some(message) = &item.status_message {
        let _ = writeln!(out, "      status: {message}");
    }
    if let Some(error) = &item.last_error {
        let _ = writeln!(out, "      error: {error}");
    }
    for part in &item.parts {
        match &part.artifact {
            Some(path) => {
                let _ = writeln!(out, "      part {}: {}", part.number, path.display());
            }
            None => {
                let _ = writeln!(
                    out,
                    "      part {}: pages {}-{} not written",
                    part.number, part.first_page, part.last_page
                );
            }
        }
    }
    out
}
