//! Run command handler: download the queue until every item settles.

use std::io::IsTerminal;

use anyhow::{Context, Result};
use manuscript_core::{ItemState, QueueItemView};
use tracing::{info, warn};

use crate::ProcessExit;
use crate::app::context::AppContext;
use crate::app::exit_handler::determine_exit_outcome;
use crate::app::{progress_manager, terminal};

pub(crate) async fn run_queue_command(ctx: &AppContext, quiet: bool) -> Result<ProcessExit> {
    let orchestrator = &ctx.orchestrator;
    let use_progress = terminal::should_use_progress(
        std::io::stderr().is_terminal(),
        quiet,
        terminal::is_dumb_terminal(),
    );
    let (progress, stop_progress) = progress_manager::spawn_progress_ui(use_progress, orchestrator);

    let started = orchestrator.start();
    if started == 0 {
        info!("Nothing to download");
    }

    tokio::select! {
        () = orchestrator.wait_idle() => {}
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            warn!("Interrupted; stopping the queue (downloaded pages are kept)");
            orchestrator.stop().await;
        }
    }

    stop_progress.cancel();
    if let Some(handle) = progress {
        let _ = handle.await;
    }

    let items = orchestrator.items();
    if !quiet {
        for item in &items {
            if let Some(line) = summary_line(item) {
                println!("{line}");
            }
        }
    }
    let completed = count(&items, ItemState::Completed);
    let failed = count(&items, ItemState::Failed);
    info!(completed, failed, total = items.len(), "Run finished");
    Ok(determine_exit_outcome(completed, failed))
}

fn count(items: &[QueueItemView], state: ItemState) -> usize {
    items.iter().filter(|item| item.state == state).count()
}

/// One line per item that did not finish cleanly or has output to point at.
pub(crate) fn summary_line(item: &QueueItemView) -> Option<String> {
    let name = item.title.as_deref().unwrap_or(&item.url);
    match item.state {
        ItemState::Completed => {
            let files: Vec<String> = item
                .parts
                .iter()
                .filter_map(|part| part.artifact.as_ref())
                .map(|path| path.display().to_string())
                .collect();
            let note = item
                .status_message
                .as_deref()
                .map(|message| format!(" ({message})"))
                .unwrap_or_default();
            Some(format!("#{} {name}: {}{note}", item.id, files.join(", ")))
        }
        ItemState::Failed => Some(format!(
            "#{} {name}: failed: {}",
            item.id,
            item.last_error.as_deref().unwrap_or("unknown error")
        )),
        ItemState::Paused | ItemState::Stopped => Some(format!(
            "#{} {name}: {} at {}/{} pages",
            item.id, item.state, item.progress.attempted, item.progress.total_pages
        )),
        _ => None,
    }
}
