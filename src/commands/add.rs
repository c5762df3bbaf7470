//! Add command handler: queue one or more manuscript URLs.

use anyhow::{Context, Result};
use manuscript_core::{ItemOptions, OrchestratorError};
use tracing::warn;

use crate::ProcessExit;
use crate::app::context::AppContext;
use crate::app::exit_handler::determine_exit_outcome;
use crate::app_config::AppConfig;
use crate::cli::AddArgs;

pub(crate) const BYTES_PER_MB: u64 = 1024 * 1024;

pub(crate) async fn run_add_command(ctx: &AppContext, args: &AddArgs) -> Result<ProcessExit> {
    let options = item_options(&ctx.config, args);
    let mut queued = 0;
    let mut rejected = 0;

    for url in &args.urls {
        match ctx.orchestrator.enqueue(url, options.clone()).await {
            Ok(id) => {
                let adapter = ctx
                    .orchestrator
                    .item(id)
                    .map(|view| view.adapter_id)
                    .unwrap_or_default();
                println!("Queued #{id} [{adapter}] {}", url.trim());
                queued += 1;
            }
            Err(
                error @ (OrchestratorError::Resolve(_)
                | OrchestratorError::InvalidOptions { .. }
                | OrchestratorError::InvalidConcurrency { .. }),
            ) => {
                warn!(url = %url, error = %error, "Rejected URL");
                eprintln!("Skipped {url}: {error}");
                rejected += 1;
            }
            Err(error) => {
                return Err(error).with_context(|| format!("Failed to queue '{url}'"));
            }
        }
    }

    Ok(determine_exit_outcome(queued, rejected))
}

/// Per-item options from `add` flags over the configured defaults.
pub(crate) fn item_options(config: &AppConfig, args: &AddArgs) -> ItemOptions {
    ItemOptions {
        page_range: args.pages,
        concurrency: args.concurrency.map(usize::from),
        split_threshold_bytes: args
            .split_mb
            .map_or_else(|| config.split_threshold_bytes(), |mb| mb.saturating_mul(BYTES_PER_MB)),
        split_enabled: config.split_enabled && !args.no_split,
    }
}
