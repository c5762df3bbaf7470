//! Top-level flow: parse arguments, set up logging and config, dispatch.

use anyhow::Result;
use clap::Parser;
use tracing::debug;

use crate::app::context::AppContext;
use crate::app::{config_runtime, terminal};
use crate::cli::{Cli, Command};
use crate::{ProcessExit, commands};

pub(crate) async fn run_app() -> Result<ProcessExit> {
    // Parse first so --help works without logs
    let cli = Cli::parse();

    let default_level = config_runtime::resolve_default_log_level(&cli.global);
    terminal::init_tracing(default_level, terminal::no_color_env_requested());
    debug!(?cli, "CLI arguments parsed");

    let resolved = config_runtime::resolve_config(&cli.global)?;
    debug!(
        config = ?resolved.config,
        config_path = ?resolved.file_path,
        from_file = resolved.loaded_from_file,
        "Effective configuration"
    );
    let config = resolved.config;

    if let Command::Resolve(args) = &cli.command {
        commands::run_resolve_command(&config, args).await?;
        return Ok(ProcessExit::Success);
    }

    let ctx = AppContext::open(config).await?;
    let exit = dispatch(&ctx, &cli).await;
    ctx.close().await;
    exit
}

async fn dispatch(ctx: &AppContext, cli: &Cli) -> Result<ProcessExit> {
    match &cli.command {
        Command::Add(args) => commands::run_add_command(ctx, args).await,
        Command::List(args) => {
            commands::run_list_command(ctx, args)?;
            Ok(ProcessExit::Success)
        }
        Command::Run => commands::run_queue_command(ctx, cli.global.quiet).await,
        Command::Remove { id } => {
            commands::run_remove_command(ctx, *id).await?;
            Ok(ProcessExit::Success)
        }
        Command::Edit(args) => {
            commands::run_edit_command(ctx, args).await?;
            Ok(ProcessExit::Success)
        }
        Command::Retry { id } => {
            commands::run_retry_command(ctx, *id).await?;
            Ok(ProcessExit::Success)
        }
        Command::Resolve(args) => {
            commands::run_resolve_command(&ctx.config, args).await?;
            Ok(ProcessExit::Success)
        }
    }
}
