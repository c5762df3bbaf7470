//! Merges built-in defaults, the config file and command-line flags.

use anyhow::Result;
use tracing::debug;

use crate::app_config::{self, AppConfig, FileConfig};
use crate::cli::GlobalArgs;

/// Effective settings plus where the file layer came from.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedConfig {
    pub(crate) config: AppConfig,
    pub(crate) file_path: Option<std::path::PathBuf>,
    pub(crate) loaded_from_file: bool,
}

/// Loads the config file (unless `--no-config`) and overlays command-line flags.
pub(crate) fn resolve_config(global: &GlobalArgs) -> Result<ResolvedConfig> {
    let defaults = AppConfig::defaults(&app_config::resolve_data_dir());
    if global.no_config {
        debug!("Config file disabled by --no-config");
        return Ok(ResolvedConfig {
            config: apply_cli_overrides(defaults, global),
            file_path: None,
            loaded_from_file: false,
        });
    }

    let loaded = app_config::load_default_file_config()?;
    if loaded.loaded_from_file
        && let Some(path) = &loaded.path
    {
        debug!(path = %path.display(), "Loaded config file");
    }
    Ok(ResolvedConfig {
        config: merge(defaults, loaded.config.as_ref(), global),
        file_path: loaded.path,
        loaded_from_file: loaded.loaded_from_file,
    })
}

fn merge(defaults: AppConfig, file: Option<&FileConfig>, global: &GlobalArgs) -> AppConfig {
    let config = match file {
        Some(file) => defaults.with_file(file),
        None => defaults,
    };
    apply_cli_overrides(config, global)
}

/// Command-line values win over everything else, but only when given.
pub(crate) fn apply_cli_overrides(mut config: AppConfig, global: &GlobalArgs) -> AppConfig {
    if let Some(dir) = &global.output_dir {
        config.output_dir.clone_from(dir);
    }
    if let Some(db) = &global.db {
        config.db_path.clone_from(db);
    }
    if let Some(concurrency) = global.concurrency {
        config.concurrency = usize::from(concurrency);
    }
    if let Some(retries) = global.max_retries {
        config.max_retries = u32::from(retries);
    }
    if let Some(rate_limit) = global.rate_limit {
        config.rate_limit_ms = rate_limit;
    }
    config
}

/// Priority: quiet flag > verbose count > info. `RUST_LOG` is applied later and wins.
pub(crate) fn resolve_default_log_level(global: &GlobalArgs) -> &'static str {
    if global.quiet {
        "error"
    } else {
        match global.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}
