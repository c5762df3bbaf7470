//! Application configuration: built-in defaults, the optional config file,
//! and the effective settings handed to the orchestrator.

use std::env;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use manuscript_core::DEFAULT_MAX_PARALLEL_ITEMS;
use manuscript_core::download::{MAX_CONCURRENCY, MIN_CONCURRENCY};
use manuscript_core::fetch::{CONNECT_TIMEOUT_SECS, DEFAULT_MAX_RETRIES, READ_TIMEOUT_SECS};
use manuscript_core::tiles::DEFAULT_TILE_CONCURRENCY;

const APP_DIR: &str = "manuscript-downloader";
const DB_FILE: &str = "manuscripts.db";

/// Default per-host gap between requests.
pub const DEFAULT_RATE_LIMIT_MS: u64 = 250;
/// Default part size bound.
pub const DEFAULT_SPLIT_THRESHOLD_MB: u64 = 300;

/// Values read from `config.toml`; `None` means "not set in the file".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileConfig {
    pub output_dir: Option<PathBuf>,
    pub concurrency: Option<u64>,
    pub max_parallel_items: Option<u64>,
    pub max_retries: Option<u64>,
    pub rate_limit_ms: Option<u64>,
    pub split_threshold_mb: Option<u64>,
    pub split_enabled: Option<bool>,
    pub connect_timeout_secs: Option<u64>,
    pub read_timeout_secs: Option<u64>,
    pub tile_concurrency: Option<u64>,
    pub db_path: Option<PathBuf>,
}

impl FileConfig {
    /// Checks every set value against the range the runtime accepts.
    pub fn validate(&self) -> Result<()> {
        let concurrency = MIN_CONCURRENCY as u64..=MAX_CONCURRENCY as u64;
        validate_range("concurrency", self.concurrency, &concurrency)?;
        validate_range("max_parallel_items", self.max_parallel_items, &(1..=8))?;
        validate_range("max_retries", self.max_retries, &(0..=10))?;
        validate_range("rate_limit_ms", self.rate_limit_ms, &(0..=60_000))?;
        validate_range("split_threshold_mb", self.split_threshold_mb, &(1..=102_400))?;
        validate_range("connect_timeout_secs", self.connect_timeout_secs, &(1..=3600))?;
        validate_range("read_timeout_secs", self.read_timeout_secs, &(1..=3600))?;
        validate_range("tile_concurrency", self.tile_concurrency, &(1..=32))?;
        Ok(())
    }
}

fn validate_range(
    field: &str,
    value: Option<u64>,
    range: &std::ops::RangeInclusive<u64>,
) -> Result<()> {
    let Some(value) = value else {
        return Ok(());
    };
    if !range.contains(&value) {
        bail!(
            "Invalid config value for `{field}`: {value}. Expected range: {}..={}",
            range.start(),
            range.end()
        );
    }
    Ok(())
}

/// Where the config came from.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// Resolved config path if a base directory is known.
    pub path: Option<PathBuf>,
    /// Parsed file config when the file exists.
    pub config: Option<FileConfig>,
    pub loaded_from_file: bool,
}

/// Effective settings after defaults, file and command line are merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub output_dir: PathBuf,
    pub concurrency: usize,
    pub max_parallel_items: usize,
    pub max_retries: u32,
    pub rate_limit_ms: u64,
    pub split_threshold_mb: u64,
    pub split_enabled: bool,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub tile_concurrency: usize,
    pub db_path: PathBuf,
}

impl AppConfig {
    /// Built-in defaults with the database under `data_dir`.
    #[must_use]
    pub fn defaults(data_dir: &Path) -> Self {
        Self {
            output_dir: PathBuf::from("."),
            concurrency: manuscript_core::DEFAULT_CONCURRENCY,
            max_parallel_items: DEFAULT_MAX_PARALLEL_ITEMS,
            max_retries: DEFAULT_MAX_RETRIES,
            rate_limit_ms: DEFAULT_RATE_LIMIT_MS,
            split_threshold_mb: DEFAULT_SPLIT_THRESHOLD_MB,
            split_enabled: true,
            connect_timeout_secs: CONNECT_TIMEOUT_SECS,
            read_timeout_secs: READ_TIMEOUT_SECS,
            tile_concurrency: DEFAULT_TILE_CONCURRENCY,
            db_path: data_dir.join(DB_FILE),
        }
    }

    /// Overlays values set in the file.
    #[must_use]
    pub fn with_file(mut self, file: &FileConfig) -> Self {
        if let Some(dir) = &file.output_dir {
            self.output_dir.clone_from(dir);
        }
        if let Some(path) = &file.db_path {
            self.db_path.clone_from(path);
        }
        self.concurrency = file.concurrency.map_or(self.concurrency, saturating_usize);
        self.max_parallel_items = file
            .max_parallel_items
            .map_or(self.max_parallel_items, saturating_usize);
        self.max_retries = file
            .max_retries
            .map_or(self.max_retries, |v| u32::try_from(v).unwrap_or(u32::MAX));
        self.rate_limit_ms = file.rate_limit_ms.unwrap_or(self.rate_limit_ms);
        self.split_threshold_mb = file.split_threshold_mb.unwrap_or(self.split_threshold_mb);
        self.split_enabled = file.split_enabled.unwrap_or(self.split_enabled);
        self.connect_timeout_secs = file.connect_timeout_secs.unwrap_or(self.connect_timeout_secs);
        self.read_timeout_secs = file.read_timeout_secs.unwrap_or(self.read_timeout_secs);
        self.tile_concurrency = file
            .tile_concurrency
            .map_or(self.tile_concurrency, saturating_usize);
        self
    }

    /// Part size bound in bytes.
    #[must_use]
    pub fn split_threshold_bytes(&self) -> u64 {
        self.split_threshold_mb.saturating_mul(1024 * 1024)
    }

    /// Staged pages live next to the database so they survive with it.
    #[must_use]
    pub fn staging_dir(&self) -> PathBuf {
        self.db_path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("staging"), |parent| parent.join("staging"))
    }
}

fn saturating_usize(value: u64) -> usize {
    usize::try_from(value).unwrap_or(usize::MAX)
}

/// Resolves the default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/manuscript-downloader/config.toml`
/// 2. `$HOME/.config/manuscript-downloader/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    config_path_from(
        env_var_non_empty_os("XDG_CONFIG_HOME"),
        env_var_non_empty_os("HOME"),
    )
}

fn config_path_from(xdg_config_home: Option<OsString>, home: Option<OsString>) -> Option<PathBuf> {
    if let Some(xdg) = xdg_config_home {
        return Some(PathBuf::from(xdg).join(APP_DIR).join("config.toml"));
    }
    let home = home?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join(APP_DIR)
            .join("config.toml"),
    )
}

/// Directory for the queue database and staged pages.
///
/// `$XDG_DATA_HOME/manuscript-downloader`, then
/// `$HOME/.local/share/manuscript-downloader`, then `./.manuscript-downloader`.
#[must_use]
pub fn resolve_data_dir() -> PathBuf {
    data_dir_from(
        env_var_non_empty_os("XDG_DATA_HOME"),
        env_var_non_empty_os("HOME"),
    )
}

fn data_dir_from(xdg_data_home: Option<OsString>, home: Option<OsString>) -> PathBuf {
    if let Some(xdg) = xdg_data_home {
        return PathBuf::from(xdg).join(APP_DIR);
    }
    match home {
        Some(home) => PathBuf::from(home).join(".local").join("share").join(APP_DIR),
        None => PathBuf::from(format!(".{APP_DIR}")),
    }
}

fn env_var_non_empty_os(name: &str) -> Option<OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Loads the config file from its default location, if it exists.
pub fn load_default_file_config() -> Result<LoadedConfig> {
    let path = resolve_default_config_path();
    let Some(path_ref) = path.as_deref().filter(|p| p.exists()) else {
        return Ok(LoadedConfig {
            path,
            config: None,
            loaded_from_file: false,
        });
    };

    let config = load_file_config(path_ref)?;
    Ok(LoadedConfig {
        path,
        config: Some(config),
        loaded_from_file: true,
    })
}

fn load_file_config(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
    parse_config_str(&raw)
        .with_context(|| format!("Failed to parse config file '{}'", path.display()))
}

fn parse_config_str(raw: &str) -> Result<FileConfig> {
    let mut cfg = FileConfig::default();
    for (line_index, raw_line) in raw.lines().enumerate() {
        let line_no = line_index + 1;
        let line = strip_inline_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        let Some((raw_key, raw_value)) = line.split_once('=') else {
            bail!("Invalid config syntax on line {line_no}: expected key = value");
        };
        let key = raw_key.trim();
        let value = raw_value.trim();
        let invalid = || format!("Invalid `{key}` value on line {line_no}");

        match key {
            "output_dir" => {
                cfg.output_dir = Some(parse_string_literal(value).with_context(invalid)?.into());
            }
            "db_path" => {
                cfg.db_path = Some(parse_string_literal(value).with_context(invalid)?.into());
            }
            "concurrency" => cfg.concurrency = Some(parse_integer_u64(value).with_context(invalid)?),
            "max_parallel_items" => {
                cfg.max_parallel_items = Some(parse_integer_u64(value).with_context(invalid)?);
            }
            "max_retries" => cfg.max_retries = Some(parse_integer_u64(value).with_context(invalid)?),
            "rate_limit_ms" => {
                cfg.rate_limit_ms = Some(parse_integer_u64(value).with_context(invalid)?);
            }
            "split_threshold_mb" => {
                cfg.split_threshold_mb = Some(parse_integer_u64(value).with_context(invalid)?);
            }
            "split_enabled" => cfg.split_enabled = Some(parse_boolean(value).with_context(invalid)?),
            "connect_timeout_secs" => {
                cfg.connect_timeout_secs = Some(parse_integer_u64(value).with_context(invalid)?);
            }
            "read_timeout_secs" => {
                cfg.read_timeout_secs = Some(parse_integer_u64(value).with_context(invalid)?);
            }
            "tile_concurrency" => {
                cfg.tile_concurrency = Some(parse_integer_u64(value).with_context(invalid)?);
            }
            unknown => bail!("Unknown configuration key: '{unknown}' on line {line_no}"),
        }
    }
    cfg.validate()?;
    Ok(cfg)
}

fn strip_inline_comment(line: &str) -> &str {
    let mut in_string = false;
    for (index, ch) in line.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..index],
            _ => {}
        }
    }
    line
}

fn parse_string_literal(raw_value: &str) -> Result<String> {
    raw_value
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .map(str::to_string)
        .context("Expected double-quoted string")
}

fn parse_integer_u64(raw_value: &str) -> Result<u64> {
    let token = raw_value.trim().replace('_', "");
    if token.is_empty() {
        bail!("Expected integer value");
    }
    let value = token.parse::<i128>()?;
    if value < 0 {
        bail!("Expected non-negative integer");
    }
    u64::try_from(value).map_err(|_| anyhow::anyhow!("Integer value out of range for u64"))
}

fn parse_boolean(raw_value: &str) -> Result<bool> {
    match raw_value {
        "true" => Ok(true),
        "false" => Ok(false),
        other => bail!("Expected `true` or `false`, got '{other}'"),
    }
}
