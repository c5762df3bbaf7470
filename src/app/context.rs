//! Shared runtime context: the opened queue and the orchestrator driving it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use manuscript_core::fetch::Fetcher;
use manuscript_core::{
    Database, HttpFetcher, ManifestResolver, Orchestrator, OrchestratorConfig, QueueStore,
    RateLimiter, ResolveContext, RetryPolicy, build_default_registry,
};
use tracing::debug;

use crate::app_config::AppConfig;

/// Everything a subcommand needs, built once per process.
pub(crate) struct AppContext {
    pub(crate) config: AppConfig,
    pub(crate) orchestrator: Orchestrator,
    db: Database,
}

impl AppContext {
    /// Opens (or creates) the queue database and restores its items.
    pub(crate) async fn open(config: AppConfig) -> Result<Self> {
        let db = Database::new(&config.db_path).await.with_context(|| {
            format!("Failed to open queue database '{}'", config.db_path.display())
        })?;
        Self::with_database(config, db).await
    }

    pub(crate) async fn with_database(config: AppConfig, db: Database) -> Result<Self> {
        let store = QueueStore::open(db.clone())
            .await
            .context("Failed to load the download queue")?;
        let fetcher = build_fetcher(&config)?;
        let orchestrator = build_orchestrator(&config, Arc::new(store), fetcher)?;
        Ok(Self {
            config,
            orchestrator,
            db,
        })
    }

    /// Closes the database pool after the last write.
    pub(crate) async fn close(self) {
        self.db.close().await;
    }
}

pub(crate) fn retry_policy(config: &AppConfig) -> RetryPolicy {
    RetryPolicy::with_max_attempts(config.max_retries)
}

pub(crate) fn build_fetcher(config: &AppConfig) -> Result<Arc<dyn Fetcher>> {
    let rate_limiter = if config.rate_limit_ms == 0 {
        debug!("rate limiting disabled");
        Arc::new(RateLimiter::disabled())
    } else {
        debug!(rate_limit_ms = config.rate_limit_ms, "rate limiting enabled");
        Arc::new(RateLimiter::new(Duration::from_millis(config.rate_limit_ms)))
    };
    let fetcher = HttpFetcher::with_timeouts(
        rate_limiter,
        config.connect_timeout_secs,
        config.read_timeout_secs,
    )
    .context("Failed to build HTTP client")?;
    Ok(Arc::new(fetcher))
}

pub(crate) fn build_resolver(config: &AppConfig, fetcher: Arc<dyn Fetcher>) -> ManifestResolver {
    let ctx = ResolveContext::new(fetcher).with_retry_policy(retry_policy(config));
    ManifestResolver::new(Arc::new(build_default_registry()), ctx)
}

fn build_orchestrator(
    config: &AppConfig,
    store: Arc<QueueStore>,
    fetcher: Arc<dyn Fetcher>,
) -> Result<Orchestrator> {
    let resolver = build_resolver(config, Arc::clone(&fetcher));
    let settings = OrchestratorConfig::new(&config.output_dir, config.staging_dir())
        .with_concurrency(config.concurrency)
        .with_max_parallel_items(config.max_parallel_items)
        .with_retry_policy(retry_policy(config))
        .with_tile_concurrency(config.tile_concurrency);
    Orchestrator::new(store, resolver, fetcher, settings).context("Invalid queue settings")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use manuscript_core::QueueState;

    #[tokio::test]
    async fn test_context_builds_idle_orchestrator() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::defaults(dir.path());
        config.output_dir = dir.path().join("out");
        let db = Database::new_in_memory().await.unwrap();

        let ctx = AppContext::with_database(config, db).await.unwrap();
        assert_eq!(ctx.orchestrator.state(), QueueState::Idle);
        assert!(ctx.orchestrator.items().is_empty());
        ctx.close().await;
    }

    #[tokio::test]
    async fn test_context_rejects_out_of_range_concurrency() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::defaults(dir.path());
        config.concurrency = 0;
        let db = Database::new_in_memory().await.unwrap();

        let error = AppContext::with_database(config, db).await.err().unwrap();
        assert!(format!("{error:#}").contains("invalid concurrency value 0"));
    }

    #[test]
    fn test_retry_policy_uses_configured_attempts() {
        let mut config = AppConfig::defaults(std::path::Path::new("/data"));
        config.max_retries = 5;
        assert_eq!(retry_policy(&config).max_attempts(), 5);
        config.max_retries = 0;
        assert_eq!(retry_policy(&config).max_attempts(), 1);
    }
}
