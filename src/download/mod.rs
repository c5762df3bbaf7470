//! Download queue orchestration.
//!
//! An [`Orchestrator`] owns the [`QueueStore`](crate::queue::QueueStore) and
//! runs one driver task per item: resolve the manifest, fetch pages through a
//! bounded worker pool, stage them on disk, and hand contiguous runs of pages
//! to the output assembler as size-bounded parts.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use manuscript_core::download::{Orchestrator, OrchestratorConfig};
//! use manuscript_core::fetch::{HttpFetcher, RateLimiter};
//! use manuscript_core::queue::{ItemOptions, QueueStore};
//! use manuscript_core::resolver::{ManifestResolver, ResolveContext, build_default_registry};
//! use manuscript_core::Database;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(QueueStore::open(Database::new_in_memory().await?).await?);
//! let fetcher = Arc::new(HttpFetcher::new(Arc::new(RateLimiter::new(Duration::from_millis(250))))?);
//! let resolver = ManifestResolver::new(
//!     Arc::new(build_default_registry()),
//!     ResolveContext::new(fetcher.clone()),
//! );
//! let config = OrchestratorConfig::new("./manuscripts", "./manuscripts/.staging");
//! let orchestrator = Orchestrator::new(store, resolver, fetcher, config)?;
//!
//! orchestrator
//!     .enqueue("https://digi.vatlib.it/view/MSS_Vat.lat.3225", ItemOptions::default())
//!     .await?;
//! orchestrator.start();
//! orchestrator.wait_idle().await;
//! # Ok(())
//! # }
//! ```

mod driver;
mod error;
mod orchestrator;
mod slots;
mod split;
mod staging;
mod worker;

pub use error::{MAX_CONCURRENCY, MIN_CONCURRENCY, OrchestratorError, validate_concurrency};
pub use orchestrator::{
    DEFAULT_CONCURRENCY, DEFAULT_MAX_PARALLEL_ITEMS, Orchestrator, OrchestratorConfig, QueueEvent,
    QueueState,
};
pub use slots::{PageOutcome, PageSlots};
pub use split::{PartPlanner, SealedPart};
pub use staging::{STAGED_EXTENSIONS, Staging, extension_for};
pub use worker::{FetchedPage, PageError, PageWorker};
