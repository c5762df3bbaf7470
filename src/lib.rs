//! Manuscript Downloader Core Library
//!
//! Turns a digital-library viewer or manifest URL into one or more PDFs of
//! the manuscript's pages, with a persistent, resumable queue in between.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`fetch`] - Injected fetch capability, retry policy and per-host pacing
//! - [`resolver`] - URL-to-manifest adapters, registry and manifest cache
//! - [`manifest`] - Canonical page model shared by every stage
//! - [`tiles`] - Tile discovery and stitching for pyramid-only pages
//! - [`output`] - PDF assembly with placeholders for failed pages
//! - [`queue`] - Queue items and their write-through persistence
//! - [`download`] - Orchestrator driving items from `Pending` to `Completed`
//! - [`db`] - Database connection and schema management

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod db;
pub mod download;
pub mod error;
pub mod fetch;
pub mod manifest;
pub mod output;
pub mod queue;
pub mod resolver;
pub mod tiles;
mod user_agent;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types
pub use db::{Database, DbError};
pub use download::{
    DEFAULT_CONCURRENCY, DEFAULT_MAX_PARALLEL_ITEMS, Orchestrator, OrchestratorConfig,
    OrchestratorError, QueueEvent, QueueState,
};
pub use error::ManuscriptError;
pub use fetch::{FetchError, Fetcher, HttpFetcher, RateLimiter, RetryPolicy};
pub use manifest::{ImageLocator, Manifest, Page, Source, TileDescriptor};
pub use queue::{ItemOptions, ItemState, PageRange, QueueError, QueueItemView, QueueStore};
pub use resolver::{ManifestResolver, ResolveContext, ResolveError, build_default_registry};
