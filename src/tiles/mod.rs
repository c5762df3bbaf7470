//! Reassembly of full-resolution pages from undocumented tile pyramids.
//!
//! A [`TileDescriptor`] only says how to address a tile; the pyramid depth
//! and grid size are discovered here:
//!
//! 1. **Level search**: walk down from the ceiling until `(level, 0, 0)` exists.
//! 2. **Grid walk**: extend along row 0 and column 0 until a tile is missing.
//! 3. **Fill**: fetch every remaining tile under the tile semaphore.
//! 4. **Stitch**: crop overlaps, paste, encode JPEG.
//!
//! Missing interior tiles leave a black hole rather than failing the page;
//! only an unreachable pyramid or cancellation fails it.

mod error;
mod stitch;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::fetch::{FetchError, FetchOptions, Fetcher, RetryPolicy, fetch_with_retry};
use crate::manifest::TileDescriptor;

pub use error::TileError;
pub use stitch::{JPEG_QUALITY, TilePos, stitch};

/// Default size of the tile sub-pool.
pub const DEFAULT_TILE_CONCURRENCY: usize = 8;
/// Upper bound on columns and rows discovered by the grid walk.
pub const MAX_GRID_EXTENT: u32 = 200;

/// A stitched page image.
#[derive(Debug, Clone)]
pub struct RasterPage {
    /// JPEG bytes.
    pub bytes: Bytes,
    /// Pixel width.
    pub width: u32,
    /// Pixel height.
    pub height: u32,
}

/// Finds, fetches and stitches tile pyramids.
#[derive(Debug, Clone)]
pub struct TileAssembler {
    fetcher: Arc<dyn Fetcher>,
    semaphore: Arc<Semaphore>,
    retry: RetryPolicy,
}

impl TileAssembler {
    /// Creates an assembler with a tile sub-pool of `concurrency` permits.
    #[must_use]
    pub fn new(fetcher: Arc<dyn Fetcher>, concurrency: usize) -> Self {
        Self {
            fetcher,
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            retry: RetryPolicy::new(2, Duration::from_millis(250), Duration::from_secs(2), 2.0),
        }
    }

    /// Replaces the per-tile retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Rebuilds one page.
    ///
    /// # Errors
    ///
    /// - [`TileError::LevelsExhausted`] when no level yields its first tile
    /// - [`TileError::Cancelled`] when `cancel` fires at any point
    /// - [`TileError::Decode`] / [`TileError::Encode`] from stitching
    #[instrument(skip(self, tiles, cancel), fields(template = %tiles.url_template))]
    pub async fn assemble(
        &self,
        tiles: &TileDescriptor,
        cancel: &CancellationToken,
    ) -> Result<RasterPage, TileError> {
        let (level, origin) = self.find_level(tiles, cancel).await?;
        let mut fetched: HashMap<TilePos, Bytes> = HashMap::new();
        fetched.insert(TilePos { col: 0, row: 0 }, origin);

        let cols = self.walk(tiles, level, true, &mut fetched, cancel).await?;
        let rows = self.walk(tiles, level, false, &mut fetched, cancel).await?;
        debug!(level, cols, rows, "Discovered tile grid");

        let remaining: Vec<TilePos> = (1..rows)
            .flat_map(|row| (1..cols).map(move |col| TilePos { col, row }))
            .collect();
        let filled = self.fill(tiles, level, remaining, cancel).await?;
        fetched.extend(filled);

        if cancel.is_cancelled() {
            return Err(TileError::Cancelled);
        }

        let template = tiles.url_template.clone();
        let (tile_size, overlap) = (tiles.tile_size, tiles.overlap);
        let mut ordered: Vec<(TilePos, Bytes)> = fetched.into_iter().collect();
        ordered.sort_by_key(|(pos, _)| *pos);

        tokio::task::spawn_blocking(move || stitch(&template, tile_size, overlap, ordered))
            .await
            .map_err(|error| TileError::encode(format!("stitch task failed: {error}")))?
    }

    /// Finds the deepest level whose `(0, 0)` tile exists.
    async fn find_level(
        &self,
        tiles: &TileDescriptor,
        cancel: &CancellationToken,
    ) -> Result<(u32, Bytes), TileError> {
        let ceiling = tiles.search_ceiling();
        for level in (tiles.min_level..=ceiling).rev() {
            if let Some(bytes) = self.fetch_tile(&tiles.tile_url(level, 0, 0), cancel).await? {
                debug!(level, "Tile level found");
                return Ok((level, bytes));
            }
        }
        Err(TileError::LevelsExhausted {
            template: tiles.url_template.clone(),
            min_level: tiles.min_level,
            max_level: ceiling,
        })
    }

    /// Extends along row 0 (`across`) or column 0 until a tile is missing.
    /// Returns the extent; every tile found is kept in `fetched`.
    async fn walk(
        &self,
        tiles: &TileDescriptor,
        level: u32,
        across: bool,
        fetched: &mut HashMap<TilePos, Bytes>,
        cancel: &CancellationToken,
    ) -> Result<u32, TileError> {
        let mut extent = 1;
        while extent < MAX_GRID_EXTENT {
            let pos = if across {
                TilePos { col: extent, row: 0 }
            } else {
                TilePos { col: 0, row: extent }
            };
            match self.fetch_tile(&tiles.tile_url(level, pos.col, pos.row), cancel).await? {
                Some(bytes) => {
                    fetched.insert(pos, bytes);
                    extent += 1;
                }
                None => break,
            }
        }
        Ok(extent)
    }

    /// Fetches the interior tiles concurrently; missing ones are dropped.
    async fn fill(
        &self,
        tiles: &TileDescriptor,
        level: u32,
        positions: Vec<TilePos>,
        cancel: &CancellationToken,
    ) -> Result<Vec<(TilePos, Bytes)>, TileError> {
        let mut handles = Vec::with_capacity(positions.len());
        for pos in positions {
            let permit = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(TileError::Cancelled),
                permit = Arc::clone(&self.semaphore).acquire_owned() => {
                    permit.map_err(|_| TileError::Cancelled)?
                }
            };
            let assembler = self.clone();
            let url = tiles.tile_url(level, pos.col, pos.row);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                assembler
                    .fetch_tile(&url, &cancel)
                    .await
                    .map(|bytes| bytes.map(|bytes| (pos, bytes)))
            }));
        }

        let mut filled = Vec::with_capacity(handles.len());
        let mut missing = 0usize;
        for handle in handles {
            match handle.await {
                Ok(Ok(Some(tile))) => filled.push(tile),
                Ok(Ok(None)) => missing += 1,
                Ok(Err(error)) => return Err(error),
                Err(error) => {
                    warn!(error = %error, "Tile task panicked");
                    missing += 1;
                }
            }
        }
        if missing > 0 {
            debug!(missing, "Tolerating missing tiles");
        }
        Ok(filled)
    }

    /// One tile with the small retry; `None` means missing.
    async fn fetch_tile(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Bytes>, TileError> {
        match fetch_with_retry(
            self.fetcher.as_ref(),
            url,
            &FetchOptions::default(),
            &self.retry,
            cancel,
        )
        .await
        {
            Ok(response) => Ok(Some(response.body)),
            Err(FetchError::Cancelled { .. }) => Err(TileError::Cancelled),
            Err(error) => {
                debug!(url, error = %error, "Tile unavailable");
                Ok(None)
            }
        }
    }
}
