//! Fetching one page image, directly or through the tile engine.

use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::fetch::{FetchError, FetchOptions, Fetcher, RetryPolicy, fetch_with_retry};
use crate::manifest::{ImageLocator, Page};
use crate::tiles::{TileAssembler, TileError};

use super::staging::extension_for;

/// Why a page produced no image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageError {
    /// Cancelled; nothing is recorded.
    Cancelled,
    /// Terminal failure; the page becomes a placeholder.
    Failed(String),
}

/// A fetched page body and its staging extension.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub bytes: Bytes,
    pub extension: &'static str,
}

/// Resolves a [`Page`] locator to image bytes.
#[derive(Debug, Clone)]
pub struct PageWorker {
    fetcher: Arc<dyn Fetcher>,
    retry: RetryPolicy,
    tiles: TileAssembler,
}

impl PageWorker {
    #[must_use]
    pub fn new(fetcher: Arc<dyn Fetcher>, retry: RetryPolicy, tiles: TileAssembler) -> Self {
        Self {
            fetcher,
            retry,
            tiles,
        }
    }

    /// Fetches `page` with retries.
    ///
    /// # Errors
    ///
    /// [`PageError::Cancelled`] when `cancel` fires, otherwise
    /// [`PageError::Failed`] with a one-line reason.
    pub async fn fetch(&self, page: &Page, cancel: &CancellationToken) -> Result<FetchedPage, PageError> {
        match &page.locator {
            ImageLocator::Direct { url } => self.fetch_direct(url, cancel).await,
            ImageLocator::Tiled(tiles) => match self.tiles.assemble(tiles, cancel).await {
                Ok(raster) => {
                    debug!(page = page.index, width = raster.width, height = raster.height, "Stitched tiled page");
                    Ok(FetchedPage {
                        bytes: raster.bytes,
                        extension: "jpg",
                    })
                }
                Err(TileError::Cancelled) => Err(PageError::Cancelled),
                Err(error) => Err(PageError::Failed(error.to_string())),
            },
        }
    }

    async fn fetch_direct(&self, url: &str, cancel: &CancellationToken) -> Result<FetchedPage, PageError> {
        let response = fetch_with_retry(
            self.fetcher.as_ref(),
            url,
            &FetchOptions::default(),
            &self.retry,
            cancel,
        )
        .await
        .map_err(|error| match error {
            FetchError::Cancelled { .. } => PageError::Cancelled,
            other => PageError::Failed(other.to_string()),
        })?;

        let extension = extension_for(&response.body).ok_or_else(|| {
            let content_type = response.header("content-type").unwrap_or("unknown");
            PageError::Failed(format!("{url} did not return an image (content-type {content_type})"))
        })?;
        Ok(FetchedPage {
            bytes: response.body,
            extension,
        })
    }
}
