//! Canonical page model shared by adapters, the orchestrator and the output assembler.
//!
//! Every adapter, whatever the host's addressing scheme, produces a
//! [`Manifest`]: a non-empty list of [`Page`]s indexed `1..=N` without gaps.
//! [`Manifest::new`] enforces that invariant, so code downstream of a
//! resolver never has to re-check it.

use serde::{Deserialize, Serialize};

use crate::resolver::ResolveError;

/// A submitted URL and the adapter that recognized it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    /// URL exactly as submitted.
    pub url: String,
    /// Identifier of the adapter that matched.
    pub adapter_id: String,
}

impl Source {
    /// Creates a source record.
    #[must_use]
    pub fn new(url: impl Into<String>, adapter_id: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            adapter_id: adapter_id.into(),
        }
    }
}

/// Tile pyramid description for pages without a directly fetchable image.
///
/// The grid is deliberately absent: it is discovered by requesting tiles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileDescriptor {
    /// Tile URL with `{level}`, `{col}` and `{row}` placeholders.
    pub url_template: String,
    /// Nominal tile edge in pixels.
    pub tile_size: u32,
    /// Highest level worth trying, if known.
    pub max_level: Option<u32>,
    /// Lowest level worth trying.
    pub min_level: u32,
    /// Pixels of overlap each tile shares with its neighbours (Deep Zoom uses 1).
    pub overlap: u32,
    /// Tile file format extension, e.g. `jpg`.
    pub format: String,
}

impl TileDescriptor {
    /// Default search ceiling when the pyramid depth is unknown.
    pub const DEFAULT_MAX_LEVEL: u32 = 20;

    /// Builds the URL for one tile.
    #[must_use]
    pub fn tile_url(&self, level: u32, col: u32, row: u32) -> String {
        self.url_template
            .replace("{level}", &level.to_string())
            .replace("{col}", &col.to_string())
            .replace("{row}", &row.to_string())
    }

    /// The level the search starts from.
    #[must_use]
    pub fn search_ceiling(&self) -> u32 {
        self.max_level
            .unwrap_or(Self::DEFAULT_MAX_LEVEL)
            .max(self.min_level)
    }
}

/// Where a page image comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImageLocator {
    /// A single fetchable image URL.
    Direct {
        /// Image URL.
        url: String,
    },
    /// A tile pyramid that must be reassembled.
    Tiled(TileDescriptor),
}

/// One page of a manuscript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    /// 1-based position in the manifest.
    pub index: u32,
    /// Human label ("fol. 1r", "Page 3").
    pub label: String,
    /// Image source.
    pub locator: ImageLocator,
}

impl Page {
    /// Creates a page with a direct image URL.
    #[must_use]
    pub fn direct(index: u32, label: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            index,
            label: label.into(),
            locator: ImageLocator::Direct { url: url.into() },
        }
    }

    /// Creates a page backed by a tile pyramid.
    #[must_use]
    pub fn tiled(index: u32, label: impl Into<String>, tiles: TileDescriptor) -> Self {
        Self {
            index,
            label: label.into(),
            locator: ImageLocator::Tiled(tiles),
        }
    }
}

/// Ordered page list plus display title.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    title: String,
    source: Source,
    pages: Vec<Page>,
}

impl Manifest {
    /// Validates and builds a manifest.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::PermanentFormat`] when `pages` is empty or the
    /// indices are not exactly `1..=N` in order.
    pub fn new(
        title: impl Into<String>,
        source: Source,
        pages: Vec<Page>,
    ) -> Result<Self, ResolveError> {
        let manifest = Self {
            title: title.into(),
            source,
            pages,
        };
        manifest.validate()?;
        Ok(manifest)
    }

    /// Builds a manifest from pages in display order, assigning indices `1..=N`.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::PermanentFormat`] when `pages` is empty.
    pub fn from_ordered(
        title: impl Into<String>,
        source: Source,
        pages: impl IntoIterator<Item = (String, ImageLocator)>,
    ) -> Result<Self, ResolveError> {
        let pages = pages
            .into_iter()
            .zip(1u32..)
            .map(|((label, locator), index)| Page {
                index,
                label,
                locator,
            })
            .collect();
        Self::new(title, source, pages)
    }

    /// Checks the non-empty and contiguous `1..=N` invariants.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::PermanentFormat`] describing the first violation.
    pub fn validate(&self) -> Result<(), ResolveError> {
        if self.pages.is_empty() {
            return Err(ResolveError::permanent_format(
                &self.source.adapter_id,
                "manifest contains no pages",
            ));
        }
        for (expected, page) in (1u32..).zip(&self.pages) {
            if page.index != expected {
                return Err(ResolveError::permanent_format(
                    &self.source.adapter_id,
                    &format!(
                        "page indices must be contiguous from 1 (expected {expected}, found {})",
                        page.index
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Display title.
    #[must_use]
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Source this manifest was resolved from.
    #[must_use]
    pub fn source(&self) -> &Source {
        &self.source
    }

    /// Pages in order.
    #[must_use]
    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    /// Number of pages (always at least 1).
    #[must_use]
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Always false for a validated manifest; present for API symmetry.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Looks up a page by its 1-based index.
    #[must_use]
    pub fn page(&self, index: u32) -> Option<&Page> {
        let position = usize::try_from(index.checked_sub(1)?).ok()?;
        self.pages.get(position)
    }
}
