//! On-disk staging of fetched page images: `<root>/<item>/page_NNNN.<ext>`.

use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::{debug, warn};

/// Extensions a staged page may carry.
pub const STAGED_EXTENSIONS: [&str; 4] = ["jpg", "png", "webp", "bin"];

/// Staging area shared by every item.
#[derive(Debug, Clone)]
pub struct Staging {
    root: PathBuf,
}

impl Staging {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn item_dir(&self, id: i64) -> PathBuf {
        self.root.join(id.to_string())
    }

    #[must_use]
    pub fn page_path(&self, id: i64, index: u32, extension: &str) -> PathBuf {
        self.item_dir(id).join(format!("page_{index:04}.{extension}"))
    }

    /// Writes page bytes via a temporary name so a crash never leaves a torn page.
    ///
    /// # Errors
    ///
    /// Propagates directory creation, write and rename failures.
    pub async fn write_page(
        &self,
        id: i64,
        index: u32,
        extension: &str,
        bytes: &Bytes,
    ) -> io::Result<PathBuf> {
        let path = self.page_path(id, index, extension);
        tokio::fs::create_dir_all(self.item_dir(id)).await?;
        let partial = path.with_extension(format!("{extension}.part"));
        tokio::fs::write(&partial, bytes).await?;
        tokio::fs::rename(&partial, &path).await?;
        Ok(path)
    }

    /// Staged file for a page, whatever its extension.
    #[must_use]
    pub fn find_page(&self, id: i64, index: u32) -> Option<PathBuf> {
        STAGED_EXTENSIONS
            .iter()
            .map(|ext| self.page_path(id, index, ext))
            .find(|path| path.is_file())
    }

    /// Deletes staged pages once their part is written.
    pub async fn remove_pages(&self, paths: impl IntoIterator<Item = PathBuf>) {
        for path in paths {
            if let Err(error) = tokio::fs::remove_file(&path).await
                && error.kind() != io::ErrorKind::NotFound
            {
                warn!(path = %path.display(), error = %error, "Could not delete staged page");
            }
        }
    }

    /// Deletes an item's whole staging directory.
    pub async fn remove_item(&self, id: i64) {
        let dir = self.item_dir(id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => debug!(dir = %dir.display(), "Removed staging directory"),
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(error) => warn!(dir = %dir.display(), error = %error, "Could not remove staging directory"),
        }
    }
}

/// Staging extension for a page body, from its magic bytes.
#[must_use]
pub fn extension_for(bytes: &[u8]) -> Option<&'static str> {
    match image::guess_format(bytes).ok()? {
        image::ImageFormat::Jpeg => Some("jpg"),
        image::ImageFormat::Png => Some("png"),
        image::ImageFormat::WebP => Some("webp"),
        _ => None,
    }
}
