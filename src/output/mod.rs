//! Part artifacts: staged page images in, one PDF out.
//!
//! Pages are emitted in the order given, which the orchestrator fixes to
//! manifest order. Failed pages become Letter-sized placeholders so page
//! numbering never shifts. Every artifact is written to a temp file in its
//! destination directory and renamed into place once synced.

mod error;
mod naming;
pub mod pdf;

use std::io::{BufWriter, Cursor};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use image::codecs::jpeg::{JpegDecoder, JpegEncoder};
use image::{ExtendedColorType, ImageDecoder, ImageFormat};
use tempfile::NamedTempFile;
use tracing::{debug, info, instrument, warn};

pub use error::OutputError;
pub use naming::{artifact_path, file_stem, sanitize_title};
pub use pdf::{JpegColor, PdfPage};

/// Visible notice on placeholder pages.
pub const PLACEHOLDER_NOTICE: &str = "Page could not be downloaded";

const REENCODE_QUALITY: u8 = 90;
const WRAP_COLUMNS: usize = 80;

/// What a page contributes to its part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageContent {
    /// Image bytes staged on disk.
    Staged(PathBuf),
    /// The page failed; `reason` is shown on the placeholder.
    Failed { reason: String },
}

/// One page of a part, in output order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartPage {
    /// Manifest index.
    pub index: u32,
    /// Manifest label.
    pub label: String,
    /// Image or failure.
    pub content: PageContent,
}

/// Everything needed to write one part.
#[derive(Debug, Clone)]
pub struct PartJob {
    /// Manuscript title, recorded in the document info.
    pub title: String,
    /// Final artifact path.
    pub destination: PathBuf,
    /// Pages in manifest order.
    pub pages: Vec<PartPage>,
}

/// Writes part artifacts.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputAssembler;

impl OutputAssembler {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Writes `job` atomically and returns its final path.
    ///
    /// # Errors
    ///
    /// [`OutputError::Write`] if the directory, temp file, write, sync or
    /// rename fails. The temp file never outlives a failure.
    #[instrument(skip(self, job), fields(path = %job.destination.display(), pages = job.pages.len()))]
    pub async fn write_part(&self, job: &PartJob) -> Result<PathBuf, OutputError> {
        let job = job.clone();
        let destination = job.destination.clone();
        let path = tokio::task::spawn_blocking(move || write_part_blocking(&job))
            .await
            .map_err(|error| OutputError::write(&destination, error))??;
        info!(path = %path.display(), "Wrote part artifact");
        Ok(path)
    }
}

fn write_part_blocking(job: &PartJob) -> Result<PathBuf, OutputError> {
    let destination = &job.destination;
    let parent = destination
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(|e| OutputError::write(destination, e))?;

    let pages: Vec<PdfPage> = job.pages.iter().map(render_page).collect();

    let mut temp = NamedTempFile::new_in(parent).map_err(|e| OutputError::write(destination, e))?;
    {
        let writer = BufWriter::new(temp.as_file_mut());
        pdf::write_pdf(writer, &job.title, &pages)
            .and_then(|writer| writer.into_inner().map_err(std::io::IntoInnerError::into_error))
            .map_err(|e| OutputError::write(destination, e))?;
    }
    temp.as_file()
        .sync_all()
        .map_err(|e| OutputError::write(destination, e))?;
    temp.persist(destination)
        .map_err(|e| OutputError::write(destination, e.error))?;
    Ok(destination.clone())
}

fn render_page(page: &PartPage) -> PdfPage {
    match &page.content {
        PageContent::Failed { reason } => placeholder(page, reason),
        PageContent::Staged(path) => match std::fs::read(path)
            .map_err(|e| e.to_string())
            .and_then(|data| embeddable_jpeg(Bytes::from(data)))
        {
            Ok(image) => image,
            Err(error) => {
                warn!(page = page.index, path = %path.display(), error = %error, "Staged image unusable");
                placeholder(page, &format!("staged image unusable: {error}"))
            }
        },
    }
}

/// JPEGs in gray or RGB are embedded untouched; anything else is decoded and re-encoded.
///
/// # Errors
///
/// Returns the decoder or encoder message when the bytes are not a usable image.
pub fn embeddable_jpeg(data: Bytes) -> Result<PdfPage, String> {
    if image::guess_format(&data).ok() == Some(ImageFormat::Jpeg)
        && let Ok(decoder) = JpegDecoder::new(Cursor::new(&data[..]))
    {
        let (width, height) = decoder.dimensions();
        let color = match decoder.original_color_type() {
            ExtendedColorType::L8 => Some(JpegColor::Gray),
            ExtendedColorType::Rgb8 => Some(JpegColor::Rgb),
            _ => None,
        };
        if let Some(color) = color {
            return Ok(PdfPage::Jpeg {
                data,
                width,
                height,
                color,
            });
        }
    }

    debug!("Re-encoding page image as JPEG");
    let rgb = image::load_from_memory(&data)
        .map_err(|e| e.to_string())?
        .to_rgb8();
    let mut out = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut out, REENCODE_QUALITY)
        .encode_image(&rgb)
        .map_err(|e| e.to_string())?;
    Ok(PdfPage::Jpeg {
        data: Bytes::from(out.into_inner()),
        width: rgb.width(),
        height: rgb.height(),
        color: JpegColor::Rgb,
    })
}

fn placeholder(page: &PartPage, reason: &str) -> PdfPage {
    let mut lines = vec![page.label.clone(), PLACEHOLDER_NOTICE.to_string()];
    lines.extend(wrap(reason, WRAP_COLUMNS));
    lines.push(format!("Manuscript page {}", page.index));
    PdfPage::Text { lines }
}

fn wrap(text: &str, columns: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    for word in text.split_whitespace() {
        if !current.is_empty() && current.chars().count() + 1 + word.chars().count() > columns {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

/// Item status text when pages fell back to placeholders.
#[must_use]
pub fn summary_message(failed: usize, total: usize) -> Option<String> {
    (failed > 0).then(|| format!("{failed} of {total} pages couldn't be downloaded"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_support::jpeg_bytes;

    fn staged(dir: &Path, index: u32, data: &[u8]) -> PartPage {
        let path = dir.join(format!("page_{index:04}.jpg"));
        std::fs::write(&path, data).unwrap();
        PartPage {
            index,
            label: format!("fol. {index}"),
            content: PageContent::Staged(path),
        }
    }

    fn count_pages(pdf: &[u8]) -> usize {
        String::from_utf8_lossy(pdf).matches("/Type /Page ").count()
    }

    // ==================== Summary Tests ====================

    #[test]
    fn test_summary_message() {
        assert_eq!(summary_message(0, 10), None);
        assert_eq!(
            summary_message(2, 10).as_deref(),
            Some("2 of 10 pages couldn't be downloaded")
        );
    }

    #[test]
    fn test_wrap_respects_columns() {
        let lines = wrap("HTTP 404 downloading https://example.org/a/very/long/path", 20);
        assert!(lines.iter().all(|l| l.chars().count() <= 20 || !l.contains(' ')));
        assert_eq!(lines[0], "HTTP 404 downloading");
    }

    // ==================== Image Tests ====================

    #[test]
    fn test_jpeg_embedded_verbatim() {
        let data = Bytes::from(jpeg_bytes(40, 30, 90));
        match embeddable_jpeg(data.clone()).unwrap() {
            PdfPage::Jpeg { data: embedded, width, height, .. } => {
                assert_eq!(embedded, data);
                assert_eq!((width, height), (40, 30));
            }
            PdfPage::Text { .. } => panic!("expected image"),
        }
    }

    #[test]
    fn test_png_is_reencoded() {
        let image = image::RgbImage::from_pixel(12, 8, image::Rgb([1, 2, 3]));
        let mut png = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(image)
            .write_to(&mut png, ImageFormat::Png)
            .unwrap();
        match embeddable_jpeg(Bytes::from(png.into_inner())).unwrap() {
            PdfPage::Jpeg { data, width, height, color } => {
                assert_eq!(image::guess_format(&data).unwrap(), ImageFormat::Jpeg);
                assert_eq!((width, height, color), (12, 8, JpegColor::Rgb));
            }
            PdfPage::Text { .. } => panic!("expected image"),
        }
    }

    // ==================== Write Tests ====================

    #[tokio::test]
    async fn test_placeholders_keep_page_count_and_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut pages = Vec::new();
        for index in 1..=10 {
            if index == 3 || index == 7 {
                pages.push(PartPage {
                    index,
                    label: format!("fol. {index}"),
                    content: PageContent::Failed {
                        reason: "HTTP 404".to_string(),
                    },
                });
            } else {
                pages.push(staged(dir.path(), index, &jpeg_bytes(8, 8, 10)));
            }
        }
        let destination = dir.path().join("out").join("Codex.pdf");
        let job = PartJob {
            title: "Codex".to_string(),
            destination: destination.clone(),
            pages,
        };

        let written = OutputAssembler::new().write_part(&job).await.unwrap();
        assert_eq!(written, destination);
        let pdf = std::fs::read(&destination).unwrap();
        assert_eq!(count_pages(&pdf), 10);
        let text = String::from_utf8_lossy(&pdf);
        assert_eq!(text.matches(PLACEHOLDER_NOTICE).count(), 2);
        let third = text.find("(fol. 3) Tj").unwrap();
        let seventh = text.find("(fol. 7) Tj").unwrap();
        assert!(third < seventh);
    }

    #[tokio::test]
    async fn test_unreadable_staged_page_becomes_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let pages = vec![staged(dir.path(), 1, b"garbage")];
        let job = PartJob {
            title: "X".to_string(),
            destination: dir.path().join("X.pdf"),
            pages,
        };
        let path = OutputAssembler::new().write_part(&job).await.unwrap();
        let text = String::from_utf8_lossy(&std::fs::read(path).unwrap()).into_owned();
        assert!(text.contains(PLACEHOLDER_NOTICE));
    }

    #[tokio::test]
    async fn test_write_failure_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        // destination is an existing directory, so the final rename fails
        let destination = dir.path().join("taken.pdf");
        std::fs::create_dir(&destination).unwrap();
        std::fs::write(destination.join("keep"), b"x").unwrap();
        let job = PartJob {
            title: "T".to_string(),
            destination: destination.clone(),
            pages: vec![staged(dir.path(), 1, &jpeg_bytes(4, 4, 0))],
        };

        let error = OutputAssembler::new().write_part(&job).await.unwrap_err();
        assert!(matches!(error, OutputError::Write { .. }));
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }
}
