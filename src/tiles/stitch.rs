//! Pasting decoded tiles onto one canvas.

use std::io::Cursor;

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{RgbImage, imageops};
use tracing::warn;

use super::{RasterPage, TileError};

/// JPEG quality of the reassembled page.
pub const JPEG_QUALITY: u8 = 90;

/// Grid position of a fetched tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TilePos {
    pub col: u32,
    pub row: u32,
}

struct Placement {
    x: u32,
    y: u32,
    image: RgbImage,
}

/// Decodes, crops and pastes `tiles`, then encodes the canvas as JPEG.
///
/// Tiles beyond the first column or row lose their leading `overlap`
/// pixels; each contributes at most `tile_size` pixels per axis. The canvas
/// covers exactly the placed tiles, so a missing trailing column simply
/// narrows the page.
///
/// # Errors
///
/// [`TileError::Decode`] when no tile decodes, [`TileError::Encode`] when the
/// JPEG encoder fails.
pub fn stitch(
    template: &str,
    tile_size: u32,
    overlap: u32,
    tiles: Vec<(TilePos, Bytes)>,
) -> Result<RasterPage, TileError> {
    let mut placements = Vec::with_capacity(tiles.len());
    let mut last_error = None;

    for (pos, bytes) in tiles {
        let decoded = match image::load_from_memory(&bytes) {
            Ok(decoded) => decoded.to_rgb8(),
            Err(error) => {
                warn!(col = pos.col, row = pos.row, error = %error, "Skipping undecodable tile");
                last_error = Some(error.to_string());
                continue;
            }
        };

        let src_x = if pos.col > 0 { overlap } else { 0 };
        let src_y = if pos.row > 0 { overlap } else { 0 };
        if decoded.width() <= src_x || decoded.height() <= src_y {
            continue;
        }
        let width = (decoded.width() - src_x).min(tile_size);
        let height = (decoded.height() - src_y).min(tile_size);
        let image = imageops::crop_imm(&decoded, src_x, src_y, width, height).to_image();

        placements.push(Placement {
            x: tile_size * pos.col,
            y: tile_size * pos.row,
            image,
        });
    }

    if placements.is_empty() {
        return Err(TileError::decode(
            template,
            last_error.unwrap_or_else(|| "no tiles to stitch".to_string()),
        ));
    }

    let width = placements
        .iter()
        .map(|p| p.x + p.image.width())
        .max()
        .unwrap_or(0);
    let height = placements
        .iter()
        .map(|p| p.y + p.image.height())
        .max()
        .unwrap_or(0);

    let mut canvas = RgbImage::new(width, height);
    for placement in &placements {
        imageops::replace(
            &mut canvas,
            &placement.image,
            i64::from(placement.x),
            i64::from(placement.y),
        );
    }

    let mut out = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY)
        .encode_image(&canvas)
        .map_err(|error| TileError::encode(error.to_string()))?;

    Ok(RasterPage {
        bytes: Bytes::from(out.into_inner()),
        width,
        height,
    })
}
