//! Minimal PDF 1.4 serializer: one full-page JPEG or one text placeholder per page.
//!
//! JPEG streams are embedded as-is with `DCTDecode`. Placeholders use the
//! standard Helvetica font with `WinAnsiEncoding`, so no font data is embedded.

use std::io::{self, Write};

use bytes::Bytes;

/// Largest page edge a PDF viewer must accept, in points.
pub const MAX_PAGE_POINTS: f64 = 14_400.0;
/// US Letter, in points.
pub const LETTER: (f64, f64) = (612.0, 792.0);

/// Colour space of an embedded JPEG.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JpegColor {
    Gray,
    Rgb,
}

impl JpegColor {
    fn pdf_name(self) -> &'static str {
        match self {
            Self::Gray => "/DeviceGray",
            Self::Rgb => "/DeviceRGB",
        }
    }
}

/// One page to emit.
#[derive(Debug, Clone)]
pub enum PdfPage {
    /// A baseline or progressive JPEG covering the whole page.
    Jpeg {
        data: Bytes,
        width: u32,
        height: u32,
        color: JpegColor,
    },
    /// A Letter-sized page of text lines; the first line is set larger.
    Text { lines: Vec<String> },
}

/// Page size in points for an image: 1 px = 1 pt, scaled down to fit [`MAX_PAGE_POINTS`].
#[must_use]
pub fn page_size(width: u32, height: u32) -> (f64, f64) {
    let (w, h) = (f64::from(width.max(1)), f64::from(height.max(1)));
    let scale = (MAX_PAGE_POINTS / w.max(h)).min(1.0);
    (w * scale, h * scale)
}

/// Object writer that tracks byte offsets for the xref table.
struct ObjectWriter<W: Write> {
    out: W,
    written: usize,
    offsets: Vec<usize>,
}

impl<W: Write> ObjectWriter<W> {
    fn new(out: W) -> Self {
        Self {
            out,
            written: 0,
            offsets: Vec::new(),
        }
    }

    fn raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.out.write_all(bytes)?;
        self.written += bytes.len();
        Ok(())
    }

    /// Reserves the next object number.
    fn reserve(&mut self) -> usize {
        self.offsets.push(0);
        self.offsets.len()
    }

    fn object(&mut self, id: usize, body: &str) -> io::Result<()> {
        self.offsets[id - 1] = self.written;
        self.raw(format!("{id} 0 obj\n{body}\nendobj\n").as_bytes())
    }

    fn stream(&mut self, id: usize, dict: &str, data: &[u8]) -> io::Result<()> {
        self.offsets[id - 1] = self.written;
        self.raw(format!("{id} 0 obj\n<< {dict} /Length {} >>\nstream\n", data.len()).as_bytes())?;
        self.raw(data)?;
        self.raw(b"\nendstream\nendobj\n")
    }

    fn finish(mut self, root: usize) -> io::Result<W> {
        let xref_at = self.written;
        let mut table = format!("xref\n0 {}\n0000000000 65535 f \n", self.offsets.len() + 1);
        for offset in &self.offsets {
            table.push_str(&format!("{offset:010} 00000 n \n"));
        }
        table.push_str(&format!(
            "trailer\n<< /Size {} /Root {root} 0 R >>\nstartxref\n{xref_at}\n%%EOF\n",
            self.offsets.len() + 1
        ));
        self.raw(table.as_bytes())?;
        self.out.flush()?;
        Ok(self.out)
    }
}

/// Serializes `pages` as a complete PDF document.
///
/// # Errors
///
/// Propagates I/O errors from `out`.
pub fn write_pdf<W: Write>(out: W, title: &str, pages: &[PdfPage]) -> io::Result<W> {
    let mut pdf = ObjectWriter::new(out);
    pdf.raw(b"%PDF-1.4\n%\xE2\xE3\xCF\xD3\n")?;

    let catalog = pdf.reserve();
    let tree = pdf.reserve();
    let font = pdf.reserve();
    let info = pdf.reserve();

    pdf.object(
        font,
        "<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica /Encoding /WinAnsiEncoding >>",
    )?;
    let mut info_body = b"<< /Producer (manuscript-downloader) /Title ".to_vec();
    info_body.extend(pdf_string(title));
    info_body.extend(b" >>");
    pdf.offsets[info - 1] = pdf.written;
    pdf.raw(format!("{info} 0 obj\n").as_bytes())?;
    pdf.raw(&info_body)?;
    pdf.raw(b"\nendobj\n")?;

    let mut kids = Vec::with_capacity(pages.len());
    for page in pages {
        let page_id = pdf.reserve();
        let content_id = pdf.reserve();
        kids.push(page_id);
        match page {
            PdfPage::Jpeg {
                data,
                width,
                height,
                color,
            } => {
                let image_id = pdf.reserve();
                let (w, h) = page_size(*width, *height);
                pdf.stream(
                    image_id,
                    &format!(
                        "/Type /XObject /Subtype /Image /Width {width} /Height {height} \
                         /ColorSpace {} /BitsPerComponent 8 /Filter /DCTDecode",
                        color.pdf_name()
                    ),
                    data,
                )?;
                let content = format!("q\n{w:.2} 0 0 {h:.2} 0 0 cm\n/Im0 Do\nQ\n");
                pdf.stream(content_id, "", content.as_bytes())?;
                pdf.object(
                    page_id,
                    &format!(
                        "<< /Type /Page /Parent {tree} 0 R /MediaBox [0 0 {w:.2} {h:.2}] \
                         /Resources << /XObject << /Im0 {image_id} 0 R >> >> /Contents {content_id} 0 R >>"
                    ),
                )?;
            }
            PdfPage::Text { lines } => {
                let content = text_content(lines);
                pdf.stream(content_id, "", &content)?;
                pdf.object(
                    page_id,
                    &format!(
                        "<< /Type /Page /Parent {tree} 0 R /MediaBox [0 0 {} {}] \
                         /Resources << /Font << /F1 {font} 0 R >> >> /Contents {content_id} 0 R >>",
                        LETTER.0, LETTER.1
                    ),
                )?;
            }
        }
    }

    let kids_list = kids
        .iter()
        .map(|id| format!("{id} 0 R"))
        .collect::<Vec<_>>()
        .join(" ");
    pdf.object(
        tree,
        &format!("<< /Type /Pages /Kids [{kids_list}] /Count {} >>", kids.len()),
    )?;
    pdf.object(catalog, &format!("<< /Type /Catalog /Pages {tree} 0 R >>"))?;
    pdf.finish(catalog)
}

fn text_content(lines: &[String]) -> Vec<u8> {
    let mut content = Vec::new();
    let mut y = LETTER.1 - 120.0;
    for (i, line) in lines.iter().enumerate() {
        let size = if i == 0 { 20 } else { 12 };
        content.extend(format!("BT /F1 {size} Tf 72 {y:.0} Td ").as_bytes());
        content.extend(pdf_string(line));
        content.extend(b" Tj ET\n");
        y -= if i == 0 { 36.0 } else { 18.0 };
    }
    content
}

/// Literal string in WinAnsi bytes; characters outside Latin-1 become `?`.
fn pdf_string(text: &str) -> Vec<u8> {
    let mut out = vec![b'('];
    for ch in text.chars() {
        match ch {
            '(' | ')' | '\\' => {
                out.push(b'\\');
                out.push(u8::try_from(ch).unwrap_or(b'?'));
            }
            '\n' | '\r' | '\t' => out.push(b' '),
            c => out.push(u8::try_from(u32::from(c)).unwrap_or(b'?')),
        }
    }
    out.push(b')');
    out
}
