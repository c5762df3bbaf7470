use std::io::Cursor;

use serde_json::{Value, json};

/// Solid grey JPEG of the given size.
#[allow(clippy::unwrap_used)]
pub fn jpeg(width: u32, height: u32, shade: u8) -> Vec<u8> {
    let image = image::RgbImage::from_pixel(width, height, image::Rgb([shade, shade, shade]));
    let mut out = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(image)
        .write_to(&mut out, image::ImageFormat::Jpeg)
        .unwrap();
    out.into_inner()
}

/// IIIF Presentation 2 manifest whose canvas `i` points at `image_url(i)`.
pub fn iiif_v2(title: &str, pages: u32, image_url: impl Fn(u32) -> String) -> Value {
    let canvases: Vec<Value> = (1..=pages)
        .map(|i| {
            json!({
                "@id": format!("canvas/{i}"),
                "label": format!("f. {i}"),
                "images": [{"resource": {"@id": image_url(i)}}]
            })
        })
        .collect();
    json!({
        "@context": "http://iiif.io/api/presentation/2/context.json",
        "label": title,
        "sequences": [{"canvases": canvases}]
    })
}

/// Number of page objects in a PDF produced by the output assembler.
pub fn pdf_page_count(pdf: &[u8]) -> usize {
    String::from_utf8_lossy(pdf).matches("/Type /Page ").count()
}

/// Page widths, in points, in page-tree order.
pub fn media_box_widths(pdf: &[u8]) -> Vec<u32> {
    let text = String::from_utf8_lossy(pdf);
    text.split("/MediaBox [0 0 ")
        .skip(1)
        .filter_map(|rest| rest.split_whitespace().next())
        .filter_map(|width| width.parse::<f64>().ok())
        .map(|width| width as u32)
        .collect()
}
