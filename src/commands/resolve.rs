//! Resolve command handler: print a manuscript's manifest without queueing it.

use std::fmt::Write as _;

use anyhow::{Context, Result};
use manuscript_core::{ImageLocator, Manifest};

use crate::app::context::{build_fetcher, build_resolver};
use crate::app_config::AppConfig;
use crate::cli::ResolveArgs;

const PREVIEW_PAGES: usize = 10;

pub(crate) async fn run_resolve_command(config: &AppConfig, args: &ResolveArgs) -> Result<()> {
    let resolver = build_resolver(config, build_fetcher(config)?);
    let manifest = resolver
        .resolve(&args.url)
        .await
        .with_context(|| format!("Failed to resolve '{}'", args.url))?;
    print!("{}", render_manifest(&manifest, args.all));
    Ok(())
}

pub(crate) fn render_manifest(manifest: &Manifest, all: bool) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Title:   {}", manifest.title());
    let _ = writeln!(out, "Adapter: {}", manifest.source().adapter_id);
    let _ = writeln!(out, "Pages:   {}", manifest.len());

    let shown = if all { manifest.len() } else { PREVIEW_PAGES.min(manifest.len()) };
    for page in &manifest.pages()[..shown] {
        let location = match &page.locator {
            ImageLocator::Direct { url } => url.clone(),
            ImageLocator::Tiled(tiles) => format!("tiles {}", tiles.url_template),
        };
        let _ = writeln!(out, "{:>5}  {:<16}  {location}", page.index, page.label);
    }
    let hidden = manifest.len() - shown;
    if hidden > 0 {
        let _ = writeln!(out, "  ... {hidden} more (use --all to list every page)");
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use manuscript_core::{Source, TileDescriptor};

    use super::*;

    fn manifest(pages: u32) -> Manifest {
        Manifest::from_ordered(
            "Codex",
            Source::new("https://iiif.test/m.json", "iiif"),
            (1..=pages).map(|i| {
                (
                    format!("fol. {i}r"),
                    ImageLocator::Direct {
                        url: format!("https://img.test/{i}.jpg"),
                    },
                )
            }),
        )
        .unwrap()
    }

    #[test]
    fn test_render_small_manifest_lists_every_page() {
        let out = render_manifest(&manifest(3), false);
        assert!(out.contains("Title:   Codex"));
        assert!(out.contains("Adapter: iiif"));
        assert!(out.contains("Pages:   3"));
        assert!(out.contains("fol. 3r"));
        assert!(out.contains("https://img.test/3.jpg"));
        assert!(!out.contains("more"));
    }

    #[test]
    fn test_render_large_manifest_is_truncated_unless_all() {
        let out = render_manifest(&manifest(25), false);
        assert!(out.contains("fol. 10r"));
        assert!(!out.contains("fol. 11r"));
        assert!(out.contains("15 more"));

        let out = render_manifest(&manifest(25), true);
        assert!(out.contains("fol. 25r"));
        assert!(!out.contains("more"));
    }

    #[test]
    fn test_render_tiled_page() {
        let tiles = TileDescriptor {
            url_template: "https://t.test/p1_files/{level}/{col}_{row}.jpg".to_string(),
            tile_size: 256,
            max_level: Some(13),
            min_level: 0,
            overlap: 1,
            format: "jpg".to_string(),
        };
        let manifest = Manifest::from_ordered(
            "Tiled",
            Source::new("https://t.test/x", "bordeaux"),
            [("Page 1".to_string(), ImageLocator::Tiled(tiles))],
        )
        .unwrap();
        let out = render_manifest(&manifest, false);
        assert!(out.contains("tiles https://t.test/p1_files/{level}/{col}_{row}.jpg"));
    }
}
