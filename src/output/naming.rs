//! Artifact names derived from manuscript titles and page selections.

use std::path::{Path, PathBuf};

const MAX_TITLE_CHARS: usize = 100;

/// Filesystem-safe form of a title: separators and reserved characters
/// collapse to single underscores, ends are trimmed, length is bounded.
#[must_use]
pub fn sanitize_title(title: &str) -> String {
    let mut out = String::new();
    let mut prev_sep = false;
    for ch in title.chars() {
        let mapped = match ch {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_whitespace() || c.is_control() => '_',
            c if c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | '(' | ')' | ',') => c,
            _ => '_',
        };
        if mapped == '_' {
            if !prev_sep {
                out.push('_');
                prev_sep = true;
            }
        } else {
            out.push(mapped);
            prev_sep = false;
        }
    }
    let trimmed: String = out
        .trim_matches(|c| c == '_' || c == '.')
        .chars()
        .take(MAX_TITLE_CHARS)
        .collect();
    let trimmed = trimmed.trim_end_matches(['_', '.']).to_string();
    if trimmed.is_empty() {
        "manuscript".to_string()
    } else {
        trimmed
    }
}

/// Base artifact name for an item: the sanitized title, plus
/// `_pages_A-B` when only part of the manuscript was selected.
#[must_use]
pub fn file_stem(title: &str, pages: Option<(u32, u32)>) -> String {
    let name = sanitize_title(title);
    match pages {
        Some((first, last)) => format!("{name}_pages_{first}-{last}"),
        None => name,
    }
}

/// Where part `number` of the item named `stem` is written.
///
/// A part that is both the first and the last is the whole manuscript and is
/// written to `<stem>.pdf`; otherwise parts go to `<stem>/Part_NNN.pdf`.
#[must_use]
pub fn artifact_path(output_dir: &Path, stem: &str, number: u32, sole: bool) -> PathBuf {
    if sole {
        output_dir.join(format!("{stem}.pdf"))
    } else {
        output_dir.join(stem).join(format!("Part_{number:03}.pdf"))
    }
}
