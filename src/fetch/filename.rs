//! Filename derivation and unique-path resolution for downloads.

use std::path::{Path, PathBuf};

use crate::upstream::RemoteFile;

/// Builds a filename from upstream file metadata.
///
/// Pattern: `Name (Author).ext`, where the name prefers the file's
/// description, then its title, then a `book_<id>` fallback. The
/// extension falls back to the book record's, then to `pdf`.
#[must_use]
pub fn build_filename(file: &RemoteFile, book_id: &str, fallback_extension: Option<&str>) -> String {
    let base = [file.description.as_deref(), file.title.as_deref()]
        .into_iter()
        .flatten()
        .map(sanitize_component)
        .find(|name| !name.is_empty())
        .unwrap_or_else(|| format!("book_{}", sanitize_component(book_id)));

    let mut name = base;
    if let Some(author) = file.author.as_deref() {
        let author = sanitize_component(author);
        if !author.is_empty() {
            name.push_str(&format!(" ({author})"));
        }
    }

    let extension = [file.extension.as_deref(), fallback_extension]
        .into_iter()
        .flatten()
        .map(|ext| sanitize_component(ext.trim_start_matches('.')).to_lowercase())
        .find(|ext| !ext.is_empty())
        .unwrap_or_else(|| "pdf".to_string());

    format!("{name}.{extension}")
}

/// Replaces path separators and reserved characters, collapsing runs.
///
/// Spaces and parentheses are kept; the result is display-friendly but
/// safe as a single path component.
fn sanitize_component(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut prev_replaced = false;
    for ch in value.chars() {
        let mapped = match ch {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => None,
            c if c.is_control() => None,
            c => Some(c),
        };
        match mapped {
            Some(c) => {
                out.push(c);
                prev_replaced = false;
            }
            None => {
                if !prev_replaced {
                    out.push('_');
                    prev_replaced = true;
                }
            }
        }
    }
    out.trim().trim_matches('.').trim().to_string()
}

/// Resolves a non-colliding path for `filename` inside `dir`.
///
/// When the name is taken, `_2`, `_3`, ... suffixes are tried before the
/// extension until a free name is found.
#[must_use]
pub fn resolve_unique_path(dir: &Path, filename: &str) -> PathBuf {
    let candidate = dir.join(filename);
    if !candidate.exists() {
        return candidate;
    }

    let (stem, extension) = match filename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (filename, None),
    };

    let mut counter: u32 = 2;
    loop {
        let name = match extension {
            Some(ext) => format!("{stem}_{counter}.{ext}"),
            None => format!("{stem}_{counter}"),
        };
        let candidate = dir.join(name);
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}
