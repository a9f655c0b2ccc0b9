//! Deterministic file naming: sanitization, Radarr-style movie stems and
//! collision avoidance inside a target directory.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use walkdir::WalkDir;

static RESERVED_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[\\/:*?"<>|]+"#).expect("reserved character pattern"));

/// Replaces characters that are invalid on common filesystems with `_` and
/// drops surrounding whitespace plus trailing periods (Windows refuses them).
pub fn sanitize_filename(name: &str) -> String {
    let replaced = RESERVED_CHARS.replace_all(name, "_");
    replaced
        .trim_start()
        .trim_end_matches(|ch: char| ch == '.' || ch.is_whitespace())
        .to_string()
}

/// Builds the canonical `Title (Year) {tmdb-ID}` stem Radarr uses for movie
/// folders and files. Zero values are treated as unknown.
pub fn build_movie_stem(title: &str, year: Option<i64>, tmdb_id: Option<i64>) -> String {
    let title = title.trim();
    let mut parts = vec![if title.is_empty() { "Movie" } else { title }.to_string()];
    if let Some(year) = year.filter(|value| *value > 0) {
        parts.push(format!("({year})"));
    }
    if let Some(id) = tmdb_id.filter(|value| *value > 0) {
        parts.push(format!("{{tmdb-{id}}}"));
    }
    let cleaned = sanitize_filename(&parts.join(" "));
    if cleaned.is_empty() {
        "Movie".to_string()
    } else {
        cleaned
    }
}

/// Returns `stem` when nothing in `dir` uses it yet, otherwise the first free
/// `"stem (2)"`, `"stem (3)"`, ... An entry uses a stem when it is named
/// exactly `stem` or `stem.<anything>`. `exclude` lets a file being renamed
/// ignore itself.
pub fn free_stem(dir: &Path, stem: &str, exclude: Option<&Path>) -> String {
    if !stem_taken(dir, stem, exclude) {
        return stem.to_string();
    }
    let mut suffix = 2u32;
    loop {
        let candidate = format!("{stem} ({suffix})");
        if !stem_taken(dir, &candidate, exclude) {
            return candidate;
        }
        suffix += 1;
    }
}

pub fn stem_taken(dir: &Path, stem: &str, exclude: Option<&Path>) -> bool {
    let dotted = format!("{stem}.");
    entries_in(dir).into_iter().any(|path| {
        if exclude.is_some_and(|skip| skip == path) {
            return false;
        }
        path.file_name()
            .map(|name| name.to_string_lossy())
            .is_some_and(|name| name == stem || name.starts_with(&dotted))
    })
}

/// Files and folders that match the shell pattern `<dir>/<stem>.*`.
pub fn matching_stem(dir: &Path, stem: &str) -> Vec<PathBuf> {
    let dotted = format!("{stem}.");
    entries_in(dir)
        .into_iter()
        .filter(|path| {
            path.file_name()
                .is_some_and(|name| name.to_string_lossy().starts_with(&dotted))
        })
        .collect()
}

/// Lowercase extension without the dot, if any.
pub fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .filter(|ext| !ext.is_empty())
}

/// Direct children of `dir`, sorted by name. Missing directories yield an
/// empty list.
pub fn entries_in(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.into_path())
        .collect()
}
