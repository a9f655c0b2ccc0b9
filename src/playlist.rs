//! Playlist staging, ffmpeg concatenation and extras fan-out.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, anyhow, bail};

use crate::extras::{ExtraType, PlaylistExtraEntry};
use crate::naming::{entries_in, free_stem, sanitize_filename};
use crate::ytdlp::{self, is_intermediate, is_partial};

pub const STAGING_PREFIX: &str = ".yt2radarr_playlist_";
pub const PLAYLIST_TEMPLATE: &str = "%(playlist_index)05d - %(title)s.%(ext)s";
pub const MANIFEST_NAME: &str = "concat.txt";

pub fn staging_dir(target_dir: &Path, job_id: &str) -> PathBuf {
    target_dir.join(format!("{STAGING_PREFIX}{job_id}"))
}

/// Completed downloads inside `staging`, in playlist order.
pub fn staged_files(staging: &Path) -> Vec<PathBuf> {
    entries_in(staging)
        .into_iter()
        .filter(|path| path.is_file() && !is_partial(path))
        .filter(|path| {
            path.file_name()
                .is_some_and(|name| name.to_string_lossy() != MANIFEST_NAME)
        })
        .collect()
}

/// One concat demuxer line. Backslashes and single quotes are escaped the
/// way ffmpeg's quoting rules expect.
pub fn manifest_line(path: &Path) -> String {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let escaped = absolute
        .to_string_lossy()
        .replace('\\', "\\\\")
        .replace('\'', "'\\''");
    format!("file '{escaped}'")
}

pub fn write_manifest(staging: &Path, segments: &[PathBuf]) -> Result<PathBuf> {
    let manifest = staging.join(MANIFEST_NAME);
    let mut contents = segments
        .iter()
        .map(|segment| manifest_line(segment))
        .collect::<Vec<_>>()
        .join("\n");
    contents.push('\n');
    fs::write(&manifest, contents)
        .with_context(|| format!("writing {}", manifest.display()))?;
    Ok(manifest)
}

/// Concatenates `segments` (already sorted) into `merged<ext>` inside
/// `staging` without re-encoding. The manifest and the segments are removed
/// once the merge succeeded.
pub fn merge_segments(
    ffmpeg: &Path,
    staging: &Path,
    segments: &[PathBuf],
    log: &mut dyn FnMut(String),
) -> Result<PathBuf> {
    if segments.is_empty() {
        bail!("No playlist segments to merge.");
    }
    let extension = segments[0]
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_else(|| ".mp4".to_string());
    let merged = staging.join(format!("merged{extension}"));
    let manifest = write_manifest(staging, segments)?;

    log(format!(
        "Merging playlist videos with ffmpeg (segments: {}).",
        segments.len()
    ));
    let mut command = Command::new(ffmpeg);
    command
        .current_dir(staging)
        .args(["-y", "-f", "concat", "-safe", "0", "-i", MANIFEST_NAME, "-c", "copy"])
        .arg(&merged);
    let status = ytdlp::run_streaming(command, |line| log(format!("DEBUG: ffmpeg: {line}")))
        .context("Failed to merge playlist videos into a single file.")?;
    if !status.success() || !merged.is_file() {
        bail!("Failed to merge playlist videos into a single file.");
    }

    log("Merging playlist videos completed successfully.".to_string());
    let _ = fs::remove_file(&manifest);
    for segment in segments {
        let _ = fs::remove_file(segment);
    }
    Ok(merged)
}

/// Downloaded playlist files that should become extras, in playlist order.
pub fn extras_candidates(staging: &Path) -> Vec<PathBuf> {
    staged_files(staging)
        .into_iter()
        .filter(|path| !is_intermediate(path))
        .collect()
}

/// Moves each staged file into the extras folder of its matched descriptor.
/// Files beyond the declared descriptors reuse the last declared type.
pub fn fan_out_extras(
    files: &[PathBuf],
    entries: &[PlaylistExtraEntry],
    movie_path: &Path,
    movie_stem: &str,
    log: &mut dyn FnMut(String),
) -> Result<Vec<PathBuf>> {
    let fallback = entries.last().map_or(ExtraType::Other, |entry| entry.kind);
    if files.len() > entries.len() {
        log(format!(
            "WARNING: Playlist contained {} entries but only {} extra descriptors were supplied. Remaining entries will use '{}'.",
            files.len(),
            entries.len(),
            fallback.label()
        ));
    }

    let mut placed = Vec::with_capacity(files.len());
    for (position, file) in files.iter().enumerate() {
        let entry = entries.get(position);
        let kind = entry.map_or(fallback, |entry| entry.kind);
        let folder = movie_path.join(kind.folder());
        fs::create_dir_all(&folder)
            .with_context(|| format!("creating {}", folder.display()))?;

        let raw_name = entry.map_or("", |entry| entry.name.trim());
        let custom_name = sanitize_filename(raw_name);
        let entry_title = entry
            .map(|entry| entry.title.trim())
            .filter(|title| !title.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| {
                file.file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
                    .unwrap_or_default()
            });

        let base = format!("{movie_stem} {}", kind.label());
        let detail = if !custom_name.is_empty() {
            custom_name.clone()
        } else {
            let title = sanitize_filename(&entry_title);
            if title.is_empty() || base.to_lowercase().contains(&title.to_lowercase()) {
                String::new()
            } else {
                title
            }
        };
        let stem = if detail.is_empty() {
            base
        } else {
            format!("{base} {detail}")
        };
        let stem = free_stem(&folder, &stem, None);
        let extension = file
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_default();
        let destination = folder.join(format!("{stem}{extension}"));
        let file_name = destination
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        fs::rename(file, &destination).map_err(|err| {
            anyhow!(
                "Failed to move playlist extra '{}' to '{file_name}': {err}",
                kind.label()
            )
        })?;
        let label = kind.label();
        let display = if !raw_name.is_empty() {
            format!("{label} – {raw_name}")
        } else if !entry_title.is_empty()
            && !label.to_lowercase().contains(&entry_title.to_lowercase())
        {
            format!("{label} – {entry_title}")
        } else {
            label.to_string()
        };
        log(format!(
            "Saving playlist extra #{}: '{display}' -> '{file_name}'.",
            position + 1
        ));
        placed.push(destination);
    }
    Ok(placed)
}
