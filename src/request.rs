//! Request validation and job descriptors.
//!
//! The browser posts a loosely typed JSON form. [`prepare_request`] turns it
//! into a [`DownloadRequest`] or a list of user-facing errors; nothing is
//! created when validation fails.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::extras::{
    ExtraType, PlaylistExtraEntry, RawExtraEntry, lenient_int, lenient_string, normalize_entries,
    readable_types,
};

static YOUTUBE_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(youtube\.com|youtu\.be)/").expect("youtube url pattern"));

/// Loose host check shared by job submission and playlist previews.
pub fn is_youtube_url(url: &str) -> bool {
    YOUTUBE_URL.is_match(url)
}

/// How a playlist URL is handled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum PlaylistHandling {
    /// One video (or yt-dlp's default playlist behaviour).
    #[default]
    Single,
    /// Download every entry and concatenate them into one file.
    Merge,
    /// Download every entry and file each one as an extra.
    Extras { entries: Vec<PlaylistExtraEntry> },
}

impl PlaylistHandling {
    pub fn is_playlist(&self) -> bool {
        !matches!(self, Self::Single)
    }

    pub fn extra_entries(&self) -> &[PlaylistExtraEntry] {
        match self {
            Self::Extras { entries } => entries,
            _ => &[],
        }
    }
}

/// Validated job parameters, stored alongside the job record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadRequest {
    pub yturl: String,
    #[serde(rename = "movieId")]
    pub movie_id: String,
    #[serde(rename = "movieName")]
    pub movie_name: String,
    pub title: String,
    pub year: Option<i64>,
    pub tmdb: Option<i64>,
    pub extra: bool,
    /// Raw token as submitted; unknown values are coerced when the job runs.
    #[serde(rename = "extraType")]
    pub extra_type: String,
    pub extra_name: String,
    pub playlist: PlaylistHandling,
}

/// Form body accepted by the create endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CreateJobForm {
    pub yturl: Option<String>,
    #[serde(rename = "movieId")]
    pub movie_id: Value,
    #[serde(rename = "movieName")]
    pub movie_name: Option<String>,
    pub title: Option<String>,
    pub year: Value,
    pub tmdb: Value,
    pub extra: Value,
    #[serde(rename = "extraType")]
    pub extra_type: Option<String>,
    pub extra_name: Option<String>,
    pub playlist_mode: Option<String>,
    pub merge_playlist: Value,
    pub playlist_extra_types: Value,
    pub playlist_extra_entries: Value,
}

pub fn prepare_request(form: &CreateJobForm) -> Result<DownloadRequest, Vec<String>> {
    let mut errors = Vec::new();

    let yturl = text(form.yturl.as_deref());
    if yturl.is_empty() {
        errors.push("YouTube URL is required.".to_string());
    } else if !is_youtube_url(&yturl) {
        errors.push("Please provide a valid YouTube URL.".to_string());
    }

    let movie_id = lenient_string(&form.movie_id);
    if movie_id.is_empty() {
        errors.push("No movie selected. Please choose a movie from the suggestions list.".into());
    }

    let mode = match form.playlist_mode.as_deref().map(str::trim) {
        Some(raw) if !raw.is_empty() => raw.to_lowercase(),
        _ if truthy(&form.merge_playlist) => "merge".to_string(),
        _ => "single".to_string(),
    };
    let mode = match mode.as_str() {
        "single" | "merge" | "extras" => mode,
        _ => {
            errors.push("Invalid playlist handling option selected.".to_string());
            "single".to_string()
        }
    };

    let raw_entries: Vec<RawExtraEntry> = match &form.playlist_extra_entries {
        Value::Array(items) => items
            .iter()
            .filter(|item| item.is_object())
            .filter_map(|item| serde_json::from_value(item.clone()).ok())
            .collect(),
        _ => Vec::new(),
    };
    let mut entries = normalize_entries(&raw_entries, |err| errors.push(err));
    if entries.is_empty() {
        entries = entries_from_types(&form.playlist_extra_types, &mut errors);
    }

    let extra_name = text(form.extra_name.as_deref());
    let extra = truthy(&form.extra) || !entries.is_empty();
    if mode == "extras" {
        if !extra {
            errors.push("Playlist extras require storing the videos as extras.".to_string());
        }
        if entries.is_empty() {
            errors.push("Provide at least one extra type for the playlist entries.".to_string());
        }
    } else if extra && extra_name.is_empty() {
        errors.push("Extra name is required when storing in a subfolder.".to_string());
    }

    let mut extra_type = match text(form.extra_type.as_deref()) {
        token if token.is_empty() => ExtraType::Trailer.key().to_string(),
        token => token.to_lowercase(),
    };
    let playlist = match mode.as_str() {
        "merge" => PlaylistHandling::Merge,
        "extras" => {
            if let Some(first) = entries.first() {
                extra_type = first.kind.key().to_string();
            }
            PlaylistHandling::Extras { entries }
        }
        _ => PlaylistHandling::Single,
    };

    if !errors.is_empty() {
        return Err(errors);
    }

    Ok(DownloadRequest {
        yturl,
        movie_id,
        movie_name: text(form.movie_name.as_deref()),
        title: text(form.title.as_deref()),
        year: lenient_int(&form.year),
        tmdb: lenient_int(&form.tmdb),
        extra: extra || matches!(playlist, PlaylistHandling::Extras { .. }),
        extra_type,
        extra_name,
        playlist,
    })
}

/// `playlist_extra_types` is the older, type-only way of describing playlist
/// extras. Each type becomes a positional entry.
fn entries_from_types(raw: &Value, errors: &mut Vec<String>) -> Vec<PlaylistExtraEntry> {
    let Value::Array(items) = raw else {
        return Vec::new();
    };
    let mut entries = Vec::new();
    for item in items {
        let token = lenient_string(item);
        match ExtraType::parse(&token) {
            Some(kind) => entries.push(PlaylistExtraEntry {
                index: entries.len() as u32 + 1,
                kind,
                name: String::new(),
                title: String::new(),
                id: String::new(),
                duration: None,
            }),
            None if !token.is_empty() => {
                errors.push(format!("Unknown playlist extra type '{token}'."));
            }
            None => {}
        }
    }
    entries
}

/// Display fields derived from a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobDescriptor {
    pub label: String,
    pub subtitle: String,
    pub metadata: Vec<String>,
}

pub fn describe_job(request: &DownloadRequest) -> JobDescriptor {
    let movie = [&request.movie_name, &request.title]
        .into_iter()
        .map(|value| value.trim())
        .find(|value| !value.is_empty())
        .unwrap_or("Selected Movie");

    let entries = request.playlist.extra_entries();
    let extra = request.extra || !entries.is_empty();
    let extra_label = if !entries.is_empty() {
        "Playlist Extras".to_string()
    } else if !request.extra_name.trim().is_empty() {
        request.extra_name.trim().to_string()
    } else {
        type_label(&request.extra_type)
    };

    let (label, subtitle) = if extra {
        (
            format!("{movie} – {extra_label}"),
            format!("Extra • {extra_label}"),
        )
    } else {
        (movie.to_string(), String::new())
    };

    let mut metadata = Vec::new();
    if extra {
        metadata.push("Stored as extra content".to_string());
    }
    if request.playlist == PlaylistHandling::Merge {
        metadata.push("Playlist merged into single file".to_string());
    }
    if !entries.is_empty() {
        let kinds: Vec<ExtraType> = entries.iter().map(|entry| entry.kind).collect();
        metadata.push(format!("Playlist extras: {}", readable_types(&kinds)));
        metadata.push(format!("Playlist entries: {}", entries.len()));
    }

    JobDescriptor {
        label,
        subtitle,
        metadata,
    }
}

/// Label for a possibly unknown extra token (`"gag-reel"` becomes
/// `"Gag-reel"`).
pub fn type_label(token: &str) -> String {
    if let Some(kind) = ExtraType::parse(token) {
        return kind.label().to_string();
    }
    let token = token.trim();
    let mut chars = token.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => ExtraType::Trailer.label().to_string(),
    }
}

fn text(value: Option<&str>) -> String {
    value.unwrap_or("").trim().to_string()
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(raw) => matches!(
            raw.trim().to_lowercase().as_str(),
            "1" | "true" | "on" | "yes"
        ),
        _ => false,
    }
}
