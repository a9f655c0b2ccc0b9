//! Extra-content classification shared by request validation and the
//! playlist coordinator.
//!
//! Radarr (and Plex/Jellyfin behind it) recognise a fixed set of extras
//! folders next to the main movie file. Everything user supplied is folded
//! into [`ExtraType`] before it reaches the filesystem.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtraType {
    #[default]
    Trailer,
    BehindTheScenes,
    Deleted,
    Featurette,
    Interview,
    Scene,
    Short,
    Other,
}

const ALIASES: &[(&str, ExtraType)] = &[
    ("trailers", ExtraType::Trailer),
    ("behindthescene", ExtraType::BehindTheScenes),
    ("behindthescenesclip", ExtraType::BehindTheScenes),
    ("behindthescenesfeature", ExtraType::BehindTheScenes),
    ("behindthescenesfeaturette", ExtraType::BehindTheScenes),
    ("deletedscene", ExtraType::Deleted),
    ("deletedscenes", ExtraType::Deleted),
    ("featurettes", ExtraType::Featurette),
    ("interviews", ExtraType::Interview),
    ("scenes", ExtraType::Scene),
    ("shorts", ExtraType::Short),
    ("extras", ExtraType::Other),
];

impl ExtraType {
    pub const ALL: [ExtraType; 8] = [
        Self::Trailer,
        Self::BehindTheScenes,
        Self::Deleted,
        Self::Featurette,
        Self::Interview,
        Self::Scene,
        Self::Short,
        Self::Other,
    ];

    /// Canonical lowercase key, identical to the serialized form.
    pub fn key(self) -> &'static str {
        match self {
            Self::Trailer => "trailer",
            Self::BehindTheScenes => "behindthescenes",
            Self::Deleted => "deleted",
            Self::Featurette => "featurette",
            Self::Interview => "interview",
            Self::Scene => "scene",
            Self::Short => "short",
            Self::Other => "other",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Trailer => "Trailer",
            Self::BehindTheScenes => "Behind the Scenes",
            Self::Deleted => "Deleted Scene",
            Self::Featurette => "Featurette",
            Self::Interview => "Interview",
            Self::Scene => "Scene",
            Self::Short => "Short",
            Self::Other => "Other",
        }
    }

    /// Subfolder (relative to the movie folder) the media server scans for
    /// this kind of extra.
    pub fn folder(self) -> &'static str {
        match self {
            Self::Trailer => "Trailers",
            Self::BehindTheScenes => "Behind The Scenes",
            Self::Deleted => "Deleted Scenes",
            Self::Featurette => "Featurettes",
            Self::Interview => "Interviews",
            Self::Scene => "Scenes",
            Self::Short => "Shorts",
            Self::Other => "Other",
        }
    }

    /// Normalises free-form input (`"Behind-the-Scenes"`, `"Trailers"`, ...)
    /// into a known type. Returns `None` for blank or unknown tokens.
    pub fn parse(raw: &str) -> Option<Self> {
        let token: String = raw
            .to_lowercase()
            .chars()
            .filter(|ch| ch.is_ascii_lowercase())
            .collect();
        if token.is_empty() {
            return None;
        }
        Self::ALL
            .into_iter()
            .find(|kind| kind.key() == token)
            .or_else(|| {
                ALIASES
                    .iter()
                    .find(|(alias, _)| *alias == token)
                    .map(|(_, kind)| *kind)
            })
    }
}

/// Outcome of classifying a token at job time, where unknown values are
/// tolerated instead of rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtraTypeChoice {
    Known(ExtraType),
    Coerced { token: String },
}

impl ExtraTypeChoice {
    pub fn resolve(raw: &str) -> Self {
        match ExtraType::parse(raw) {
            Some(kind) => Self::Known(kind),
            None => Self::Coerced {
                token: raw.trim().to_string(),
            },
        }
    }

    pub fn extra_type(&self) -> ExtraType {
        match self {
            Self::Known(kind) => *kind,
            Self::Coerced { .. } => ExtraType::Other,
        }
    }
}

/// Per-entry descriptor for playlist extras fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistExtraEntry {
    pub index: u32,
    #[serde(rename = "type")]
    pub kind: ExtraType,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default)]
    pub duration: Option<i64>,
}

/// Entry as posted by the browser. Numbers may arrive as strings, so every
/// scalar is kept loose until [`normalize_entries`] runs.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawExtraEntry {
    #[serde(default)]
    pub index: Value,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub id: Value,
    #[serde(default)]
    pub duration: Value,
}

/// Turns raw descriptors into dense, ordered entries. Unknown non-blank
/// types are reported through `error` and fall back to [`ExtraType::Other`].
pub fn normalize_entries(
    raw_entries: &[RawExtraEntry],
    mut error: impl FnMut(String),
) -> Vec<PlaylistExtraEntry> {
    let mut collected = Vec::with_capacity(raw_entries.len());
    let mut next_index: i64 = 1;

    for raw in raw_entries {
        let index = match lenient_int(&raw.index) {
            Some(value) if value >= 1 => value,
            _ => next_index,
        };
        next_index = index + 1;

        let raw_type = raw.kind.as_deref().unwrap_or("");
        let kind = match ExtraType::parse(raw_type) {
            Some(kind) => kind,
            None => {
                if !raw_type.trim().is_empty() {
                    error(format!("Unknown extra type '{raw_type}'."));
                }
                ExtraType::Other
            }
        };

        collected.push(PlaylistExtraEntry {
            index: u32::try_from(index).unwrap_or(u32::MAX),
            kind,
            name: trimmed(raw.name.as_deref()),
            title: trimmed(raw.title.as_deref()),
            id: lenient_string(&raw.id),
            duration: lenient_int(&raw.duration),
        });
    }

    renumber(&mut collected);
    collected
}

/// Sorts by declared index (stable) and rewrites indices as 1..=N.
pub fn renumber(entries: &mut [PlaylistExtraEntry]) {
    entries.sort_by_key(|entry| entry.index);
    for (position, entry) in entries.iter_mut().enumerate() {
        entry.index = position as u32 + 1;
    }
}

/// Readable, comma separated labels (`"Trailer, Featurette"`).
pub fn readable_types(kinds: &[ExtraType]) -> String {
    kinds
        .iter()
        .map(|kind| kind.label())
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) fn lenient_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|float| float.trunc() as i64)),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn lenient_string(value: &Value) -> String {
    match value {
        Value::String(text) => text.trim().to_string(),
        Value::Number(number) => number.to_string(),
        _ => String::new(),
    }
}

fn trimmed(value: Option<&str>) -> String {
    value.unwrap_or("").trim().to_string()
}
