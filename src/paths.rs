//! Maps the folder Radarr reports for a movie onto a directory that exists
//! in this process' filesystem namespace.
//!
//! Radarr frequently runs in another container than yt2radarr, so the path it
//! reports (`/movies/Heat (1995)`) may only exist here under a different
//! mount point. Operators bridge the gap with override rules and library
//! roots.

use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

/// `remote => local` prefix substitution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathOverride {
    pub remote: String,
    pub local: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Resolution {
    pub path: Option<PathBuf>,
    /// True when a directory had to be created to satisfy the lookup.
    pub created: bool,
}

struct Resolver {
    create_if_missing: bool,
    created: bool,
}

impl Resolver {
    /// Accepts `candidate` when it already is a directory, or creates it when
    /// allowed and `base` exists.
    fn ensure(&mut self, candidate: &Path, base: Option<&Path>) -> Option<PathBuf> {
        if candidate.is_dir() {
            return Some(candidate.to_path_buf());
        }
        if !self.create_if_missing {
            return None;
        }
        let base = base.or_else(|| candidate.parent())?;
        if base.as_os_str().is_empty() || !base.is_dir() {
            return None;
        }
        fs::create_dir_all(candidate).ok()?;
        self.created = true;
        Some(candidate.to_path_buf())
    }
}

pub fn resolve_movie_path(
    reported: &str,
    overrides: &[PathOverride],
    library_roots: &[PathBuf],
    create_if_missing: bool,
) -> Resolution {
    let reported = reported.trim();
    if reported.is_empty() {
        return Resolution::default();
    }

    let mut resolver = Resolver {
        create_if_missing,
        created: false,
    };
    let normalized = normalize_lexically(reported);
    let direct = PathBuf::from(&normalized);

    let path = resolver
        .ensure(&direct, direct.parent())
        .or_else(|| resolve_override(&mut resolver, &normalized, overrides))
        .or_else(|| resolve_library_root(&mut resolver, &normalized, library_roots));

    Resolution {
        path,
        created: resolver.created,
    }
}

fn resolve_override(
    resolver: &mut Resolver,
    normalized: &str,
    overrides: &[PathOverride],
) -> Option<PathBuf> {
    let reported = normalized.replace('\\', "/");
    for rule in overrides {
        let remote = normalize_lexically(rule.remote.trim()).replace('\\', "/");
        if remote.is_empty() || rule.local.as_os_str().is_empty() {
            continue;
        }
        let Some(remainder) = strip_remote_prefix(&reported, &remote) else {
            continue;
        };

        // The rule's own `local` must exist before anything below it is
        // created; intermediate folders of a nested remainder are created with
        // the target. A bare `local` needs its parent instead.
        let resolved = if remainder.is_empty() {
            resolver.ensure(&rule.local, rule.local.parent())
        } else {
            let candidate =
                PathBuf::from(normalize_lexically(&rule.local.join(remainder).to_string_lossy()));
            resolver.ensure(&candidate, Some(&rule.local))
        };
        if resolved.is_some() {
            return resolved;
        }
    }
    None
}

fn resolve_library_root(
    resolver: &mut Resolver,
    normalized: &str,
    roots: &[PathBuf],
) -> Option<PathBuf> {
    let folder = normalized
        .trim_end_matches(['/', '\\'])
        .rsplit(['/', '\\'])
        .next()
        .filter(|name| !name.is_empty() && *name != "..")?;

    if let Some(found) = roots
        .iter()
        .map(|root| root.join(folder))
        .find(|candidate| candidate.is_dir())
    {
        return Some(found);
    }
    roots
        .iter()
        .find_map(|root| resolver.ensure(&root.join(folder), Some(root)))
}

/// Returns the path remainder when `reported` equals `remote` or lives below
/// it. Comparison is per component, so `/library` does not match
/// `/library-old/x`.
fn strip_remote_prefix<'a>(reported: &'a str, remote: &str) -> Option<&'a str> {
    if reported == remote {
        return Some("");
    }
    if remote == "/" {
        return reported.strip_prefix('/');
    }
    reported
        .strip_prefix(remote)
        .and_then(|rest| rest.strip_prefix('/'))
}

/// Collapses `.`/`..` components, repeated separators and trailing slashes
/// without touching the filesystem.
pub fn normalize_lexically(raw: &str) -> String {
    let path = Path::new(raw);
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    let rendered = out.to_string_lossy().into_owned();
    if rendered.is_empty() {
        ".".to_string()
    } else {
        rendered
    }
}
