//! Download jobs: submission, the per-job worker thread and final placement.
//!
//! Every job runs on its own named OS thread and talks to the rest of the
//! service exclusively through the [`JobStore`]. A worker never leaves a job
//! in `processing`: errors and panics both end in `failed`.

use std::any::Any;
use std::fmt;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::SystemTime;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{ConfigStore, env_var_string};
use crate::extras::{ExtraType, ExtraTypeChoice, readable_types};
use crate::jobs::{JobSnapshot, JobStatus, JobStore, JobUpdate, NewJob};
use crate::naming::{
    build_movie_stem, extension_of, free_stem, matching_stem, sanitize_filename, stem_taken,
};
use crate::paths::resolve_movie_path;
use crate::playlist::{self, PLAYLIST_TEMPLATE};
use crate::radarr::{MovieCatalog, resolve_movie_id};
use crate::request::{CreateJobForm, DownloadRequest, PlaylistHandling, describe_job, prepare_request};
use crate::security::cookie_path;
use crate::ytdlp::{
    self, FORMAT_SELECTOR, FormatProbe, LineKind, ResolvedFormat, TitleLookup, Tools,
    classify_line, is_intermediate, is_partial,
};

const MAX_FAILURE_MESSAGE: usize = 500;
const MAX_TOOL_DETAIL: usize = 300;
const FORMAT_METADATA_PREFIXES: &[&str] = &[
    "format:",
    "format id:",
    "resolution:",
    "video codec:",
    "audio codec:",
    "filesize:",
];

#[derive(Debug)]
pub enum SubmitError {
    /// Radarr or the library paths have not been set up yet.
    NotConfigured,
    /// User-facing validation messages; nothing was created.
    Invalid(Vec<String>),
    Internal(anyhow::Error),
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConfigured => f.write_str("Application has not been configured yet."),
            Self::Invalid(errors) => f.write_str(&errors.join(" ")),
            Self::Internal(err) => write!(f, "{err:#}"),
        }
    }
}

impl std::error::Error for SubmitError {}

/// A queued job and the worker that processes it. Dropping `worker` detaches
/// the thread.
pub struct Submission {
    pub job: JobSnapshot,
    pub worker: JoinHandle<()>,
}

#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<JobStore>,
    config: Arc<ConfigStore>,
    catalog: Arc<MovieCatalog>,
    tools: Tools,
}

impl Orchestrator {
    pub fn new(
        store: Arc<JobStore>,
        config: Arc<ConfigStore>,
        catalog: Arc<MovieCatalog>,
        tools: Tools,
    ) -> Self {
        Self {
            store,
            config,
            catalog,
            tools,
        }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    pub fn catalog(&self) -> &Arc<MovieCatalog> {
        &self.catalog
    }

    pub fn tools(&self) -> &Tools {
        &self.tools
    }

    /// Validates `form`, records a queued job and starts its worker.
    pub fn submit(&self, form: &CreateJobForm) -> Result<Submission, SubmitError> {
        if !self.config.current().is_configured() {
            return Err(SubmitError::NotConfigured);
        }
        let request = prepare_request(form).map_err(SubmitError::Invalid)?;
        let descriptor = describe_job(&request);
        let id = Uuid::new_v4().simple().to_string();

        let job = self
            .store
            .create(NewJob {
                id: id.clone(),
                label: descriptor.label,
                subtitle: descriptor.subtitle,
                metadata: descriptor.metadata,
                logs: vec!["Job queued.".to_string()],
                request,
            })
            .map_err(SubmitError::Internal)?;

        let worker = Worker {
            store: Arc::clone(&self.store),
            config: Arc::clone(&self.config),
            catalog: Arc::clone(&self.catalog),
            tools: self.tools.clone(),
            id: id.clone(),
        };
        let spawned = thread::Builder::new()
            .name(format!("job-{}", &id[..8]))
            .spawn(move || worker.run());
        match spawned {
            Ok(worker) => {
                info!(job = %id, "job queued");
                Ok(Submission { job, worker })
            }
            Err(err) => {
                self.store
                    .mark_failure(&id, format!("Unexpected error: {err}"));
                Err(SubmitError::Internal(
                    anyhow!(err).context("spawning job worker"),
                ))
            }
        }
    }
}

/// Job-visible log writer. Consecutive `[download]` progress lines collapse
/// into one entry unless debug mode is on.
struct JobLog {
    store: Arc<JobStore>,
    id: String,
    debug: bool,
    collapsing: bool,
}

impl JobLog {
    fn log(&mut self, line: impl Into<String>) {
        self.collapsing = false;
        self.store.append_logs(&self.id, [line.into()]);
    }

    fn warn(&mut self, message: impl fmt::Display) {
        self.log(format!("WARNING: {message}"));
    }

    fn progress_line(&mut self, line: &str) {
        if self.collapsing && !self.debug {
            self.store.replace_last_log(&self.id, line);
        } else {
            self.store.append_logs(&self.id, [line]);
        }
        self.collapsing = true;
    }

    fn progress(&self, value: f64) {
        self.store.update(
            &self.id,
            JobUpdate {
                progress: Some(value),
                ..JobUpdate::default()
            },
        );
    }

    fn tool_line(&mut self, line: &str) {
        let classified = classify_line(line);
        if let Some(value) = classified.progress {
            self.progress(value);
        }
        match classified.kind {
            LineKind::DownloadProgress => self.progress_line(line),
            kind => self.log(kind.render(line)),
        }
    }
}

struct Worker {
    store: Arc<JobStore>,
    config: Arc<ConfigStore>,
    catalog: Arc<MovieCatalog>,
    tools: Tools,
    id: String,
}

impl Worker {
    fn run(self) {
        let mut log = JobLog {
            store: Arc::clone(&self.store),
            id: self.id.clone(),
            debug: self.config.current().debug_mode,
            collapsing: false,
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.process(&mut log)));
        let failure = match outcome {
            Ok(Ok(())) => {
                info!(job = %self.id, "job complete");
                return;
            }
            Ok(Err(err)) => format!("{err:#}"),
            Err(payload) => format!("Unexpected error: {}", panic_message(payload.as_ref())),
        };
        let failure = truncate_chars(&failure, MAX_FAILURE_MESSAGE);
        warn!(job = %self.id, "job failed: {failure}");
        log.log(format!("ERROR: {failure}"));
        self.store.mark_failure(&self.id, failure);
    }

    fn process(&self, log: &mut JobLog) -> Result<()> {
        self.store
            .set_status(&self.id, JobStatus::Processing, Some(1.0));
        let config = self.config.current();
        if !config.is_configured() {
            bail!("Application has not been configured yet.");
        }
        let mut request = self
            .store
            .request(&self.id)
            .ok_or_else(|| anyhow!("Job {} no longer exists.", self.id))?;

        let movie_id = resolve_movie_id(
            &request.movie_id,
            request.tmdb,
            &request.title,
            request.year,
            &self.catalog,
            |line| log.log(line),
        )
        .ok_or_else(|| {
            anyhow!("No movie selected. Please choose a movie from the suggestions list.")
        })?;

        let choice = ExtraTypeChoice::resolve(&request.extra_type);
        if let ExtraTypeChoice::Coerced { token } = &choice {
            log.warn(format!("Unknown extra type '{token}', defaulting to 'other'."));
        }
        let extra_type = choice.extra_type();
        request.extra_type = extra_type.key().to_string();
        let descriptor = describe_job(&request);
        self.store.update(
            &self.id,
            JobUpdate {
                label: Some(descriptor.label),
                subtitle: Some(descriptor.subtitle),
                metadata: Some(descriptor.metadata),
                request: Some(request.clone()),
                ..JobUpdate::default()
            },
        );

        log.log(format!("Fetching Radarr details for movie ID {movie_id}."));
        let movie = self
            .catalog
            .library()
            .get_movie(&movie_id)
            .map_err(|err| {
                anyhow!("Could not retrieve movie info from Radarr (ID {movie_id}): {err:#}")
            })?;

        let resolution =
            resolve_movie_path(&movie.path, &config.path_overrides, &config.file_paths, true);
        let Some(movie_path) = resolution.path else {
            bail!("Movie folder not found on disk: {}", movie.path);
        };
        if resolution.created {
            log.log(format!("Created movie folder at '{}'.", movie_path.display()));
        }
        log.log(format!("Movie path resolved to '{}'.", movie_path.display()));
        log.progress(10.0);

        let single_extra = request.extra && !matches!(request.playlist, PlaylistHandling::Extras { .. });
        let target_dir = match &request.playlist {
            PlaylistHandling::Extras { .. } => {
                log.log(
                    "Playlist extras requested; videos will be saved into their respective extra subfolders.",
                );
                movie_path.clone()
            }
            _ if single_extra => {
                let folder = movie_path.join(extra_type.folder());
                fs::create_dir_all(&folder)
                    .with_context(|| format!("Creating {}", folder.display()))?;
                log.log(format!(
                    "Storing video in subfolder '{}'.",
                    extra_type.folder()
                ));
                folder
            }
            _ => {
                log.log("Treating video as main video file.");
                movie_path.clone()
            }
        };
        match &request.playlist {
            PlaylistHandling::Merge => log.log(
                "Playlist download requested; videos will be merged into a single file.",
            ),
            PlaylistHandling::Extras { entries } => {
                let kinds: Vec<ExtraType> = entries.iter().map(|entry| entry.kind).collect();
                log.log(format!(
                    "Playlist download requested; entries will be processed as extras ({}).",
                    readable_types(&kinds)
                ));
            }
            PlaylistHandling::Single => {}
        }

        let movie_stem = build_movie_stem(&movie.title, movie.year, movie.tmdb_id);
        log.log(format!("Resolved Radarr movie stem to '{movie_stem}'."));
        let custom_name = sanitize_filename(&request.extra_name);
        let canonical_stem = if single_extra {
            let extra_label = if custom_name.is_empty() {
                extra_type.label().to_string()
            } else {
                custom_name.clone()
            };
            log.log(format!("Using extra label '{extra_label}'."));
            format!("{movie_stem} {extra_label}")
        } else {
            movie_stem.clone()
        };

        let cookies = cookie_path(self.config.config_dir(), &config, env_var_string);
        let playlist = request.playlist.is_playlist();
        let descriptive = self.descriptive_name(&request, cookies.as_deref(), log);
        let fallback = if playlist { "Playlist" } else { "Video" };
        let mut working_stem = match sanitize_filename(&descriptive) {
            name if name.is_empty() => fallback.to_string(),
            name => name,
        };
        if single_extra {
            let suffix = if custom_name.is_empty() {
                extra_type.key().to_string()
            } else {
                custom_name.clone()
            };
            working_stem = format!("{working_stem}-{suffix}");
        }

        let staging = if playlist {
            let staging = playlist::staging_dir(&target_dir, &self.id);
            fs::create_dir_all(&staging)
                .with_context(|| format!("Creating {}", staging.display()))?;
            let name = staging
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            let mode = if matches!(request.playlist, PlaylistHandling::Merge) {
                "merge"
            } else {
                "extras"
            };
            log.log(format!(
                "Playlist {mode} enabled. Downloads will be staged in '{name}'."
            ));
            Some(staging)
        } else {
            if stem_taken(&target_dir, &working_stem, None) {
                log.log(format!(
                    "File stem '{working_stem}' already exists. Searching for a free filename."
                ));
                working_stem = free_stem(&target_dir, &working_stem, None);
                log.log(format!("Selected new filename stem '{working_stem}'."));
            }
            None
        };
        let template = match &staging {
            Some(staging) => format!("{}/{PLAYLIST_TEMPLATE}", escape_template(staging)),
            None => format!(
                "{}.%(ext)s",
                escape_template(&target_dir.join(&working_stem))
            ),
        };
        let expected = || match &staging {
            Some(staging) => playlist::staged_files(staging),
            None => matching_stem(&target_dir, &working_stem)
                .into_iter()
                .filter(|path| path.is_file())
                .collect(),
        };

        if self.tools.ffmpeg.is_none() {
            log.warn(
                "ffmpeg executable not found; yt-dlp may fall back to a lower quality progressive stream.",
            );
        }
        let resolved = match ytdlp::probe_format(&self.tools, &request.yturl, cookies.as_deref(), playlist) {
            FormatProbe::Resolved(format) => {
                log.log(format!("Resolved YouTube format: {}.", format.summary()));
                Some(format)
            }
            FormatProbe::Unreported => {
                log.log("yt-dlp did not report a resolved format; proceeding with download.");
                None
            }
            FormatProbe::Failed(err) => {
                log.warn(format!("Failed to query format details via yt-dlp: {err}"));
                None
            }
        };

        let mut command = self.tools.yt_dlp_command(cookies.as_deref());
        command
            .current_dir(&target_dir)
            .args(["--newline", "-f", FORMAT_SELECTOR]);
        if playlist {
            command.arg("--yes-playlist");
        }
        command.arg("-o").arg(&template).arg(&request.yturl);

        log.log("Running yt-dlp with explicit output template.");
        log.progress(20.0);
        let mut last_line = String::new();
        let status = ytdlp::run_streaming(command, |line| {
            last_line = line.to_string();
            log.tool_line(line);
        })
        .map_err(|err| {
            discard_staging(staging.as_deref());
            anyhow!("Failed to invoke yt-dlp: {err:#}")
        })?;

        if !status.success() {
            let code = status
                .code()
                .map_or_else(|| "unknown".to_string(), |code| code.to_string());
            log.log(format!("yt-dlp exited with code {code}."));
            for leftover in expected().into_iter().filter(|path| is_partial(path)) {
                let _ = fs::remove_file(leftover);
            }
            discard_staging(staging.as_deref());
            let detail = truncate_chars(&last_line, MAX_TOOL_DETAIL);
            if detail.is_empty() {
                bail!("Download failed.");
            }
            bail!("Download failed: {detail}");
        }

        let mut candidates: Vec<PathBuf> = expected()
            .into_iter()
            .filter(|path| !is_partial(path))
            .collect();
        if candidates.is_empty() {
            discard_staging(staging.as_deref());
            bail!("Download completed but the output file could not be located.");
        }

        if let (PlaylistHandling::Extras { entries }, Some(staging)) = (&request.playlist, &staging) {
            let files = playlist::extras_candidates(staging);
            let placed = playlist::fan_out_extras(
                &files,
                entries,
                &movie_path,
                &movie_stem,
                &mut |line: String| log.log(line),
            );
            discard_staging(Some(staging.as_path()));
            let placed = placed?;
            log.progress(100.0);
            log.log(format!("Success! Saved {} playlist extras.", placed.len()));
            self.store.mark_success(&self.id);
            return Ok(());
        }

        if let (PlaylistHandling::Merge, Some(staging)) = (&request.playlist, &staging) {
            let Some(ffmpeg) = self.tools.ffmpeg.as_deref() else {
                discard_staging(Some(staging.as_path()));
                bail!("ffmpeg is required to merge playlist videos but was not found.");
            };
            let segments: Vec<PathBuf> = candidates
                .iter()
                .filter(|path| !is_intermediate(path))
                .cloned()
                .collect();
            let merged =
                playlist::merge_segments(ffmpeg, staging, &segments, &mut |line: String| log.log(line))
                    .inspect_err(|_| discard_staging(Some(staging.as_path())))?;
            candidates = vec![merged];
        }

        let final_file = newest(candidates.iter().filter(|path| !is_intermediate(path)))
            .or_else(|| newest(candidates.iter()))
            .ok_or_else(|| anyhow!("Download completed but the output file could not be located."))?;
        let extension = extension_of(&final_file);
        self.record_format(extension.as_deref(), resolved.as_ref());

        let mut final_stem = canonical_stem;
        if stem_taken(&target_dir, &final_stem, Some(&final_file)) {
            log.log(format!(
                "Canonical filename '{}' already exists. Searching for a free name.",
                with_extension(&final_stem, extension.as_deref())
            ));
            final_stem = free_stem(&target_dir, &final_stem, Some(&final_file));
            log.log(format!(
                "Selected canonical filename '{}'.",
                with_extension(&final_stem, extension.as_deref())
            ));
        }
        let final_name = with_extension(&final_stem, extension.as_deref());
        let destination = target_dir.join(&final_name);
        if destination != final_file {
            log.log(format!(
                "Renaming downloaded file to canonical name '{final_name}'."
            ));
            fs::rename(&final_file, &destination).map_err(|err| {
                anyhow!("Failed to rename downloaded file to '{final_name}': {err}")
            })?;
        } else {
            log.log("Download already matches canonical filename.");
        }

        for leftover in candidates {
            if leftover != destination && leftover.exists() && is_intermediate(&leftover) {
                let _ = fs::remove_file(leftover);
            }
        }
        discard_staging(staging.as_deref());

        log.progress(100.0);
        log.log(format!("Success! Video saved as '{}'.", destination.display()));
        self.store.mark_success(&self.id);
        Ok(())
    }

    fn descriptive_name(
        &self,
        request: &DownloadRequest,
        cookies: Option<&Path>,
        log: &mut JobLog,
    ) -> String {
        let custom = request.extra_name.trim();
        if !custom.is_empty() {
            log.log(format!("Using custom descriptive name '{custom}'."));
            return custom.to_string();
        }
        let playlist = request.playlist.is_playlist();
        let (subject, fallback) = if playlist {
            ("playlist", "Playlist")
        } else {
            ("video", "Video")
        };
        log.log(format!("Querying yt-dlp for {subject} title."));
        match ytdlp::fetch_title(&self.tools, &request.yturl, cookies, playlist) {
            TitleLookup::Found(title) => {
                let source = if playlist { "playlist" } else { "YouTube" };
                log.log(format!("Using {source} title '{title}'."));
                title
            }
            TitleLookup::Fallback { reason } => {
                log.warn(format!(
                    "Failed to retrieve title from yt-dlp ({reason}). Using fallback name '{fallback}'."
                ));
                fallback.to_string()
            }
        }
    }

    fn record_format(&self, extension: Option<&str>, resolved: Option<&ResolvedFormat>) {
        let Some(snapshot) = self.store.get(&self.id, false) else {
            return;
        };
        let mut metadata: Vec<String> = snapshot
            .metadata
            .into_iter()
            .filter(|line| {
                let lowered = line.to_lowercase();
                !FORMAT_METADATA_PREFIXES
                    .iter()
                    .any(|prefix| lowered.starts_with(prefix))
            })
            .collect();
        if let Some(extension) = extension {
            metadata.push(format!("Format: {}", extension.to_uppercase()));
        }
        if let Some(resolved) = resolved {
            metadata.extend(resolved.metadata_lines());
        }
        self.store.update(
            &self.id,
            JobUpdate {
                metadata: Some(metadata),
                ..JobUpdate::default()
            },
        );
    }
}

fn escape_template(path: &Path) -> String {
    path.to_string_lossy().replace('%', "%%")
}

fn with_extension(stem: &str, extension: Option<&str>) -> String {
    match extension {
        Some(extension) => format!("{stem}.{extension}"),
        None => stem.to_string(),
    }
}

fn newest<'a>(paths: impl Iterator<Item = &'a PathBuf>) -> Option<PathBuf> {
    paths
        .max_by_key(|path| {
            fs::metadata(path)
                .and_then(|meta| meta.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH)
        })
        .cloned()
}

fn truncate_chars(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

fn discard_staging(staging: Option<&Path>) {
    if let Some(staging) = staging {
        let _ = fs::remove_dir_all(staging);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "worker panicked".to_string()
    }
}
