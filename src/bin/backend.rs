#![forbid(unsafe_code)]

//! HTTP front for the job engine.
//!
//! Handlers are thin: every blocking call (Radarr, yt-dlp, the job store's
//! disk writes) runs on the blocking pool and the download itself runs on
//! the job's own worker thread.

use std::{
    fs,
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Path as AxumPath, State},
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::signal;
use tracing::{info, warn};
use yt2radarr::config::{
    ConfigStore, RuntimeOverrides, SetupForm, env_var_string, resolve_runtime_settings,
    validate_setup,
};
use yt2radarr::jobs::{JobStore, StoreLimits, filter_logs_for_display};
use yt2radarr::logging::init_logging;
use yt2radarr::orchestrator::{Orchestrator, SubmitError};
use yt2radarr::paths::PathOverride;
use yt2radarr::radarr::{Movie, MovieCatalog, MovieLibrary, RadarrClient};
use yt2radarr::request::{CreateJobForm, is_youtube_url};
use yt2radarr::security::{cookie_path, delete_cookie_file, ensure_not_root, save_cookie_text};
use yt2radarr::ytdlp::{Tools, clamp_preview_limit, fetch_playlist_preview};

/// Queue YouTube downloads into a Radarr library.
#[derive(Debug, Parser)]
#[command(name = "yt2radarr", version, about)]
struct BackendArgs {
    /// Directory holding config.toml, jobs.json and cookies.txt.
    #[arg(long, value_name = "DIR")]
    config_dir: Option<PathBuf>,
    /// Listen address (IPv4 or IPv6).
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    /// Alternative `.env` file.
    #[arg(long, value_name = "FILE")]
    env_file: Option<PathBuf>,
}

impl BackendArgs {
    fn overrides(self) -> RuntimeOverrides {
        RuntimeOverrides {
            config_dir: self.config_dir,
            host: self.host,
            port: self.port,
            env_path: self.env_file,
        }
    }
}

#[derive(Clone)]
struct AppState {
    engine: Orchestrator,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    let args = BackendArgs::parse();
    init_logging()?;
    ensure_not_root("yt2radarr")?;

    let settings = resolve_runtime_settings(args.overrides())?;
    fs::create_dir_all(&settings.config_dir)
        .with_context(|| format!("creating {}", settings.config_dir.display()))?;

    let config = Arc::new(ConfigStore::load(&settings));
    let store = Arc::new(JobStore::open(settings.jobs_path(), StoreLimits::default()));
    let library: Arc<dyn MovieLibrary> = Arc::new(RadarrClient::new(Arc::clone(&config)));
    let catalog = Arc::new(MovieCatalog::new(library, Arc::clone(&config)));
    let tools = Tools::detect();
    if tools.ffmpeg.is_none() {
        warn!("ffmpeg not found on PATH; playlist merges will fail");
    }
    if !config.current().is_configured() {
        warn!("Radarr is not configured yet; jobs are refused until settings are saved");
    }

    let state = AppState {
        engine: Orchestrator::new(store, config, catalog, tools),
    };

    let host: IpAddr = settings
        .host
        .parse()
        .context("expected a valid IPv4 or IPv6 address for --host/YT2RADARR_HOST")?;
    let addr = SocketAddr::new(host, settings.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!(config_dir = %settings.config_dir.display(), "API server listening on http://{addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/movies", get(list_movies))
        .route("/api/playlist_preview", post(playlist_preview))
        .route("/api/jobs", get(list_jobs).post(create_job))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/settings", get(get_settings).put(update_settings))
        .fallback(api_fallback)
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        warn!("failed to install Ctrl+C handler: {err}");
    }
}

async fn api_fallback(uri: Uri) -> ApiError {
    ApiError::not_found(format!("endpoint not found: {}", uri.path()))
}

async fn blocking<T, F>(work: F) -> ApiResult<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| ApiError::internal(format!("worker task failed: {err}")))
}

async fn list_movies(State(state): State<AppState>) -> ApiResult<Json<Vec<Movie>>> {
    let catalog = Arc::clone(state.engine.catalog());
    let movies = blocking(move || catalog.movies()).await?;
    Ok(Json(movies.as_ref().clone()))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PreviewRequest {
    #[serde(alias = "url")]
    yturl: String,
    limit: Option<i64>,
}

async fn playlist_preview(
    State(state): State<AppState>,
    Json(payload): Json<PreviewRequest>,
) -> ApiResult<Response> {
    let url = payload.yturl.trim().to_string();
    if url.is_empty() {
        return Err(ApiError::bad_request("YouTube URL is required."));
    }
    if !is_youtube_url(&url.to_lowercase()) {
        return Err(ApiError::bad_request("Please provide a valid YouTube URL."));
    }
    let limit = clamp_preview_limit(payload.limit);
    let engine = state.engine.clone();
    let preview = blocking(move || {
        let config = engine.config().current();
        let cookies = cookie_path(engine.config().config_dir(), &config, env_var_string);
        fetch_playlist_preview(engine.tools(), &url, cookies.as_deref(), limit)
    })
    .await?;

    match preview {
        Ok(preview) => Ok(Json(preview).into_response()),
        Err(err) => {
            let missing_tool = err
                .downcast_ref::<std::io::Error>()
                .is_some_and(|io| io.kind() == std::io::ErrorKind::NotFound);
            let status = if missing_tool {
                StatusCode::INTERNAL_SERVER_ERROR
            } else {
                StatusCode::BAD_GATEWAY
            };
            warn!("playlist preview failed: {err:#}");
            Err(ApiError::new(status, err.to_string()))
        }
    }
}

async fn create_job(
    State(state): State<AppState>,
    Json(form): Json<CreateJobForm>,
) -> ApiResult<Response> {
    let engine = state.engine.clone();
    let submitted = blocking(move || engine.submit(&form).map(|submission| submission.job)).await?;
    match submitted {
        Ok(job) => Ok((StatusCode::ACCEPTED, Json(json!({ "job": job }))).into_response()),
        Err(SubmitError::Invalid(errors)) => {
            let logs: Vec<String> = errors.iter().map(|err| format!("ERROR: {err}")).collect();
            let body = json!({
                "error": errors.join(" "),
                "errors": errors,
                "logs": logs,
            });
            Ok((StatusCode::BAD_REQUEST, Json(body)).into_response())
        }
        Err(err @ SubmitError::NotConfigured) => Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            err.to_string(),
        )),
        Err(SubmitError::Internal(err)) => Err(ApiError::internal(format!("{err:#}"))),
    }
}

async fn list_jobs(State(state): State<AppState>) -> ApiResult<Response> {
    let jobs = state.engine.store().list(false);
    Ok(Json(json!({ "jobs": jobs })).into_response())
}

async fn get_job(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Response> {
    let debug = state.engine.config().current().debug_mode;
    let mut job = state
        .engine
        .store()
        .get(&id, true)
        .ok_or_else(|| ApiError::not_found("Job not found."))?;
    let logs = job.logs.take().unwrap_or_default();
    job.logs = Some(filter_logs_for_display(&logs, debug));
    Ok(Json(json!({ "job": job, "debug_mode": debug })).into_response())
}

/// Settings as shown on the setup page. The cookie file itself never leaves
/// the server.
#[derive(Debug, Serialize)]
struct SettingsView {
    radarr_url: String,
    radarr_api_key: String,
    file_paths: Vec<String>,
    path_overrides: Vec<PathOverride>,
    debug_mode: bool,
    has_cookies: bool,
    configured: bool,
}

fn settings_view(config_store: &ConfigStore) -> SettingsView {
    let config = config_store.current();
    let has_cookies = cookie_path(config_store.config_dir(), &config, |_| None).is_some();
    SettingsView {
        file_paths: config
            .file_paths
            .iter()
            .map(|path| path.display().to_string())
            .collect(),
        configured: config.is_configured(),
        radarr_url: config.radarr_url,
        radarr_api_key: config.radarr_api_key,
        path_overrides: config.path_overrides,
        debug_mode: config.debug_mode,
        has_cookies,
    }
}

async fn get_settings(State(state): State<AppState>) -> ApiResult<Json<SettingsView>> {
    Ok(Json(settings_view(state.engine.config())))
}

async fn update_settings(
    State(state): State<AppState>,
    Json(form): Json<SetupForm>,
) -> ApiResult<Response> {
    let config_store = Arc::clone(state.engine.config());
    let current = config_store.current();
    let mut updated = match validate_setup(&form, &current) {
        Ok(updated) => updated,
        Err(errors) => {
            let body = json!({ "error": errors.join(" "), "errors": errors });
            return Ok((StatusCode::BAD_REQUEST, Json(body)).into_response());
        }
    };

    let catalog = Arc::clone(state.engine.catalog());
    blocking(move || -> Result<()> {
        let config_dir = config_store.config_dir();
        if form.clear_cookies {
            delete_cookie_file(config_dir, &current.cookie_file);
            updated.cookie_file.clear();
        } else if !form.cookie_text.trim().is_empty() {
            updated.cookie_file = save_cookie_text(config_dir, &form.cookie_text)?;
        }
        config_store.save(updated)?;
        catalog.invalidate();
        Ok(())
    })
    .await?
    .map_err(|err| ApiError::internal(format!("{err:#}")))?;

    Ok(Json(settings_view(state.engine.config())).into_response())
}
