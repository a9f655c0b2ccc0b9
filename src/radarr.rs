//! Radarr access: the blocking HTTP client, a generation-checked movie
//! catalog cache and movie identity resolution.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ConfigStore;

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// The subset of Radarr's movie resource this service reads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Movie {
    pub id: i64,
    pub title: String,
    pub year: Option<i64>,
    pub tmdb_id: Option<i64>,
    pub path: String,
}

pub trait MovieLibrary: Send + Sync {
    fn list_movies(&self) -> Result<Vec<Movie>>;
    fn get_movie(&self, id: &str) -> Result<Movie>;
}

/// Talks to `{radarr_url}/api/v3`. Credentials are read from the config
/// store on every call so a saved configuration applies immediately.
pub struct RadarrClient {
    config: Arc<ConfigStore>,
    agent: ureq::Agent,
}

impl RadarrClient {
    pub fn new(config: Arc<ConfigStore>) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(REQUEST_TIMEOUT).build();
        Self { config, agent }
    }

    fn fetch<T: serde::de::DeserializeOwned>(&self, endpoint: &str) -> Result<T> {
        let config = self.config.current();
        if config.radarr_url.is_empty() || config.radarr_api_key.is_empty() {
            bail!("Radarr is not configured");
        }
        let url = format!("{}/api/v3/{endpoint}", config.radarr_url);
        debug!(%url, "querying radarr");
        let response = self
            .agent
            .get(&url)
            .set("X-Api-Key", &config.radarr_api_key)
            .call()
            .map_err(|err| anyhow!("{err}"))?;
        response
            .into_json::<T>()
            .map_err(|err| anyhow!("invalid response from {url}: {err}"))
    }
}

impl MovieLibrary for RadarrClient {
    fn list_movies(&self) -> Result<Vec<Movie>> {
        self.fetch("movie")
    }

    fn get_movie(&self, id: &str) -> Result<Movie> {
        self.fetch(&format!("movie/{}", id.trim()))
    }
}

/// Process-wide movie list, refetched after the configuration changes.
pub struct MovieCatalog {
    library: Arc<dyn MovieLibrary>,
    config: Arc<ConfigStore>,
    cached: RwLock<Option<(u64, Arc<Vec<Movie>>)>>,
}

impl MovieCatalog {
    pub fn new(library: Arc<dyn MovieLibrary>, config: Arc<ConfigStore>) -> Self {
        Self {
            library,
            config,
            cached: RwLock::new(None),
        }
    }

    pub fn library(&self) -> &Arc<dyn MovieLibrary> {
        &self.library
    }

    /// Movies sorted by case-insensitive title. Fetch failures are logged and
    /// yield an empty list that is not cached.
    pub fn movies(&self) -> Arc<Vec<Movie>> {
        let generation = self.config.generation();
        if let Some((cached_generation, movies)) = self.cached.read().as_ref()
            && *cached_generation == generation
        {
            return Arc::clone(movies);
        }
        if !self.config.current().is_configured() {
            return Arc::new(Vec::new());
        }

        match self.library.list_movies() {
            Ok(mut movies) => {
                movies.sort_by_cached_key(|movie| movie.title.to_lowercase());
                let movies = Arc::new(movies);
                *self.cached.write() = Some((generation, Arc::clone(&movies)));
                movies
            }
            Err(err) => {
                warn!("error fetching movies from radarr: {err:#}");
                Arc::new(Vec::new())
            }
        }
    }

    pub fn invalidate(&self) {
        *self.cached.write() = None;
    }
}

/// Picks the Radarr movie id for a request: the explicit id, then a TMDb id
/// match in the catalog, then an exact case-insensitive title (optionally
/// narrowed by year).
pub fn resolve_movie_id(
    movie_id: &str,
    tmdb: Option<i64>,
    title: &str,
    year: Option<i64>,
    catalog: &MovieCatalog,
    mut log: impl FnMut(String),
) -> Option<String> {
    let movie_id = movie_id.trim();
    if !movie_id.is_empty() {
        return Some(movie_id.to_string());
    }

    let movies = catalog.movies();
    if let Some(tmdb) = tmdb
        && let Some(movie) = movies.iter().find(|movie| movie.tmdb_id == Some(tmdb))
    {
        log(format!(
            "Matched TMDb ID {tmdb} to Radarr movie '{}'.",
            movie.title
        ));
        return Some(movie.id.to_string());
    }

    let title = title.trim();
    if title.is_empty() {
        return None;
    }
    let lowered = title.to_lowercase();
    let movie = movies
        .iter()
        .filter(|movie| movie.title.to_lowercase() == lowered)
        .find(|movie| year.is_none() || movie.year == year)?;
    match year {
        Some(year) => log(format!(
            "Matched title '{title}' ({year}) to Radarr movie '{}'.",
            movie.title
        )),
        None => log(format!(
            "Matched title '{title}' to Radarr movie '{}'.",
            movie.title
        )),
    }
    Some(movie.id.to_string())
}
