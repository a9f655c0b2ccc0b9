#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};
use tracing::{info, warn};

use crate::paths::PathOverride;

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const JOBS_FILE_NAME: &str = "jobs.json";
pub const DEFAULT_COOKIE_FILENAME: &str = "cookies.txt";

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub config_dir: PathBuf,
    pub host: String,
    pub port: u16,
}

impl RuntimeSettings {
    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE_NAME)
    }

    pub fn jobs_path(&self) -> PathBuf {
        self.config_dir.join(JOBS_FILE_NAME)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub config_dir: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub env_path: Option<PathBuf>,
}

/// CLI flags win over the process environment, which wins over the `.env`
/// file.
pub fn resolve_runtime_settings(overrides: RuntimeOverrides) -> Result<RuntimeSettings> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_runtime_settings(&file_vars, env_var_string, overrides)
}

fn build_runtime_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimeSettings> {
    let config_dir = overrides
        .config_dir
        .or_else(|| lookup_value("YT2RADARR_CONFIG_DIR", file_vars, &env_lookup).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("."));
    let config_dir = absolute(&expand_home(&config_dir.to_string_lossy()))?;
    let port = overrides
        .port
        .or_else(|| {
            lookup_value("YT2RADARR_PORT", file_vars, &env_lookup)
                .and_then(|value| value.parse::<u16>().ok())
        })
        .unwrap_or(DEFAULT_PORT);
    let host = overrides
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup_value("YT2RADARR_HOST", file_vars, &env_lookup))
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    Ok(RuntimeSettings {
        config_dir,
        host,
        port,
    })
}

pub fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).cloned())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

/// Writes `payload` next to `path` and renames it into place.
pub fn write_atomic(path: &Path, payload: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("Creating {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, payload).with_context(|| format!("Writing {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("Replacing {}", path.display()))?;
    Ok(())
}

/// Operator settings stored in `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub radarr_url: String,
    pub radarr_api_key: String,
    pub file_paths: Vec<PathBuf>,
    pub debug_mode: bool,
    pub cookie_file: String,
    pub path_overrides: Vec<PathOverride>,
}

/// Shape of the file on disk; absent keys fall back to environment defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StoredConfig {
    radarr_url: Option<String>,
    radarr_api_key: Option<String>,
    file_paths: Option<Vec<PathBuf>>,
    debug_mode: Option<bool>,
    cookie_file: Option<String>,
    path_overrides: Option<Vec<PathOverride>>,
}

impl AppConfig {
    pub fn from_env(env_lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            radarr_url: env_lookup("RADARR_URL").unwrap_or_default(),
            radarr_api_key: env_lookup("RADARR_API_KEY").unwrap_or_default(),
            debug_mode: env_lookup("YT2RADARR_DEBUG").is_some_and(|value| !value.is_empty()),
            ..Self::default()
        }
    }

    fn merged(mut self, stored: StoredConfig) -> Self {
        if let Some(url) = stored.radarr_url {
            self.radarr_url = url;
        }
        if let Some(key) = stored.radarr_api_key {
            self.radarr_api_key = key;
        }
        if let Some(paths) = stored.file_paths {
            self.file_paths = paths;
        }
        if let Some(debug) = stored.debug_mode {
            self.debug_mode = debug;
        }
        if let Some(cookie) = stored.cookie_file {
            self.cookie_file = cookie;
        }
        if let Some(overrides) = stored.path_overrides {
            self.path_overrides = overrides;
        }
        self
    }

    /// Trims credentials, makes library paths absolute, cleans override
    /// rules and picks up a `cookies.txt` dropped into the config directory.
    pub fn normalized(mut self, config_dir: &Path) -> Self {
        self.radarr_url = self.radarr_url.trim().trim_end_matches('/').to_string();
        self.radarr_api_key = self.radarr_api_key.trim().to_string();
        let mut file_paths: Vec<PathBuf> = Vec::new();
        for path in &self.file_paths {
            let path = absolute_or_raw(&expand_home(&path.to_string_lossy()));
            if !file_paths.contains(&path) {
                file_paths.push(path);
            }
        }
        self.file_paths = file_paths;
        self.path_overrides = normalize_path_overrides(self.path_overrides);
        self.cookie_file = self.cookie_file.trim().to_string();
        if self.cookie_file.is_empty() && config_dir.join(DEFAULT_COOKIE_FILENAME).exists() {
            self.cookie_file = DEFAULT_COOKIE_FILENAME.to_string();
        }
        self
    }

    /// Radarr URL, API key and at least one library path are required before
    /// any job may run.
    pub fn is_configured(&self) -> bool {
        !self.radarr_url.is_empty() && !self.radarr_api_key.is_empty() && !self.file_paths.is_empty()
    }
}

pub fn load_app_config(
    path: &Path,
    config_dir: &Path,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> AppConfig {
    let defaults = AppConfig::from_env(env_lookup);
    let config = match fs::read_to_string(path) {
        Ok(raw) => match toml::from_str::<StoredConfig>(&raw) {
            Ok(stored) => defaults.merged(stored),
            Err(err) => {
                warn!(path = %path.display(), "failed to parse configuration: {err}");
                defaults
            }
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => defaults,
        Err(err) => {
            warn!(path = %path.display(), "failed to read configuration: {err}");
            defaults
        }
    };
    config.normalized(config_dir)
}

/// Process-wide configuration. Every successful [`ConfigStore::save`] bumps
/// the generation so dependent caches can tell they are stale.
pub struct ConfigStore {
    path: PathBuf,
    config_dir: PathBuf,
    current: RwLock<AppConfig>,
    generation: AtomicU64,
}

impl ConfigStore {
    pub fn load(settings: &RuntimeSettings) -> Self {
        let path = settings.config_path();
        let config = load_app_config(&path, &settings.config_dir, env_var_string);
        Self::new(settings.config_dir.clone(), config)
    }

    /// Wraps an already loaded configuration living in `config_dir`.
    pub fn new(config_dir: PathBuf, config: AppConfig) -> Self {
        Self {
            path: config_dir.join(CONFIG_FILE_NAME),
            config_dir,
            current: RwLock::new(config),
            generation: AtomicU64::new(0),
        }
    }

    pub fn current(&self) -> AppConfig {
        self.current.read().clone()
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn save(&self, config: AppConfig) -> Result<AppConfig> {
        let config = config.normalized(&self.config_dir);
        let rendered = toml::to_string_pretty(&config).context("Serializing configuration")?;
        let mut current = self.current.write();
        write_atomic(&self.path, rendered.as_bytes())?;
        *current = config.clone();
        self.generation.fetch_add(1, Ordering::AcqRel);
        info!(path = %self.path.display(), "configuration saved");
        Ok(config)
    }
}

/// Setup form as posted by the settings page. Paths and overrides are
/// newline separated text.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SetupForm {
    pub radarr_url: String,
    pub radarr_api_key: String,
    pub file_paths: String,
    pub path_overrides: String,
    pub debug_mode: bool,
    pub cookie_text: String,
    pub clear_cookies: bool,
}

/// Builds the configuration described by `form` on top of `current`, or
/// returns every problem found. Cookie handling is left to the caller.
pub fn validate_setup(form: &SetupForm, current: &AppConfig) -> Result<AppConfig, Vec<String>> {
    let mut errors = Vec::new();
    let radarr_url = form.radarr_url.trim().trim_end_matches('/').to_string();
    let api_key = form.radarr_api_key.trim().to_string();
    let file_paths = normalize_paths(&form.file_paths);
    let (overrides, override_errors) = parse_path_overrides(&form.path_overrides);
    errors.extend(override_errors);

    if radarr_url.is_empty() {
        errors.push("Radarr URL is required.".to_string());
    } else if !(radarr_url.starts_with("http://") || radarr_url.starts_with("https://")) {
        errors.push("Radarr URL must start with http:// or https://.".to_string());
    }
    if api_key.is_empty() {
        errors.push("Radarr API key is required.".to_string());
    }
    if file_paths.is_empty() {
        errors.push("At least one library path is required.".to_string());
    }
    if !errors.is_empty() {
        return Err(errors);
    }

    Ok(AppConfig {
        radarr_url,
        radarr_api_key: api_key,
        file_paths,
        debug_mode: form.debug_mode,
        cookie_file: current.cookie_file.clone(),
        path_overrides: normalize_path_overrides(overrides),
    })
}

/// Newline separated paths to de-duplicated absolute paths.
pub fn normalize_paths(raw: &str) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    for line in raw.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let path = absolute_or_raw(&expand_home(line));
        if !paths.contains(&path) {
            paths.push(path);
        }
    }
    paths
}

/// Parses `remote => local` lines (`->` and `,` are accepted too).
pub fn parse_path_overrides(raw: &str) -> (Vec<PathOverride>, Vec<String>) {
    let mut overrides = Vec::new();
    let mut errors = Vec::new();
    for (number, line) in raw.lines().enumerate() {
        let line_number = number + 1;
        let cleaned = line.trim();
        if cleaned.is_empty() {
            continue;
        }
        let Some((remote, local)) = ["=>", "->", ","]
            .iter()
            .find_map(|separator| cleaned.split_once(separator))
        else {
            errors.push(format!(
                "Path override line {line_number} must use 'remote => local' format: '{cleaned}'"
            ));
            continue;
        };
        let (remote, local) = (remote.trim(), local.trim());
        if remote.is_empty() || local.is_empty() {
            errors.push(format!(
                "Path override line {line_number} is missing a remote or local path: '{cleaned}'"
            ));
            continue;
        }
        overrides.push(PathOverride {
            remote: remote.to_string(),
            local: PathBuf::from(local),
        });
    }
    (overrides, errors)
}

pub fn normalize_path_overrides(overrides: Vec<PathOverride>) -> Vec<PathOverride> {
    let mut normalized: Vec<PathOverride> = Vec::new();
    for rule in overrides {
        let remote = rule.remote.trim();
        let local = rule.local.to_string_lossy();
        let local = local.trim();
        if remote.is_empty() || local.is_empty() {
            continue;
        }
        let stripped = remote.trim_end_matches(['/', '\\']);
        let record = PathOverride {
            remote: if stripped.is_empty() { remote } else { stripped }.to_string(),
            local: absolute_or_raw(&expand_home(local)),
        };
        if !normalized.contains(&record) {
            normalized.push(record);
        }
    }
    normalized
}

/// Expands a leading `~` using `$HOME`.
pub fn expand_home(raw: &str) -> PathBuf {
    let home = || env::var_os("HOME").map(PathBuf::from);
    if raw == "~" {
        if let Some(home) = home() {
            return home;
        }
    } else if let Some(rest) = raw.strip_prefix("~/")
        && let Some(home) = home()
    {
        return home.join(rest);
    }
    PathBuf::from(raw)
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).with_context(|| format!("Resolving {}", path.display()))
}

fn absolute_or_raw(path: &Path) -> PathBuf {
    absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, tempdir};

    fn make_env(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn settings_from(contents: &str) -> RuntimeSettings {
        let cfg = make_env(contents);
        let vars = read_env_file(cfg.path()).unwrap();
        build_runtime_settings(&vars, |_| None, RuntimeOverrides::default()).unwrap()
    }

    #[test]
    fn runtime_settings_default_port_and_host() {
        let settings = settings_from("YT2RADARR_CONFIG_DIR=\"/srv/yt2radarr\"\n");
        assert_eq!(settings.port, DEFAULT_PORT);
        assert_eq!(settings.host, DEFAULT_HOST);
        assert_eq!(settings.config_dir, PathBuf::from("/srv/yt2radarr"));
        assert_eq!(
            settings.jobs_path(),
            PathBuf::from("/srv/yt2radarr/jobs.json")
        );
    }

    #[test]
    fn runtime_settings_invalid_port_defaults() {
        let settings = settings_from("YT2RADARR_PORT=\"nope\"\n");
        assert_eq!(settings.port, DEFAULT_PORT);
        assert!(settings.config_dir.is_absolute());
    }

    #[test]
    fn runtime_settings_override_precedence() {
        let mut vars = HashMap::new();
        vars.insert("YT2RADARR_CONFIG_DIR".to_string(), "/file-config".to_string());
        vars.insert("YT2RADARR_HOST".to_string(), "file-host".to_string());
        vars.insert("YT2RADARR_PORT".to_string(), "7000".to_string());

        let settings = build_runtime_settings(
            &vars,
            |key| (key == "YT2RADARR_PORT").then(|| "8000".to_string()),
            RuntimeOverrides {
                config_dir: Some(PathBuf::from("/override")),
                host: Some("   ".into()),
                ..RuntimeOverrides::default()
            },
        )
        .unwrap();
        assert_eq!(settings.config_dir, PathBuf::from("/override"));
        assert_eq!(settings.port, 8000);
        assert_eq!(settings.host, "file-host");
    }

    #[test]
    fn read_env_file_handles_export_and_quotes() {
        let cfg = make_env(
            r#"
            export RADARR_URL="http://radarr:7878"
            RADARR_API_KEY='secret'
            YT2RADARR_PORT =  "9090"
            # comment
            INVALID_LINE
            "#,
        );
        let vars = read_env_file(cfg.path()).unwrap();
        assert_eq!(vars.get("RADARR_URL").unwrap(), "http://radarr:7878");
        assert_eq!(vars.get("RADARR_API_KEY").unwrap(), "secret");
        assert_eq!(vars.get("YT2RADARR_PORT").unwrap(), "9090");
        assert!(!vars.contains_key("INVALID_LINE"));
        assert!(read_env_file(Path::new("/definitely/missing.env")).unwrap().is_empty());
    }

    #[test]
    fn app_config_falls_back_to_environment_defaults() {
        let dir = tempdir().unwrap();
        let env = |key: &str| match key {
            "RADARR_URL" => Some("http://radarr:7878/".to_string()),
            "RADARR_API_KEY" => Some("env-key".to_string()),
            _ => None,
        };
        let missing = load_app_config(&dir.path().join(CONFIG_FILE_NAME), dir.path(), env);
        assert_eq!(missing.radarr_url, "http://radarr:7878");
        assert!(!missing.is_configured());

        fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            "radarr_api_key = \" file-key \"\nfile_paths = [\"/movies\", \"/movies\"]\n\n[[path_overrides]]\nremote = \"/data/\"\nlocal = \"/mnt/data\"\n",
        )
        .unwrap();
        let loaded = load_app_config(&dir.path().join(CONFIG_FILE_NAME), dir.path(), env);
        assert_eq!(loaded.radarr_url, "http://radarr:7878");
        assert_eq!(loaded.radarr_api_key, "file-key");
        assert_eq!(loaded.file_paths, vec![PathBuf::from("/movies")]);
        assert_eq!(loaded.path_overrides[0].remote, "/data");
        assert!(loaded.is_configured());
    }

    #[test]
    fn broken_config_file_uses_defaults() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE_NAME), "radarr_url = [").unwrap();
        let loaded = load_app_config(&dir.path().join(CONFIG_FILE_NAME), dir.path(), |_| None);
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn cookie_file_in_config_dir_is_picked_up() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(DEFAULT_COOKIE_FILENAME), "# Netscape").unwrap();
        let loaded = load_app_config(&dir.path().join(CONFIG_FILE_NAME), dir.path(), |_| None);
        assert_eq!(loaded.cookie_file, DEFAULT_COOKIE_FILENAME);
    }

    #[test]
    fn save_round_trips_and_bumps_generation() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::new(dir.path().to_path_buf(), AppConfig::default());
        assert_eq!(store.generation(), 0);

        let saved = store
            .save(AppConfig {
                radarr_url: "http://radarr/".into(),
                radarr_api_key: "k".into(),
                file_paths: vec![PathBuf::from("/movies")],
                path_overrides: vec![PathOverride {
                    remote: "/library".into(),
                    local: PathBuf::from("/mnt/library"),
                }],
                ..AppConfig::default()
            })
            .unwrap();
        assert_eq!(saved.radarr_url, "http://radarr");
        assert_eq!(store.generation(), 1);
        assert_eq!(store.current(), saved);

        let reloaded = load_app_config(&dir.path().join(CONFIG_FILE_NAME), dir.path(), |_| None);
        assert_eq!(reloaded, saved);
    }

    #[test]
    fn parse_path_overrides_reports_bad_lines() {
        let (overrides, errors) =
            parse_path_overrides("/a => /b\n\n/c -> /d\n/e, /f\nno separator\n/g =>  \n");
        let pairs: Vec<_> = overrides
            .iter()
            .map(|rule| (rule.remote.as_str(), rule.local.to_string_lossy().into_owned()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("/a", "/b".to_string()),
                ("/c", "/d".to_string()),
                ("/e", "/f".to_string())
            ]
        );
        assert_eq!(
            errors,
            vec![
                "Path override line 5 must use 'remote => local' format: 'no separator'",
                "Path override line 6 is missing a remote or local path: '/g =>'",
            ]
        );
    }

    #[test]
    fn normalize_path_overrides_strips_and_dedupes() {
        let rules = normalize_path_overrides(vec![
            PathOverride {
                remote: "/library//".into(),
                local: PathBuf::from("/mnt/lib"),
            },
            PathOverride {
                remote: "/library".into(),
                local: PathBuf::from("/mnt/lib"),
            },
            PathOverride {
                remote: "/".into(),
                local: PathBuf::from("/mnt/root"),
            },
            PathOverride {
                remote: "  ".into(),
                local: PathBuf::from("/ignored"),
            },
        ]);
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].remote, "/library");
        assert_eq!(rules[1].remote, "/");
    }

    #[test]
    fn validate_setup_collects_errors() {
        let errors = validate_setup(
            &SetupForm {
                radarr_url: "radarr:7878".into(),
                path_overrides: "broken".into(),
                ..SetupForm::default()
            },
            &AppConfig::default(),
        )
        .unwrap_err();
        assert_eq!(
            errors,
            vec![
                "Path override line 1 must use 'remote => local' format: 'broken'",
                "Radarr URL must start with http:// or https://.",
                "Radarr API key is required.",
                "At least one library path is required.",
            ]
        );

        let config = validate_setup(
            &SetupForm {
                radarr_url: "https://radarr.local/".into(),
                radarr_api_key: "key".into(),
                file_paths: "/movies\n/movies\n/4k\n".into(),
                debug_mode: true,
                ..SetupForm::default()
            },
            &AppConfig {
                cookie_file: "cookies.txt".into(),
                ..AppConfig::default()
            },
        )
        .unwrap();
        assert_eq!(config.radarr_url, "https://radarr.local");
        assert_eq!(config.file_paths.len(), 2);
        assert_eq!(config.cookie_file, "cookies.txt");
        assert!(config.debug_mode);
    }
}
