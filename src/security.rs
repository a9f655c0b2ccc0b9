#![forbid(unsafe_code)]

//! Privilege checks and handling of the yt-dlp cookie file.

use anyhow::{Context, Result, bail};
use nix::unistd::Uid;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::config::{AppConfig, DEFAULT_COOKIE_FILENAME, expand_home};

pub const COOKIE_ENV_VAR: &str = "YT_COOKIE_FILE";

/// Fails fast when the service is started as root. Downloads land inside the
/// media library and must not end up owned by root.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!(
            "{process} must not be run as root; use a regular user or a dedicated service account"
        );
    }
    Ok(())
}

/// Resolves a configured cookie file name against the config directory.
pub fn cookie_absolute_path(config_dir: &Path, cookie_file: &str) -> Option<PathBuf> {
    let cookie_file = cookie_file.trim();
    if cookie_file.is_empty() {
        return None;
    }
    let expanded = expand_home(cookie_file);
    let joined = if expanded.is_absolute() {
        expanded
    } else {
        config_dir.join(expanded)
    };
    Some(std::path::absolute(&joined).unwrap_or(joined))
}

/// Restricts `path` to its owner. Failures are not fatal.
pub fn secure_file(path: &Path) {
    if let Err(err) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
        debug!(path = %path.display(), "could not restrict cookie permissions: {err}");
    }
}

/// Cookie file handed to yt-dlp. `YT_COOKIE_FILE` wins over the configured
/// file; a path that does not exist is ignored.
pub fn cookie_path(
    config_dir: &Path,
    config: &AppConfig,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Option<PathBuf> {
    let from_env = env_lookup(COOKIE_ENV_VAR).and_then(|raw| cookie_absolute_path(config_dir, &raw));
    let from_config = cookie_absolute_path(config_dir, &config.cookie_file);
    let found = [from_env, from_config]
        .into_iter()
        .flatten()
        .find(|path| path.exists())?;
    secure_file(&found);
    Some(found)
}

/// Stores pasted cookie text as `cookies.txt` in the config directory and
/// returns the name to record in the configuration.
pub fn save_cookie_text(config_dir: &Path, raw_text: &str) -> Result<String> {
    fs::create_dir_all(config_dir)
        .with_context(|| format!("Creating {}", config_dir.display()))?;
    let target = config_dir.join(DEFAULT_COOKIE_FILENAME);
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&target)
        .with_context(|| format!("Opening {}", target.display()))?;
    writeln!(file, "{}", raw_text.trim())
        .with_context(|| format!("Writing {}", target.display()))?;
    secure_file(&target);
    Ok(DEFAULT_COOKIE_FILENAME.to_string())
}

pub fn delete_cookie_file(config_dir: &Path, cookie_file: &str) {
    let Some(path) = cookie_absolute_path(config_dir, cookie_file) else {
        return;
    };
    if path.exists()
        && let Err(err) = fs::remove_file(&path)
    {
        debug!(path = %path.display(), "could not delete cookie file: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Uid;
    use tempfile::tempdir;

    #[test]
    fn ensure_not_root_allows_unprivileged_uid() {
        let uid = Uid::from_raw(1000);
        assert!(ensure_not_root_for(uid, "tester").is_ok());
    }

    #[test]
    fn ensure_not_root_rejects_root_uid() {
        let uid = Uid::from_raw(0);
        let err = ensure_not_root_for(uid, "tester").unwrap_err();
        assert!(err.to_string().contains("must not be run as root"));
    }

    #[test]
    fn saved_cookies_are_private_and_resolvable() {
        let dir = tempdir().unwrap();
        let name = save_cookie_text(dir.path(), "  # Netscape HTTP Cookie File\n").unwrap();
        assert_eq!(name, DEFAULT_COOKIE_FILENAME);

        let path = dir.path().join(DEFAULT_COOKIE_FILENAME);
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "# Netscape HTTP Cookie File\n"
        );
        assert_eq!(
            fs::metadata(&path).unwrap().permissions().mode() & 0o777,
            0o600
        );

        let config = AppConfig {
            cookie_file: name.clone(),
            ..AppConfig::default()
        };
        assert_eq!(cookie_path(dir.path(), &config, |_| None), Some(path.clone()));

        delete_cookie_file(dir.path(), &name);
        assert!(!path.exists());
        assert_eq!(cookie_path(dir.path(), &config, |_| None), None);
    }

    #[test]
    fn environment_cookie_file_takes_precedence() {
        let dir = tempdir().unwrap();
        let env_file = dir.path().join("env-cookies.txt");
        fs::write(&env_file, "x").unwrap();
        fs::set_permissions(&env_file, fs::Permissions::from_mode(0o644)).unwrap();
        fs::write(dir.path().join(DEFAULT_COOKIE_FILENAME), "y").unwrap();

        let config = AppConfig {
            cookie_file: DEFAULT_COOKIE_FILENAME.into(),
            ..AppConfig::default()
        };
        let env_value = env_file.to_string_lossy().into_owned();
        let found = cookie_path(dir.path(), &config, |key| {
            (key == COOKIE_ENV_VAR).then(|| env_value.clone())
        });
        assert_eq!(found, Some(env_file.clone()));
        assert_eq!(
            fs::metadata(&env_file).unwrap().permissions().mode() & 0o777,
            0o600
        );

        let missing = cookie_path(dir.path(), &config, |_| Some("/nope/cookies.txt".into()));
        assert_eq!(missing, Some(dir.path().join(DEFAULT_COOKIE_FILENAME)));
    }
}
