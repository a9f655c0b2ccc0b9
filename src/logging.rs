//! Process logging. Job-visible output goes to each job's log ring instead.

use anyhow::{Result, anyhow};
use tracing_subscriber::EnvFilter;

pub const DEFAULT_FILTER: &str = "info,yt2radarr=debug";

/// Installs a stderr subscriber honouring `RUST_LOG`.
pub fn init_logging() -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init()
        .map_err(|err| anyhow!("failed to install log subscriber: {err}"))?;
    tracing::debug!("logging initialized");
    Ok(())
}
