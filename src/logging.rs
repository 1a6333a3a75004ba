#![forbid(unsafe_code)]

use anyhow::{Context, Result, anyhow};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_FILE: &str = "downloader.log";
pub const LOG_ENV: &str = "MEDIAGRAB_LOG";

/// Installs the global subscriber: terse stderr output for the user plus a
/// full debug log appended to `<output_dir>/downloader.log`. Returns the log
/// file path.
pub fn init(output_dir: &Path, verbose: bool) -> Result<PathBuf> {
    fs::create_dir_all(output_dir)
        .with_context(|| format!("Creating {}", output_dir.display()))?;
    let log_path = output_dir.join(LOG_FILE);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("Opening {}", log_path.display()))?;

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(stderr_filter(verbose, |key| std::env::var(key).ok()));
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_filter(EnvFilter::new("mediagrab=debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow!("installing log subscriber: {err}"))?;
    Ok(log_path)
}

/// `MEDIAGRAB_LOG` wins over `RUST_LOG`; without either only warnings reach
/// the terminal unless `verbose` is set.
fn stderr_filter(verbose: bool, env_lookup: impl Fn(&str) -> Option<String>) -> EnvFilter {
    [LOG_ENV, "RUST_LOG"]
        .into_iter()
        .filter_map(|key| env_lookup(key))
        .find_map(|directives| EnvFilter::try_new(directives.trim()).ok())
        .unwrap_or_else(|| default_directives(verbose).into())
}

fn default_directives(verbose: bool) -> &'static str {
    if verbose {
        "mediagrab=debug"
    } else {
        "mediagrab=warn"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_directives_take_precedence() {
        let filter = stderr_filter(false, |key| {
            (key == LOG_ENV).then(|| "mediagrab=trace".to_string())
        });
        assert_eq!(filter.to_string(), "mediagrab=trace");

        let filter = stderr_filter(false, |key| {
            (key == "RUST_LOG").then(|| "mediagrab::engine=debug".to_string())
        });
        assert_eq!(filter.to_string(), "mediagrab::engine=debug");
    }

    #[test]
    fn defaults_follow_verbosity() {
        assert_eq!(stderr_filter(false, |_| None).to_string(), "mediagrab=warn");
        assert_eq!(stderr_filter(true, |_| None).to_string(), "mediagrab=debug");
    }
}
