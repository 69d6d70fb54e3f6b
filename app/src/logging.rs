use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tidal_core::profiles::config_dir;
use tracing_subscriber::EnvFilter;

const LOG_FILTER_ENV: &str = "TIDAL_LOG";
const LOG_FILE_NAME: &str = "tidal.log";
const DEFAULT_FILTER: &str = "info";

/// Installs the global subscriber. The terminal is owned by the UI, so
/// every event goes to a log file.
pub fn init(explicit_path: Option<PathBuf>) -> Result<PathBuf, Box<dyn std::error::Error>> {
    let path = match explicit_path {
        Some(path) => path,
        None => config_dir()?.join(LOG_FILE_NAME),
    };
    let file = open_log_file(&path)?;

    tracing_subscriber::fmt()
        .with_env_filter(env_filter(std::env::var(LOG_FILTER_ENV).ok().as_deref()))
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_target(true)
        .try_init()
        .map_err(|error| io::Error::other(error.to_string()))?;

    Ok(path)
}

fn env_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .and_then(|raw| EnvFilter::try_new(raw).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}

fn open_log_file(path: &Path) -> io::Result<fs::File> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

#[cfg(test)]
mod tests {
    use super::{env_filter, open_log_file};

    #[test]
    fn invalid_directives_fall_back_to_info() {
        assert_eq!(env_filter(Some("[[[")).to_string(), "info");
        assert_eq!(env_filter(None).to_string(), "info");
        assert_eq!(
            env_filter(Some("tidal_core=debug")).to_string(),
            "tidal_core=debug"
        );
    }

    #[test]
    fn log_file_parent_directories_are_created() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested/logs/tidal.log");
        open_log_file(&path).expect("log file should open");
        assert!(path.exists());
    }
}
