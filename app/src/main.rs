mod logging;

use std::path::PathBuf;

use clap::Parser;
use tidal_core::profiles::{ConnectionProfile, FileProfilesStore, ProfilesError};
use tidal_tui::TuiError;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "tidal", about = "Terminal SQL client with paged result browsing")]
struct Cli {
    /// Profile to connect with on start; defaults to the first stored profile.
    #[arg(short, long, env = "TIDAL_PROFILE")]
    profile: Option<String>,

    /// Log file, defaults to tidal.log in the config directory.
    #[arg(long, env = "TIDAL_LOG_FILE")]
    log_file: Option<PathBuf>,
}

/// Picks the profile to open on start. An empty store is not an error
/// unless a profile was asked for by name.
fn startup_profile(
    store: &FileProfilesStore,
    name: Option<&str>,
) -> Result<Option<ConnectionProfile>, ProfilesError> {
    match store.select(name) {
        Ok(profile) => Ok(Some(profile.clone())),
        Err(ProfilesError::UnknownProfile(_)) if name.is_none() => Ok(None),
        Err(error) => Err(error),
    }
}

fn run_app(
    profile: Option<ConnectionProfile>,
    run_tui: impl FnOnce(Option<ConnectionProfile>) -> Result<(), TuiError>,
) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        core = tidal_core::domain_name(),
        adapters = tidal_adapters::adapter_name(),
        ui = tidal_tui::ui_name(),
        profile = profile.as_ref().map_or("-", |profile| profile.name.as_str()),
        "starting"
    );
    run_tui(profile)?;
    info!("exited cleanly");
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let log_path = logging::init(cli.log_file)?;
    info!(path = %log_path.display(), "logging initialized");

    let store = FileProfilesStore::load_default()?;
    let profile = startup_profile(&store, cli.profile.as_deref())?;
    run_app(profile, tidal_tui::run)
}
