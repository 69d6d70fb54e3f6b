use std::env;
use std::fs;
use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;

const APP_DIR: &str = "tidal";
const PROFILES_FILE: &str = "profiles.toml";

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Engine {
    #[default]
    Mysql,
    Postgres,
}

impl Engine {
    #[must_use]
    pub fn default_port(self) -> u16 {
        match self {
            Self::Mysql => 3306,
            Self::Postgres => 5432,
        }
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Mysql => "mysql",
            Self::Postgres => "postgres",
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TlsMode {
    Disabled,
    #[default]
    Prefer,
    Require,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PasswordSource {
    #[default]
    EnvVar,
    Keyring,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ConnectionProfile {
    pub name: String,
    #[serde(default)]
    pub engine: Engine,
    pub host: String,
    /// Falls back to the engine's well-known port when absent.
    #[serde(default)]
    pub port: Option<u16>,
    pub user: String,
    pub database: Option<String>,
    #[serde(default)]
    pub tls_mode: TlsMode,
    #[serde(default)]
    pub tls_ca_cert_path: Option<String>,
    #[serde(default)]
    pub password_source: PasswordSource,
    #[serde(default)]
    pub keyring_service: Option<String>,
    #[serde(default)]
    pub keyring_account: Option<String>,
}

impl ConnectionProfile {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        engine: Engine,
        host: impl Into<String>,
        user: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            engine,
            host: host.into(),
            port: None,
            user: user.into(),
            database: None,
            tls_mode: TlsMode::Prefer,
            tls_ca_cert_path: None,
            password_source: PasswordSource::EnvVar,
            keyring_service: None,
            keyring_account: None,
        }
    }

    #[must_use]
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.engine.default_port())
    }

    /// `user@host:port/database`, used in the status bar and logs.
    #[must_use]
    pub fn display_target(&self) -> String {
        let mut target = format!("{}@{}:{}", self.user, self.host, self.effective_port());
        if let Some(database) = &self.database {
            target.push('/');
            target.push_str(database);
        }
        target
    }
}

#[derive(Debug, Error)]
pub enum ProfilesError {
    #[error("config directory is unavailable for this platform")]
    ConfigDirUnavailable,
    #[error("failed to read profiles file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse profiles file at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("profile `{0}` not found")]
    UnknownProfile(String),
}

#[derive(Debug, Default, Deserialize)]
struct ProfilesDocument {
    #[serde(default)]
    profiles: Vec<ConnectionProfile>,
}

#[derive(Debug, Clone)]
pub struct FileProfilesStore {
    profiles: Vec<ConnectionProfile>,
}

impl FileProfilesStore {
    pub fn load_default() -> Result<Self, ProfilesError> {
        Self::load_from_path(config_dir()?.join(PROFILES_FILE))
    }

    pub fn load_from_path(path: impl Into<PathBuf>) -> Result<Self, ProfilesError> {
        let path = path.into();
        if !path.exists() {
            return Ok(Self {
                profiles: Vec::new(),
            });
        }

        let raw = fs::read_to_string(&path).map_err(|source| ProfilesError::Read {
            path: path.clone(),
            source,
        })?;
        let doc: ProfilesDocument = if raw.trim().is_empty() {
            ProfilesDocument::default()
        } else {
            toml::from_str(&raw).map_err(|source| ProfilesError::Parse {
                path: path.clone(),
                source,
            })?
        };

        // Later entries win when a name is repeated.
        let mut by_name = std::collections::BTreeMap::new();
        for profile in doc.profiles {
            by_name.insert(profile.name.clone(), profile);
        }

        Ok(Self {
            profiles: by_name.into_values().collect(),
        })
    }

    #[must_use]
    pub fn profiles(&self) -> &[ConnectionProfile] {
        &self.profiles
    }

    #[must_use]
    pub fn profile(&self, name: &str) -> Option<&ConnectionProfile> {
        self.profiles.iter().find(|profile| profile.name == name)
    }

    /// Picks the named profile, or the first one when no name is given.
    pub fn select(&self, name: Option<&str>) -> Result<&ConnectionProfile, ProfilesError> {
        match name {
            Some(name) => self
                .profile(name)
                .ok_or_else(|| ProfilesError::UnknownProfile(name.to_string())),
            None => self
                .profiles
                .first()
                .ok_or_else(|| ProfilesError::UnknownProfile("<default>".to_string())),
        }
    }
}

/// `$TIDAL_CONFIG_DIR`, else the platform config directory joined with `tidal`.
pub fn config_dir() -> Result<PathBuf, ProfilesError> {
    if let Some(custom) = env::var_os("TIDAL_CONFIG_DIR") {
        return Ok(PathBuf::from(custom));
    }

    let base_dir = if cfg!(target_os = "windows") {
        env::var_os("APPDATA")
            .map(PathBuf::from)
            .ok_or(ProfilesError::ConfigDirUnavailable)?
    } else if let Some(xdg_config_home) = env::var_os("XDG_CONFIG_HOME") {
        PathBuf::from(xdg_config_home)
    } else {
        let home = env::var_os("HOME").ok_or(ProfilesError::ConfigDirUnavailable)?;
        PathBuf::from(home).join(".config")
    };

    Ok(base_dir.join(APP_DIR))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::{ConnectionProfile, Engine, FileProfilesStore, ProfilesError, TlsMode};

    #[test]
    fn missing_profiles_file_loads_empty_store() {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let store = FileProfilesStore::load_from_path(temp_dir.path().join("profiles.toml"))
            .expect("failed to load store");
        assert!(store.profiles().is_empty());
        assert!(matches!(
            store.select(None),
            Err(ProfilesError::UnknownProfile(_))
        ));
    }

    #[test]
    fn port_defaults_follow_the_engine() {
        let mysql = ConnectionProfile::new("m", Engine::Mysql, "db", "root");
        let mut postgres = ConnectionProfile::new("p", Engine::Postgres, "db", "postgres");
        assert_eq!(mysql.effective_port(), 3306);
        assert_eq!(postgres.effective_port(), 5432);

        postgres.port = Some(6543);
        postgres.database = Some("app".to_string());
        assert_eq!(postgres.display_target(), "postgres@db:6543/app");
    }

    #[test]
    fn parses_minimal_toml_and_keeps_last_duplicate() {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let path = temp_dir.path().join("profiles.toml");
        fs::write(
            &path,
            r#"
[[profiles]]
name = "warehouse"
engine = "postgres"
host = "10.0.0.5"
user = "analyst"
database = "first"

[[profiles]]
name = "warehouse"
engine = "postgres"
host = "10.0.0.5"
user = "analyst"
database = "second"

[[profiles]]
name = "local"
host = "127.0.0.1"
user = "root"
"#,
        )
        .expect("failed to write profiles");

        let store = FileProfilesStore::load_from_path(&path).expect("failed to load store");
        assert_eq!(store.profiles().len(), 2);

        let warehouse = store.select(Some("warehouse")).expect("warehouse profile");
        assert_eq!(warehouse.engine, Engine::Postgres);
        assert_eq!(warehouse.database.as_deref(), Some("second"));

        let local = store.profile("local").expect("local profile");
        assert_eq!(local.engine, Engine::Mysql);
        assert_eq!(local.tls_mode, TlsMode::Prefer);
        assert_eq!(store.select(None).expect("default").name, "local");
    }
}
