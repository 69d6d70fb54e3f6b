use tidal_core::profiles::{ConnectionProfile, PasswordSource};
use tracing::debug;

pub const PASSWORD_ENV_VAR: &str = "TIDAL_DB_PASSWORD";
const DEFAULT_KEYRING_SERVICE: &str = "tidal";

/// Resolves the password for `profile`.
///
/// Keyring profiles fall back to the environment variable and seed the
/// keyring with it, so the variable is only needed once per machine.
#[must_use]
pub fn resolve_password(profile: &ConnectionProfile) -> Option<String> {
    let env_password = std::env::var(PASSWORD_ENV_VAR)
        .ok()
        .filter(|password| !password.is_empty());

    match profile.password_source {
        PasswordSource::EnvVar => env_password,
        PasswordSource::Keyring => {
            if let Some(password) = load_keyring_password(profile) {
                return Some(password);
            }

            let password = env_password?;
            store_keyring_password(profile, &password);
            Some(password)
        }
    }
}

pub(crate) fn non_empty(value: Option<&str>) -> Option<&str> {
    value.and_then(|raw| {
        let trimmed = raw.trim();
        (!trimmed.is_empty()).then_some(trimmed)
    })
}

fn keyring_coordinates(profile: &ConnectionProfile) -> (&str, &str) {
    let service =
        non_empty(profile.keyring_service.as_deref()).unwrap_or(DEFAULT_KEYRING_SERVICE);
    let account = non_empty(profile.keyring_account.as_deref()).unwrap_or(profile.name.as_str());
    (service, account)
}

#[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
fn load_keyring_password(profile: &ConnectionProfile) -> Option<String> {
    let (service, account) = keyring_coordinates(profile);
    let entry = keyring::Entry::new(service, account).ok()?;
    match entry.get_password() {
        Ok(password) if !password.is_empty() => Some(password),
        Ok(_) => None,
        Err(error) => {
            debug!(%error, service, account, "no keyring password");
            None
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
fn load_keyring_password(_profile: &ConnectionProfile) -> Option<String> {
    None
}

#[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
fn store_keyring_password(profile: &ConnectionProfile, password: &str) {
    let (service, account) = keyring_coordinates(profile);
    let Ok(entry) = keyring::Entry::new(service, account) else {
        return;
    };
    if let Err(error) = entry.set_password(password) {
        debug!(%error, service, account, "could not store password in keyring");
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
fn store_keyring_password(_profile: &ConnectionProfile, _password: &str) {}

#[cfg(test)]
mod tests {
    use tidal_core::profiles::{ConnectionProfile, Engine};

    use super::{keyring_coordinates, non_empty};

    #[test]
    fn keyring_coordinates_default_to_app_and_profile_name() {
        let mut profile = ConnectionProfile::new("warehouse", Engine::Postgres, "db", "app");
        assert_eq!(keyring_coordinates(&profile), ("tidal", "warehouse"));

        profile.keyring_service = Some("  ".to_string());
        profile.keyring_account = Some(" analyst ".to_string());
        assert_eq!(keyring_coordinates(&profile), ("tidal", "analyst"));
    }

    #[test]
    fn non_empty_trims_and_rejects_blank_values() {
        assert_eq!(non_empty(Some("  x ")), Some("x"));
        assert_eq!(non_empty(Some("   ")), None);
        assert_eq!(non_empty(None), None);
    }
}
