use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const APP_NAME: &str = "livekit";
pub const CONFIG_FILE_NAME: &str = "cli-config.toml";
pub const SETTINGS_FILE_NAME: &str = "settings.toml";

static DEFAULT_SETTINGS: Lazy<Settings> = Lazy::new(Settings::default);

/// Tool-level settings: which cloud endpoints to talk to and how patient to be.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    #[serde(default = "default_cloud_api_url")]
    pub cloud_api_url: String,
    #[serde(default = "default_dashboard_url")]
    pub dashboard_url: String,
    /// Overrides the project url for agent/twirp calls (staging clusters).
    #[serde(default)]
    pub service_url: Option<String>,
    #[serde(default = "default_templates_index_url")]
    pub templates_index_url: String,
    #[serde(default = "default_auth_poll_interval_secs")]
    pub auth_poll_interval_secs: u64,
    #[serde(default = "default_auth_timeout_secs")]
    pub auth_timeout_secs: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cloud_api_url: default_cloud_api_url(),
            dashboard_url: default_dashboard_url(),
            service_url: None,
            templates_index_url: default_templates_index_url(),
            auth_poll_interval_secs: default_auth_poll_interval_secs(),
            auth_timeout_secs: default_auth_timeout_secs(),
            retry_attempts: default_retry_attempts(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_cloud_api_url() -> String {
    "https://cloud-api.livekit.io".into()
}

fn default_dashboard_url() -> String {
    "https://cloud.livekit.io".into()
}

fn default_templates_index_url() -> String {
    "https://raw.githubusercontent.com/livekit-examples/index/main/templates.json".into()
}

fn default_auth_poll_interval_secs() -> u64 {
    4
}

fn default_auth_timeout_secs() -> u64 {
    15 * 60
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_request_timeout_secs() -> u64 {
    60
}

impl Settings {
    pub fn auth_poll_interval(&self) -> Duration {
        Duration::from_secs(self.auth_poll_interval_secs.max(1))
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Defaults, then `settings.toml` in the config dir, then `LK_*` variables.
pub fn load_settings(config_dir: Option<&Utf8PathBuf>) -> Result<Settings> {
    let mut figment = Figment::from(Serialized::defaults(DEFAULT_SETTINGS.clone()));
    if let Some(dir) = config_dir {
        let path = dir.join(SETTINGS_FILE_NAME);
        if path.exists() {
            debug!(%path, "loading settings file");
            figment = figment.merge(Toml::file(path));
        }
    }
    figment = figment.merge(Env::prefixed("LK_").ignore(&["CONFIG_DIR"]));

    figment
        .extract()
        .context("failed to load lk settings")
}

/// `LK_CONFIG_DIR` wins; otherwise the platform config directory.
pub fn resolve_config_dir() -> Option<Utf8PathBuf> {
    if let Ok(dir) = std::env::var("LK_CONFIG_DIR")
        && !dir.trim().is_empty()
    {
        return Some(Utf8PathBuf::from(dir));
    }
    ProjectDirs::from("io", "LiveKit", APP_NAME)
        .and_then(|dirs| Utf8PathBuf::from_path_buf(dirs.config_dir().to_path_buf()).ok())
}

/// Snapshot of the credential variables the resolver consults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvCredentials {
    #[serde(default, rename = "livekit_url")]
    pub url: Option<String>,
    #[serde(default, rename = "livekit_api_key")]
    pub api_key: Option<String>,
    #[serde(default, rename = "livekit_api_secret")]
    pub api_secret: Option<String>,
}

impl EnvCredentials {
    pub fn from_env() -> Result<Self> {
        let creds: Self = Figment::new()
            .merge(Env::raw().only(&["LIVEKIT_URL", "LIVEKIT_API_KEY", "LIVEKIT_API_SECRET"]))
            .extract()
            .context("failed to read LIVEKIT_* environment")?;
        Ok(creds.non_empty())
    }

    pub fn from_pairs(pairs: &BTreeMap<String, String>) -> Self {
        Self {
            url: pairs.get("LIVEKIT_URL").cloned(),
            api_key: pairs.get("LIVEKIT_API_KEY").cloned(),
            api_secret: pairs.get("LIVEKIT_API_SECRET").cloned(),
        }
        .non_empty()
    }

    fn non_empty(self) -> Self {
        let keep = |v: Option<String>| v.filter(|s| !s.trim().is_empty());
        Self {
            url: keep(self.url),
            api_key: keep(self.api_key),
            api_secret: keep(self.api_secret),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_match_documented_values() {
        let settings = Settings::default();
        assert_eq!(settings.auth_poll_interval(), Duration::from_secs(4));
        assert_eq!(settings.auth_timeout(), Duration::from_secs(900));
        assert_eq!(settings.retry_attempts, 3);
    }

    #[test]
    fn file_and_env_layers_override_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                SETTINGS_FILE_NAME,
                "cloud_api_url = \"http://file.local\"\nauth_poll_interval_secs = 1\n",
            )?;
            jail.set_env("LK_AUTH_POLL_INTERVAL_SECS", "2");
            let dir = Utf8PathBuf::from_path_buf(jail.directory().to_path_buf())
                .expect("utf8 jail dir");
            let settings = load_settings(Some(&dir)).expect("settings load");
            assert_eq!(settings.cloud_api_url, "http://file.local");
            assert_eq!(settings.auth_poll_interval_secs, 2);
            Ok(())
        });
    }

    #[test]
    fn env_credentials_read_livekit_variables() {
        Jail::expect_with(|jail| {
            jail.set_env("LIVEKIT_URL", "wss://demo.livekit.cloud");
            jail.set_env("LIVEKIT_API_KEY", "");
            let creds = EnvCredentials::from_env().expect("env read");
            assert_eq!(creds.url.as_deref(), Some("wss://demo.livekit.cloud"));
            assert!(creds.api_key.is_none());
            assert!(creds.api_secret.is_none());
            Ok(())
        });
    }
}
