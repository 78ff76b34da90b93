pub mod project_file;

use std::fs;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::CliError;

pub use project_file::{AgentSection, ProjectFile, ProjectSection};

/// `[A-Za-z0-9_-]+`, shared by project and agent names.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

pub fn validate_name(kind: &str, name: &str) -> Result<(), CliError> {
    if is_valid_name(name) {
        Ok(())
    } else {
        Err(CliError::Input(format!(
            "{kind} name `{name}` may only contain letters, digits, `-` and `_`"
        )))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub name: String,
    pub url: String,
    pub api_key: String,
    pub api_secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
}

impl ProjectConfig {
    pub fn validate(&self) -> Result<(), CliError> {
        validate_name("project", &self.name)?;
        let scheme_ok = ["http://", "https://", "ws://", "wss://"]
            .iter()
            .any(|scheme| self.url.starts_with(scheme));
        if !scheme_ok {
            return Err(CliError::Input(format!(
                "project url `{}` must start with http, https, ws or wss",
                self.url
            )));
        }
        if self.api_key.len() < 3 {
            return Err(CliError::Input("api key must be at least 3 characters".into()));
        }
        if self.api_secret.len() < 3 {
            return Err(CliError::Input(
                "api secret must be at least 3 characters".into(),
            ));
        }
        Ok(())
    }

    /// First DNS label of the project url, e.g. `acme` for `wss://acme.livekit.cloud`.
    pub fn subdomain(&self) -> Option<String> {
        subdomain_of(&self.url)
    }
}

pub fn subdomain_of(url: &str) -> Option<String> {
    let rest = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let host = rest.split(['/', ':', '?']).next()?;
    let label = host.split('.').next()?;
    if label.is_empty() {
        None
    } else {
        Some(label.to_ascii_lowercase())
    }
}

/// On-disk shape of `cli-config.toml`. The default pointer is written first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CliConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_project: Option<String>,
    #[serde(default)]
    pub projects: Vec<ProjectConfig>,
}

/// The persisted project registry. Every mutation goes through `persist`,
/// which only touches disk when the in-memory state changed.
#[derive(Debug)]
pub struct ConfigStore {
    path: Utf8PathBuf,
    config: CliConfig,
    on_disk: Option<CliConfig>,
}

impl ConfigStore {
    pub fn load_or_create(path: Utf8PathBuf) -> Result<Self> {
        let on_disk = Self::load_from_disk(&path)?;
        let config = on_disk.clone().unwrap_or_default();
        Ok(Self {
            path,
            config,
            on_disk,
        })
    }

    pub fn in_dir(dir: &Utf8Path) -> Result<Self> {
        Self::load_or_create(dir.join(crate::settings::CONFIG_FILE_NAME))
    }

    fn load_from_disk(path: &Utf8Path) -> Result<Option<CliConfig>> {
        if !path.exists() {
            return Ok(None);
        }
        let raw =
            fs::read_to_string(path).with_context(|| format!("failed to read config {path}"))?;
        if raw.trim().is_empty() {
            return Ok(Some(CliConfig::default()));
        }
        let config: CliConfig =
            toml::from_str(&raw).with_context(|| format!("invalid TOML in {path}"))?;
        Ok(Some(config))
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn config(&self) -> &CliConfig {
        &self.config
    }

    pub fn list(&self) -> &[ProjectConfig] {
        &self.config.projects
    }

    pub fn get(&self, name: &str) -> Option<&ProjectConfig> {
        self.config.projects.iter().find(|p| p.name == name)
    }

    pub fn find_by_subdomain(&self, subdomain: &str) -> Option<&ProjectConfig> {
        let wanted = subdomain.to_ascii_lowercase();
        self.config
            .projects
            .iter()
            .find(|p| p.subdomain().as_deref() == Some(wanted.as_str()))
    }

    pub fn default_project(&self) -> Option<&ProjectConfig> {
        self.config
            .default_project
            .as_deref()
            .and_then(|name| self.get(name))
    }

    pub fn is_default(&self, name: &str) -> bool {
        self.config.default_project.as_deref() == Some(name)
    }

    pub fn add(&mut self, project: ProjectConfig) -> Result<()> {
        project.validate()?;
        if self.get(&project.name).is_some() {
            return Err(CliError::Conflict(format!("project `{}`", project.name)).into());
        }
        debug!(name = %project.name, "adding project");
        self.config.projects.push(project);
        self.persist()
    }

    /// Replace the entry that shares `project_id` (re-authentication), or add.
    pub fn upsert_by_project_id(&mut self, project: ProjectConfig) -> Result<()> {
        project.validate()?;
        let existing = project.project_id.as_deref().and_then(|id| {
            self.config
                .projects
                .iter()
                .position(|p| p.project_id.as_deref() == Some(id))
        });
        match existing {
            Some(index) => {
                let old_name = self.config.projects[index].name.clone();
                if old_name != project.name && self.get(&project.name).is_some() {
                    return Err(CliError::Conflict(format!("project `{}`", project.name)).into());
                }
                if self.is_default(&old_name) {
                    self.config.default_project = Some(project.name.clone());
                }
                self.config.projects[index] = project;
                self.persist()
            }
            None => self.add(project),
        }
    }

    /// Removing an unknown name is a no-op.
    pub fn remove(&mut self, name: &str) -> Result<bool> {
        let before = self.config.projects.len();
        self.config.projects.retain(|p| p.name != name);
        let removed = self.config.projects.len() != before;
        if self.is_default(name) {
            self.config.default_project = None;
        }
        self.persist()?;
        Ok(removed)
    }

    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if self.get(name).is_none() {
            return Err(CliError::NotFound(format!("project `{name}`")).into());
        }
        self.config.default_project = Some(name.to_string());
        self.persist()
    }

    /// Writes only when the in-memory config differs from what was loaded.
    pub fn persist(&mut self) -> Result<()> {
        let unchanged = match &self.on_disk {
            Some(saved) => saved == &self.config,
            None => self.config == CliConfig::default(),
        };
        if unchanged {
            return Ok(());
        }
        let body = toml::to_string_pretty(&self.config).context("failed to encode config")?;
        if let Some(parent) = self.path.parent() {
            create_private_dir(parent)?;
        }
        fs::write(&self.path, body)
            .with_context(|| format!("failed to write config {}", self.path))?;
        restrict_file(&self.path)?;
        self.on_disk = Some(self.config.clone());
        debug!(path = %self.path, "config saved");
        Ok(())
    }
}

#[cfg(unix)]
fn create_private_dir(dir: &Utf8Path) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    if dir.as_str().is_empty() || dir.exists() {
        return Ok(());
    }
    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
        .with_context(|| format!("failed to create {dir}"))
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Utf8Path) -> Result<()> {
    if dir.as_str().is_empty() {
        return Ok(());
    }
    fs::create_dir_all(dir).with_context(|| format!("failed to create {dir}"))
}

#[cfg(unix)]
fn restrict_file(path: &Utf8Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .with_context(|| format!("failed to restrict permissions on {path}"))
}

#[cfg(not(unix))]
fn restrict_file(_path: &Utf8Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn project(name: &str, url: &str) -> ProjectConfig {
        ProjectConfig {
            name: name.into(),
            url: url.into(),
            api_key: "APIabc".into(),
            api_secret: "secret-value".into(),
            project_id: None,
        }
    }

    fn store_in(dir: &tempfile::TempDir) -> ConfigStore {
        let path = Utf8PathBuf::from_path_buf(dir.path().join("nested/cli-config.toml"))
            .expect("utf8 path");
        ConfigStore::load_or_create(path).unwrap()
    }

    #[test]
    fn missing_file_loads_empty_without_writing() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);
        assert!(store.list().is_empty());
        assert!(!store.path().exists());
    }

    #[test]
    fn add_then_reload_preserves_projects_and_default() {
        let dir = tempdir().unwrap();
        let mut store = store_in(&dir);
        store.add(project("acme", "wss://acme.livekit.cloud")).unwrap();
        store.add(project("dev-box", "http://localhost:7880")).unwrap();
        store.set_default("acme").unwrap();

        let reloaded = ConfigStore::load_or_create(store.path().to_owned()).unwrap();
        assert_eq!(reloaded.config(), store.config());
        assert_eq!(reloaded.default_project().unwrap().name, "acme");

        let raw = fs::read_to_string(store.path()).unwrap();
        assert!(raw.starts_with("default_project"));
    }

    #[test]
    fn duplicate_and_invalid_names_are_rejected() {
        let dir = tempdir().unwrap();
        let mut store = store_in(&dir);
        store.add(project("acme", "wss://acme.livekit.cloud")).unwrap();
        let dup = store
            .add(project("acme", "wss://other.livekit.cloud"))
            .unwrap_err();
        assert!(matches!(
            dup.downcast_ref::<CliError>(),
            Some(CliError::Conflict(_))
        ));
        assert!(store.add(project("has space", "wss://x.io")).is_err());
        assert!(store.add(project("ftp", "ftp://x.io")).is_err());
    }

    #[test]
    fn remove_clears_default_and_ignores_unknown() {
        let dir = tempdir().unwrap();
        let mut store = store_in(&dir);
        store.add(project("acme", "wss://acme.livekit.cloud")).unwrap();
        store.set_default("acme").unwrap();
        assert!(!store.remove("ghost").unwrap());
        assert!(store.remove("acme").unwrap());
        assert!(store.config().default_project.is_none());
    }

    #[test]
    fn set_default_requires_known_project() {
        let dir = tempdir().unwrap();
        let mut store = store_in(&dir);
        let err = store.set_default("nope").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CliError>(),
            Some(CliError::NotFound(_))
        ));
    }

    #[test]
    fn unchanged_state_is_not_rewritten() {
        let dir = tempdir().unwrap();
        let mut store = store_in(&dir);
        store.add(project("acme", "wss://acme.livekit.cloud")).unwrap();
        fs::write(store.path(), "# hand edited\n").unwrap();
        store.persist().unwrap();
        assert_eq!(fs::read_to_string(store.path()).unwrap(), "# hand edited\n");
    }

    #[test]
    fn subdomain_lookup_uses_first_label() {
        let dir = tempdir().unwrap();
        let mut store = store_in(&dir);
        store.add(project("acme", "wss://Acme.livekit.cloud")).unwrap();
        assert_eq!(store.find_by_subdomain("acme").unwrap().name, "acme");
        assert_eq!(subdomain_of("http://localhost:7880/x").as_deref(), Some("localhost"));
    }

    #[test]
    fn reauth_replaces_by_project_id() {
        let dir = tempdir().unwrap();
        let mut store = store_in(&dir);
        let mut first = project("acme", "wss://acme.livekit.cloud");
        first.project_id = Some("p_123".into());
        store.add(first.clone()).unwrap();
        store.set_default("acme").unwrap();

        let mut second = first;
        second.name = "acme-renamed".into();
        second.api_key = "APInew".into();
        store.upsert_by_project_id(second).unwrap();
        assert_eq!(store.list().len(), 1);
        assert_eq!(store.default_project().unwrap().api_key, "APInew");
    }

    #[cfg(unix)]
    #[test]
    fn config_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let mut store = store_in(&dir);
        store.add(project("acme", "wss://acme.livekit.cloud")).unwrap();
        let mode = fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
