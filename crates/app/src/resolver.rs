use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use crate::config::{ConfigStore, ProjectConfig, ProjectFile};
use crate::error::CliError;
use crate::prompt::{Outcome, Prompter};
use crate::settings::EnvCredentials;

pub const DEV_API_KEY: &str = "devkey";
pub const DEV_API_SECRET: &str = "secret";
pub const DEV_URL: &str = "http://localhost:7880";

/// Credential-related global flags.
#[derive(Debug, Clone, Default)]
pub struct ProjectFlags {
    pub project: Option<String>,
    pub subdomain: Option<String>,
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub dev: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectSource {
    NamedProject,
    Subdomain,
    Explicit,
    Dev,
    ProjectFile,
    Default,
    Selected,
}

/// The effective project for one command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectContext {
    pub name: Option<String>,
    pub url: String,
    pub api_key: String,
    pub api_secret: String,
    pub project_id: Option<String>,
    pub source: ProjectSource,
}

impl ProjectContext {
    fn from_project(project: &ProjectConfig, source: ProjectSource) -> Self {
        Self {
            name: Some(project.name.clone()),
            url: project.url.clone(),
            api_key: project.api_key.clone(),
            api_secret: project.api_secret.clone(),
            project_id: project.project_id.clone(),
            source,
        }
    }

    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.url)
    }
}

pub struct Resolver<'a> {
    pub store: &'a ConfigStore,
    pub flags: &'a ProjectFlags,
    pub env: &'a EnvCredentials,
    pub working_dir: &'a Path,
    pub prompter: &'a dyn Prompter,
}

#[derive(Debug, Default)]
struct Explicit {
    url: Option<String>,
    api_key: Option<String>,
    api_secret: Option<String>,
}

impl Explicit {
    fn is_empty(&self) -> bool {
        self.url.is_none() && self.api_key.is_none() && self.api_secret.is_none()
    }

    fn missing(&self, require_url: bool) -> Vec<String> {
        let mut missing = Vec::new();
        if require_url && self.url.is_none() {
            missing.push("url (--url or LIVEKIT_URL)".to_string());
        }
        if self.api_key.is_none() {
            missing.push("api-key (--api-key or LIVEKIT_API_KEY)".to_string());
        }
        if self.api_secret.is_none() {
            missing.push("api-secret (--api-secret or LIVEKIT_API_SECRET)".to_string());
        }
        missing
    }

    /// Supplied fields win over whatever the lower-priority source found.
    fn overlay(&self, mut ctx: ProjectContext) -> ProjectContext {
        if let Some(url) = &self.url {
            ctx.url = url.clone();
        }
        if let Some(key) = &self.api_key {
            ctx.api_key = key.clone();
        }
        if let Some(secret) = &self.api_secret {
            ctx.api_secret = secret.clone();
        }
        ctx
    }
}

impl Resolver<'_> {
    fn explicit(&self) -> Explicit {
        let pick = |flag: &Option<String>, env: &Option<String>| {
            flag.clone()
                .filter(|v| !v.trim().is_empty())
                .or_else(|| env.clone())
        };
        Explicit {
            url: pick(&self.flags.url, &self.env.url),
            api_key: pick(&self.flags.api_key, &self.env.api_key),
            api_secret: pick(&self.flags.api_secret, &self.env.api_secret),
        }
    }

    pub fn resolve(&self, require_url: bool) -> Result<ProjectContext> {
        let flags = self.flags;
        if let Some(name) = &flags.project {
            if flags.dev {
                return Err(CliError::Input("--project cannot be combined with --dev".into()).into());
            }
            let project = self
                .store
                .get(name)
                .ok_or_else(|| CliError::NotFound(format!("project `{name}`")))?;
            debug!(project = %name, "using named project");
            return Ok(ProjectContext::from_project(project, ProjectSource::NamedProject));
        }

        if let Some(sub) = &flags.subdomain {
            let project = self
                .store
                .find_by_subdomain(sub)
                .ok_or_else(|| CliError::NotFound(format!("project with subdomain `{sub}`")))?;
            return Ok(ProjectContext::from_project(project, ProjectSource::Subdomain));
        }

        let explicit = self.explicit();
        if explicit.missing(require_url).is_empty() {
            return Ok(ProjectContext {
                name: None,
                url: explicit.url.clone().unwrap_or_default(),
                api_key: explicit.api_key.clone().unwrap_or_default(),
                api_secret: explicit.api_secret.clone().unwrap_or_default(),
                project_id: None,
                source: ProjectSource::Explicit,
            });
        }

        if flags.dev {
            let dev = ProjectContext {
                name: None,
                url: DEV_URL.into(),
                api_key: DEV_API_KEY.into(),
                api_secret: DEV_API_SECRET.into(),
                project_id: None,
                source: ProjectSource::Dev,
            };
            return Ok(explicit.overlay(dev));
        }

        if let Some(file) = ProjectFile::load(self.working_dir).context("unable to read livekit.toml")?
            && !file.project.subdomain.is_empty()
            && let Some(project) = self.store.find_by_subdomain(&file.project.subdomain)
        {
            debug!(subdomain = %file.project.subdomain, "using project from livekit.toml");
            return Ok(explicit.overlay(ProjectContext::from_project(
                project,
                ProjectSource::ProjectFile,
            )));
        }

        if let Some(project) = self.store.default_project() {
            return Ok(explicit.overlay(ProjectContext::from_project(
                project,
                ProjectSource::Default,
            )));
        }

        if self.prompter.is_interactive() && explicit.is_empty() && !self.store.list().is_empty() {
            let names: Vec<String> = self.store.list().iter().map(|p| p.name.clone()).collect();
            return match self.prompter.select("Select a project", &names)? {
                Outcome::Value(idx) => Ok(ProjectContext::from_project(
                    &self.store.list()[idx],
                    ProjectSource::Selected,
                )),
                Outcome::Cancelled => Err(CliError::Cancelled.into()),
            };
        }

        Err(CliError::MissingCredentials {
            missing: explicit.missing(require_url),
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::{NonInteractive, ScriptedAnswer, ScriptedPrompter};
    use camino::Utf8PathBuf;
    use std::fs;
    use tempfile::{TempDir, tempdir};

    fn store_with(dir: &TempDir, default: Option<&str>) -> ConfigStore {
        let path = Utf8PathBuf::from_path_buf(dir.path().join("cli-config.toml")).unwrap();
        let mut store = ConfigStore::load_or_create(path).unwrap();
        for (name, url) in [
            ("acme", "wss://acme.livekit.cloud"),
            ("globex", "wss://globex.livekit.cloud"),
        ] {
            store
                .add(ProjectConfig {
                    name: name.into(),
                    url: url.into(),
                    api_key: format!("key-{name}"),
                    api_secret: format!("secret-{name}"),
                    project_id: None,
                })
                .unwrap();
        }
        if let Some(name) = default {
            store.set_default(name).unwrap();
        }
        store
    }

    fn resolve_with(
        store: &ConfigStore,
        flags: &ProjectFlags,
        env: &EnvCredentials,
        dir: &Path,
        prompter: &dyn Prompter,
    ) -> Result<ProjectContext> {
        Resolver {
            store,
            flags,
            env,
            working_dir: dir,
            prompter,
        }
        .resolve(true)
    }

    #[test]
    fn named_project_wins_and_rejects_dev() {
        let dir = tempdir().unwrap();
        let store = store_with(&dir, Some("globex"));
        let mut flags = ProjectFlags {
            project: Some("acme".into()),
            ..ProjectFlags::default()
        };
        let env = EnvCredentials::default();
        let ctx = resolve_with(&store, &flags, &env, dir.path(), &NonInteractive).unwrap();
        assert_eq!(ctx.api_key, "key-acme");
        assert_eq!(ctx.source, ProjectSource::NamedProject);

        flags.dev = true;
        assert!(resolve_with(&store, &flags, &env, dir.path(), &NonInteractive).is_err());
    }

    #[test]
    fn env_credentials_beat_default_project() {
        let dir = tempdir().unwrap();
        let store = store_with(&dir, Some("acme"));
        let env = EnvCredentials {
            url: Some("ws://env.example".into()),
            api_key: Some("env-key".into()),
            api_secret: Some("env-secret".into()),
        };
        let ctx =
            resolve_with(&store, &ProjectFlags::default(), &env, dir.path(), &NonInteractive)
                .unwrap();
        assert_eq!(ctx.source, ProjectSource::Explicit);
        assert_eq!(ctx.url, "ws://env.example");
    }

    #[test]
    fn url_optional_when_not_required() {
        let dir = tempdir().unwrap();
        let store = store_with(&dir, None);
        let flags = ProjectFlags {
            api_key: Some("k".into()),
            api_secret: Some("s".into()),
            ..ProjectFlags::default()
        };
        let env = EnvCredentials::default();
        let resolver = Resolver {
            store: &store,
            flags: &flags,
            env: &env,
            working_dir: dir.path(),
            prompter: &NonInteractive,
        };
        let ctx = resolver.resolve(false).unwrap();
        assert!(ctx.url.is_empty());
        assert!(resolver.resolve(true).is_err());
    }

    #[test]
    fn dev_mode_uses_local_server() {
        let dir = tempdir().unwrap();
        let store = store_with(&dir, Some("acme"));
        let flags = ProjectFlags {
            dev: true,
            ..ProjectFlags::default()
        };
        let ctx = resolve_with(
            &store,
            &flags,
            &EnvCredentials::default(),
            dir.path(),
            &NonInteractive,
        )
        .unwrap();
        assert_eq!(ctx.url, DEV_URL);
        assert_eq!(ctx.api_key, DEV_API_KEY);
    }

    #[test]
    fn project_file_beats_default_and_partial_flags_overlay() {
        let dir = tempdir().unwrap();
        let store = store_with(&dir, Some("acme"));
        fs::write(
            dir.path().join("livekit.toml"),
            "[project]\nsubdomain = \"globex\"\n",
        )
        .unwrap();
        let flags = ProjectFlags {
            url: Some("http://localhost:9999".into()),
            ..ProjectFlags::default()
        };
        let ctx = resolve_with(
            &store,
            &flags,
            &EnvCredentials::default(),
            dir.path(),
            &NonInteractive,
        )
        .unwrap();
        assert_eq!(ctx.source, ProjectSource::ProjectFile);
        assert_eq!(ctx.api_key, "key-globex");
        assert_eq!(ctx.url, "http://localhost:9999");
    }

    #[test]
    fn nothing_configured_lists_missing_fields() {
        let dir = tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("empty.toml")).unwrap();
        let store = ConfigStore::load_or_create(path).unwrap();
        let flags = ProjectFlags {
            api_key: Some("only-key".into()),
            ..ProjectFlags::default()
        };
        let err = resolve_with(
            &store,
            &flags,
            &EnvCredentials::default(),
            dir.path(),
            &NonInteractive,
        )
        .unwrap_err();
        match err.downcast_ref::<CliError>() {
            Some(CliError::MissingCredentials { missing }) => {
                assert_eq!(missing.len(), 2);
                assert!(missing[0].starts_with("url"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn interactive_falls_back_to_selection() {
        let dir = tempdir().unwrap();
        let store = store_with(&dir, None);
        let prompter = ScriptedPrompter::new([ScriptedAnswer::Choice(1)]);
        let ctx = resolve_with(
            &store,
            &ProjectFlags::default(),
            &EnvCredentials::default(),
            dir.path(),
            &prompter,
        )
        .unwrap();
        assert_eq!(ctx.name.as_deref(), Some("globex"));
        assert_eq!(ctx.source, ProjectSource::Selected);
    }
}
