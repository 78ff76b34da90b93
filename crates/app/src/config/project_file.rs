use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::CliError;

pub const PROJECT_FILE_NAME: &str = "livekit.toml";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectSection {
    pub subdomain: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSection {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default = "default_cpu")]
    pub cpu: String,
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    #[serde(default = "default_max_replicas")]
    pub max_replicas: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub regions: Vec<String>,
}

fn default_cpu() -> String {
    "1".into()
}

fn default_replicas() -> u32 {
    1
}

fn default_max_replicas() -> u32 {
    10
}

impl AgentSection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: None,
            cpu: default_cpu(),
            replicas: default_replicas(),
            max_replicas: default_max_replicas(),
            regions: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<(), CliError> {
        super::validate_name("agent", &self.name)?;
        if self.replicas > self.max_replicas {
            return Err(CliError::InvalidReplicaCount {
                replicas: self.replicas,
                max: self.max_replicas,
            });
        }
        let cpu_ok = self
            .cpu
            .parse::<f64>()
            .map(|v| v.is_finite() && v > 0.0)
            .unwrap_or(false);
        if !cpu_ok {
            return Err(CliError::Input(format!(
                "cpu reservation `{}` must be a positive number",
                self.cpu
            )));
        }
        Ok(())
    }
}

/// `livekit.toml` in a working directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectFile {
    #[serde(default)]
    pub project: ProjectSection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentSection>,
}

/// Early releases wrote a single flat table.
#[derive(Debug, Deserialize)]
struct LegacyProjectFile {
    subdomain: String,
    #[serde(default)]
    agent_name: Option<String>,
    #[serde(default)]
    agent_id: Option<String>,
    #[serde(default)]
    cpu: Option<String>,
    #[serde(default)]
    replicas: Option<u32>,
    #[serde(default)]
    max_replicas: Option<u32>,
    #[serde(default)]
    regions: Vec<String>,
}

impl From<LegacyProjectFile> for ProjectFile {
    fn from(legacy: LegacyProjectFile) -> Self {
        let agent = legacy
            .agent_name
            .or_else(|| legacy.agent_id.clone())
            .map(|name| AgentSection {
                name,
                id: legacy.agent_id,
                cpu: legacy.cpu.unwrap_or_else(default_cpu),
                replicas: legacy.replicas.unwrap_or_else(default_replicas),
                max_replicas: legacy.max_replicas.unwrap_or_else(default_max_replicas),
                regions: legacy.regions,
            });
        Self {
            project: ProjectSection {
                subdomain: legacy.subdomain,
            },
            agent,
        }
    }
}

impl ProjectFile {
    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join(PROJECT_FILE_NAME)
    }

    pub fn exists_in(dir: &Path) -> bool {
        Self::path_in(dir).is_file()
    }

    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = Self::path_in(dir);
        if !path.is_file() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&raw)
            .with_context(|| format!("invalid project file {}", path.display()))
            .map(Some)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let value: toml::Value = toml::from_str(raw).context("invalid TOML")?;
        let file = if value.get("project").is_some() || value.get("agent").is_some() {
            value.try_into::<ProjectFile>().context("unexpected project file layout")?
        } else {
            debug!("upgrading legacy flat project file");
            value
                .try_into::<LegacyProjectFile>()
                .context("unexpected legacy project file layout")?
                .into()
        };
        if let Some(agent) = &file.agent {
            agent.validate()?;
        }
        Ok(file)
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        if let Some(agent) = &self.agent {
            agent.validate()?;
        }
        let path = Self::path_in(dir);
        let body = toml::to_string_pretty(self).context("failed to encode project file")?;
        fs::write(&path, body).with_context(|| format!("failed to write {}", path.display()))
    }

    pub fn agent_id(&self) -> Option<&str> {
        self.agent.as_ref().and_then(|a| a.id.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn nested_layout_parses_with_defaults() {
        let file = ProjectFile::parse(
            "[project]\nsubdomain = \"acme\"\n\n[agent]\nname = \"support-bot\"\n",
        )
        .unwrap();
        let agent = file.agent.unwrap();
        assert_eq!(file.project.subdomain, "acme");
        assert_eq!(agent.cpu, "1");
        assert_eq!(agent.replicas, 1);
        assert!(agent.id.is_none());
    }

    #[test]
    fn replicas_above_max_are_rejected() {
        let err = ProjectFile::parse(
            "[project]\nsubdomain = \"acme\"\n[agent]\nname = \"a\"\nreplicas = 5\nmax_replicas = 2\n",
        )
        .unwrap_err();
        let cause = err.downcast_ref::<CliError>().expect("typed error");
        assert!(matches!(
            cause,
            CliError::InvalidReplicaCount {
                replicas: 5,
                max: 2
            }
        ));
    }

    #[test]
    fn legacy_file_upgrades_and_round_trips() {
        let dir = tempdir().unwrap();
        fs::write(
            ProjectFile::path_in(dir.path()),
            "subdomain = \"acme\"\nagent_id = \"CA_123\"\ncpu = \"0.5\"\n",
        )
        .unwrap();

        let legacy = ProjectFile::load(dir.path()).unwrap().unwrap();
        assert_eq!(legacy.agent_id(), Some("CA_123"));
        legacy.save(dir.path()).unwrap();

        let raw = fs::read_to_string(ProjectFile::path_in(dir.path())).unwrap();
        assert!(raw.contains("[project]"));
        assert!(raw.contains("[agent]"));
        let reread = ProjectFile::load(dir.path()).unwrap().unwrap();
        assert_eq!(reread, legacy);
    }

    #[test]
    fn bad_agent_name_fails_validation() {
        let mut agent = AgentSection::new("bad name");
        assert!(agent.validate().is_err());
        agent.name = "ok_name-1".into();
        agent.cpu = "zero".into();
        assert!(agent.validate().is_err());
    }
}
