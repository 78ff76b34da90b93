//! Agent lifecycle: create, deploy, update, rollback, delete, and the
//! read-only views around them.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use super::dockerfile::{self, DockerfileStatus, TemplateSettings};
use super::logs::{self, LogStreamer, Phase, StreamOutcome};
use super::secrets::{self, API_KEY_SECRET, API_SECRET_SECRET, SecretLayers};
use super::source::{self, ProjectType, SdkCheck};
use super::tarball::{Archive, Uploader};
use crate::cancel::Shutdown;
use crate::config::{AgentSection, ProjectFile, ProjectSection, subdomain_of, validate_name};
use crate::error::CliError;
use crate::fanout::map_blocking;
use crate::output::Table;
use crate::prompt::{PromptSpec, Prompter, resolve};
use crate::resolver::ProjectContext;
use crate::retry::RetryPolicy;
use crate::services::agent::{
    AgentClient, AgentInfo, AgentVersion, CreateAgentRequest, CreatePrivateLinkRequest,
    PrivateLink, PrivateLinkHealth, UpdateAgentRequest,
};
use crate::services::{Grants, build_agent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployState {
    Absent,
    AwaitingUpload,
    Building,
    Deployed,
    FailedBuild,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployEvent {
    Create,
    UploadOk,
    BuildSucceeded,
    BuildFailed,
    Deploy,
    Update,
    Rollback,
    Delete,
}

impl fmt::Display for DeployState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Absent => "absent",
            Self::AwaitingUpload => "awaiting upload",
            Self::Building => "building",
            Self::Deployed => "deployed",
            Self::FailedBuild => "build failed",
        })
    }
}

impl DeployState {
    /// The pipeline's transition table. `Delete` is accepted from anywhere.
    pub fn next(self, event: DeployEvent) -> Result<Self, CliError> {
        use DeployEvent as E;
        use DeployState as S;
        let next = match (self, event) {
            (_, E::Delete) => S::Absent,
            (S::Absent, E::Create) => S::AwaitingUpload,
            (S::AwaitingUpload, E::UploadOk) => S::Building,
            (S::Building, E::BuildSucceeded) => S::Deployed,
            (S::Building, E::BuildFailed) => S::FailedBuild,
            (S::Deployed | S::FailedBuild, E::Deploy) => S::AwaitingUpload,
            (S::Deployed, E::Update | E::Rollback) => S::Deployed,
            (state, event) => {
                return Err(CliError::Fatal(format!(
                    "cannot apply {event:?} while agent is {state}"
                )));
            }
        };
        debug!(from = %self, to = %next, ?event, "agent state transition");
        Ok(next)
    }
}

/// Inputs of `agent create` after flag parsing.
#[derive(Debug, Clone, Default)]
pub struct CreateParams {
    pub name: Option<String>,
    pub regions: Vec<String>,
    pub secrets: Vec<(String, String)>,
    pub secrets_file: Option<PathBuf>,
    pub overwrite_dockerfile: bool,
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployedAgent {
    pub agent_id: String,
    pub name: String,
    pub version: String,
}

/// Drives one agent source directory through the pipeline.
pub struct Orchestrator<'a> {
    client: AgentClient,
    project: &'a ProjectContext,
    dir: PathBuf,
    prompter: &'a dyn Prompter,
    shutdown: Shutdown,
    policy: RetryPolicy,
    state: DeployState,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        client: AgentClient,
        project: &'a ProjectContext,
        dir: impl Into<PathBuf>,
        prompter: &'a dyn Prompter,
        shutdown: Shutdown,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            client,
            project,
            dir: dir.into(),
            prompter,
            shutdown,
            policy,
            state: DeployState::Absent,
        }
    }

    pub fn state(&self) -> DeployState {
        self.state
    }

    pub fn client(&self) -> &AgentClient {
        &self.client
    }

    fn advance(&mut self, event: DeployEvent) -> Result<(), CliError> {
        self.state = self.state.next(event)?;
        Ok(())
    }

    fn project_file(&self) -> Result<Option<ProjectFile>> {
        ProjectFile::load(&self.dir)
    }

    /// The project file of an agent that has been created already.
    pub fn bound_agent(&self) -> Result<(ProjectFile, AgentSection, String)> {
        let file = self.project_file()?.ok_or_else(|| {
            CliError::Config(format!(
                "no {} in {}; run `lk agent create` or `lk agent config` first",
                crate::config::project_file::PROJECT_FILE_NAME,
                self.dir.display()
            ))
        })?;
        let agent = file
            .agent
            .clone()
            .ok_or_else(|| CliError::Config("project file has no [agent] section".into()))?;
        let id = agent
            .id
            .clone()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| CliError::Config("agent has not been created yet (no id)".into()))?;
        agent.validate()?;
        Ok((file, agent, id))
    }

    /// Detects the project type and checks the SDK against the server minimum.
    pub fn analyze_source(&self, params: &BTreeMap<String, String>) -> Result<ProjectType> {
        let project_type = source::detect(&self.dir);
        if project_type == ProjectType::Unknown {
            return Err(CliError::Config(format!(
                "unable to detect a Python or Node project in {}",
                self.dir.display()
            ))
            .into());
        }
        let package = project_type.sdk_package().unwrap_or_default();
        match source::check_sdk(&self.dir, project_type, params) {
            SdkCheck::Satisfied { observed, file } => {
                info!(%project_type, %observed, %file, "sdk version ok");
            }
            SdkCheck::TooOld {
                observed,
                minimum,
                file,
            } => {
                return Err(CliError::Config(format!(
                    "{package} {observed} (from {file}) is older than the minimum supported version {minimum}"
                ))
                .into());
            }
            SdkCheck::NotFound => {
                return Err(CliError::Config(format!(
                    "{package} is not listed in the project dependencies"
                ))
                .into());
            }
            SdkCheck::Unresolved(reason) => {
                warn!(%reason, "could not verify the {package} version");
            }
        }
        Ok(project_type)
    }

    /// Keeps a valid user Dockerfile, otherwise generates one on confirmation.
    pub fn ensure_dockerfile(
        &self,
        project_type: ProjectType,
        settings: &TemplateSettings,
        overwrite: bool,
    ) -> Result<DockerfileStatus> {
        let exists = dockerfile::exists_in(&self.dir);
        if exists && !overwrite {
            return dockerfile::check_existing(&self.dir);
        }
        if !exists {
            let answer = self
                .prompter
                .confirm("No Dockerfile found. Generate one?", true)?
                .or_cancelled()?;
            if !answer {
                return Err(CliError::Config(
                    "a Dockerfile is required to deploy an agent".into(),
                )
                .into());
            }
        }
        dockerfile::generate(&self.dir, project_type, settings, overwrite)
    }

    /// Secrets from the optional dotenv file (user may pick a subset) and
    /// `--secrets` pairs, with the pairs taking precedence.
    pub fn collect_secrets(
        &self,
        pairs: &[(String, String)],
        file: Option<&Path>,
    ) -> Result<BTreeMap<String, String>> {
        let mut layers = SecretLayers {
            cli: pairs.to_vec(),
            ..SecretLayers::default()
        };
        if let Some(path) = file {
            let entries = secrets::load_dotenv(path)?;
            layers.file = if self.prompter.is_interactive() && !entries.is_empty() {
                let names: Vec<String> = entries.iter().map(|(k, _)| k.clone()).collect();
                let picked = self
                    .prompter
                    .multi_select("Secrets to include", &names)?
                    .or_cancelled()?;
                picked
                    .into_iter()
                    .filter_map(|idx| entries.get(idx).cloned())
                    .collect()
            } else {
                entries
            };
        }
        let mut merged = layers.merge();

        let check = secrets::check_required(&[API_KEY_SECRET, API_SECRET_SECRET], &merged);
        if !check.missing.is_empty() {
            warn!(missing = ?check.missing, "agent secrets lack project credentials");
            let inject = self
                .prompter
                .confirm(
                    &format!(
                        "{} not set. Use the credentials of project {}?",
                        check.missing.join(" and "),
                        self.project.label()
                    ),
                    true,
                )?
                .or_cancelled()?;
            if inject {
                secrets::inject_project_credentials(&mut merged, self.project);
            }
        }
        Ok(merged)
    }

    fn agent_name(&self, params: &CreateParams, existing: Option<&AgentSection>) -> Result<String> {
        let fallback = self
            .dir
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| {
                n.chars()
                    .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
                    .collect::<String>()
            })
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "agent".to_string());
        let flag = params
            .name
            .as_deref()
            .or(existing.map(|a| a.name.as_str()));
        let spec = PromptSpec::new("Agent name", "--name").with_default(fallback);
        let name = resolve(flag, None, &spec, self.prompter)?.or_cancelled()?;
        validate_name("agent name", &name)?;
        Ok(name)
    }

    /// `agent create`: register the agent, upload the source, build it and
    /// follow the logs until deployed.
    pub fn create(&mut self, params: &CreateParams, out: &mut dyn Write) -> Result<DeployedAgent> {
        let file = self.project_file()?;
        if let Some(id) = file.as_ref().and_then(ProjectFile::agent_id) {
            return Err(CliError::Conflict(format!(
                "agent {id} in {}; use `lk agent deploy`",
                crate::config::project_file::PROJECT_FILE_NAME
            ))
            .into());
        }
        let existing = file.as_ref().and_then(|f| f.agent.clone());
        let name = self.agent_name(params, existing.as_ref())?;
        let mut section = existing.unwrap_or_else(|| AgentSection::new(&name));
        section.name = name.clone();
        if !params.regions.is_empty() {
            section.regions = params.regions.clone();
        }
        section.validate()?;

        let secrets = self.collect_secrets(&params.secrets, params.secrets_file.as_deref())?;
        let client_settings = self
            .client
            .client_settings()
            .context("unable to fetch agent settings")?;
        let project_type = self.analyze_source(&client_settings)?;
        self.ensure_dockerfile(
            project_type,
            &TemplateSettings::from_client_settings(&client_settings),
            params.overwrite_dockerfile,
        )?;
        self.shutdown.check()?;

        let request = CreateAgentRequest {
            agent_name: name.clone(),
            secrets: secrets::to_agent_secrets(&secrets),
            replicas: section.replicas,
            max_replicas: section.max_replicas,
            cpu_req: section.cpu.clone(),
            regions: section.regions.clone(),
        };
        let created = self
            .client
            .create(&request)
            .context("unable to create agent")?;
        self.advance(DeployEvent::Create)?;
        info!(agent_id = %created.agent_id, %name, "agent created");

        // Persist the id before uploading so a failed upload can resume with `deploy`.
        section.id = Some(created.agent_id.clone());
        let subdomain = file
            .as_ref()
            .map(|f| f.project.subdomain.clone())
            .or_else(|| subdomain_of(&self.project.url))
            .unwrap_or_default();
        ProjectFile {
            project: ProjectSection { subdomain },
            agent: Some(section),
        }
        .save(&self.dir)?;

        self.upload_and_build(&created.agent_id, &created.presigned_url, &params.exclude, out)?;
        Ok(DeployedAgent {
            agent_id: created.agent_id,
            name,
            version: created.version,
        })
    }

    /// `agent deploy`: rebuild an existing agent from the current source.
    pub fn deploy(&mut self, exclude: &[String], out: &mut dyn Write) -> Result<DeployedAgent> {
        let (_, section, agent_id) = self.bound_agent()?;
        let client_settings = self
            .client
            .client_settings()
            .context("unable to fetch agent settings")?;
        let project_type = self.analyze_source(&client_settings)?;
        self.ensure_dockerfile(
            project_type,
            &TemplateSettings::from_client_settings(&client_settings),
            false,
        )?;
        self.state = DeployState::Deployed;
        let deployed = self
            .client
            .deploy(&agent_id)
            .context("unable to deploy agent")?;
        self.advance(DeployEvent::Deploy)?;
        self.upload_and_build(&agent_id, &deployed.presigned_url, exclude, out)?;
        Ok(DeployedAgent {
            agent_id,
            name: section.name,
            version: deployed.version,
        })
    }

    fn upload_and_build(
        &mut self,
        agent_id: &str,
        presigned_url: &str,
        exclude: &[String],
        out: &mut dyn Write,
    ) -> Result<()> {
        let archive = Archive::collect(&self.dir, exclude)?;
        let uploader = Uploader::new(
            build_agent(crate::services::DEFAULT_TIMEOUT * 5),
            self.policy,
            self.shutdown.clone(),
        );
        uploader
            .upload(&archive, presigned_url)
            .context("unable to upload agent source")?;
        self.advance(DeployEvent::UploadOk)?;

        self.client
            .build(agent_id)
            .context("unable to start agent build")?;
        match self.follow_logs(agent_id, Phase::Build, out)? {
            StreamOutcome::Failed(message) => {
                self.advance(DeployEvent::BuildFailed)?;
                return Err(CliError::Fatal(format!("build failed: {message}")).into());
            }
            StreamOutcome::Closed => warn!("build log stream closed without a result"),
            StreamOutcome::Succeeded => {}
        }
        self.advance(DeployEvent::BuildSucceeded)?;
        Ok(())
    }

    /// Attach to one phase's log stream and render it until it ends.
    pub fn follow_logs(
        &self,
        agent_id: &str,
        phase: Phase,
        out: &mut dyn Write,
    ) -> Result<StreamOutcome> {
        let url = self.client.log_stream_url(agent_id, phase.as_str());
        let bearer = self.client.twirp().bearer(&Grants::room_create())?;
        let streamer = LogStreamer::new(self.policy);
        let source = streamer
            .attach(&url, &bearer)
            .with_context(|| format!("unable to attach to {} logs", phase.as_str()))?;
        Ok(logs::follow(source, out, &self.shutdown)?)
    }

    /// `agent update`: push replica/CPU/region settings and any given
    /// secrets. Nothing is uploaded or built.
    pub fn update(&mut self, secrets: &BTreeMap<String, String>) -> Result<AgentSection> {
        let (_, section, agent_id) = self.bound_agent()?;
        self.state = DeployState::Deployed;
        self.client
            .update(&UpdateAgentRequest {
                agent_id,
                secrets: secrets::to_agent_secrets(secrets),
                replicas: section.replicas,
                max_replicas: section.max_replicas,
                cpu_req: section.cpu.clone(),
                regions: section.regions.clone(),
            })
            .context("unable to update agent")?;
        self.advance(DeployEvent::Update)?;
        Ok(section)
    }

    /// `agent rollback`: the version string goes to the service untouched.
    pub fn rollback(&mut self, version: &str) -> Result<String> {
        let (_, section, agent_id) = self.bound_agent()?;
        self.state = DeployState::Deployed;
        self.client
            .rollback(&agent_id, version)
            .context("unable to rollback agent")?;
        self.advance(DeployEvent::Rollback)?;
        Ok(format!("Rolled back agent [{}] to version {version}", section.name))
    }

    /// `agent delete`: needs confirmation unless `assume_yes`.
    pub fn delete(&mut self, assume_yes: bool) -> Result<Option<String>> {
        let (mut file, section, agent_id) = self.bound_agent()?;
        if !assume_yes {
            let confirmed = self
                .prompter
                .confirm(&format!("Delete agent {} ({agent_id})?", section.name), false)?
                .or_cancelled()?;
            if !confirmed {
                return Ok(None);
            }
        }
        self.client
            .delete(&agent_id)
            .context("unable to delete agent")?;
        self.advance(DeployEvent::Delete)?;
        file.agent = None;
        file.save(&self.dir)?;
        Ok(Some(agent_id))
    }

    /// `agent config`: write the project file for an agent that already
    /// exists remotely.
    pub fn write_config(&self, agent_id: &str, overwrite: bool) -> Result<ProjectFile> {
        if ProjectFile::exists_in(&self.dir) && !overwrite {
            return Err(CliError::Conflict(
                crate::config::project_file::PROJECT_FILE_NAME.to_string(),
            )
            .into());
        }
        let info = self
            .client
            .list(Some(agent_id))
            .context("unable to fetch agent")?
            .into_iter()
            .find(|a| a.agent_id == agent_id)
            .ok_or_else(|| CliError::NotFound(format!("agent {agent_id}")))?;
        let mut section = AgentSection::new(&info.agent_name);
        section.id = Some(info.agent_id.clone());
        if let Some(dep) = info.agent_deployments.first() {
            section.replicas = dep.min_replicas.max(dep.replicas).max(1);
            section.max_replicas = dep.max_replicas.max(section.replicas);
            if !dep.cpu_req.is_empty() {
                section.cpu = dep.cpu_req.clone();
            }
        }
        section.regions = info
            .agent_deployments
            .iter()
            .map(|d| d.region.clone())
            .filter(|r| !r.is_empty())
            .collect();
        section.validate()?;
        let file = ProjectFile {
            project: ProjectSection {
                subdomain: subdomain_of(&self.project.url).unwrap_or_default(),
            },
            agent: Some(section),
        };
        file.save(&self.dir)?;
        Ok(file)
    }
}

/// One row per regional deployment.
pub fn status_table(agents: &[AgentInfo]) -> Table {
    let mut table = Table::new([
        "ID",
        "Version",
        "Region",
        "Status",
        "CPU",
        "Mem",
        "Replicas",
        "Deployed At",
    ]);
    for agent in agents {
        if agent.agent_deployments.is_empty() {
            table.row([
                agent.agent_id.as_str(),
                agent.version.as_str(),
                "-",
                "-",
                "-",
                "-",
                "-",
                agent.deployed_at.as_str(),
            ]);
        }
        for dep in &agent.agent_deployments {
            table.row([
                agent.agent_id.clone(),
                agent.version.clone(),
                dep.region.clone(),
                dep.status.clone(),
                format!("{} / {}", or_dash(&dep.cur_cpu), or_dash(&dep.cpu_req)),
                format!("{} / {}", or_dash(&dep.cur_mem), or_dash(&dep.mem_req)),
                format!("{} / {}", dep.replicas, dep.max_replicas),
                agent.deployed_at.clone(),
            ]);
        }
    }
    table
}

fn or_dash(value: &str) -> &str {
    if value.is_empty() { "-" } else { value }
}

pub fn versions_table(versions: &[AgentVersion]) -> Table {
    let mut table = Table::new(["Version", "Current", "Created At", "Deployed At"]);
    for v in versions {
        table.row([
            v.version.as_str(),
            crate::output::yes_no(v.current),
            v.created_at.as_str(),
            v.deployed_at.as_str(),
        ]);
    }
    table
}

/// A private link and the outcome of its health query.
#[derive(Debug, Clone)]
pub struct PrivateLinkRow {
    pub link: PrivateLink,
    pub health: Result<PrivateLinkHealth, String>,
}

/// Message to show for a failed call: the service's own text when there
/// is one.
fn error_message(err: &anyhow::Error) -> String {
    match err.chain().find_map(|c| c.downcast_ref::<CliError>()) {
        Some(CliError::Protocol { message, .. }) if !message.is_empty() => message.clone(),
        Some(other) => other.to_string(),
        None => err.to_string(),
    }
}

/// Lists private links and queries every link's health concurrently. A
/// failed health query only affects its own row.
pub async fn private_links_with_health(client: &AgentClient) -> Result<Vec<PrivateLinkRow>> {
    let links = client
        .list_private_links()
        .context("unable to list private links")?;
    let health_client = client.clone();
    let results = map_blocking(links.clone(), move |link: PrivateLink| {
        health_client
            .private_link_health(&link.private_link_id)
            .map_err(anyhow::Error::from)
    })
    .await;
    Ok(links
        .into_iter()
        .zip(results)
        .map(|(link, health)| {
            if let Err(err) = &health {
                warn!(link = %link.private_link_id, error = %err, "health query failed");
            }
            PrivateLinkRow {
                link,
                health: health.map_err(|err| error_message(&err)),
            }
        })
        .collect())
}

pub fn private_link_table(rows: &[PrivateLinkRow]) -> Table {
    let mut table = Table::new(["ID", "Name", "Region", "Port", "Endpoint", "Health", "Updated At"]);
    for row in rows {
        let (health, updated) = match &row.health {
            Ok(h) => (or_dash(&h.status).to_string(), or_dash(&h.updated_at).to_string()),
            Err(message) => ("ERROR".to_string(), message.clone()),
        };
        table.row([
            row.link.private_link_id.clone(),
            row.link.name.clone(),
            row.link.region.clone(),
            row.link.port.to_string(),
            row.link.endpoint.clone(),
            health,
            updated,
        ]);
    }
    table
}

pub fn create_private_link(
    client: &AgentClient,
    request: &CreatePrivateLinkRequest,
) -> Result<PrivateLink> {
    validate_name("private link name", &request.name)?;
    if request.port == 0 {
        return Err(CliError::Input("port must be between 1 and 65535".into()).into());
    }
    client
        .create_private_link(request)
        .context("unable to create private link")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::agent::AgentDeployment;

    #[test]
    fn transition_table() {
        use DeployEvent as E;
        use DeployState as S;
        let mut state = S::Absent;
        for event in [E::Create, E::UploadOk, E::BuildSucceeded, E::Update, E::Rollback] {
            state = state.next(event).unwrap();
        }
        assert_eq!(state, S::Deployed);
        assert_eq!(state.next(E::Deploy).unwrap(), S::AwaitingUpload);
        assert_eq!(S::Building.next(E::BuildFailed).unwrap(), S::FailedBuild);
        assert_eq!(S::FailedBuild.next(E::Delete).unwrap(), S::Absent);
        assert!(S::Absent.next(E::UploadOk).is_err());
        assert!(S::AwaitingUpload.next(E::Update).is_err());
        assert!(S::FailedBuild.next(E::Rollback).is_err());
    }

    #[test]
    fn status_rows_per_region() {
        let agent = AgentInfo {
            agent_id: "CA_1".into(),
            version: "v3".into(),
            deployed_at: "2026-01-01".into(),
            agent_deployments: vec![
                AgentDeployment {
                    region: "us-east".into(),
                    status: "Running".into(),
                    replicas: 2,
                    max_replicas: 4,
                    cpu_req: "1".into(),
                    cur_cpu: "0.4".into(),
                    ..AgentDeployment::default()
                },
                AgentDeployment {
                    region: "eu-central".into(),
                    status: "Pending".into(),
                    ..AgentDeployment::default()
                },
            ],
            ..AgentInfo::default()
        };
        let table = status_table(&[agent]);
        assert_eq!(table.rows().len(), 2);
        assert_eq!(table.rows()[0][4], "0.4 / 1");
        assert_eq!(table.rows()[0][6], "2 / 4");
        assert_eq!(table.rows()[1][4], "- / -");
    }

    #[test]
    fn failed_health_only_marks_its_row() {
        let link = |id: &str| PrivateLink {
            private_link_id: id.into(),
            name: format!("link-{id}"),
            region: "us-east".into(),
            port: 5432,
            endpoint: "svc".into(),
        };
        let rows = vec![
            PrivateLinkRow {
                link: link("PL_1"),
                health: Ok(PrivateLinkHealth {
                    status: "HEALTHY".into(),
                    updated_at: "t1".into(),
                }),
            },
            PrivateLinkRow {
                link: link("PL_2"),
                health: Err("endpoint unreachable".into()),
            },
        ];
        let table = private_link_table(&rows);
        assert_eq!(table.rows()[0][5], "HEALTHY");
        assert_eq!(table.rows()[1][5], "ERROR");
        assert_eq!(table.rows()[1][6], "endpoint unreachable");
    }

    #[test]
    fn protocol_messages_are_unwrapped() {
        let err = anyhow::Error::from(CliError::protocol(500, "internal", "db down"))
            .context("unable to get health");
        assert_eq!(error_message(&err), "db down");
        assert_eq!(error_message(&anyhow::anyhow!("plain")), "plain");
    }
}
