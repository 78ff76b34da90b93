use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use tracing::warn;

use super::{CommandContext, parse_key_value};
use crate::agent::deploy::{
    self, CreateParams, Orchestrator, private_link_table, private_links_with_health,
    status_table, versions_table,
};
use crate::agent::dockerfile::{DockerfileStatus, TemplateSettings};
use crate::agent::logs::{Phase, StreamOutcome};
use crate::agent::secrets;
use crate::config::ProjectFile;
use crate::error::CliError;
use crate::output::{Table, print_json};
use crate::resolver::ProjectContext;
use crate::services::agent::{AgentClient, CreatePrivateLinkRequest};

#[derive(Subcommand, Debug)]
pub enum AgentCommand {
    /// Register a new agent and deploy the working directory
    Create(CreateArgs),
    /// Write livekit.toml for an agent that already exists
    Config(ConfigArgs),
    /// Build and deploy a new version of the agent
    Deploy(DeployArgs),
    /// Push replica, CPU and region settings from livekit.toml, plus secrets
    Update(UpdateArgs),
    /// Switch the agent to a previous version
    Rollback(RollbackArgs),
    /// Show the agent's regional deployments
    Status(IdArgs),
    /// Stream build or deploy logs
    Logs(LogsArgs),
    /// Delete the agent
    Delete(DeleteArgs),
    /// List the agent's versions
    Versions(IdArgs),
    /// List the project's agents
    List(ListArgs),
    /// List the names of the agent's secrets
    Secrets(IdArgs),
    /// Add or replace the agent's secrets
    UpdateSecrets(UpdateSecretsArgs),
    /// Generate or check the Dockerfile of the working directory
    Dockerfile(DockerfileArgs),
    /// Private network links
    PrivateLink {
        #[command(subcommand)]
        command: PrivateLinkCommand,
    },
}

#[derive(Args, Debug, Clone, Default)]
pub struct DirArgs {
    /// Agent source directory (defaults to the working directory)
    dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct SecretArgs {
    /// KEY=VALUE, may be repeated
    #[arg(long = "secrets", value_parser = parse_key_value)]
    secrets: Vec<(String, String)>,
    /// dotenv file with more secrets
    #[arg(long)]
    secrets_file: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    #[command(flatten)]
    dir: DirArgs,
    #[arg(long)]
    name: Option<String>,
    /// Deployment region, may be repeated
    #[arg(long = "region")]
    regions: Vec<String>,
    #[command(flatten)]
    secrets: SecretArgs,
    /// Regenerate the Dockerfile even if one exists
    #[arg(long)]
    overwrite_dockerfile: bool,
    /// Extra ignore patterns for the uploaded source
    #[arg(long)]
    exclude: Vec<String>,
    /// Do not follow the deploy logs after the build
    #[arg(long)]
    silent: bool,
}

#[derive(Args, Debug)]
pub struct UpdateArgs {
    #[command(flatten)]
    dir: DirArgs,
    #[command(flatten)]
    secrets: SecretArgs,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(flatten)]
    dir: DirArgs,
    #[arg(long)]
    id: String,
    /// Replace an existing livekit.toml
    #[arg(long)]
    overwrite: bool,
}

#[derive(Args, Debug)]
pub struct DeployArgs {
    #[command(flatten)]
    dir: DirArgs,
    #[arg(long)]
    exclude: Vec<String>,
    #[arg(long)]
    silent: bool,
}

#[derive(Args, Debug)]
pub struct RollbackArgs {
    #[command(flatten)]
    dir: DirArgs,
    /// Version to roll back to; `latest` is the one before the current
    #[arg(long, default_value = "latest")]
    version: String,
}

#[derive(Args, Debug)]
pub struct IdArgs {
    #[command(flatten)]
    dir: DirArgs,
    /// Agent id (defaults to the one in livekit.toml)
    #[arg(long)]
    id: Option<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
pub struct LogsArgs {
    #[command(flatten)]
    dir: DirArgs,
    #[arg(long)]
    id: Option<String>,
    /// build, deploy or update
    #[arg(long, default_value = "deploy")]
    phase: Phase,
}

#[derive(Args, Debug)]
pub struct DeleteArgs {
    #[command(flatten)]
    dir: DirArgs,
    /// Skip the confirmation
    #[arg(short, long)]
    yes: bool,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    #[arg(long)]
    id: Option<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
pub struct UpdateSecretsArgs {
    #[command(flatten)]
    dir: DirArgs,
    #[arg(long)]
    id: Option<String>,
    #[command(flatten)]
    secrets: SecretArgs,
    /// Replace all secrets instead of merging
    #[arg(long)]
    overwrite: bool,
}

#[derive(Args, Debug)]
pub struct DockerfileArgs {
    #[command(flatten)]
    dir: DirArgs,
    #[arg(long)]
    overwrite: bool,
}

#[derive(Subcommand, Debug)]
pub enum PrivateLinkCommand {
    /// Create a private link to an endpoint in your network
    Create(PrivateLinkCreateArgs),
    /// List private links with their health
    List(JsonArg),
    /// Delete a private link
    Delete(LinkIdArg),
    /// Show one private link's health
    HealthStatus(LinkIdArg),
}

#[derive(Args, Debug)]
pub struct PrivateLinkCreateArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    region: String,
    #[arg(long)]
    port: u32,
    #[arg(long)]
    endpoint: String,
}

#[derive(Args, Debug)]
pub struct LinkIdArg {
    #[arg(long)]
    id: String,
}

#[derive(Args, Debug)]
pub struct JsonArg {
    #[arg(long)]
    json: bool,
}

struct AgentCtx<'a> {
    ctx: &'a CommandContext,
    project: ProjectContext,
    client: AgentClient,
}

impl<'a> AgentCtx<'a> {
    fn new(ctx: &'a CommandContext) -> Result<Self> {
        let (project, twirp) = ctx.connect()?;
        Ok(Self {
            ctx,
            project,
            client: AgentClient::new(twirp),
        })
    }

    fn dir(&self, args: &DirArgs) -> PathBuf {
        match &args.dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => self.ctx.working_dir.join(dir),
            None => self.ctx.working_dir.clone(),
        }
    }

    fn orchestrator(&self, dir: PathBuf) -> Orchestrator<'_> {
        Orchestrator::new(
            self.client.clone(),
            &self.project,
            dir,
            self.ctx.prompter.as_ref(),
            self.ctx.shutdown.clone(),
            self.ctx.retry_policy(),
        )
    }

    /// `--id` wins over the id bound in livekit.toml.
    fn agent_id(&self, id: Option<String>, dir: &Path) -> Result<String> {
        if let Some(id) = id.filter(|id| !id.is_empty()) {
            return Ok(id);
        }
        ProjectFile::load(dir)?
            .as_ref()
            .and_then(ProjectFile::agent_id)
            .map(str::to_string)
            .ok_or_else(|| {
                CliError::Input(format!(
                    "no agent id: pass --id or run from a directory with a created agent ({})",
                    dir.display()
                ))
                .into()
            })
    }
}

/// Agent commands block on HTTP, prompts and log streams, so they run on a
/// worker that tokio has moved its other tasks off.
pub async fn handle(ctx: &CommandContext, command: AgentCommand) -> Result<()> {
    tokio::task::block_in_place(|| {
        let agent = AgentCtx::new(ctx)?;
        dispatch(&agent, command)
    })
}

fn dispatch(agent: &AgentCtx<'_>, command: AgentCommand) -> Result<()> {
    let mut out = io::stdout();
    match command {
        AgentCommand::Create(args) => {
            let dir = agent.dir(&args.dir);
            let params = CreateParams {
                name: args.name,
                regions: args.regions,
                secrets: args.secrets.secrets,
                secrets_file: args.secrets.secrets_file,
                overwrite_dockerfile: args.overwrite_dockerfile,
                exclude: args.exclude,
            };
            let mut orchestrator = agent.orchestrator(dir);
            let created = orchestrator.create(&params, &mut out)?;
            println!(
                "Created agent [{}] with ID [{}], version {}",
                created.name, created.agent_id, created.version
            );
            if !args.silent {
                follow_deploy(&orchestrator, &created.agent_id, &mut out)?;
            }
            Ok(())
        }
        AgentCommand::Config(args) => {
            let dir = agent.dir(&args.dir);
            let file = agent
                .orchestrator(dir.clone())
                .write_config(&args.id, args.overwrite)?;
            let name = file.agent.map(|a| a.name).unwrap_or_default();
            println!(
                "Wrote {} for agent [{name}]",
                ProjectFile::path_in(&dir).display()
            );
            Ok(())
        }
        AgentCommand::Deploy(args) => {
            let mut orchestrator = agent.orchestrator(agent.dir(&args.dir));
            let deployed = orchestrator.deploy(&args.exclude, &mut out)?;
            println!(
                "Deployed agent [{}] version {}",
                deployed.name, deployed.version
            );
            if !args.silent {
                follow_deploy(&orchestrator, &deployed.agent_id, &mut out)?;
            }
            Ok(())
        }
        AgentCommand::Update(args) => {
            let merged = merge_secrets(&args.secrets)?;
            let section = agent.orchestrator(agent.dir(&args.dir)).update(&merged)?;
            println!("Updated agent [{}]", section.name);
            Ok(())
        }
        AgentCommand::Rollback(args) => {
            let message = agent
                .orchestrator(agent.dir(&args.dir))
                .rollback(&args.version)?;
            println!("{message}");
            Ok(())
        }
        AgentCommand::Status(args) => {
            let id = agent.agent_id(args.id, &agent.dir(&args.dir))?;
            let agents = agent
                .client
                .list(Some(&id))
                .context("unable to fetch agent status")?;
            if args.json {
                return print_json(&agents);
            }
            status_table(&agents).print();
            Ok(())
        }
        AgentCommand::Logs(args) => {
            let dir = agent.dir(&args.dir);
            let id = agent.agent_id(args.id, &dir)?;
            match agent.orchestrator(dir).follow_logs(&id, args.phase, &mut out)? {
                StreamOutcome::Failed(message) => {
                    Err(CliError::Fatal(format!("{} failed: {message}", args.phase.as_str())).into())
                }
                StreamOutcome::Succeeded | StreamOutcome::Closed => Ok(()),
            }
        }
        AgentCommand::Delete(args) => {
            match agent.orchestrator(agent.dir(&args.dir)).delete(args.yes)? {
                Some(id) => println!("Deleted agent {id}"),
                None => println!("Agent not deleted"),
            }
            Ok(())
        }
        AgentCommand::Versions(args) => {
            let id = agent.agent_id(args.id, &agent.dir(&args.dir))?;
            let versions = agent
                .client
                .versions(&id)
                .context("unable to list agent versions")?;
            if args.json {
                return print_json(&versions);
            }
            versions_table(&versions).print();
            Ok(())
        }
        AgentCommand::List(args) => {
            let agents = agent
                .client
                .list(args.id.as_deref())
                .context("unable to list agents")?;
            if args.json {
                return print_json(&agents);
            }
            let mut table = Table::new(["ID", "Name", "Version", "Regions", "Deployed At"]);
            for info in &agents {
                let regions: Vec<&str> = info
                    .agent_deployments
                    .iter()
                    .map(|d| d.region.as_str())
                    .collect();
                table.row([
                    info.agent_id.clone(),
                    info.agent_name.clone(),
                    info.version.clone(),
                    regions.join(","),
                    info.deployed_at.clone(),
                ]);
            }
            table.print();
            Ok(())
        }
        AgentCommand::Secrets(args) => {
            let id = agent.agent_id(args.id, &agent.dir(&args.dir))?;
            let names = agent
                .client
                .secrets(&id)
                .context("unable to list agent secrets")?;
            if args.json {
                return print_json(&names);
            }
            let mut table = Table::new(["Name"]);
            for name in names {
                table.row([name]);
            }
            table.print();
            Ok(())
        }
        AgentCommand::UpdateSecrets(args) => {
            let id = agent.agent_id(args.id, &agent.dir(&args.dir))?;
            let merged = merge_secrets(&args.secrets)?;
            if merged.is_empty() {
                return Err(CliError::Input(
                    "no secrets given; use --secrets or --secrets-file".into(),
                )
                .into());
            }
            agent
                .client
                .update_secrets(&id, &secrets::to_agent_secrets(&merged), args.overwrite)
                .context("unable to update agent secrets")?;
            println!("Updated {} secret(s) of agent {id}", merged.len());
            Ok(())
        }
        AgentCommand::Dockerfile(args) => {
            let orchestrator = agent.orchestrator(agent.dir(&args.dir));
            let client_settings = agent
                .client
                .client_settings()
                .context("unable to fetch agent settings")?;
            let project_type = orchestrator.analyze_source(&client_settings)?;
            let status = orchestrator.ensure_dockerfile(
                project_type,
                &TemplateSettings::from_client_settings(&client_settings),
                args.overwrite,
            )?;
            match status {
                DockerfileStatus::Existing { warnings } if warnings.is_empty() => {
                    println!("Dockerfile is valid for a {project_type} project");
                }
                DockerfileStatus::Existing { warnings } => {
                    println!("Dockerfile has {} warning(s)", warnings.len());
                }
                DockerfileStatus::Generated { path } => println!("Wrote {}", path.display()),
            }
            Ok(())
        }
        AgentCommand::PrivateLink { command } => {
            tokio::runtime::Handle::current().block_on(private_link(&agent.client, command))
        }
    }
}

/// Deploy logs after a finished build. A failed deploy is an error; a
/// stream that just ends is not.
fn follow_deploy(orchestrator: &Orchestrator<'_>, agent_id: &str, out: &mut io::Stdout) -> Result<()> {
    match orchestrator.follow_logs(agent_id, Phase::Deploy, out)? {
        StreamOutcome::Failed(message) => {
            Err(CliError::Fatal(format!("deploy failed: {message}")).into())
        }
        StreamOutcome::Closed => {
            warn!("deploy log stream closed without a result");
            Ok(())
        }
        StreamOutcome::Succeeded => Ok(()),
    }
}

fn merge_secrets(args: &SecretArgs) -> Result<BTreeMap<String, String>> {
    let file = match &args.secrets_file {
        Some(path) => secrets::load_dotenv(path)?,
        None => Vec::new(),
    };
    Ok(secrets::SecretLayers {
        file,
        cli: args.secrets.clone(),
    }
    .merge())
}

async fn private_link(client: &AgentClient, command: PrivateLinkCommand) -> Result<()> {
    match command {
        PrivateLinkCommand::Create(args) => {
            let link = deploy::create_private_link(
                client,
                &CreatePrivateLinkRequest {
                    name: args.name,
                    region: args.region,
                    port: args.port,
                    endpoint: args.endpoint,
                },
            )?;
            println!("Created private link {} ({})", link.name, link.private_link_id);
            Ok(())
        }
        PrivateLinkCommand::List(args) => {
            let rows = private_links_with_health(client).await?;
            if args.json {
                let links: Vec<_> = rows.iter().map(|r| &r.link).collect();
                return print_json(&links);
            }
            private_link_table(&rows).print();
            Ok(())
        }
        PrivateLinkCommand::Delete(args) => {
            client
                .delete_private_link(&args.id)
                .context("unable to delete private link")?;
            println!("Deleted private link {}", args.id);
            Ok(())
        }
        PrivateLinkCommand::HealthStatus(args) => {
            let health = client
                .private_link_health(&args.id)
                .context("unable to get private link health")?;
            let mut table = Table::new(["ID", "Health", "Updated At"]);
            table.row([args.id, health.status, health.updated_at]);
            table.print();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::commands::{Cli, Command};

    fn agent_command(args: &[&str]) -> AgentCommand {
        let cli = Cli::try_parse_from(["lk", "agent"].iter().chain(args)).unwrap();
        match cli.command {
            Command::Agent { command } => command,
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn rollback_defaults_to_latest() {
        let AgentCommand::Rollback(args) = agent_command(&["rollback"]) else {
            panic!("expected rollback");
        };
        assert_eq!(args.version, "latest");
    }

    #[test]
    fn create_collects_repeated_secrets() {
        let AgentCommand::Create(args) = agent_command(&[
            "create",
            "--secrets",
            "A=1",
            "--secrets",
            "B=x=y",
            "--region",
            "us-east",
        ]) else {
            panic!("expected create");
        };
        assert_eq!(
            args.secrets.secrets,
            vec![
                ("A".to_string(), "1".to_string()),
                ("B".to_string(), "x=y".to_string())
            ]
        );
        assert_eq!(args.regions, vec!["us-east".to_string()]);
    }

    #[test]
    fn update_accepts_secret_flags() {
        let AgentCommand::Update(args) =
            agent_command(&["update", "--secrets", "TOKEN=abc", "--secrets-file", ".env"])
        else {
            panic!("expected update");
        };
        assert_eq!(args.secrets.secrets, vec![("TOKEN".to_string(), "abc".to_string())]);
        assert_eq!(args.secrets.secrets_file, Some(PathBuf::from(".env")));
    }

    #[test]
    fn logs_phase_is_validated() {
        let AgentCommand::Logs(args) = agent_command(&["logs", "--phase", "build"]) else {
            panic!("expected logs");
        };
        assert_eq!(args.phase, Phase::Build);
        assert!(Cli::try_parse_from(["lk", "agent", "logs", "--phase", "nope"]).is_err());
    }

    #[test]
    fn secrets_file_pairs_lose_to_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "A=file\nB=file\n").unwrap();
        let merged = merge_secrets(&SecretArgs {
            secrets: vec![("A".into(), "flag".into())],
            secrets_file: Some(path),
        })
        .unwrap();
        assert_eq!(merged["A"], "flag");
        assert_eq!(merged["B"], "file");
    }
}
