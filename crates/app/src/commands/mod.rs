//! The `lk` command tree. Every handler receives a [`CommandContext`]
//! built once in `main`.

pub mod agent;
pub mod app;
pub mod cloud;
pub mod egress;
pub mod ingress;
pub mod number;
pub mod perf;
pub mod project;
pub mod replay;
pub mod room;
pub mod sip;
pub mod token;

use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use tracing::debug;

use crate::cancel::Shutdown;
use crate::config::ConfigStore;
use crate::error::CliError;
use crate::prompt::{NonInteractive, Prompter, TerminalPrompter};
use crate::resolver::{ProjectContext, ProjectFlags, Resolver};
use crate::retry::RetryPolicy;
use crate::services::{ClientOptions, TwirpClient};
use crate::settings::{EnvCredentials, Settings, load_settings, resolve_config_dir};

#[derive(Parser, Debug)]
#[command(
    name = "lk",
    version,
    about = "Manage LiveKit projects, rooms, agents and load tests"
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Server url (falls back to LIVEKIT_URL)
    #[arg(long, global = true, value_name = "URL")]
    pub url: Option<String>,
    /// API key (falls back to LIVEKIT_API_KEY)
    #[arg(long, global = true)]
    pub api_key: Option<String>,
    /// API secret (falls back to LIVEKIT_API_SECRET)
    #[arg(long, global = true)]
    pub api_secret: Option<String>,
    /// Use the local development server and its default credentials
    #[arg(long, global = true)]
    pub dev: bool,
    /// Name of a stored project
    #[arg(long, global = true)]
    pub project: Option<String>,
    /// Pick a stored project by its url subdomain
    #[arg(long, global = true)]
    pub subdomain: Option<String>,
    /// Alternate cli-config.toml
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<Utf8PathBuf>,
    /// Print the equivalent curl command of every RPC
    #[arg(long, global = true)]
    pub curl: bool,
    /// Debug logging and full error chains
    #[arg(long, global = true)]
    pub verbose: bool,
}

impl GlobalArgs {
    pub fn project_flags(&self) -> ProjectFlags {
        ProjectFlags {
            project: self.project.clone(),
            subdomain: self.subdomain.clone(),
            url: self.url.clone(),
            api_key: self.api_key.clone(),
            api_secret: self.api_secret.clone(),
            dev: self.dev,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Authenticate with LiveKit Cloud (same as `cloud auth`)
    Auth(cloud::AuthArgs),
    /// Manage stored projects
    Project {
        #[command(subcommand)]
        command: project::ProjectCommand,
    },
    /// LiveKit Cloud account commands
    Cloud {
        #[command(subcommand)]
        command: cloud::CloudCommand,
    },
    /// Bootstrap applications from templates
    App {
        #[command(subcommand)]
        command: app::AppCommand,
    },
    /// Build and deploy agents to LiveKit Cloud
    Agent {
        #[command(subcommand)]
        command: agent::AgentCommand,
    },
    /// Rooms and participants
    Room {
        #[command(subcommand)]
        command: room::RoomCommand,
    },
    /// Access tokens
    Token {
        #[command(subcommand)]
        command: token::TokenCommand,
    },
    /// SIP trunks, dispatch rules and participants
    Sip {
        #[command(subcommand)]
        command: sip::SipCommand,
    },
    /// Phone numbers
    Number {
        #[command(subcommand)]
        command: number::NumberCommand,
    },
    /// Room replays
    Replay {
        #[command(subcommand)]
        command: replay::ReplayCommand,
    },
    /// Ingress endpoints
    Ingress {
        #[command(subcommand)]
        command: ingress::IngressCommand,
    },
    /// Egress recordings and streams
    Egress {
        #[command(subcommand)]
        command: egress::EgressCommand,
    },
    /// Load and performance tests
    Perf {
        #[command(subcommand)]
        command: perf::PerfCommand,
    },
}

/// Everything a handler may need for one invocation.
pub struct CommandContext {
    pub global: GlobalArgs,
    pub settings: Settings,
    pub store: ConfigStore,
    pub env: EnvCredentials,
    pub prompter: Box<dyn Prompter>,
    pub shutdown: Shutdown,
    pub working_dir: PathBuf,
}

impl CommandContext {
    /// `--config` points at the store file; `settings.toml` is read from
    /// the same directory.
    pub fn load(global: GlobalArgs, shutdown: Shutdown) -> Result<Self> {
        let (store, config_dir) = match &global.config {
            Some(path) => (
                ConfigStore::load_or_create(path.clone())?,
                path.parent().map(|dir| dir.to_path_buf()),
            ),
            None => {
                let dir = resolve_config_dir().ok_or_else(|| {
                    CliError::Config("unable to determine the user config directory".into())
                })?;
                (ConfigStore::in_dir(&dir)?, Some(dir))
            }
        };
        debug!(store = %store.path(), "config store loaded");
        let settings = load_settings(config_dir.as_ref())?;
        let env = EnvCredentials::from_env()?;
        let working_dir =
            std::env::current_dir().context("unable to read the working directory")?;
        let prompter: Box<dyn Prompter> = if std::io::stdin().is_terminal() {
            Box::new(TerminalPrompter)
        } else {
            Box::new(NonInteractive)
        };
        Ok(Self {
            global,
            settings,
            store,
            env,
            prompter,
            shutdown,
            working_dir,
        })
    }

    pub fn project(&self, require_url: bool) -> Result<ProjectContext> {
        let flags = self.global.project_flags();
        Resolver {
            store: &self.store,
            flags: &flags,
            env: &self.env,
            working_dir: &self.working_dir,
            prompter: self.prompter.as_ref(),
        }
        .resolve(require_url)
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            print_curl: self.global.curl,
            timeout: self.settings.request_timeout(),
            service_url: self.settings.service_url.clone(),
        }
    }

    pub fn twirp(&self, project: &ProjectContext) -> Result<TwirpClient> {
        Ok(TwirpClient::new(project, self.client_options())?)
    }

    /// Resolve the project and build an RPC client for it.
    pub fn connect(&self) -> Result<(ProjectContext, TwirpClient)> {
        let project = self.project(true)?;
        let twirp = self.twirp(&project)?;
        Ok((project, twirp))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::with_attempts(self.settings.retry_attempts)
    }
}

pub async fn run(cli: Cli, shutdown: Shutdown) -> Result<()> {
    let mut ctx = CommandContext::load(cli.global, shutdown)?;
    match cli.command {
        Command::Auth(args) => cloud::auth(&mut ctx, args).await,
        Command::Project { command } => project::handle(&mut ctx, command),
        Command::Cloud { command } => cloud::handle(&mut ctx, command).await,
        Command::App { command } => app::handle(&ctx, command),
        Command::Agent { command } => agent::handle(&ctx, command).await,
        Command::Room { command } => room::handle(&ctx, command),
        Command::Token { command } => token::handle(&ctx, command),
        Command::Sip { command } => sip::handle(&ctx, command),
        Command::Number { command } => number::handle(&ctx, command).await,
        Command::Replay { command } => replay::handle(&ctx, command),
        Command::Ingress { command } => ingress::handle(&ctx, command),
        Command::Egress { command } => egress::handle(&ctx, command),
        Command::Perf { command } => perf::handle(&ctx, command).await,
    }
}

/// `KEY=VALUE` flag values.
pub(crate) fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got `{raw}`")),
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn command_tree_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_flags_work_after_subcommands() {
        let cli = Cli::try_parse_from([
            "lk", "room", "list", "--project", "acme", "--curl", "--verbose",
        ])
        .unwrap();
        assert_eq!(cli.global.project.as_deref(), Some("acme"));
        assert!(cli.global.curl);
        assert!(cli.global.verbose);
        assert!(matches!(cli.command, Command::Room { .. }));
    }

    #[test]
    fn auth_is_an_alias_of_cloud_auth() {
        let top = Cli::try_parse_from(["lk", "auth", "--revoke"]).unwrap();
        let nested = Cli::try_parse_from(["lk", "cloud", "auth", "--revoke"]).unwrap();
        let Command::Auth(top) = top.command else {
            panic!("expected auth");
        };
        let Command::Cloud {
            command: cloud::CloudCommand::Auth(nested),
        } = nested.command
        else {
            panic!("expected cloud auth");
        };
        assert!(top.revoke && nested.revoke);
    }

    #[test]
    fn key_value_pairs() {
        assert_eq!(
            parse_key_value("A=b=c").unwrap(),
            ("A".to_string(), "b=c".to_string())
        );
        assert!(parse_key_value("=x").is_err());
        assert!(parse_key_value("novalue").is_err());
    }
}
