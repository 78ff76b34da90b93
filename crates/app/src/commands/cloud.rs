use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use tracing::{info, warn};

use super::CommandContext;
use crate::auth::{self, AuthBroker, ClaimedCredentials};
use crate::config::ProjectConfig;
use crate::error::CliError;
use crate::prompt::{Flow, FlowResult, Outcome, PromptSpec, Prompter, resolve, run_flow};

#[derive(Subcommand, Debug)]
pub enum CloudCommand {
    /// Authorize this device and store the project's credentials
    Auth(AuthArgs),
}

#[derive(Args, Debug)]
pub struct AuthArgs {
    /// Revoke the stored credentials of --project (or the default project)
    #[arg(long)]
    pub revoke: bool,
}

pub async fn handle(ctx: &mut CommandContext, command: CloudCommand) -> Result<()> {
    match command {
        CloudCommand::Auth(args) => auth(ctx, args).await,
    }
}

pub async fn auth(ctx: &mut CommandContext, args: AuthArgs) -> Result<()> {
    if args.revoke {
        return revoke(ctx);
    }
    let broker = AuthBroker::new(&ctx.settings);
    let device = auth::device_name();
    let token = {
        let broker = broker.clone();
        tokio::task::spawn_blocking(move || broker.request_token(&device))
            .await
            .context("device authorization task failed")?
            .context("unable to start device authorization")?
    };
    let confirm_url = broker.confirm_url(&token);
    eprintln!("Confirm access to LiveKit Cloud at:\n\n    {confirm_url}\n");
    if !auth::open_browser(&confirm_url) {
        eprintln!("Open the link above in a browser to continue.");
    }

    let creds = broker
        .await_claim(&token, &ctx.shutdown)
        .await
        .context("unable to complete device authorization")?;
    let name = store_claim(ctx, creds)?;
    println!("Authenticated project {name}");
    Ok(())
}

/// Saves claimed credentials and returns the name they were stored under.
fn store_claim(ctx: &mut CommandContext, creds: ClaimedCredentials) -> Result<String> {
    let suggested = auth::sanitize_project_name(&creds.project_name);
    let name = resolve(
        None,
        None,
        &PromptSpec::new("Project name", "--project").with_default(suggested),
        ctx.prompter.as_ref(),
    )?
    .or_cancelled()?;
    let project = ProjectConfig {
        name: name.clone(),
        url: creds.url,
        api_key: creds.key,
        api_secret: creds.secret,
        project_id: Some(creds.project_id).filter(|id| !id.is_empty()),
    };
    ctx.store
        .upsert_by_project_id(project)
        .context("unable to save project")?;
    info!(project = %name, "credentials stored");

    let make_default = match ctx.store.default_project() {
        None => true,
        Some(current) if current.name == name => false,
        Some(current) => ctx
            .prompter
            .confirm(
                &format!("Make {name} the default project instead of {}?", current.name),
                false,
            )?
            .or_cancelled()?,
    };
    if make_default {
        ctx.store.set_default(&name)?;
    }
    Ok(name)
}

struct RevokeFlow {
    broker: AuthBroker,
    project: ProjectConfig,
}

impl Flow for RevokeFlow {
    type Output = ();

    fn confirm(&mut self, prompter: &dyn Prompter) -> Result<Outcome<bool>> {
        prompter.confirm(
            &format!("Revoke the credentials of project {}?", self.project.name),
            true,
        )
    }

    fn execute(&mut self) -> Result<()> {
        self.broker
            .revoke(&self.project)
            .context("unable to revoke credentials")
    }

    fn render(&self, _output: &()) -> Result<()> {
        println!("Revoked credentials of project {}", self.project.name);
        Ok(())
    }
}

fn revoke(ctx: &mut CommandContext) -> Result<()> {
    let project = match &ctx.global.project {
        Some(name) => ctx.store.get(name),
        None => ctx.store.default_project(),
    }
    .cloned()
    .ok_or_else(|| CliError::NotFound("project to revoke".into()))?;

    let mut flow = RevokeFlow {
        broker: AuthBroker::new(&ctx.settings),
        project,
    };
    match run_flow(&mut flow, ctx.prompter.as_ref())? {
        FlowResult::Completed(()) => {
            ctx.store.remove(&flow.project.name)?;
            Ok(())
        }
        FlowResult::Declined => {
            warn!("revocation declined");
            Ok(())
        }
        FlowResult::Cancelled => Err(CliError::Cancelled.into()),
    }
}
