use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use serde::Serialize;
use tracing::info;

use super::CommandContext;
use crate::config::ProjectConfig;
use crate::output::{Table, print_json};
use crate::prompt::{PromptSpec, resolve};

#[derive(Subcommand, Debug)]
pub enum ProjectCommand {
    /// Store a project's url and credentials (--url, --api-key, --api-secret)
    Add(AddArgs),
    /// List stored projects
    List(ListArgs),
    /// Forget a stored project
    Remove(NameArg),
    /// Make a stored project the default
    SetDefault(NameArg),
}

#[derive(Args, Debug)]
pub struct AddArgs {
    /// Project name
    name: Option<String>,
    /// Also make it the default project
    #[arg(long)]
    default: bool,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
pub struct NameArg {
    name: String,
}

pub fn handle(ctx: &mut CommandContext, command: ProjectCommand) -> Result<()> {
    match command {
        ProjectCommand::Add(args) => add(ctx, args),
        ProjectCommand::List(args) => list(ctx, args),
        ProjectCommand::Remove(args) => {
            if ctx.store.remove(&args.name)? {
                println!("Removed project {}", args.name);
            } else {
                println!("No project named {}", args.name);
            }
            Ok(())
        }
        ProjectCommand::SetDefault(args) => {
            ctx.store
                .set_default(&args.name)
                .context("unable to set default project")?;
            println!("Default project is now {}", args.name);
            Ok(())
        }
    }
}

fn add(ctx: &mut CommandContext, args: AddArgs) -> Result<()> {
    let prompter = ctx.prompter.as_ref();
    let url = resolve(
        ctx.global.url.as_deref(),
        Some("LIVEKIT_URL"),
        &PromptSpec::new("URL", "--url"),
        prompter,
    )?
    .or_cancelled()?;
    let api_key = resolve(
        ctx.global.api_key.as_deref(),
        Some("LIVEKIT_API_KEY"),
        &PromptSpec::new("API Key", "--api-key"),
        prompter,
    )?
    .or_cancelled()?;
    let api_secret = resolve(
        ctx.global.api_secret.as_deref(),
        Some("LIVEKIT_API_SECRET"),
        &PromptSpec::new("API Secret", "--api-secret"),
        prompter,
    )?
    .or_cancelled()?;
    let name = resolve(
        args.name.as_deref(),
        None,
        &PromptSpec::new("Project name", "<NAME>"),
        prompter,
    )?
    .or_cancelled()?;

    let first = ctx.store.list().is_empty();
    ctx.store
        .add(ProjectConfig {
            name: name.clone(),
            url,
            api_key,
            api_secret,
            project_id: None,
        })
        .context("unable to add project")?;
    info!(project = %name, "project added");
    if args.default || first {
        ctx.store.set_default(&name)?;
    }
    println!("Saved project {name}");
    Ok(())
}

#[derive(Serialize)]
struct ProjectRow<'a> {
    name: &'a str,
    url: &'a str,
    api_key: &'a str,
    default: bool,
}

fn list(ctx: &CommandContext, args: ListArgs) -> Result<()> {
    let rows: Vec<ProjectRow<'_>> = ctx
        .store
        .list()
        .iter()
        .map(|p| ProjectRow {
            name: &p.name,
            url: &p.url,
            api_key: &p.api_key,
            default: ctx.store.is_default(&p.name),
        })
        .collect();
    if args.json {
        return print_json(&rows);
    }
    if rows.is_empty() {
        println!("No projects configured; use `lk project add` or `lk cloud auth`.");
        return Ok(());
    }
    let mut table = Table::new(["Name", "URL", "API Key", "Default"]);
    for row in &rows {
        table.row([
            row.name,
            row.url,
            row.api_key,
            if row.default { "*" } else { "" },
        ]);
    }
    table.print();
    Ok(())
}
