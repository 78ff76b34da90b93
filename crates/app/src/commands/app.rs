use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use tracing::warn;

use super::CommandContext;
use crate::agent::secrets::{API_KEY_SECRET, API_SECRET_SECRET, URL_SECRET};
use crate::error::CliError;
use crate::output::{Table, print_json};
use crate::prompt::{PromptSpec, resolve};
use crate::resolver::ProjectContext;
use crate::templates::{self, Task, Template};

#[derive(Subcommand, Debug)]
pub enum AppCommand {
    /// Clone a template into a new directory and write its .env.local
    Create(CreateArgs),
    /// Write .env.local from .env.example with the project's credentials
    Env(EnvArgs),
    /// List available templates
    ListTemplates(ListTemplatesArgs),
    /// Install the project's dependencies
    Install(DirArg),
    /// Run the project's dev task
    Run(DirArg),
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Directory to create
    name: Option<String>,
    /// Template name or repository url
    #[arg(long)]
    template: Option<String>,
}

#[derive(Args, Debug)]
pub struct EnvArgs {
    /// Project directory (defaults to the working directory)
    #[arg(long)]
    dir: Option<PathBuf>,
    /// Replace an existing .env.local
    #[arg(long)]
    overwrite: bool,
}

#[derive(Args, Debug)]
pub struct ListTemplatesArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
pub struct DirArg {
    /// Project directory (defaults to the working directory)
    dir: Option<PathBuf>,
}

pub fn handle(ctx: &CommandContext, command: AppCommand) -> Result<()> {
    match command {
        AppCommand::Create(args) => create(ctx, args),
        AppCommand::Env(args) => {
            let dir = args.dir.unwrap_or_else(|| ctx.working_dir.clone());
            let project = ctx.project(true)?;
            let path = templates::write_env(&dir, &env_values(&project), args.overwrite)
                .context("unable to write environment file")?;
            println!("Wrote {}", path.display());
            Ok(())
        }
        AppCommand::ListTemplates(args) => {
            let index = templates::fetch_index(&ctx.settings)
                .context("unable to fetch template index")?;
            if args.json {
                return print_json(&index);
            }
            let mut table = Table::new(["Name", "Description", "URL"]);
            for template in &index {
                table.row([&template.name, &template.desc, &template.url]);
            }
            table.print();
            Ok(())
        }
        AppCommand::Install(args) => task(ctx, args, Task::Install),
        AppCommand::Run(args) => task(ctx, args, Task::Run),
    }
}

fn env_values(project: &ProjectContext) -> BTreeMap<String, String> {
    BTreeMap::from([
        (URL_SECRET.to_string(), project.url.clone()),
        (API_KEY_SECRET.to_string(), project.api_key.clone()),
        (API_SECRET_SECRET.to_string(), project.api_secret.clone()),
    ])
}

fn pick_template<'a>(
    ctx: &CommandContext,
    index: &'a [Template],
    wanted: Option<&str>,
) -> Result<&'a Template> {
    if let Some(wanted) = wanted {
        return templates::find(index, wanted)
            .ok_or_else(|| CliError::NotFound(format!("template `{wanted}`")).into());
    }
    if !ctx.prompter.is_interactive() {
        return Err(CliError::Input("missing required flag --template".into()).into());
    }
    let names: Vec<String> = index
        .iter()
        .map(|t| {
            if t.display_name.is_empty() {
                t.name.clone()
            } else {
                format!("{} ({})", t.display_name, t.name)
            }
        })
        .collect();
    let picked = ctx
        .prompter
        .select("Select a template", &names)?
        .or_cancelled()?;
    index
        .get(picked)
        .ok_or_else(|| CliError::Input(format!("no template at position {picked}")).into())
}

fn create(ctx: &CommandContext, args: CreateArgs) -> Result<()> {
    let index =
        templates::fetch_index(&ctx.settings).context("unable to fetch template index")?;
    let template = pick_template(ctx, &index, args.template.as_deref())?;
    let name = resolve(
        args.name.as_deref(),
        None,
        &PromptSpec::new("Application name", "<NAME>").with_default(template.name.clone()),
        ctx.prompter.as_ref(),
    )?
    .or_cancelled()?;
    let dest = ctx.working_dir.join(&name);
    templates::clone(template, &dest).context("unable to clone template")?;

    match ctx.project(true) {
        Ok(project) => {
            templates::write_env(&dest, &env_values(&project), false)
                .context("unable to write environment file")?;
        }
        Err(err) => warn!(error = %err, "no project credentials; skipping .env.local"),
    }
    println!("Created {} from template {}", dest.display(), template.name);
    println!("Next: cd {name} && lk app install && lk app run");
    Ok(())
}

fn task(ctx: &CommandContext, args: DirArg, task: Task) -> Result<()> {
    let dir = args.dir.unwrap_or_else(|| ctx.working_dir.clone());
    let verb = match task {
        Task::Install => "install",
        Task::Run => "run",
    };
    templates::execute(&dir, task).with_context(|| format!("unable to {verb} project"))
}
