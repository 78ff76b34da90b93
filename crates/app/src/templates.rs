//! Application bootstrap from template repositories.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::agent::source::{self, ProjectType};
use crate::error::CliError;
use crate::services::build_agent;
use crate::settings::Settings;

pub const ENV_EXAMPLE: &str = ".env.example";
pub const ENV_LOCAL: &str = ".env.local";
pub const TASKFILE: &str = "taskfile.yaml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Template {
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub desc: String,
    pub url: String,
    #[serde(default)]
    pub docs: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

pub fn fetch_index(settings: &Settings) -> Result<Vec<Template>, CliError> {
    let url = &settings.templates_index_url;
    debug!(%url, "fetching template index");
    let response = build_agent(settings.request_timeout()).get(url).call()?;
    let status = response.status().as_u16();
    let body = response.into_body().read_to_string()?;
    if !(200..300).contains(&status) {
        return Err(CliError::protocol(status, "templates", body.trim().to_string()));
    }
    serde_json::from_str(&body)
        .map_err(|err| CliError::protocol(status, "malformed", format!("invalid template index: {err}")))
}

/// Match on `name`, or on a full repository url.
pub fn find<'a>(templates: &'a [Template], wanted: &str) -> Option<&'a Template> {
    let wanted = wanted.trim_end_matches('/').trim_end_matches(".git");
    templates
        .iter()
        .find(|t| t.name == wanted || t.url.trim_end_matches('/').trim_end_matches(".git") == wanted)
}

/// Replace `KEY=...` lines of `.env.example` with known values; unknown
/// keys keep the example's value.
pub fn render_env(example: &str, values: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(example.len());
    for line in example.lines() {
        let trimmed = line.trim_start();
        let key = trimmed
            .strip_prefix("export ")
            .unwrap_or(trimmed)
            .split_once('=')
            .map(|(k, _)| k.trim());
        match key.and_then(|k| values.get_key_value(k)) {
            Some((k, v)) if !trimmed.starts_with('#') => {
                out.push_str(&format!("{k}={v}"));
            }
            _ => out.push_str(line),
        }
        out.push('\n');
    }
    out
}

/// Write `.env.local` from `.env.example` (or from scratch when the template
/// ships none). Returns the written path.
pub fn write_env(dir: &Path, values: &BTreeMap<String, String>, overwrite: bool) -> Result<PathBuf> {
    let target = dir.join(ENV_LOCAL);
    if target.exists() && !overwrite {
        return Err(CliError::Conflict(format!("{}", target.display())).into());
    }
    let example = dir.join(ENV_EXAMPLE);
    let text = if example.exists() {
        let raw = fs::read_to_string(&example)
            .with_context(|| format!("failed to read {}", example.display()))?;
        render_env(&raw, values)
    } else {
        values.iter().map(|(k, v)| format!("{k}={v}\n")).collect()
    };
    fs::write(&target, text).with_context(|| format!("failed to write {}", target.display()))?;
    info!(path = %target.display(), "environment written");
    Ok(target)
}

fn run(program: &Path, args: &[&str], dir: &Path) -> Result<()> {
    debug!(program = %program.display(), ?args, "running");
    let status = Command::new(program)
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::inherit())
        .status()
        .with_context(|| format!("failed to run {}", program.display()))?;
    if !status.success() {
        bail!("{} {} exited with {status}", program.display(), args.join(" "));
    }
    Ok(())
}

fn tool(name: &str) -> Result<PathBuf> {
    which::which(name).with_context(|| format!("`{name}` was not found on PATH"))
}

/// Shallow clone `template.url` into `dest` and drop its history.
pub fn clone(template: &Template, dest: &Path) -> Result<()> {
    if dest.exists() {
        return Err(CliError::Conflict(format!("{}", dest.display())).into());
    }
    let git = tool("git")?;
    let dest_str = dest.to_string_lossy();
    let parent = dest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    run(&git, &["clone", "--depth", "1", &template.url, &dest_str], parent)?;
    let history = dest.join(".git");
    if history.exists() {
        fs::remove_dir_all(&history)
            .with_context(|| format!("failed to remove {}", history.display()))?;
    }
    Ok(())
}

/// Which step of the project lifecycle to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    Install,
    Run,
}

impl Task {
    fn as_str(self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Run => "dev",
        }
    }
}

/// Command line for `task` in `dir`, preferring a Taskfile.
pub fn plan(dir: &Path, task: Task) -> Result<(String, Vec<String>)> {
    let has_taskfile = ["taskfile.yaml", "Taskfile.yaml", "taskfile.yml", "Taskfile.yml"]
        .iter()
        .any(|f| dir.join(f).exists());
    if has_taskfile {
        return Ok(("task".into(), vec![task.as_str().into()]));
    }
    let owned = |args: &[&str]| args.iter().map(|a| a.to_string()).collect::<Vec<_>>();
    let plan = match (source::detect(dir), task) {
        (ProjectType::PythonUv, Task::Install) => ("uv".into(), owned(&["sync"])),
        (ProjectType::PythonUv, Task::Run) => {
            ("uv".into(), owned(&["run", &python_entry(dir), "dev"]))
        }
        (ProjectType::PythonPip, Task::Install) => {
            ("pip".into(), owned(&["install", "-r", "requirements.txt"]))
        }
        (ProjectType::PythonPip, Task::Run) => ("python".into(), owned(&[&python_entry(dir), "dev"])),
        (ProjectType::Node, Task::Install) => (node_manager(dir).into(), owned(&["install"])),
        (ProjectType::Node, Task::Run) => (node_manager(dir).into(), owned(&["run", "dev"])),
        (ProjectType::Unknown, _) => {
            return Err(CliError::Input(format!(
                "cannot tell how to {} {}: no Taskfile and no recognised project files",
                task.as_str(),
                dir.display()
            ))
            .into());
        }
    };
    Ok(plan)
}

fn python_entry(dir: &Path) -> String {
    ["agent.py", "main.py", "src/agent.py", "app.py"]
        .iter()
        .find(|f| dir.join(f).exists())
        .unwrap_or(&"agent.py")
        .to_string()
}

fn node_manager(dir: &Path) -> &'static str {
    if dir.join("pnpm-lock.yaml").exists() {
        "pnpm"
    } else if dir.join("yarn.lock").exists() {
        "yarn"
    } else if dir.join("bun.lockb").exists() {
        "bun"
    } else {
        "npm"
    }
}

pub fn execute(dir: &Path, task: Task) -> Result<()> {
    let (program, args) = plan(dir, task)?;
    let program = tool(&program)?;
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    run(&program, &args, dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn values() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("LIVEKIT_URL".to_string(), "wss://demo.livekit.cloud".to_string()),
            ("LIVEKIT_API_KEY".to_string(), "APIdemo".to_string()),
        ])
    }

    #[test]
    fn env_substitution_keeps_unknown_keys() {
        let example = "# sample\nLIVEKIT_URL=\nexport LIVEKIT_API_KEY=<key>\nOPENAI_API_KEY=sk-x\n";
        let rendered = render_env(example, &values());
        assert_eq!(
            rendered,
            "# sample\nLIVEKIT_URL=wss://demo.livekit.cloud\nLIVEKIT_API_KEY=APIdemo\nOPENAI_API_KEY=sk-x\n"
        );
    }

    #[test]
    fn write_env_refuses_to_clobber() {
        let dir = TempDir::new().unwrap();
        let path = write_env(dir.path(), &values(), false).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("LIVEKIT_API_KEY=APIdemo"));
        assert!(write_env(dir.path(), &values(), false).is_err());
        assert!(write_env(dir.path(), &values(), true).is_ok());
    }

    #[test]
    fn plan_prefers_taskfile_then_project_type() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("package.json"), "{}").unwrap();
        fs::write(dir.path().join("pnpm-lock.yaml"), "lockfileVersion: '9.0'\n").unwrap();
        assert_eq!(
            plan(dir.path(), Task::Install).unwrap(),
            ("pnpm".to_string(), vec!["install".to_string()])
        );
        fs::write(dir.path().join(TASKFILE), "version: '3'\n").unwrap();
        assert_eq!(
            plan(dir.path(), Task::Run).unwrap(),
            ("task".to_string(), vec!["dev".to_string()])
        );
        let empty = TempDir::new().unwrap();
        assert!(plan(empty.path(), Task::Install).is_err());
    }

    #[test]
    fn templates_match_by_name_or_url() {
        let templates = vec![Template {
            name: "agent-starter-python".into(),
            display_name: "Python agent".into(),
            desc: String::new(),
            url: "https://github.com/livekit-examples/agent-starter-python".into(),
            docs: String::new(),
            tags: vec![],
        }];
        assert!(find(&templates, "agent-starter-python").is_some());
        assert!(find(&templates, "https://github.com/livekit-examples/agent-starter-python.git").is_some());
        assert!(find(&templates, "other").is_none());
    }
}
