//! Container recipe generation and validation for agent sources.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value as Json;
use tracing::{info, warn};

use super::source::ProjectType;
use crate::error::CliError;

pub const DOCKERFILE: &str = "Dockerfile";
pub const DOCKERIGNORE: &str = ".dockerignore";
pub const HEALTH_PORT: u16 = 8081;

const PYTHON_ENTRYPOINTS: [&str; 4] = ["agent.py", "main.py", "src/agent.py", "app.py"];
const NODE_ENTRYPOINTS: [&str; 3] = ["dist/agent.js", "agent.js", "src/agent.ts"];

/// Base images and hints, overridable through the agent service's client
/// settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateSettings {
    pub python_image: String,
    pub uv_image: String,
    pub node_image: String,
    pub entrypoint: Option<String>,
}

impl Default for TemplateSettings {
    fn default() -> Self {
        Self {
            python_image: "python:3.11-slim".into(),
            uv_image: "ghcr.io/astral-sh/uv:python3.11-bookworm-slim".into(),
            node_image: "node:22-slim".into(),
            entrypoint: None,
        }
    }
}

impl TemplateSettings {
    pub fn from_client_settings(params: &BTreeMap<String, String>) -> Self {
        let mut settings = Self::default();
        let pick = |key: &str| params.get(key).filter(|v| !v.trim().is_empty()).cloned();
        if let Some(image) = pick("python-base-image") {
            settings.python_image = image;
        }
        if let Some(image) = pick("uv-base-image") {
            settings.uv_image = image;
        }
        if let Some(image) = pick("node-base-image") {
            settings.node_image = image;
        }
        settings.entrypoint = pick("entrypoint");
        settings
    }
}

/// Where the agent starts and how it gets there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entrypoint {
    /// Path the container runs, relative to the project root.
    pub run: String,
    /// Whether a build step produces `run`.
    pub needs_build: bool,
}

fn read_package_json(dir: &Path) -> Option<Json> {
    let raw = fs::read_to_string(dir.join("package.json")).ok()?;
    serde_json::from_str(&raw).ok()
}

pub fn find_entrypoint(
    dir: &Path,
    project_type: ProjectType,
    hint: Option<&str>,
) -> Result<Entrypoint, CliError> {
    let exists = |rel: &str| dir.join(rel).is_file();
    if project_type.is_python() {
        let found = hint
            .filter(|h| exists(h))
            .or_else(|| PYTHON_ENTRYPOINTS.iter().copied().find(|c| exists(c)))
            .ok_or_else(|| {
                CliError::Config(format!(
                    "no entrypoint found; expected one of {}",
                    PYTHON_ENTRYPOINTS.join(", ")
                ))
            })?;
        return Ok(Entrypoint {
            run: found.to_string(),
            needs_build: false,
        });
    }

    let manifest = read_package_json(dir);
    let has_build = manifest
        .as_ref()
        .and_then(|m| m.get("scripts")?.get("build"))
        .is_some();
    let main = manifest
        .as_ref()
        .and_then(|m| m.get("main")?.as_str().map(str::to_string));
    let found = hint
        .map(str::to_string)
        .or(main)
        .or_else(|| {
            NODE_ENTRYPOINTS
                .iter()
                .find(|c| exists(c))
                .map(|c| c.to_string())
        })
        .ok_or_else(|| {
            CliError::Config(format!(
                "no entrypoint found; set `main` in package.json or add one of {}",
                NODE_ENTRYPOINTS.join(", ")
            ))
        })?;
    if let Some(stem) = found.strip_suffix(".ts") {
        let file = Path::new(stem)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("agent");
        return Ok(Entrypoint {
            run: format!("dist/{file}.js"),
            needs_build: true,
        });
    }
    Ok(Entrypoint {
        needs_build: has_build && found.starts_with("dist/"),
        run: found,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeManager {
    Npm,
    Pnpm,
    Yarn,
    Bun,
}

impl NodeManager {
    fn detect(dir: &Path) -> Self {
        if dir.join("pnpm-lock.yaml").is_file() {
            Self::Pnpm
        } else if dir.join("yarn.lock").is_file() {
            Self::Yarn
        } else if dir.join("bun.lockb").is_file() {
            Self::Bun
        } else {
            Self::Npm
        }
    }

    fn lock_file(self, dir: &Path) -> Option<&'static str> {
        let lock = match self {
            Self::Npm => "package-lock.json",
            Self::Pnpm => "pnpm-lock.yaml",
            Self::Yarn => "yarn.lock",
            Self::Bun => "bun.lockb",
        };
        dir.join(lock).is_file().then_some(lock)
    }

    fn install(self, locked: bool) -> &'static str {
        match (self, locked) {
            (Self::Npm, true) => "npm ci",
            (Self::Npm, false) => "npm install",
            (Self::Pnpm, _) => "corepack enable && pnpm install --frozen-lockfile",
            (Self::Yarn, _) => "corepack enable && yarn install --frozen-lockfile",
            (Self::Bun, _) => "npm install -g bun && bun install --frozen-lockfile",
        }
    }

    fn run(self) -> &'static str {
        match self {
            Self::Npm => "npm run",
            Self::Pnpm => "pnpm run",
            Self::Yarn => "yarn run",
            Self::Bun => "bun run",
        }
    }
}

fn header(out: &mut String, image: &str) {
    out.push_str("# syntax=docker/dockerfile:1\n");
    let _ = writeln!(out, "FROM {image}");
    out.push_str("\nARG UID=10001\n");
    out.push_str(
        "RUN adduser --disabled-password --gecos \"\" --home \"/home/appuser\" \\\n    --shell \"/sbin/nologin\" --uid \"${UID}\" appuser\n\n",
    );
}

fn build_essentials(out: &mut String, extra: &str) {
    let _ = writeln!(
        out,
        "RUN apt-get update && apt-get install -y --no-install-recommends \\\n    build-essential ca-certificates{extra} \\\n    && rm -rf /var/lib/apt/lists/*\n"
    );
}

fn footer(out: &mut String, run_prefix: &[&str], entry: &str) {
    out.push_str("RUN chown -R appuser:appuser /home/appuser\nUSER appuser\n\n");
    let _ = writeln!(out, "RUN {} {entry} download-files\n", run_prefix.join(" "));
    let _ = writeln!(out, "EXPOSE {HEALTH_PORT}");
    let mut args: Vec<String> = run_prefix.iter().map(|s| format!("\"{s}\"")).collect();
    args.push(format!("\"{entry}\""));
    args.push("\"start\"".into());
    let _ = writeln!(out, "CMD [{}]", args.join(", "));
}

fn python_pip(dir: &Path, settings: &TemplateSettings, entry: &Entrypoint) -> String {
    let mut out = String::new();
    header(&mut out, &settings.python_image);
    out.push_str("ENV PYTHONUNBUFFERED=1\n\n");
    build_essentials(&mut out, " gcc g++ python3-dev");
    out.push_str("WORKDIR /home/appuser\n\n");
    let has = |name: &str| dir.join(name).is_file();
    if has("requirements.txt") {
        out.push_str("COPY requirements.txt .\nRUN python -m pip install --no-cache-dir -r requirements.txt\n\nCOPY . .\n");
    } else if has("poetry.lock") {
        out.push_str("COPY pyproject.toml poetry.lock ./\nRUN python -m pip install --no-cache-dir poetry \\\n    && poetry config virtualenvs.create false \\\n    && poetry install --no-root --only main\n\nCOPY . .\n");
    } else if has("Pipfile") {
        out.push_str("COPY Pipfile Pipfile.lock* ./\nRUN python -m pip install --no-cache-dir pipenv \\\n    && pipenv install --system --deploy\n\nCOPY . .\n");
    } else {
        out.push_str("COPY . .\nRUN python -m pip install --no-cache-dir .\n");
    }
    out.push('\n');
    footer(&mut out, &["python"], &entry.run);
    out
}

fn python_uv(dir: &Path, settings: &TemplateSettings, entry: &Entrypoint) -> String {
    let locked = if dir.join("uv.lock").is_file() { " --locked" } else { "" };
    let mut out = String::new();
    header(&mut out, &settings.uv_image);
    out.push_str("ENV PYTHONUNBUFFERED=1 UV_COMPILE_BYTECODE=1 UV_LINK_MODE=copy\n\n");
    build_essentials(&mut out, " gcc g++ python3-dev");
    out.push_str("WORKDIR /home/appuser\n\n");
    let _ = writeln!(
        out,
        "COPY pyproject.toml uv.lock* ./\nRUN uv sync{locked} --no-install-project --no-dev\n\nCOPY . .\nRUN uv sync{locked} --no-dev\n"
    );
    footer(&mut out, &["uv", "run"], &entry.run);
    out
}

fn node(dir: &Path, settings: &TemplateSettings, entry: &Entrypoint) -> String {
    let manager = NodeManager::detect(dir);
    let lock = manager.lock_file(dir);
    let mut out = String::new();
    header(&mut out, &settings.node_image);
    build_essentials(&mut out, " python3");
    out.push_str("WORKDIR /home/appuser\n\n");
    let _ = writeln!(
        out,
        "COPY package.json {}./\nRUN {}\n\nCOPY . .",
        lock.map(|l| format!("{l} ")).unwrap_or_default(),
        manager.install(lock.is_some())
    );
    if entry.needs_build {
        let _ = writeln!(out, "RUN {} build", manager.run());
    }
    out.push('\n');
    footer(&mut out, &["node"], &entry.run);
    out
}

/// Deterministic Dockerfile text for `project_type`.
pub fn render(
    dir: &Path,
    project_type: ProjectType,
    settings: &TemplateSettings,
) -> Result<String, CliError> {
    let entry = find_entrypoint(dir, project_type, settings.entrypoint.as_deref())?;
    match project_type {
        ProjectType::PythonPip => Ok(python_pip(dir, settings, &entry)),
        ProjectType::PythonUv => Ok(python_uv(dir, settings, &entry)),
        ProjectType::Node => Ok(node(dir, settings, &entry)),
        ProjectType::Unknown => Err(CliError::Config(
            "unable to determine project type; no Python or Node project files found".into(),
        )),
    }
}

pub fn render_dockerignore(project_type: ProjectType) -> String {
    let mut out = String::from(".git\n.gitignore\nlivekit.toml\nDockerfile\n.dockerignore\n.env\n.env.*\n");
    if project_type.is_python() {
        out.push_str("__pycache__/\n*.pyc\n.venv/\nvenv/\n.pytest_cache/\n.mypy_cache/\n");
    } else {
        out.push_str("node_modules/\nnpm-debug.log*\n");
    }
    out
}

static FROM_LINE: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"(?im)^\s*FROM\s+\S+").ok());
static USER_LINE: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"(?im)^\s*USER\s+(\S+)").ok());

/// Checks a user-provided Dockerfile. Returns warnings; a file without any
/// `FROM` is rejected.
pub fn validate(text: &str) -> Result<Vec<String>, CliError> {
    let has_from = FROM_LINE.as_ref().is_some_and(|re| re.is_match(text));
    if !has_from {
        return Err(CliError::Config("Dockerfile has no FROM instruction".into()));
    }
    let last_user = USER_LINE
        .as_ref()
        .and_then(|re| re.captures_iter(text).last())
        .and_then(|caps| caps.get(1).map(|m| m.as_str().to_string()));
    let mut warnings = Vec::new();
    match last_user.as_deref() {
        None => warnings.push("Dockerfile never switches to a non-root USER".to_string()),
        Some(user) if user == "root" || user == "0" || user.starts_with("root:") || user.starts_with("0:") => {
            warnings.push("Dockerfile runs the agent as root".to_string())
        }
        Some(_) => {}
    }
    Ok(warnings)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DockerfileStatus {
    /// A user Dockerfile was found and accepted.
    Existing { warnings: Vec<String> },
    Generated { path: PathBuf },
}

pub fn exists_in(dir: &Path) -> bool {
    dir.join(DOCKERFILE).is_file()
}

/// Validate the existing Dockerfile in `dir`.
pub fn check_existing(dir: &Path) -> Result<DockerfileStatus> {
    let path = dir.join(DOCKERFILE);
    let text = fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let warnings = validate(&text)?;
    for warning in &warnings {
        warn!("{warning}");
    }
    Ok(DockerfileStatus::Existing { warnings })
}

/// Write a generated Dockerfile (and `.dockerignore` when absent). An
/// existing Dockerfile is only replaced when `overwrite` is set.
pub fn generate(
    dir: &Path,
    project_type: ProjectType,
    settings: &TemplateSettings,
    overwrite: bool,
) -> Result<DockerfileStatus> {
    let path = dir.join(DOCKERFILE);
    if path.exists() && !overwrite {
        return Err(CliError::Conflict(format!("{}", path.display())).into());
    }
    let text = render(dir, project_type, settings)?;
    fs::write(&path, text).with_context(|| format!("failed to write {}", path.display()))?;
    let ignore = dir.join(DOCKERIGNORE);
    if !ignore.exists() {
        fs::write(&ignore, render_dockerignore(project_type))
            .with_context(|| format!("failed to write {}", ignore.display()))?;
    }
    info!(path = %path.display(), %project_type, "generated Dockerfile");
    Ok(DockerfileStatus::Generated { path })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn python_template_covers_the_essentials() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("requirements.txt"), "livekit-agents\n").unwrap();
        fs::write(dir.path().join("agent.py"), "").unwrap();
        let text = render(dir.path(), ProjectType::PythonPip, &TemplateSettings::default()).unwrap();
        assert!(text.contains("FROM python:3.11-slim"));
        assert!(text.contains("build-essential"));
        assert!(text.contains("pip install --no-cache-dir -r requirements.txt"));
        assert!(text.contains("RUN python agent.py download-files"));
        assert!(text.contains("EXPOSE 8081"));
        assert!(text.trim_end().ends_with(r#"CMD ["python", "agent.py", "start"]"#));
        assert!(validate(&text).unwrap().is_empty());
    }

    #[test]
    fn rendering_is_deterministic() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("pyproject.toml"), "[project]\nname='a'\n").unwrap();
        fs::write(dir.path().join("uv.lock"), "version = 1\n").unwrap();
        fs::create_dir(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/agent.py"), "").unwrap();
        let settings = TemplateSettings::default();
        let a = render(dir.path(), ProjectType::PythonUv, &settings).unwrap();
        let b = render(dir.path(), ProjectType::PythonUv, &settings).unwrap();
        assert_eq!(a, b);
        assert!(a.contains("uv sync --locked --no-install-project"));
        assert!(a.contains(r#"CMD ["uv", "run", "src/agent.py", "start"]"#));
    }

    #[test]
    fn node_typescript_entry_is_built() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("package.json"), r#"{"scripts":{"build":"tsc"}}"#).unwrap();
        fs::write(dir.path().join("pnpm-lock.yaml"), "lockfileVersion: '9.0'\n").unwrap();
        fs::create_dir(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/agent.ts"), "").unwrap();
        let text = render(dir.path(), ProjectType::Node, &TemplateSettings::default()).unwrap();
        assert!(text.contains("COPY package.json pnpm-lock.yaml ./"));
        assert!(text.contains("pnpm install --frozen-lockfile"));
        assert!(text.contains("RUN pnpm run build"));
        assert!(text.contains(r#"CMD ["node", "dist/agent.js", "start"]"#));
    }

    #[test]
    fn missing_entrypoint_is_a_config_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("requirements.txt"), "").unwrap();
        let err = render(dir.path(), ProjectType::PythonPip, &TemplateSettings::default()).unwrap_err();
        assert!(matches!(err, CliError::Config(_)));
    }

    #[test]
    fn validation_rules() {
        assert!(validate("RUN echo hi\n").is_err());
        assert_eq!(validate("FROM alpine\n").unwrap().len(), 1);
        assert_eq!(validate("from alpine\nUSER app\nUSER root\n").unwrap().len(), 1);
        assert!(validate("FROM alpine\nUSER 10001\n").unwrap().is_empty());
    }

    #[test]
    fn generate_refuses_to_clobber() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("requirements.txt"), "").unwrap();
        fs::write(dir.path().join("main.py"), "").unwrap();
        fs::write(dir.path().join(DOCKERFILE), "FROM scratch\n").unwrap();
        let settings = TemplateSettings::default();
        assert!(generate(dir.path(), ProjectType::PythonPip, &settings, false).is_err());
        generate(dir.path(), ProjectType::PythonPip, &settings, true).unwrap();
        let text = fs::read_to_string(dir.path().join(DOCKERFILE)).unwrap();
        assert!(text.contains("main.py"));
        assert!(dir.path().join(DOCKERIGNORE).is_file());
    }
}
