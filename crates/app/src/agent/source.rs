//! Project-type detection and SDK version discovery for agent sources.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value as Json;
use serde_yaml_bw as serde_yaml;
use tracing::{debug, warn};

use super::version::{self, SourceKind};

pub const PYTHON_PACKAGE: &str = "livekit-agents";
pub const NODE_PACKAGE: &str = "@livekit/agents";
pub const PYTHON_MIN_VERSION_KEY: &str = "python-min-sdk-version";
pub const NODE_MIN_VERSION_KEY: &str = "node-min-sdk-version";

const UV_MARKERS: [&str; 1] = ["uv.lock"];
const PIP_MARKERS: [&str; 6] = [
    "poetry.lock",
    "Pipfile",
    "pyproject.toml",
    "requirements.txt",
    "setup.py",
    "setup.cfg",
];
const NODE_MARKERS: [&str; 5] = [
    "package.json",
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "bun.lockb",
];
const PYTHON_FILES: [&str; 9] = [
    "uv.lock",
    "poetry.lock",
    "Pipfile.lock",
    "pyproject.toml",
    "requirements.txt",
    "Pipfile",
    "setup.py",
    "setup.cfg",
    "requirements.in",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectType {
    PythonPip,
    PythonUv,
    Node,
    Unknown,
}

impl ProjectType {
    pub fn is_python(self) -> bool {
        matches!(self, Self::PythonPip | Self::PythonUv)
    }

    pub fn sdk_package(self) -> Option<&'static str> {
        match self {
            Self::PythonPip | Self::PythonUv => Some(PYTHON_PACKAGE),
            Self::Node => Some(NODE_PACKAGE),
            Self::Unknown => None,
        }
    }

    pub fn min_version_key(self) -> Option<&'static str> {
        match self {
            Self::PythonPip | Self::PythonUv => Some(PYTHON_MIN_VERSION_KEY),
            Self::Node => Some(NODE_MIN_VERSION_KEY),
            Self::Unknown => None,
        }
    }
}

impl fmt::Display for ProjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PythonPip => "python.pip",
            Self::PythonUv => "python.uv",
            Self::Node => "node",
            Self::Unknown => "unknown",
        })
    }
}

/// First matching marker wins; `pyproject.toml` with `[dependency-groups]`
/// implies uv even without a lock file.
pub fn detect(dir: &Path) -> ProjectType {
    let has = |name: &str| dir.join(name).is_file();
    if UV_MARKERS.iter().any(|m| has(m)) {
        return ProjectType::PythonUv;
    }
    if has("pyproject.toml") && pyproject_has_dependency_groups(&dir.join("pyproject.toml")) {
        return ProjectType::PythonUv;
    }
    if PIP_MARKERS.iter().any(|m| has(m)) {
        return ProjectType::PythonPip;
    }
    if NODE_MARKERS.iter().any(|m| has(m)) {
        return ProjectType::Node;
    }
    ProjectType::Unknown
}

fn pyproject_has_dependency_groups(path: &Path) -> bool {
    fs::read_to_string(path)
        .ok()
        .and_then(|raw| toml::from_str::<toml::Table>(&raw).ok())
        .is_some_and(|table| table.get("dependency-groups").is_some_and(toml::Value::is_table))
}

/// One version string found for the SDK package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub file: String,
    pub version: String,
    pub kind: SourceKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdkCheck {
    Satisfied { observed: String, file: String },
    TooOld { observed: String, minimum: String, file: String },
    NotFound,
    Unresolved(String),
}

/// Lower is better: lock files, then primary manifests, then requirement
/// lists, then setup scripts.
pub fn rank(file: &str) -> u8 {
    match file {
        "package-lock.json" | "pnpm-lock.yaml" | "Pipfile.lock" | "yarn.lock" | "bun.lockb" => 0,
        f if f.ends_with(".lock") => 0,
        "package.json" | "pyproject.toml" => 1,
        "requirements.txt" | "requirements.in" | "Pipfile" => 2,
        f if f.starts_with("setup.") => 3,
        _ => 4,
    }
}

/// PEP 503 name normalization: case-insensitive, runs of `-_.` collapse.
pub fn pep503(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_sep = false;
    for c in name.trim().chars() {
        if matches!(c, '-' | '_' | '.') {
            if !in_sep {
                out.push('-');
            }
            in_sep = true;
        } else {
            out.extend(c.to_lowercase());
            in_sep = false;
        }
    }
    out
}

static REQUIREMENT: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"^\s*([A-Za-z0-9][A-Za-z0-9._-]*)\s*(?:\[[^\]]*\])?\s*([^;#]*)").ok()
});

/// Split a PEP 508 requirement into (normalized name, version spec).
pub fn parse_requirement(line: &str) -> Option<(String, String)> {
    let caps = REQUIREMENT.as_ref()?.captures(line)?;
    let name = pep503(caps.get(1)?.as_str());
    let spec = caps
        .get(2)
        .map(|m| m.as_str().trim())
        .unwrap_or_default()
        .trim_start_matches('(')
        .trim_end_matches(')')
        .trim();
    if spec.starts_with('@') {
        return Some((name, String::new()));
    }
    Some((name, spec.to_string()))
}

fn find_requirement<'a>(lines: impl Iterator<Item = &'a str>, package: &str) -> Option<String> {
    let target = pep503(package);
    lines
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#') && !l.starts_with('-'))
        .filter_map(parse_requirement)
        .find(|(name, _)| *name == target)
        .map(|(_, spec)| spec)
}

fn toml_version(value: &toml::Value) -> Option<String> {
    match value {
        toml::Value::String(s) => Some(s.clone()),
        toml::Value::Table(t) => Some(
            t.get("version")
                .and_then(toml::Value::as_str)
                .unwrap_or_default()
                .to_string(),
        ),
        _ => None,
    }
}

fn toml_lock_packages(raw: &str, package: &str) -> Result<Option<String>> {
    let table: toml::Table = toml::from_str(raw).context("invalid TOML")?;
    let target = pep503(package);
    Ok(table
        .get("package")
        .and_then(toml::Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(toml::Value::as_table)
        .find(|p| p.get("name").and_then(toml::Value::as_str).map(pep503).as_deref() == Some(target.as_str()))
        .and_then(|p| p.get("version").and_then(toml::Value::as_str))
        .map(str::to_string))
}

fn toml_dependency_table(table: Option<&toml::Value>, package: &str) -> Option<String> {
    let target = pep503(package);
    table?
        .as_table()?
        .iter()
        .find(|(name, _)| pep503(name) == target)
        .and_then(|(_, value)| toml_version(value))
}

fn parse_pyproject(raw: &str, package: &str) -> Result<Option<String>> {
    let table: toml::Table = toml::from_str(raw).context("invalid TOML")?;
    let from_list = |value: Option<&toml::Value>| {
        value
            .and_then(toml::Value::as_array)
            .and_then(|items| find_requirement(items.iter().filter_map(toml::Value::as_str), package))
    };
    let project = table.get("project");
    if let Some(found) = from_list(project.and_then(|p| p.get("dependencies"))) {
        return Ok(Some(found));
    }
    if let Some(groups) = table.get("dependency-groups").and_then(toml::Value::as_table) {
        for group in groups.values() {
            if let Some(found) = from_list(Some(group)) {
                return Ok(Some(found));
            }
        }
    }
    if let Some(optional) = project
        .and_then(|p| p.get("optional-dependencies"))
        .and_then(toml::Value::as_table)
    {
        for group in optional.values() {
            if let Some(found) = from_list(Some(group)) {
                return Ok(Some(found));
            }
        }
    }
    let poetry = table
        .get("tool")
        .and_then(|t| t.get("poetry"))
        .and_then(|p| p.get("dependencies"));
    Ok(toml_dependency_table(poetry, package))
}

fn parse_pipfile(raw: &str, package: &str) -> Result<Option<String>> {
    let table: toml::Table = toml::from_str(raw).context("invalid TOML")?;
    Ok(toml_dependency_table(table.get("packages"), package)
        .or_else(|| toml_dependency_table(table.get("dev-packages"), package)))
}

fn parse_pipfile_lock(raw: &str, package: &str) -> Result<Option<String>> {
    let json: Json = serde_json::from_str(raw).context("invalid JSON")?;
    let target = pep503(package);
    for section in ["default", "develop"] {
        if let Some(found) = json
            .get(section)
            .and_then(Json::as_object)
            .and_then(|deps| deps.iter().find(|(name, _)| pep503(name) == target))
            .and_then(|(_, entry)| entry.get("version").and_then(Json::as_str))
        {
            return Ok(Some(found.to_string()));
        }
    }
    Ok(None)
}

static SETUP_PY_REQUIREMENT: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r#"["']([^"']+)["']"#).ok());

fn parse_setup_py(raw: &str, package: &str) -> Option<String> {
    let re = SETUP_PY_REQUIREMENT.as_ref()?;
    find_requirement(
        re.captures_iter(raw)
            .filter_map(|caps| caps.get(1).map(|m| m.as_str())),
        package,
    )
}

fn parse_setup_cfg(raw: &str, package: &str) -> Option<String> {
    find_requirement(
        raw.lines()
            .map(|l| l.trim().trim_start_matches("install_requires").trim_start_matches('=')),
        package,
    )
}

fn parse_package_json(raw: &str, package: &str) -> Result<Option<String>> {
    let json: Json = serde_json::from_str(raw).context("invalid JSON")?;
    Ok(["dependencies", "devDependencies", "peerDependencies"]
        .iter()
        .find_map(|section| json.get(section)?.get(package)?.as_str())
        .map(str::to_string))
}

fn parse_package_lock(raw: &str, package: &str) -> Result<Option<String>> {
    let json: Json = serde_json::from_str(raw).context("invalid JSON")?;
    let modern = json
        .get("packages")
        .and_then(|p| p.get(format!("node_modules/{package}")))
        .and_then(|p| p.get("version"))
        .and_then(Json::as_str);
    let legacy = || {
        json.get("dependencies")
            .and_then(|d| d.get(package))
            .and_then(|p| p.get("version"))
            .and_then(Json::as_str)
    };
    Ok(modern.or_else(legacy).map(str::to_string))
}

/// pnpm appends peer suffixes like `1.0.0(zod@3.23.8)`.
fn strip_peer_suffix(version: &str) -> &str {
    version.split('(').next().unwrap_or(version).trim()
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PnpmDeps {
    #[serde(default)]
    dependencies: BTreeMap<String, PnpmDep>,
    #[serde(default)]
    dev_dependencies: BTreeMap<String, PnpmDep>,
}

#[derive(Debug, Default, Deserialize)]
struct PnpmLock {
    #[serde(default)]
    importers: BTreeMap<String, PnpmDeps>,
    #[serde(flatten)]
    root: PnpmDeps,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PnpmDep {
    Plain(String),
    Detailed { version: String },
}

impl PnpmDeps {
    fn version_of(&self, package: &str) -> Option<String> {
        self.dependencies
            .get(package)
            .or_else(|| self.dev_dependencies.get(package))
            .map(|dep| match dep {
                PnpmDep::Plain(v) | PnpmDep::Detailed { version: v } => {
                    strip_peer_suffix(v).to_string()
                }
            })
    }
}

fn parse_pnpm_lock(raw: &str, package: &str) -> Result<Option<String>> {
    let lock: PnpmLock = serde_yaml::from_str(raw).context("invalid YAML")?;
    Ok(lock
        .importers
        .get(".")
        .and_then(|deps| deps.version_of(package))
        .or_else(|| lock.root.version_of(package)))
}

fn parse_yarn_lock(raw: &str, package: &str) -> Option<String> {
    let header = format!("{package}@");
    let mut in_block = false;
    for line in raw.lines() {
        if !line.starts_with(' ') && !line.is_empty() {
            let key = line.trim_start_matches('"');
            in_block = key.starts_with(&header)
                || line.split(',').any(|k| k.trim().trim_matches('"').starts_with(&header));
            continue;
        }
        if in_block {
            let trimmed = line.trim();
            if let Some(rest) = trimmed.strip_prefix("version") {
                return Some(rest.trim_start_matches(':').trim().trim_matches('"').to_string());
            }
        }
    }
    None
}

fn read_file(dir: &Path, file: &str) -> Option<Result<String>> {
    let path = dir.join(file);
    if !path.is_file() {
        return None;
    }
    Some(fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display())))
}

fn observe_file(dir: &Path, file: &str, package: &str) -> Result<Option<Observation>> {
    let Some(raw) = read_file(dir, file) else {
        return Ok(None);
    };
    let raw = raw?;
    let (found, kind) = match file {
        "uv.lock" | "poetry.lock" => (toml_lock_packages(&raw, package)?, SourceKind::Lock),
        "Pipfile.lock" => (parse_pipfile_lock(&raw, package)?, SourceKind::Lock),
        "pyproject.toml" => (parse_pyproject(&raw, package)?, SourceKind::Manifest),
        "Pipfile" => (parse_pipfile(&raw, package)?, SourceKind::Manifest),
        "requirements.txt" | "requirements.in" => {
            (find_requirement(raw.lines(), package), SourceKind::Manifest)
        }
        "setup.py" => (parse_setup_py(&raw, package), SourceKind::Manifest),
        "setup.cfg" => (parse_setup_cfg(&raw, package), SourceKind::Manifest),
        "package.json" => (parse_package_json(&raw, package)?, SourceKind::Manifest),
        "package-lock.json" => (parse_package_lock(&raw, package)?, SourceKind::Lock),
        "pnpm-lock.yaml" => (parse_pnpm_lock(&raw, package)?, SourceKind::Lock),
        "yarn.lock" => (parse_yarn_lock(&raw, package), SourceKind::Lock),
        other => return Err(anyhow!("no parser for {other}")),
    };
    Ok(found.map(|version| Observation {
        file: file.to_string(),
        version,
        kind,
    }))
}

/// SDK version strings found in the project, plus the dependency files
/// that could not be read or parsed.
#[derive(Debug, Default)]
pub struct Observed {
    /// Best source first.
    pub found: Vec<Observation>,
    pub failures: Vec<String>,
}

/// Every SDK version string present in the project, best source first.
pub fn observe(dir: &Path, project_type: ProjectType) -> Observed {
    let Some(package) = project_type.sdk_package() else {
        return Observed::default();
    };
    let files: &[&str] = if project_type.is_python() {
        &PYTHON_FILES
    } else {
        &["package-lock.json", "pnpm-lock.yaml", "yarn.lock", "package.json"]
    };
    let mut observed = Observed::default();
    for file in files {
        match observe_file(dir, file, package) {
            Ok(Some(obs)) => observed.found.push(obs),
            Ok(None) => {}
            Err(err) => {
                warn!(file, error = %err, "unreadable dependency file");
                observed.failures.push(format!("{file}: {err:#}"));
            }
        }
    }
    observed.found.sort_by_key(|obs| rank(&obs.file));
    observed
}

/// Compare the best observed SDK version with the server's minimum.
pub fn check_sdk(
    dir: &Path,
    project_type: ProjectType,
    client_settings: &BTreeMap<String, String>,
) -> SdkCheck {
    let Some(minimum) = project_type
        .min_version_key()
        .and_then(|key| client_settings.get(key))
        .filter(|v| !v.trim().is_empty())
    else {
        return SdkCheck::Unresolved("server did not advertise a minimum SDK version".into());
    };
    let Observed { found, failures } = observe(dir, project_type);
    if found.is_empty() {
        if failures.is_empty() {
            return SdkCheck::NotFound;
        }
        return SdkCheck::Unresolved(failures.join("; "));
    }
    let mut reasons = failures;
    for obs in found {
        match version::is_satisfied(&obs.version, minimum, obs.kind) {
            Ok(true) => {
                debug!(file = %obs.file, version = %obs.version, "sdk version satisfied");
                return SdkCheck::Satisfied {
                    observed: obs.version,
                    file: obs.file,
                };
            }
            Ok(false) => {
                return SdkCheck::TooOld {
                    observed: obs.version,
                    minimum: minimum.clone(),
                    file: obs.file,
                };
            }
            Err(err) => reasons.push(format!("{}: {err}", obs.file)),
        }
    }
    SdkCheck::Unresolved(reasons.join("; "))
}
