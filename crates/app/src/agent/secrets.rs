use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::error::CliError;
use crate::resolver::ProjectContext;
use crate::services::agent::AgentSecret;

pub const API_KEY_SECRET: &str = "LIVEKIT_API_KEY";
pub const API_SECRET_SECRET: &str = "LIVEKIT_API_SECRET";
pub const URL_SECRET: &str = "LIVEKIT_URL";

fn valid_key(key: &str) -> bool {
    let mut chars = key.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

/// `KEY=VALUE` from the command line.
pub fn parse_pair(raw: &str) -> Result<(String, String), CliError> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| CliError::Input(format!("secret `{raw}` must look like KEY=VALUE")))?;
    let key = key.trim();
    if !valid_key(key) {
        return Err(CliError::Input(format!("invalid secret name `{key}`")));
    }
    Ok((key.to_string(), value.to_string()))
}

fn unquote(value: &str) -> String {
    if value.len() >= 2 && value.starts_with('\'') && value.ends_with('\'') {
        return value[1..value.len() - 1].to_string();
    }
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        let inner = &value[1..value.len() - 1];
        let mut out = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            if c != '\\' {
                out.push(c);
                continue;
            }
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some(other) => out.push(other),
                None => out.push('\\'),
            }
        }
        return out;
    }
    match value.find(" #") {
        Some(idx) => value[..idx].trim_end().to_string(),
        None => value.to_string(),
    }
}

/// Dotenv syntax: `KEY=VALUE`, optional `export`, quotes, `#` comments.
/// Order is preserved; later duplicates win on merge.
pub fn parse_dotenv(text: &str) -> Result<Vec<(String, String)>, CliError> {
    let mut out = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let (key, value) = line.split_once('=').ok_or_else(|| {
            CliError::Input(format!("line {}: expected KEY=VALUE", idx + 1))
        })?;
        let key = key.trim();
        if !valid_key(key) {
            return Err(CliError::Input(format!("line {}: invalid name `{key}`", idx + 1)));
        }
        out.push((key.to_string(), unquote(value.trim())));
    }
    Ok(out)
}

pub fn load_dotenv(path: &Path) -> Result<Vec<(String, String)>> {
    let text =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    parse_dotenv(&text)
        .map_err(anyhow::Error::from)
        .with_context(|| format!("invalid secrets file {}", path.display()))
}

/// Layers in increasing precedence: secrets file, then `--secrets` pairs.
#[derive(Debug, Clone, Default)]
pub struct SecretLayers {
    pub file: Vec<(String, String)>,
    pub cli: Vec<(String, String)>,
}

impl SecretLayers {
    pub fn merge(&self) -> BTreeMap<String, String> {
        let mut merged = BTreeMap::new();
        for (key, value) in self.file.iter().chain(self.cli.iter()) {
            merged.insert(key.clone(), value.clone());
        }
        merged
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SecretCheck {
    pub required: Vec<String>,
    pub provided: Vec<String>,
    pub missing: Vec<String>,
}

/// Which of `required` carry a non-blank value.
pub fn check_required(required: &[&str], secrets: &BTreeMap<String, String>) -> SecretCheck {
    let (provided, missing): (Vec<String>, Vec<String>) = required
        .iter()
        .map(|key| key.to_string())
        .partition(|key| secrets.get(key).is_some_and(|v| !v.trim().is_empty()));
    SecretCheck {
        required: required.iter().map(|k| k.to_string()).collect(),
        provided,
        missing,
    }
}

/// Fill in the project credentials the agent needs to reach its project.
/// Values the caller already set are kept.
pub fn inject_project_credentials(secrets: &mut BTreeMap<String, String>, project: &ProjectContext) {
    for (key, value) in [
        (API_KEY_SECRET, &project.api_key),
        (API_SECRET_SECRET, &project.api_secret),
        (URL_SECRET, &project.url),
    ] {
        if !value.is_empty() {
            secrets
                .entry(key.to_string())
                .or_insert_with(|| value.clone());
        }
    }
}

pub fn to_agent_secrets(secrets: &BTreeMap<String, String>) -> Vec<AgentSecret> {
    secrets
        .iter()
        .map(|(name, value)| AgentSecret::new(name.clone(), value.as_bytes().to_vec()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::ProjectSource;

    #[test]
    fn dotenv_parsing() {
        let parsed = parse_dotenv(
            "# comment\nexport OPENAI_API_KEY=sk-1\nQUOTED=\"a b\\n\"\nRAW='x#y'\nTRAIL=v # note\n\n",
        )
        .unwrap();
        assert_eq!(
            parsed,
            vec![
                ("OPENAI_API_KEY".to_string(), "sk-1".to_string()),
                ("QUOTED".to_string(), "a b\n".to_string()),
                ("RAW".to_string(), "x#y".to_string()),
                ("TRAIL".to_string(), "v".to_string()),
            ]
        );
        assert!(parse_dotenv("NOPE\n").is_err());
        assert!(parse_dotenv("1BAD=x\n").is_err());
    }

    #[test]
    fn cli_pairs_win_over_file() {
        let layers = SecretLayers {
            file: vec![("A".into(), "file".into()), ("B".into(), "file".into())],
            cli: vec![parse_pair("A=cli").unwrap(), parse_pair("C=x=y").unwrap()],
        };
        let merged = layers.merge();
        assert_eq!(merged["A"], "cli");
        assert_eq!(merged["B"], "file");
        assert_eq!(merged["C"], "x=y");
    }

    #[test]
    fn credentials_are_injected_without_clobbering() {
        let project = ProjectContext {
            name: Some("demo".into()),
            url: "wss://demo.livekit.cloud".into(),
            api_key: "APIkey".into(),
            api_secret: "secret-value".into(),
            project_id: None,
            source: ProjectSource::Default,
        };
        let mut secrets = BTreeMap::from([(API_KEY_SECRET.to_string(), "mine".to_string())]);
        let before = check_required(&[API_KEY_SECRET, API_SECRET_SECRET], &secrets);
        assert_eq!(before.missing, vec![API_SECRET_SECRET.to_string()]);
        inject_project_credentials(&mut secrets, &project);
        assert_eq!(secrets[API_KEY_SECRET], "mine");
        assert_eq!(secrets[API_SECRET_SECRET], "secret-value");
        assert!(check_required(&[API_KEY_SECRET, API_SECRET_SECRET], &secrets).missing.is_empty());
    }
}
