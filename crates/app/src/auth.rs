//! Browser-assisted device authorization against the cloud API.

use std::process::{Command, Stdio};
use std::time::Duration;

use serde::Deserialize;
use serde_with::{DisplayFromStr, PickFirst, serde_as};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::cancel::Shutdown;
use crate::config::ProjectConfig;
use crate::error::CliError;
use crate::services::build_agent;
use crate::settings::Settings;
use crate::token::AccessToken;

const REVOKE_TOKEN_TTL: Duration = Duration::from_secs(5 * 60);

/// Answer of `POST /cli/auth`.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeviceToken {
    pub token: String,
    /// Unix seconds after which the token can no longer be claimed.
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    #[serde(default)]
    pub expires: i64,
    #[serde(default)]
    pub identifier: String,
    #[serde(default)]
    pub device_name: String,
}

/// Credentials handed out once the user approves the device.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClaimedCredentials {
    pub key: String,
    pub secret: String,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub project_name: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimStatus {
    Pending,
    Claimed(ClaimedCredentials),
}

#[derive(Debug, Clone)]
pub struct AuthBroker {
    agent: ureq::Agent,
    cloud_api_url: String,
    dashboard_url: String,
    poll_interval: Duration,
    timeout: Duration,
}

impl AuthBroker {
    pub fn new(settings: &Settings) -> Self {
        Self {
            agent: build_agent(settings.request_timeout()),
            cloud_api_url: settings.cloud_api_url.trim_end_matches('/').to_string(),
            dashboard_url: settings.dashboard_url.trim_end_matches('/').to_string(),
            poll_interval: settings.auth_poll_interval(),
            timeout: settings.auth_timeout(),
        }
    }

    pub fn request_token(&self, device_name: &str) -> Result<DeviceToken, CliError> {
        let url = format!("{}/cli/auth", self.cloud_api_url);
        debug!(%url, device_name, "requesting device token");
        let response = self
            .agent
            .post(&url)
            .query("device_name", device_name)
            .send_empty()?;
        let status = response.status().as_u16();
        let body = response.into_body().read_to_string()?;
        if !(200..300).contains(&status) {
            return Err(CliError::Transport(format!(
                "device authorization request failed with status {status}: {}",
                body.trim()
            )));
        }
        serde_json::from_str(&body).map_err(|err| {
            CliError::protocol(status, "malformed", format!("invalid auth response: {err}"))
        })
    }

    pub fn confirm_url(&self, token: &DeviceToken) -> String {
        format!("{}/confirm-auth?t={}", self.dashboard_url, token.token)
    }

    /// One claim attempt: 401 means "not yet", 404 means the user said no.
    pub fn claim_once(&self, token: &str) -> Result<ClaimStatus, CliError> {
        let url = format!("{}/cli/claim", self.cloud_api_url);
        let response = self.agent.post(&url).query("t", token).send_empty()?;
        let status = response.status().as_u16();
        let body = response.into_body().read_to_string()?;
        match status {
            401 => Ok(ClaimStatus::Pending),
            404 => Err(CliError::Credentials("access denied".into())),
            s if (200..300).contains(&s) => serde_json::from_str(&body)
                .map(ClaimStatus::Claimed)
                .map_err(|err| {
                    CliError::protocol(s, "malformed", format!("invalid claim response: {err}"))
                }),
            s => Err(CliError::protocol(s, "claim", body.trim().to_string())),
        }
    }

    async fn poll(self, token: DeviceToken) -> Result<ClaimedCredentials, CliError> {
        loop {
            tokio::time::sleep(self.poll_interval).await;
            if token.expires > 0 && chrono::Utc::now().timestamp() > token.expires {
                return Err(CliError::Timeout("device authorization expired".into()));
            }
            let broker = self.clone();
            let value = token.token.clone();
            let attempt = tokio::task::spawn_blocking(move || broker.claim_once(&value))
                .await
                .map_err(|err| CliError::Fatal(format!("claim task failed: {err}")))?;
            match attempt {
                Ok(ClaimStatus::Claimed(creds)) => return Ok(creds),
                Ok(ClaimStatus::Pending) => debug!("authorization pending"),
                Err(err) if err.is_transient() => warn!(error = %err, "claim poll failed, retrying"),
                Err(err) => return Err(err),
            }
        }
    }

    /// Poll until approved, denied, expired, timed out or cancelled. The
    /// poller task is aborted on every exit path.
    pub async fn await_claim(
        &self,
        token: &DeviceToken,
        shutdown: &Shutdown,
    ) -> Result<ClaimedCredentials, CliError> {
        let mut poller = tokio::spawn(self.clone().poll(token.clone()));
        let outcome = tokio::select! {
            joined = &mut poller => joined
                .map_err(|err| CliError::Fatal(format!("claim poller failed: {err}")))
                .and_then(|result| result),
            _ = tokio::time::sleep(self.timeout) => {
                Err(CliError::Timeout("timed out waiting for authorization".into()))
            }
            _ = shutdown.cancelled() => Err(CliError::Cancelled),
        };
        poller.abort();
        outcome
    }

    /// `DELETE /cli/revoke` signed by the project itself.
    pub fn revoke(&self, project: &ProjectConfig) -> Result<(), CliError> {
        let token = AccessToken::new(&project.api_key, &project.api_secret)
            .with_identity(revoke_identity(&project.api_secret))
            .with_ttl(REVOKE_TOKEN_TTL)
            .to_jwt()?;
        let url = format!("{}/cli/revoke", self.cloud_api_url);
        let response = self
            .agent
            .delete(&url)
            .header("Authorization", &format!("Bearer {token}"))
            .call()?;
        let status = response.status().as_u16();
        if status != 200 {
            let body = response.into_body().read_to_string().unwrap_or_default();
            return Err(CliError::protocol(status, "revoke", body.trim().to_string()));
        }
        info!(project = %project.name, "credentials revoked");
        Ok(())
    }
}

/// Identity of revoke requests: hex SHA-256 of the api secret.
pub fn revoke_identity(api_secret: &str) -> String {
    hex::encode(Sha256::digest(api_secret.as_bytes()))
}

/// Turn a cloud project name into a valid store name.
pub fn sanitize_project_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.trim().chars() {
        if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
            out.push(c);
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    let out = out.trim_matches('-').to_string();
    if out.is_empty() { "cloud-project".into() } else { out }
}

pub fn device_name() -> String {
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .find_map(|var| std::env::var(var).ok().filter(|v| !v.trim().is_empty()))
        .unwrap_or_else(|| "lk-cli".to_string())
}

/// Best effort; returns whether a browser launcher was started.
pub fn open_browser(url: &str) -> bool {
    let launcher = if cfg!(target_os = "macos") {
        which::which("open").ok().map(|p| (p, Vec::new()))
    } else if cfg!(windows) {
        which::which("cmd")
            .ok()
            .map(|p| (p, vec!["/C".to_string(), "start".to_string(), String::new()]))
    } else {
        ["xdg-open", "wslview", "sensible-browser"]
            .iter()
            .find_map(|bin| which::which(bin).ok())
            .map(|p| (p, Vec::new()))
    };
    let Some((program, args)) = launcher else {
        debug!("no browser launcher found");
        return false;
    };
    Command::new(program)
        .args(args)
        .arg(url)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::verify;

    #[test]
    fn revoke_identity_is_sha256_hex() {
        assert_eq!(
            revoke_identity("secret"),
            "2bb80d537b1da3e38bd30361aa855686bde0eacd7162fef6a25fe97bf527a25b"
        );
    }

    #[test]
    fn revoke_token_is_signed_by_the_project() {
        let project = ProjectConfig {
            name: "demo".into(),
            url: "wss://demo.livekit.cloud".into(),
            api_key: "APIdemo".into(),
            api_secret: "demo-secret-value".into(),
            project_id: Some("p_1".into()),
        };
        let jwt = AccessToken::new(&project.api_key, &project.api_secret)
            .with_identity(revoke_identity(&project.api_secret))
            .with_ttl(REVOKE_TOKEN_TTL)
            .to_jwt()
            .unwrap();
        let claims = verify(&jwt, &project.api_secret).unwrap();
        assert_eq!(claims.iss, "APIdemo");
        assert_eq!(claims.sub, revoke_identity("demo-secret-value"));
    }

    #[test]
    fn project_names_are_sanitized() {
        assert_eq!(sanitize_project_name("My Project (prod)"), "My-Project-prod");
        assert_eq!(sanitize_project_name("  "), "cloud-project");
        assert_eq!(sanitize_project_name("ok_name-1"), "ok_name-1");
    }

    #[test]
    fn token_expiry_accepts_strings() {
        let token: DeviceToken =
            serde_json::from_str(r#"{"token":"t1","expires":"1700000000","identifier":"id"}"#).unwrap();
        assert_eq!(token.expires, 1_700_000_000);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_waiting() {
        let settings = Settings {
            cloud_api_url: "http://127.0.0.1:9".into(),
            auth_poll_interval_secs: 3600,
            ..Settings::default()
        };
        let broker = AuthBroker::new(&settings);
        let shutdown = Shutdown::new();
        shutdown.cancel();
        let token = DeviceToken {
            token: "t".into(),
            expires: 0,
            identifier: String::new(),
            device_name: String::new(),
        };
        let err = broker.await_claim(&token, &shutdown).await.unwrap_err();
        assert!(matches!(err, CliError::Cancelled));
    }
}
