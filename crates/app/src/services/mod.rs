pub mod agent;
pub mod egress;
pub mod ingress;
pub mod phone;
pub mod replay;
pub mod room;
pub mod sip;

use std::time::Duration;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::debug;

use crate::error::CliError;
use crate::resolver::ProjectContext;
use crate::token::{SipGrant, VideoGrant, service_token};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Per-invocation knobs shared by every service client.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub print_curl: bool,
    pub timeout: Duration,
    /// Replaces the project url as the RPC base (e.g. a staging cluster).
    pub service_url: Option<String>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            print_curl: false,
            timeout: DEFAULT_TIMEOUT,
            service_url: None,
        }
    }
}

/// Grants minted into the bearer token of one RPC.
#[derive(Debug, Clone, Default)]
pub struct Grants {
    pub video: VideoGrant,
    pub sip: Option<SipGrant>,
}

impl Grants {
    pub fn room_admin(room: &str) -> Self {
        Self {
            video: VideoGrant {
                room_admin: true,
                room: room.to_string(),
                ..VideoGrant::default()
            },
            sip: None,
        }
    }

    pub fn room_create() -> Self {
        Self {
            video: VideoGrant {
                room_create: true,
                ..VideoGrant::default()
            },
            sip: None,
        }
    }

    pub fn room_list() -> Self {
        Self {
            video: VideoGrant {
                room_list: true,
                ..VideoGrant::default()
            },
            sip: None,
        }
    }

    pub fn recorder() -> Self {
        Self {
            video: VideoGrant {
                room_record: true,
                ..VideoGrant::default()
            },
            sip: None,
        }
    }

    pub fn ingress_admin() -> Self {
        Self {
            video: VideoGrant {
                ingress_admin: true,
                ..VideoGrant::default()
            },
            sip: None,
        }
    }

    pub fn sip_admin() -> Self {
        Self {
            video: VideoGrant::default(),
            sip: Some(SipGrant {
                admin: true,
                call: false,
            }),
        }
    }

    pub fn sip_call() -> Self {
        Self {
            video: VideoGrant::default(),
            sip: Some(SipGrant {
                admin: false,
                call: true,
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TwirpError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    msg: String,
}

/// JSON-over-HTTP RPC client: `POST {base}/twirp/livekit.<Service>/<Method>`.
#[derive(Clone)]
pub struct TwirpClient {
    base_url: String,
    api_key: String,
    api_secret: String,
    agent: ureq::Agent,
    options: ClientOptions,
}

impl std::fmt::Debug for TwirpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TwirpClient")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key)
            .finish_non_exhaustive()
    }
}

pub fn http_base(url: &str) -> String {
    let url = url.trim_end_matches('/');
    if let Some(rest) = url.strip_prefix("wss://") {
        format!("https://{rest}")
    } else if let Some(rest) = url.strip_prefix("ws://") {
        format!("http://{rest}")
    } else {
        url.to_string()
    }
}

pub fn build_agent(timeout: Duration) -> ureq::Agent {
    ureq::Agent::config_builder()
        .timeout_global(Some(timeout))
        .http_status_as_error(false)
        .build()
        .into()
}

impl TwirpClient {
    pub fn new(ctx: &ProjectContext, options: ClientOptions) -> Result<Self, CliError> {
        let raw = options.service_url.as_deref().unwrap_or(&ctx.url);
        if raw.is_empty() {
            return Err(CliError::MissingCredentials {
                missing: vec!["url (--url or LIVEKIT_URL)".into()],
            });
        }
        Ok(Self {
            base_url: http_base(raw),
            api_key: ctx.api_key.clone(),
            api_secret: ctx.api_secret.clone(),
            agent: build_agent(options.timeout),
            options,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn agent(&self) -> &ureq::Agent {
        &self.agent
    }

    pub fn bearer(&self, grants: &Grants) -> Result<String, CliError> {
        service_token(
            &self.api_key,
            &self.api_secret,
            grants.video.clone(),
            grants.sip.clone(),
        )
    }

    pub fn call<Req, Resp>(
        &self,
        service: &str,
        method: &str,
        grants: &Grants,
        request: &Req,
    ) -> Result<Resp, CliError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        self.call_with_timeout(service, method, grants, request, None)
    }

    pub fn call_with_timeout<Req, Resp>(
        &self,
        service: &str,
        method: &str,
        grants: &Grants,
        request: &Req,
        timeout: Option<Duration>,
    ) -> Result<Resp, CliError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let url = format!("{}/twirp/livekit.{service}/{method}", self.base_url);
        let token = self.bearer(grants)?;
        let body = serde_json::to_string(request)
            .map_err(|err| CliError::Input(format!("failed to encode {method} request: {err}")))?;
        if self.options.print_curl {
            eprintln!("{}", curl_command(&url, &token, &body));
        }
        debug!(%url, "twirp call");

        let mut builder = self
            .agent
            .post(&url)
            .header("Authorization", &format!("Bearer {token}"))
            .header("Content-Type", "application/json");
        if let Some(timeout) = timeout {
            builder = builder.config().timeout_global(Some(timeout)).build();
        }
        let response = builder.send(body.as_bytes())?;
        let status = response.status().as_u16();
        let text = response.into_body().read_to_string()?;
        if !(200..300).contains(&status) {
            return Err(twirp_error(status, &text));
        }
        let text = if text.trim().is_empty() { "{}" } else { &text };
        serde_json::from_str(text).map_err(|err| {
            CliError::protocol(status, "malformed", format!("invalid {method} response: {err}"))
        })
    }
}

fn twirp_error(status: u16, body: &str) -> CliError {
    match serde_json::from_str::<TwirpError>(body) {
        Ok(err) if !err.msg.is_empty() || !err.code.is_empty() => {
            CliError::protocol(status, err.code, err.msg)
        }
        _ => CliError::protocol(status, "http", body.trim().to_string()),
    }
}

pub fn curl_command(url: &str, token: &str, body: &str) -> String {
    format!(
        "curl -X POST -H 'Authorization: Bearer {token}' -H 'Content-Type: application/json' -d '{}' {url}",
        body.replace('\'', "'\\''")
    )
}

/// Read a JSON request body from a file, or `-` for stdin.
pub fn read_request_file<T: DeserializeOwned>(path: &str) -> Result<T, CliError> {
    let raw = if path == "-" {
        std::io::read_to_string(std::io::stdin())
            .map_err(|err| CliError::Input(format!("failed to read stdin: {err}")))?
    } else {
        std::fs::read_to_string(path)
            .map_err(|err| CliError::Input(format!("failed to read {path}: {err}")))?
    };
    serde_json::from_str(&raw).map_err(|err| CliError::Input(format!("invalid JSON in {path}: {err}")))
}
