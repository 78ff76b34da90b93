use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{Grants, TwirpClient};
use crate::error::CliError;

const SERVICE: &str = "CloudAgent";

/// Secret values travel base64-encoded; names are always readable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSecret {
    pub name: String,
    #[serde(default, with = "b64", skip_serializing_if = "Vec::is_empty")]
    pub value: Vec<u8>,
}

impl AgentSecret {
    pub fn new(name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

mod b64 {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    pub fn serialize<S: Serializer>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        STANDARD.decode(raw.as_bytes()).map_err(D::Error::custom)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentDeployment {
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub agent_id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub replicas: u32,
    #[serde(default)]
    pub min_replicas: u32,
    #[serde(default)]
    pub max_replicas: u32,
    #[serde(default)]
    pub cpu_req: String,
    #[serde(default)]
    pub cur_cpu: String,
    #[serde(default)]
    pub mem_req: String,
    #[serde(default)]
    pub cur_mem: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub agent_id: String,
    #[serde(default)]
    pub agent_name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub deployed_at: String,
    #[serde(default)]
    pub agent_deployments: Vec<AgentDeployment>,
    #[serde(default)]
    pub secrets: Vec<AgentSecret>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentVersion {
    pub version: String,
    #[serde(default)]
    pub current: bool,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub deployed_at: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CreateAgentRequest {
    pub agent_name: String,
    pub secrets: Vec<AgentSecret>,
    pub replicas: u32,
    pub max_replicas: u32,
    pub cpu_req: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub regions: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateAgentResponse {
    pub agent_id: String,
    #[serde(default)]
    pub agent_name: String,
    #[serde(default)]
    pub version: String,
    pub presigned_url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeployAgentResponse {
    #[serde(default)]
    pub agent_id: String,
    #[serde(default)]
    pub version: String,
    pub presigned_url: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UpdateAgentRequest {
    pub agent_id: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<AgentSecret>,
    pub replicas: u32,
    pub max_replicas: u32,
    pub cpu_req: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub regions: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateLink {
    pub private_link_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub port: u32,
    #[serde(default)]
    pub endpoint: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CreatePrivateLinkRequest {
    pub name: String,
    pub region: String,
    pub port: u32,
    pub endpoint: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateLinkHealth {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub updated_at: String,
}

#[derive(Debug, Deserialize, Default)]
struct ClientSettingsResponse {
    #[serde(default)]
    params: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize, Default)]
struct ListAgentsResponse {
    #[serde(default)]
    agents: Vec<AgentInfo>,
}

#[derive(Debug, Deserialize, Default)]
struct ListVersionsResponse {
    #[serde(default)]
    versions: Vec<AgentVersion>,
}

#[derive(Debug, Deserialize, Default)]
struct ListSecretsResponse {
    #[serde(default)]
    secrets: Vec<AgentSecret>,
}

#[derive(Debug, Deserialize, Default)]
struct ListPrivateLinksResponse {
    #[serde(default)]
    private_links: Vec<PrivateLink>,
}

#[derive(Debug, Deserialize, Default)]
struct CreatePrivateLinkResponse {
    private_link: PrivateLink,
}

/// Generic `{ success, message }` answer of mutating agent RPCs.
#[derive(Debug, Deserialize, Default)]
pub struct Ack {
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

fn default_true() -> bool {
    true
}

impl Ack {
    fn into_result(self, what: &str) -> Result<(), CliError> {
        if self.success {
            Ok(())
        } else {
            Err(CliError::Fatal(format!("{what} failed: {}", self.message)))
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentClient {
    twirp: TwirpClient,
}

impl AgentClient {
    pub fn new(twirp: TwirpClient) -> Self {
        Self { twirp }
    }

    pub fn twirp(&self) -> &TwirpClient {
        &self.twirp
    }

    fn grants() -> Grants {
        Grants::room_create()
    }

    /// Server-advertised knobs: minimum SDK versions, base images.
    pub fn client_settings(&self) -> Result<BTreeMap<String, String>, CliError> {
        let resp: ClientSettingsResponse =
            self.twirp
                .call(SERVICE, "GetClientSettings", &Self::grants(), &json!({}))?;
        Ok(resp.params)
    }

    pub fn create(&self, request: &CreateAgentRequest) -> Result<CreateAgentResponse, CliError> {
        self.twirp
            .call(SERVICE, "CreateAgent", &Self::grants(), request)
    }

    pub fn deploy(&self, agent_id: &str) -> Result<DeployAgentResponse, CliError> {
        self.twirp.call(
            SERVICE,
            "DeployAgent",
            &Self::grants(),
            &json!({ "agent_id": agent_id }),
        )
    }

    pub fn build(&self, agent_id: &str) -> Result<(), CliError> {
        let ack: Ack = self.twirp.call(
            SERVICE,
            "BuildAgent",
            &Self::grants(),
            &json!({ "agent_id": agent_id }),
        )?;
        ack.into_result("build request")
    }

    pub fn update(&self, request: &UpdateAgentRequest) -> Result<(), CliError> {
        let ack: Ack = self
            .twirp
            .call(SERVICE, "UpdateAgent", &Self::grants(), request)?;
        ack.into_result("update")
    }

    /// `version` is sent verbatim; `latest` is resolved server-side.
    pub fn rollback(&self, agent_id: &str, version: &str) -> Result<(), CliError> {
        let ack: Ack = self.twirp.call(
            SERVICE,
            "RollbackAgent",
            &Self::grants(),
            &json!({ "agent_id": agent_id, "version": version }),
        )?;
        ack.into_result("rollback")
    }

    pub fn delete(&self, agent_id: &str) -> Result<(), CliError> {
        let ack: Ack = self.twirp.call(
            SERVICE,
            "DeleteAgent",
            &Self::grants(),
            &json!({ "agent_id": agent_id }),
        )?;
        ack.into_result("delete")
    }

    pub fn list(&self, agent_id: Option<&str>) -> Result<Vec<AgentInfo>, CliError> {
        let resp: ListAgentsResponse = self.twirp.call(
            SERVICE,
            "ListAgents",
            &Self::grants(),
            &json!({ "agent_id": agent_id.unwrap_or_default() }),
        )?;
        Ok(resp.agents)
    }

    pub fn versions(&self, agent_id: &str) -> Result<Vec<AgentVersion>, CliError> {
        let resp: ListVersionsResponse = self.twirp.call(
            SERVICE,
            "ListAgentVersions",
            &Self::grants(),
            &json!({ "agent_id": agent_id }),
        )?;
        Ok(resp.versions)
    }

    /// Names only; the service never returns values.
    pub fn secrets(&self, agent_id: &str) -> Result<Vec<String>, CliError> {
        let resp: ListSecretsResponse = self.twirp.call(
            SERVICE,
            "ListAgentSecrets",
            &Self::grants(),
            &json!({ "agent_id": agent_id }),
        )?;
        Ok(resp.secrets.into_iter().map(|s| s.name).collect())
    }

    pub fn update_secrets(
        &self,
        agent_id: &str,
        secrets: &[AgentSecret],
        overwrite: bool,
    ) -> Result<(), CliError> {
        let ack: Ack = self.twirp.call(
            SERVICE,
            "UpdateAgentSecrets",
            &Self::grants(),
            &json!({ "agent_id": agent_id, "secrets": secrets, "overwrite": overwrite }),
        )?;
        ack.into_result("secrets update")
    }

    pub fn create_private_link(
        &self,
        request: &CreatePrivateLinkRequest,
    ) -> Result<PrivateLink, CliError> {
        let resp: CreatePrivateLinkResponse =
            self.twirp
                .call(SERVICE, "CreatePrivateLink", &Self::grants(), request)?;
        Ok(resp.private_link)
    }

    pub fn list_private_links(&self) -> Result<Vec<PrivateLink>, CliError> {
        let resp: ListPrivateLinksResponse =
            self.twirp
                .call(SERVICE, "ListPrivateLinks", &Self::grants(), &json!({}))?;
        Ok(resp.private_links)
    }

    pub fn delete_private_link(&self, id: &str) -> Result<(), CliError> {
        let ack: Ack = self.twirp.call(
            SERVICE,
            "DeletePrivateLink",
            &Self::grants(),
            &json!({ "private_link_id": id }),
        )?;
        ack.into_result("private link delete")
    }

    pub fn private_link_health(&self, id: &str) -> Result<PrivateLinkHealth, CliError> {
        self.twirp.call(
            SERVICE,
            "GetPrivateLinkHealthStatus",
            &Self::grants(),
            &json!({ "private_link_id": id }),
        )
    }

    /// Line-oriented log stream for one pipeline phase.
    pub fn log_stream_url(&self, agent_id: &str, phase: &str) -> String {
        format!("{}/agents/{agent_id}/logs/{phase}", self.twirp.base_url())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{Engine as _, engine::general_purpose::STANDARD};

    #[test]
    fn secret_values_are_base64_on_the_wire() {
        let secret = AgentSecret::new("OPENAI_API_KEY", "sk-test");
        let json = serde_json::to_value(&secret).unwrap();
        assert_eq!(json["value"], STANDARD.encode(b"sk-test"));
        let back: AgentSecret = serde_json::from_value(json).unwrap();
        assert_eq!(back.value, b"sk-test");
    }

    #[test]
    fn name_only_secrets_decode() {
        let secret: AgentSecret = serde_json::from_str(r#"{"name":"TOKEN"}"#).unwrap();
        assert!(secret.value.is_empty());
    }

    #[test]
    fn failed_ack_is_an_error() {
        let ack: Ack = serde_json::from_str(r#"{"success":false,"message":"no such version"}"#)
            .unwrap();
        let err = ack.into_result("rollback").unwrap_err();
        assert_eq!(err.to_string(), "rollback failed: no such version");
        let implicit: Ack = serde_json::from_str("{}").unwrap();
        assert!(implicit.into_result("x").is_ok());
    }
}
