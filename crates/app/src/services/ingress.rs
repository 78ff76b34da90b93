use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{Grants, TwirpClient};
use crate::error::CliError;

const SERVICE: &str = "Ingress";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngressInfo {
    #[serde(default)]
    pub ingress_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub stream_key: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub input_type: String,
    #[serde(default)]
    pub room_name: String,
    #[serde(default)]
    pub participant_identity: String,
    #[serde(default)]
    pub participant_name: String,
    #[serde(default)]
    pub state: Option<IngressState>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngressState {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub error: String,
}

impl IngressInfo {
    pub fn status(&self) -> &str {
        self.state
            .as_ref()
            .map(|s| s.status.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("ENDPOINT_INACTIVE")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateIngressRequest {
    pub input_type: String,
    #[serde(default)]
    pub name: String,
    pub room_name: String,
    pub participant_identity: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub participant_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_transcoding: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateIngressRequest {
    pub ingress_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant_identity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant_name: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ListIngressResponse {
    #[serde(default)]
    items: Vec<IngressInfo>,
}

#[derive(Debug, Clone)]
pub struct IngressClient {
    twirp: TwirpClient,
}

impl IngressClient {
    pub fn new(twirp: TwirpClient) -> Self {
        Self { twirp }
    }

    pub fn create(&self, request: &CreateIngressRequest) -> Result<IngressInfo, CliError> {
        self.twirp
            .call(SERVICE, "CreateIngress", &Grants::ingress_admin(), request)
    }

    pub fn update(&self, request: &UpdateIngressRequest) -> Result<IngressInfo, CliError> {
        self.twirp
            .call(SERVICE, "UpdateIngress", &Grants::ingress_admin(), request)
    }

    pub fn list(&self, room: Option<&str>, ingress_id: Option<&str>) -> Result<Vec<IngressInfo>, CliError> {
        let body = json!({
            "room_name": room.unwrap_or_default(),
            "ingress_id": ingress_id.unwrap_or_default(),
        });
        let resp: ListIngressResponse =
            self.twirp
                .call(SERVICE, "ListIngress", &Grants::ingress_admin(), &body)?;
        Ok(resp.items)
    }

    pub fn delete(&self, ingress_id: &str) -> Result<IngressInfo, CliError> {
        self.twirp.call(
            SERVICE,
            "DeleteIngress",
            &Grants::ingress_admin(),
            &json!({ "ingress_id": ingress_id }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_state_reads_as_inactive() {
        let info: IngressInfo = serde_json::from_str(r#"{"ingress_id":"IN_1"}"#).unwrap();
        assert_eq!(info.status(), "ENDPOINT_INACTIVE");
        let live: IngressInfo =
            serde_json::from_str(r#"{"ingress_id":"IN_2","state":{"status":"ENDPOINT_PUBLISHING"}}"#)
                .unwrap();
        assert_eq!(live.status(), "ENDPOINT_PUBLISHING");
    }
}
