use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use serde_with::{DisplayFromStr, PickFirst, serde_as};

use super::{Grants, TwirpClient};
use crate::error::CliError;

const SERVICE: &str = "Egress";

#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EgressInfo {
    #[serde(default)]
    pub egress_id: String,
    #[serde(default)]
    pub room_name: String,
    #[serde(default)]
    pub status: String,
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    #[serde(default)]
    pub started_at: i64,
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    #[serde(default)]
    pub ended_at: i64,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Deserialize, Default)]
struct ListEgressResponse {
    #[serde(default)]
    items: Vec<EgressInfo>,
}

#[derive(Debug, Clone)]
pub struct EgressClient {
    twirp: TwirpClient,
}

impl EgressClient {
    pub fn new(twirp: TwirpClient) -> Self {
        Self { twirp }
    }

    /// Starts a room-composite recording. `request` is the raw JSON body so
    /// every output option (file, stream, segments) passes through untouched.
    pub fn start_room_composite(&self, request: &Value) -> Result<EgressInfo, CliError> {
        if request.get("room_name").and_then(Value::as_str).unwrap_or_default().is_empty() {
            return Err(CliError::Input("room_name is required".into()));
        }
        self.twirp
            .call(SERVICE, "StartRoomCompositeEgress", &Grants::recorder(), request)
    }

    pub fn list(&self, room: Option<&str>, active: bool) -> Result<Vec<EgressInfo>, CliError> {
        let body = json!({ "room_name": room.unwrap_or_default(), "active": active });
        let resp: ListEgressResponse =
            self.twirp.call(SERVICE, "ListEgress", &Grants::recorder(), &body)?;
        Ok(resp.items)
    }

    pub fn stop(&self, egress_id: &str) -> Result<EgressInfo, CliError> {
        self.twirp.call(
            SERVICE,
            "StopEgress",
            &Grants::recorder(),
            &json!({ "egress_id": egress_id }),
        )
    }
}
