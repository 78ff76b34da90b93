use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{Grants, TwirpClient};
use crate::error::CliError;

const SERVICE: &str = "SIP";

/// CreateSIPParticipant waits for the callee to answer.
pub const CREATE_PARTICIPANT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SipInboundTrunk {
    #[serde(default)]
    pub sip_trunk_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub numbers: Vec<String>,
    #[serde(default)]
    pub allowed_addresses: Vec<String>,
    #[serde(default)]
    pub allowed_numbers: Vec<String>,
    #[serde(default)]
    pub auth_username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub auth_password: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub metadata: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SipOutboundTrunk {
    #[serde(default)]
    pub sip_trunk_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub transport: String,
    #[serde(default)]
    pub numbers: Vec<String>,
    #[serde(default)]
    pub auth_username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub auth_password: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub metadata: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SipDispatchRule {
    #[serde(default)]
    pub sip_dispatch_rule_id: String,
    #[serde(default)]
    pub name: String,
    /// Empty means "every trunk".
    #[serde(default)]
    pub trunk_ids: Vec<String>,
    #[serde(default)]
    pub rule: Value,
    #[serde(default)]
    pub hide_phone_number: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub metadata: String,
}

impl SipDispatchRule {
    /// One-word description of the rule variant for tables.
    pub fn kind(&self) -> &'static str {
        let Some(obj) = self.rule.as_object() else {
            return "-";
        };
        if obj.contains_key("dispatch_rule_direct") {
            "Direct"
        } else if obj.contains_key("dispatch_rule_individual") {
            "Individual"
        } else if obj.contains_key("dispatch_rule_callee") {
            "Callee"
        } else {
            "-"
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SipParticipantInfo {
    #[serde(default)]
    pub participant_id: String,
    #[serde(default)]
    pub participant_identity: String,
    #[serde(default)]
    pub room_name: String,
    #[serde(default)]
    pub sip_call_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateSipParticipantRequest {
    pub sip_trunk_id: String,
    pub sip_call_to: String,
    pub room_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub participant_identity: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub participant_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sip_number: String,
    #[serde(default)]
    pub wait_until_answered: bool,
}

#[derive(Debug, Deserialize, Default)]
struct ListInboundResponse {
    #[serde(default)]
    items: Vec<SipInboundTrunk>,
}

#[derive(Debug, Deserialize, Default)]
struct ListOutboundResponse {
    #[serde(default)]
    items: Vec<SipOutboundTrunk>,
}

#[derive(Debug, Deserialize, Default)]
struct ListDispatchResponse {
    #[serde(default)]
    items: Vec<SipDispatchRule>,
}

#[derive(Debug, Deserialize, Default)]
struct Empty {}

#[derive(Debug, Clone)]
pub struct SipClient {
    twirp: TwirpClient,
}

impl SipClient {
    pub fn new(twirp: TwirpClient) -> Self {
        Self { twirp }
    }

    pub fn create_inbound_trunk(&self, trunk: &SipInboundTrunk) -> Result<SipInboundTrunk, CliError> {
        self.twirp.call(
            SERVICE,
            "CreateSIPInboundTrunk",
            &Grants::sip_admin(),
            &json!({ "trunk": trunk }),
        )
    }

    pub fn create_outbound_trunk(
        &self,
        trunk: &SipOutboundTrunk,
    ) -> Result<SipOutboundTrunk, CliError> {
        self.twirp.call(
            SERVICE,
            "CreateSIPOutboundTrunk",
            &Grants::sip_admin(),
            &json!({ "trunk": trunk }),
        )
    }

    pub fn update_inbound_trunk(&self, trunk: &SipInboundTrunk) -> Result<SipInboundTrunk, CliError> {
        self.twirp.call(
            SERVICE,
            "UpdateSIPInboundTrunk",
            &Grants::sip_admin(),
            &json!({ "sip_trunk_id": trunk.sip_trunk_id, "replace": trunk }),
        )
    }

    pub fn update_outbound_trunk(
        &self,
        trunk: &SipOutboundTrunk,
    ) -> Result<SipOutboundTrunk, CliError> {
        self.twirp.call(
            SERVICE,
            "UpdateSIPOutboundTrunk",
            &Grants::sip_admin(),
            &json!({ "sip_trunk_id": trunk.sip_trunk_id, "replace": trunk }),
        )
    }

    pub fn list_inbound_trunks(&self) -> Result<Vec<SipInboundTrunk>, CliError> {
        let resp: ListInboundResponse =
            self.twirp
                .call(SERVICE, "ListSIPInboundTrunk", &Grants::sip_admin(), &json!({}))?;
        Ok(resp.items)
    }

    pub fn list_outbound_trunks(&self) -> Result<Vec<SipOutboundTrunk>, CliError> {
        let resp: ListOutboundResponse =
            self.twirp
                .call(SERVICE, "ListSIPOutboundTrunk", &Grants::sip_admin(), &json!({}))?;
        Ok(resp.items)
    }

    pub fn delete_trunk(&self, trunk_id: &str) -> Result<(), CliError> {
        let _: Empty = self.twirp.call(
            SERVICE,
            "DeleteSIPTrunk",
            &Grants::sip_admin(),
            &json!({ "sip_trunk_id": trunk_id }),
        )?;
        Ok(())
    }

    pub fn create_dispatch_rule(&self, rule: &SipDispatchRule) -> Result<SipDispatchRule, CliError> {
        self.twirp.call(
            SERVICE,
            "CreateSIPDispatchRule",
            &Grants::sip_admin(),
            &json!({ "dispatch_rule": rule }),
        )
    }

    pub fn update_dispatch_rule(&self, rule: &SipDispatchRule) -> Result<SipDispatchRule, CliError> {
        self.twirp.call(
            SERVICE,
            "UpdateSIPDispatchRule",
            &Grants::sip_admin(),
            &json!({
                "sip_dispatch_rule_id": rule.sip_dispatch_rule_id,
                "replace": rule,
            }),
        )
    }

    pub fn list_dispatch_rules(&self) -> Result<Vec<SipDispatchRule>, CliError> {
        let resp: ListDispatchResponse =
            self.twirp
                .call(SERVICE, "ListSIPDispatchRule", &Grants::sip_admin(), &json!({}))?;
        Ok(resp.items)
    }

    pub fn delete_dispatch_rule(&self, rule_id: &str) -> Result<(), CliError> {
        let _: Empty = self.twirp.call(
            SERVICE,
            "DeleteSIPDispatchRule",
            &Grants::sip_admin(),
            &json!({ "sip_dispatch_rule_id": rule_id }),
        )?;
        Ok(())
    }

    pub fn create_participant(
        &self,
        request: &CreateSipParticipantRequest,
        timeout: Option<Duration>,
    ) -> Result<SipParticipantInfo, CliError> {
        self.twirp.call_with_timeout(
            SERVICE,
            "CreateSIPParticipant",
            &Grants::sip_call(),
            request,
            Some(timeout.unwrap_or(CREATE_PARTICIPANT_TIMEOUT)),
        )
    }

    pub fn transfer_participant(
        &self,
        room: &str,
        identity: &str,
        transfer_to: &str,
        play_dialtone: bool,
    ) -> Result<(), CliError> {
        let mut grants = Grants::sip_call();
        grants.video.room_admin = true;
        grants.video.room = room.to_string();
        let _: Empty = self.twirp.call(
            SERVICE,
            "TransferSIPParticipant",
            &grants,
            &json!({
                "room_name": room,
                "participant_identity": identity,
                "transfer_to": transfer_to,
                "play_dialtone": play_dialtone,
            }),
        )?;
        Ok(())
    }
}
