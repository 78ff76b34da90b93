use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use crate::error::CliError;

pub const DEFAULT_TTL: Duration = Duration::from_secs(6 * 60 * 60);
pub const MAX_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoGrant {
    #[serde(default, skip_serializing_if = "is_false")]
    pub room_create: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub room_list: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub room_record: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub room_admin: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub room_join: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub room: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_publish: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_subscribe: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_publish_data: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub can_publish_sources: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_update_own_metadata: Option<bool>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub ingress_admin: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub hidden: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub recorder: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub agent: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SipGrant {
    #[serde(default, skip_serializing_if = "is_false")]
    pub admin: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub call: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomAgentDispatch {
    pub agent_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub metadata: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomConfiguration {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub agents: Vec<RoomAgentDispatch>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claims {
    pub iss: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sub: String,
    pub nbf: u64,
    pub exp: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<VideoGrant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sip: Option<SipGrant>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub metadata: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_config: Option<RoomConfiguration>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Builder for HS256 access tokens signed with a project's api secret.
#[derive(Debug, Clone)]
pub struct AccessToken {
    api_key: String,
    api_secret: String,
    identity: String,
    name: String,
    ttl: Duration,
    video: Option<VideoGrant>,
    sip: Option<SipGrant>,
    metadata: String,
    attributes: BTreeMap<String, String>,
    room_config: Option<RoomConfiguration>,
}

impl AccessToken {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            identity: String::new(),
            name: String::new(),
            ttl: DEFAULT_TTL,
            video: None,
            sip: None,
            metadata: String::new(),
            attributes: BTreeMap::new(),
            room_config: None,
        }
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_video(mut self, grant: VideoGrant) -> Self {
        self.video = Some(grant);
        self
    }

    pub fn with_sip(mut self, grant: SipGrant) -> Self {
        self.sip = Some(grant);
        self
    }

    pub fn with_metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = metadata.into();
        self
    }

    pub fn with_attributes(mut self, attributes: BTreeMap<String, String>) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn with_room_config(mut self, config: RoomConfiguration) -> Self {
        self.room_config = Some(config);
        self
    }

    pub fn claims(&self) -> Result<Claims, CliError> {
        if self.ttl.is_zero() || self.ttl > MAX_TTL {
            return Err(CliError::Input(format!(
                "token validity must be between 1s and {}h",
                MAX_TTL.as_secs() / 3600
            )));
        }
        let joining = self.video.as_ref().is_some_and(|v| v.room_join);
        if joining && self.identity.is_empty() {
            return Err(CliError::Input("identity is required to join a room".into()));
        }
        let now = unix_now();
        Ok(Claims {
            iss: self.api_key.clone(),
            sub: self.identity.clone(),
            nbf: now,
            exp: now + self.ttl.as_secs(),
            name: self.name.clone(),
            video: self.video.clone(),
            sip: self.sip.clone(),
            metadata: self.metadata.clone(),
            attributes: self.attributes.clone(),
            room_config: self.room_config.clone(),
        })
    }

    pub fn to_jwt(&self) -> Result<String, CliError> {
        let claims = self.claims()?;
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.api_secret.as_bytes()),
        )
        .map_err(|err| CliError::Credentials(format!("failed to sign token: {err}")))
    }
}

/// Verify signature and expiry, returning the embedded claims.
pub fn verify(token: &str, api_secret: &str) -> Result<Claims, CliError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_nbf = true;
    validation.required_spec_claims = ["exp", "nbf", "iss"].iter().map(|c| c.to_string()).collect();
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(api_secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|err| CliError::Credentials(format!("invalid token: {err}")))
}

/// Admin-scoped bearer used for server API calls.
pub fn service_token(
    api_key: &str,
    api_secret: &str,
    video: VideoGrant,
    sip: Option<SipGrant>,
) -> Result<String, CliError> {
    let mut token = AccessToken::new(api_key, api_secret)
        .with_ttl(Duration::from_secs(10 * 60))
        .with_video(video);
    if let Some(sip) = sip {
        token = token.with_sip(sip);
    }
    token.to_jwt()
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn join_grant(room: &str) -> VideoGrant {
        VideoGrant {
            room_join: true,
            room: room.into(),
            can_publish: Some(true),
            can_subscribe: Some(true),
            ..VideoGrant::default()
        }
    }

    #[test]
    fn identity_and_grants_survive_verification() {
        let token = AccessToken::new("APIkey", "super-secret")
            .with_identity("alice")
            .with_name("Alice")
            .with_video(join_grant("standup"))
            .with_ttl(Duration::from_secs(3600))
            .to_jwt()
            .unwrap();

        let claims = verify(&token, "super-secret").unwrap();
        assert_eq!(claims.iss, "APIkey");
        assert_eq!(claims.sub, "alice");
        assert_eq!(claims.exp - claims.nbf, 3600);
        let video = claims.video.unwrap();
        assert!(video.room_join);
        assert_eq!(video.room, "standup");
        assert_eq!(video.can_publish, Some(true));
        assert!(!video.room_admin);
    }

    #[test]
    fn wrong_secret_fails_verification() {
        let token = AccessToken::new("APIkey", "super-secret")
            .with_identity("bob")
            .to_jwt()
            .unwrap();
        assert!(verify(&token, "other-secret").is_err());
    }

    #[test]
    fn joining_requires_identity_and_bounded_ttl() {
        let anon = AccessToken::new("k", "s").with_video(join_grant("r"));
        assert!(matches!(anon.to_jwt(), Err(CliError::Input(_))));

        let long = AccessToken::new("k", "s")
            .with_identity("x")
            .with_ttl(Duration::from_secs(25 * 3600));
        assert!(matches!(long.to_jwt(), Err(CliError::Input(_))));
    }

    #[test]
    fn camel_case_wire_names() {
        let claims = AccessToken::new("k", "secret")
            .with_identity("agent-tester")
            .with_video(VideoGrant {
                room_admin: true,
                can_publish_sources: vec!["camera".into()],
                ..VideoGrant::default()
            })
            .with_room_config(RoomConfiguration {
                agents: vec![RoomAgentDispatch {
                    agent_name: "support".into(),
                    metadata: String::new(),
                }],
            })
            .claims()
            .unwrap();
        let json = serde_json::to_value(&claims).unwrap();
        assert_eq!(json["video"]["roomAdmin"], true);
        assert_eq!(json["video"]["canPublishSources"][0], "camera");
        assert_eq!(json["roomConfig"]["agents"][0]["agentName"], "support");
        assert!(json["video"].get("roomJoin").is_none());
    }
}
