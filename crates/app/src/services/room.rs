use std::collections::BTreeMap;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use serde_with::{DisplayFromStr, PickFirst, serde_as};

use super::{Grants, TwirpClient};
use crate::error::CliError;

const SERVICE: &str = "RoomService";

#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Room {
    #[serde(default)]
    pub sid: String,
    pub name: String,
    #[serde(default)]
    pub empty_timeout: u32,
    #[serde(default)]
    pub departure_timeout: u32,
    #[serde(default)]
    pub max_participants: u32,
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    #[serde(default)]
    pub creation_time: i64,
    #[serde(default)]
    pub metadata: String,
    #[serde(default)]
    pub num_participants: u32,
    #[serde(default)]
    pub num_publishers: u32,
    #[serde(default)]
    pub active_recording: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CreateRoomRequest {
    pub name: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub empty_timeout: u32,
    #[serde(skip_serializing_if = "is_zero")]
    pub departure_timeout: u32,
    #[serde(skip_serializing_if = "is_zero")]
    pub max_participants: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub metadata: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agents: Option<Vec<RoomAgentDispatchRequest>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomAgentDispatchRequest {
    pub agent_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub metadata: String,
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackInfo {
    #[serde(default)]
    pub sid: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub mime_type: String,
}

#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    #[serde(default)]
    pub sid: String,
    pub identity: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub metadata: String,
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    #[serde(default)]
    pub joined_at: i64,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub tracks: Vec<TrackInfo>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UpdateParticipantRequest {
    pub room: String,
    pub identity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission: Option<ParticipantPermission>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParticipantPermission {
    pub can_subscribe: bool,
    pub can_publish: bool,
    pub can_publish_data: bool,
    #[serde(default)]
    pub hidden: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataKind {
    #[default]
    Reliable,
    Lossy,
}

#[derive(Debug, Deserialize, Default)]
struct ListRoomsResponse {
    #[serde(default)]
    rooms: Vec<Room>,
}

#[derive(Debug, Deserialize, Default)]
struct ListParticipantsResponse {
    #[serde(default)]
    participants: Vec<ParticipantInfo>,
}

#[derive(Debug, Deserialize, Default)]
struct MuteTrackResponse {
    #[serde(default)]
    track: Option<TrackInfo>,
}

#[derive(Debug, Deserialize, Default)]
struct Empty {}

#[derive(Debug, Clone)]
pub struct RoomClient {
    twirp: TwirpClient,
}

impl RoomClient {
    pub fn new(twirp: TwirpClient) -> Self {
        Self { twirp }
    }

    pub fn create_room(&self, request: &CreateRoomRequest) -> Result<Room, CliError> {
        self.twirp
            .call(SERVICE, "CreateRoom", &Grants::room_create(), request)
    }

    pub fn list_rooms(&self, names: &[String]) -> Result<Vec<Room>, CliError> {
        let body = serde_json::json!({ "names": names });
        let resp: ListRoomsResponse =
            self.twirp
                .call(SERVICE, "ListRooms", &Grants::room_list(), &body)?;
        Ok(resp.rooms)
    }

    pub fn delete_room(&self, room: &str) -> Result<(), CliError> {
        let body = serde_json::json!({ "room": room });
        let _: Empty = self
            .twirp
            .call(SERVICE, "DeleteRoom", &Grants::room_create(), &body)?;
        Ok(())
    }

    pub fn update_room_metadata(&self, room: &str, metadata: &str) -> Result<Room, CliError> {
        let body = serde_json::json!({ "room": room, "metadata": metadata });
        self.twirp
            .call(SERVICE, "UpdateRoomMetadata", &Grants::room_admin(room), &body)
    }

    pub fn list_participants(&self, room: &str) -> Result<Vec<ParticipantInfo>, CliError> {
        let body = serde_json::json!({ "room": room });
        let resp: ListParticipantsResponse =
            self.twirp
                .call(SERVICE, "ListParticipants", &Grants::room_admin(room), &body)?;
        Ok(resp.participants)
    }

    pub fn get_participant(&self, room: &str, identity: &str) -> Result<ParticipantInfo, CliError> {
        let body = serde_json::json!({ "room": room, "identity": identity });
        self.twirp
            .call(SERVICE, "GetParticipant", &Grants::room_admin(room), &body)
    }

    pub fn remove_participant(&self, room: &str, identity: &str) -> Result<(), CliError> {
        let body = serde_json::json!({ "room": room, "identity": identity });
        let _: Empty =
            self.twirp
                .call(SERVICE, "RemoveParticipant", &Grants::room_admin(room), &body)?;
        Ok(())
    }

    pub fn update_participant(
        &self,
        request: &UpdateParticipantRequest,
    ) -> Result<ParticipantInfo, CliError> {
        self.twirp.call(
            SERVICE,
            "UpdateParticipant",
            &Grants::room_admin(&request.room),
            request,
        )
    }

    pub fn mute_published_track(
        &self,
        room: &str,
        identity: &str,
        track_sid: &str,
        muted: bool,
    ) -> Result<Option<TrackInfo>, CliError> {
        let body = serde_json::json!({
            "room": room,
            "identity": identity,
            "track_sid": track_sid,
            "muted": muted,
        });
        let resp: MuteTrackResponse =
            self.twirp
                .call(SERVICE, "MutePublishedTrack", &Grants::room_admin(room), &body)?;
        Ok(resp.track)
    }

    pub fn update_subscriptions(
        &self,
        room: &str,
        identity: &str,
        track_sids: &[String],
        subscribe: bool,
    ) -> Result<(), CliError> {
        let body = serde_json::json!({
            "room": room,
            "identity": identity,
            "track_sids": track_sids,
            "subscribe": subscribe,
        });
        let _: Empty =
            self.twirp
                .call(SERVICE, "UpdateSubscriptions", &Grants::room_admin(room), &body)?;
        Ok(())
    }

    pub fn send_data(
        &self,
        room: &str,
        data: &[u8],
        kind: DataKind,
        topic: Option<&str>,
        destination_identities: &[String],
    ) -> Result<(), CliError> {
        let body = serde_json::json!({
            "room": room,
            "data": STANDARD.encode(data),
            "kind": kind,
            "topic": topic,
            "destination_identities": destination_identities,
        });
        let _: Empty = self
            .twirp
            .call(SERVICE, "SendData", &Grants::room_admin(room), &body)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int64_fields_accept_strings_and_numbers() {
        let as_string: Room =
            serde_json::from_str(r#"{"name":"a","creation_time":"1700000000"}"#).unwrap();
        let as_number: Room =
            serde_json::from_str(r#"{"name":"a","creation_time":1700000000}"#).unwrap();
        assert_eq!(as_string.creation_time, 1_700_000_000);
        assert_eq!(as_string, as_number);
    }

    #[test]
    fn create_request_omits_unset_limits() {
        let req = CreateRoomRequest {
            name: "standup".into(),
            max_participants: 10,
            ..CreateRoomRequest::default()
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["max_participants"], 10);
        assert!(json.get("empty_timeout").is_none());
        assert!(json.get("agents").is_none());
    }
}
