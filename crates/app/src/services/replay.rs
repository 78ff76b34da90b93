use serde::{Deserialize, Serialize};
use serde_json::json;
use serde_with::{DisplayFromStr, PickFirst, serde_as};

use super::{Grants, TwirpClient};
use crate::error::CliError;

const SERVICE: &str = "Replay";

#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplayInfo {
    #[serde(default)]
    pub replay_id: String,
    #[serde(default)]
    pub room_name: String,
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    #[serde(default)]
    pub start_time: i64,
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    #[serde(default)]
    pub duration: i64,
}

#[derive(Debug, Deserialize, Default)]
struct ListReplaysResponse {
    #[serde(default)]
    replays: Vec<ReplayInfo>,
}

#[derive(Debug, Deserialize, Default)]
pub struct LoadReplayResponse {
    #[serde(default)]
    pub playback_id: String,
}

#[derive(Debug, Deserialize, Default)]
struct Empty {}

#[derive(Debug, Clone)]
pub struct ReplayClient {
    twirp: TwirpClient,
}

impl ReplayClient {
    pub fn new(twirp: TwirpClient) -> Self {
        Self { twirp }
    }

    pub fn list(&self) -> Result<Vec<ReplayInfo>, CliError> {
        let resp: ListReplaysResponse =
            self.twirp
                .call(SERVICE, "ListReplays", &Grants::recorder(), &json!({}))?;
        Ok(resp.replays)
    }

    pub fn load(
        &self,
        replay_id: &str,
        room: &str,
        offset_ms: i64,
    ) -> Result<LoadReplayResponse, CliError> {
        self.twirp.call(
            SERVICE,
            "LoadReplay",
            &Grants::recorder(),
            &json!({ "replay_id": replay_id, "room_name": room, "starting_pts": offset_ms }),
        )
    }

    pub fn seek(&self, playback_id: &str, offset_ms: i64) -> Result<(), CliError> {
        let _: Empty = self.twirp.call(
            SERVICE,
            "SeekForRoom",
            &Grants::recorder(),
            &json!({ "playback_id": playback_id, "pts": offset_ms }),
        )?;
        Ok(())
    }

    pub fn close(&self, playback_id: &str) -> Result<(), CliError> {
        let _: Empty = self.twirp.call(
            SERVICE,
            "CloseReplay",
            &Grants::recorder(),
            &json!({ "playback_id": playback_id }),
        )?;
        Ok(())
    }

    pub fn delete(&self, replay_id: &str) -> Result<(), CliError> {
        let _: Empty = self.twirp.call(
            SERVICE,
            "DeleteReplay",
            &Grants::recorder(),
            &json!({ "replay_id": replay_id }),
        )?;
        Ok(())
    }
}
