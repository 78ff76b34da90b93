use std::collections::BTreeMap;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};

use super::{CommandContext, parse_key_value};
use crate::error::CliError;
use crate::output::{Table, print_json, yes_no};
use crate::services::room::{
    CreateRoomRequest, DataKind, ParticipantInfo, Room, RoomAgentDispatchRequest, RoomClient,
    UpdateParticipantRequest,
};

#[derive(Subcommand, Debug)]
pub enum RoomCommand {
    /// Create a room
    Create(CreateArgs),
    /// List rooms
    List(ListArgs),
    /// Replace a room's metadata
    Update(UpdateArgs),
    /// Delete a room and disconnect everyone in it
    Delete(RoomArg),
    /// Inspect participants
    Participants {
        #[command(subcommand)]
        command: ParticipantsCommand,
    },
    /// Disconnect a participant
    RemoveParticipant(ParticipantArgs),
    /// Change a participant's name, metadata or attributes
    UpdateParticipant(UpdateParticipantArgs),
    /// Mute or unmute a published track
    MuteTrack(MuteTrackArgs),
    /// Subscribe or unsubscribe a participant from tracks
    UpdateSubscriptions(UpdateSubscriptionsArgs),
    /// Send a data packet to the room
    SendData(SendDataArgs),
}

#[derive(Subcommand, Debug)]
pub enum ParticipantsCommand {
    /// List the participants of a room
    List(ParticipantsListArgs),
    /// Show one participant
    Get(ParticipantArgs),
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    name: String,
    /// Seconds to keep an empty room open
    #[arg(long, default_value_t = 0)]
    empty_timeout: u32,
    /// Seconds to keep the room open after the last participant left
    #[arg(long, default_value_t = 0)]
    departure_timeout: u32,
    #[arg(long, default_value_t = 0)]
    max_participants: u32,
    #[arg(long, default_value = "")]
    metadata: String,
    /// Agent to dispatch when the room starts, may be repeated
    #[arg(long = "agent")]
    agents: Vec<String>,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Only these rooms
    names: Vec<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
pub struct UpdateArgs {
    name: String,
    #[arg(long)]
    metadata: String,
}

#[derive(Args, Debug)]
pub struct RoomArg {
    name: String,
}

#[derive(Args, Debug)]
pub struct ParticipantsListArgs {
    #[arg(long)]
    room: String,
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
pub struct ParticipantArgs {
    #[arg(long)]
    room: String,
    #[arg(long)]
    identity: String,
}

#[derive(Args, Debug)]
pub struct UpdateParticipantArgs {
    #[command(flatten)]
    target: ParticipantArgs,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    metadata: Option<String>,
    /// key=value, may be repeated
    #[arg(long = "attribute", value_parser = parse_key_value)]
    attributes: Vec<(String, String)>,
}

#[derive(Args, Debug)]
pub struct MuteTrackArgs {
    #[command(flatten)]
    target: ParticipantArgs,
    #[arg(long)]
    track_sid: String,
    /// Unmute instead of mute
    #[arg(long)]
    unmute: bool,
}

#[derive(Args, Debug)]
pub struct UpdateSubscriptionsArgs {
    #[command(flatten)]
    target: ParticipantArgs,
    /// Track sid, may be repeated
    #[arg(long = "track", required = true)]
    tracks: Vec<String>,
    /// Unsubscribe instead of subscribe
    #[arg(long)]
    unsubscribe: bool,
}

#[derive(Args, Debug)]
pub struct SendDataArgs {
    #[arg(long)]
    room: String,
    /// Payload, sent as UTF-8
    #[arg(long)]
    data: String,
    #[arg(long)]
    topic: Option<String>,
    /// Recipient identity, may be repeated; everyone when omitted
    #[arg(long = "identity")]
    identities: Vec<String>,
    /// Send unreliably
    #[arg(long)]
    lossy: bool,
}

pub fn handle(ctx: &CommandContext, command: RoomCommand) -> Result<()> {
    let (_, twirp) = ctx.connect()?;
    let client = RoomClient::new(twirp);
    match command {
        RoomCommand::Create(args) => {
            let agents = (!args.agents.is_empty()).then(|| {
                args.agents
                    .iter()
                    .map(|name| RoomAgentDispatchRequest {
                        agent_name: name.clone(),
                        metadata: String::new(),
                    })
                    .collect()
            });
            let room = client
                .create_room(&CreateRoomRequest {
                    name: args.name,
                    empty_timeout: args.empty_timeout,
                    departure_timeout: args.departure_timeout,
                    max_participants: args.max_participants,
                    metadata: args.metadata,
                    agents,
                })
                .context("unable to create room")?;
            println!("Created room {} ({})", room.name, room.sid);
            Ok(())
        }
        RoomCommand::List(args) => {
            let rooms = client
                .list_rooms(&args.names)
                .context("unable to list rooms")?;
            if args.json {
                return print_json(&rooms);
            }
            rooms_table(&rooms).print();
            Ok(())
        }
        RoomCommand::Update(args) => {
            let room = client
                .update_room_metadata(&args.name, &args.metadata)
                .context("unable to update room")?;
            println!("Updated room {}", room.name);
            Ok(())
        }
        RoomCommand::Delete(args) => {
            client
                .delete_room(&args.name)
                .context("unable to delete room")?;
            println!("Deleted room {}", args.name);
            Ok(())
        }
        RoomCommand::Participants { command } => match command {
            ParticipantsCommand::List(args) => {
                let participants = client
                    .list_participants(&args.room)
                    .context("unable to list participants")?;
                if args.json {
                    return print_json(&participants);
                }
                participants_table(&participants).print();
                Ok(())
            }
            ParticipantsCommand::Get(args) => {
                let participant = client
                    .get_participant(&args.room, &args.identity)
                    .context("unable to get participant")?;
                print_json(&participant)
            }
        },
        RoomCommand::RemoveParticipant(args) => {
            client
                .remove_participant(&args.room, &args.identity)
                .context("unable to remove participant")?;
            println!("Removed {} from {}", args.identity, args.room);
            Ok(())
        }
        RoomCommand::UpdateParticipant(args) => {
            if args.name.is_none() && args.metadata.is_none() && args.attributes.is_empty() {
                return Err(CliError::Input(
                    "nothing to update; pass --name, --metadata or --attribute".into(),
                )
                .into());
            }
            let participant = client
                .update_participant(&UpdateParticipantRequest {
                    room: args.target.room,
                    identity: args.target.identity,
                    metadata: args.metadata,
                    name: args.name,
                    attributes: args.attributes.into_iter().collect::<BTreeMap<_, _>>(),
                    permission: None,
                })
                .context("unable to update participant")?;
            println!("Updated participant {}", participant.identity);
            Ok(())
        }
        RoomCommand::MuteTrack(args) => {
            let muted = !args.unmute;
            client
                .mute_published_track(
                    &args.target.room,
                    &args.target.identity,
                    &args.track_sid,
                    muted,
                )
                .context("unable to mute track")?;
            println!(
                "{} track {}",
                if muted { "Muted" } else { "Unmuted" },
                args.track_sid
            );
            Ok(())
        }
        RoomCommand::UpdateSubscriptions(args) => {
            let subscribe = !args.unsubscribe;
            client
                .update_subscriptions(
                    &args.target.room,
                    &args.target.identity,
                    &args.tracks,
                    subscribe,
                )
                .context("unable to update subscriptions")?;
            println!(
                "{} {} to {} track(s)",
                if subscribe { "Subscribed" } else { "Unsubscribed" },
                args.target.identity,
                args.tracks.len()
            );
            Ok(())
        }
        RoomCommand::SendData(args) => {
            let kind = if args.lossy {
                DataKind::Lossy
            } else {
                DataKind::Reliable
            };
            client
                .send_data(
                    &args.room,
                    args.data.as_bytes(),
                    kind,
                    args.topic.as_deref(),
                    &args.identities,
                )
                .context("unable to send data")?;
            println!("Sent {} byte(s) to {}", args.data.len(), args.room);
            Ok(())
        }
    }
}

fn rooms_table(rooms: &[Room]) -> Table {
    let mut table = Table::new(["SID", "Name", "Participants", "Publishers", "Recording"]);
    for room in rooms {
        table.row([
            room.sid.clone(),
            room.name.clone(),
            room.num_participants.to_string(),
            room.num_publishers.to_string(),
            yes_no(room.active_recording).to_string(),
        ]);
    }
    table
}

fn participants_table(participants: &[ParticipantInfo]) -> Table {
    let mut table = Table::new(["SID", "Identity", "Name", "State", "Tracks"]);
    for p in participants {
        let tracks: Vec<String> = p
            .tracks
            .iter()
            .map(|t| {
                if t.muted {
                    format!("{} (muted)", t.sid)
                } else {
                    t.sid.clone()
                }
            })
            .collect();
        table.row([
            p.sid.clone(),
            p.identity.clone(),
            p.name.clone(),
            p.state.clone(),
            tracks.join(", "),
        ]);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::room::TrackInfo;

    #[test]
    fn muted_tracks_are_marked() {
        let table = participants_table(&[ParticipantInfo {
            sid: "PA_1".into(),
            identity: "alice".into(),
            tracks: vec![
                TrackInfo {
                    sid: "TR_a".into(),
                    muted: true,
                    ..TrackInfo::default()
                },
                TrackInfo {
                    sid: "TR_v".into(),
                    ..TrackInfo::default()
                },
            ],
            ..ParticipantInfo::default()
        }]);
        assert_eq!(table.rows()[0][4], "TR_a (muted), TR_v");
    }
}
