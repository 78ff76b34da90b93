use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};

use super::{CommandContext, parse_key_value};
use crate::error::CliError;
use crate::output::expand_template;
use crate::resolver::ProjectContext;
use crate::token::{AccessToken, DEFAULT_TTL, RoomAgentDispatch, RoomConfiguration, VideoGrant};

#[derive(Subcommand, Debug)]
pub enum TokenCommand {
    /// Mint an access token
    Create(CreateArgs),
}

#[derive(Args, Debug, Default)]
pub struct CreateArgs {
    /// Allow creating rooms
    #[arg(long)]
    create: bool,
    /// Allow listing rooms
    #[arg(long)]
    list: bool,
    /// Allow joining --room as --identity
    #[arg(long)]
    join: bool,
    /// Allow administering --room
    #[arg(long)]
    admin: bool,
    /// Hidden participant that records --room
    #[arg(long)]
    recorder: bool,
    /// Allow starting egress
    #[arg(long)]
    egress: bool,
    /// Allow managing ingress
    #[arg(long)]
    ingress: bool,
    /// Restrict publishing to these sources (camera, microphone, ...)
    #[arg(long = "allow-source")]
    allow_sources: Vec<String>,
    #[arg(long)]
    room: Option<String>,
    /// Participant identity; `{.}` expands to random hex
    #[arg(long)]
    identity: Option<String>,
    /// Display name; `{.}` expands to random hex
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    metadata: Option<String>,
    /// key=value, may be repeated
    #[arg(long = "attribute", value_parser = parse_key_value)]
    attributes: Vec<(String, String)>,
    /// Token lifetime, e.g. 30m or 6h (at most 24h)
    #[arg(long, value_parser = humantime::parse_duration)]
    valid_for: Option<Duration>,
    /// Dispatch this agent when the room is created by the token holder
    #[arg(long)]
    agent: Option<String>,
}

pub fn handle(ctx: &CommandContext, command: TokenCommand) -> Result<()> {
    match command {
        TokenCommand::Create(args) => {
            let project = ctx.project(false)?;
            let token = build(&args, &project)?;
            let claims = token.claims()?;
            let jwt = token.to_jwt().context("unable to sign token")?;
            if let Some(video) = &claims.video {
                let grants = serde_json::to_string_pretty(video)
                    .context("failed to encode token grants")?;
                println!("Token grants:\n{grants}");
            }
            if !claims.sub.is_empty() {
                println!("Identity: {}", claims.sub);
            }
            if !project.url.is_empty() {
                println!("Project URL: {}", project.url);
            }
            println!("Access token: {jwt}");
            Ok(())
        }
    }
}

fn build(args: &CreateArgs, project: &ProjectContext) -> Result<AccessToken> {
    let room = args.room.clone().unwrap_or_default();
    let needs_room = args.join || args.admin || args.recorder;
    if needs_room && room.is_empty() {
        return Err(CliError::Input("--room is required for --join, --admin and --recorder".into()).into());
    }

    let mut video = VideoGrant {
        room_create: args.create,
        room_list: args.list,
        room_admin: args.admin,
        room_record: args.egress || args.recorder,
        ingress_admin: args.ingress,
        room,
        ..VideoGrant::default()
    };
    if args.join {
        video.room_join = true;
        video.can_publish = Some(true);
        video.can_subscribe = Some(true);
        video.can_publish_data = Some(true);
        video.can_publish_sources = args.allow_sources.clone();
    }
    if args.recorder {
        video.room_join = true;
        video.recorder = true;
        video.hidden = true;
        video.can_subscribe = Some(true);
    }
    let granted = video.room_create
        || video.room_list
        || video.room_admin
        || video.room_record
        || video.room_join
        || video.ingress_admin;
    if !granted {
        return Err(CliError::Input(
            "no grants requested; pass at least one of --create, --list, --join, --admin, --recorder, --egress, --ingress"
                .into(),
        )
        .into());
    }

    let identity = args.identity.as_deref().map(expand_template).unwrap_or_default();
    if video.room_join && identity.is_empty() {
        return Err(CliError::Input("--identity is required to join a room".into()).into());
    }

    let mut token = AccessToken::new(&project.api_key, &project.api_secret)
        .with_video(video)
        .with_ttl(args.valid_for.unwrap_or(DEFAULT_TTL));
    if !identity.is_empty() {
        token = token.with_identity(identity);
    }
    if let Some(name) = &args.name {
        token = token.with_name(expand_template(name));
    }
    if let Some(metadata) = &args.metadata {
        token = token.with_metadata(metadata.clone());
    }
    if !args.attributes.is_empty() {
        token = token.with_attributes(args.attributes.iter().cloned().collect());
    }
    if let Some(agent) = &args.agent {
        token = token.with_room_config(RoomConfiguration {
            agents: vec![RoomAgentDispatch {
                agent_name: agent.clone(),
                metadata: String::new(),
            }],
        });
    }
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::ProjectSource;
    use crate::token::{MAX_TTL, verify};

    fn project() -> ProjectContext {
        ProjectContext {
            name: None,
            url: "wss://demo.livekit.cloud".into(),
            api_key: "APIdemo".into(),
            api_secret: "a-secret-long-enough-to-sign".into(),
            project_id: None,
            source: ProjectSource::Explicit,
        }
    }

    #[test]
    fn join_token_expands_identity() {
        let args = CreateArgs {
            join: true,
            room: Some("r1".into()),
            identity: Some("user-{.}".into()),
            ..CreateArgs::default()
        };
        let jwt = build(&args, &project()).unwrap().to_jwt().unwrap();
        let claims = verify(&jwt, &project().api_secret).unwrap();
        let video = claims.video.unwrap();
        assert!(video.room_join);
        assert_eq!(video.room, "r1");
        let suffix = claims.sub.strip_prefix("user-").unwrap();
        assert!(!suffix.is_empty());
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn join_needs_room_and_identity() {
        let no_room = CreateArgs {
            join: true,
            identity: Some("a".into()),
            ..CreateArgs::default()
        };
        assert!(build(&no_room, &project()).is_err());
        let no_identity = CreateArgs {
            join: true,
            room: Some("r".into()),
            ..CreateArgs::default()
        };
        assert!(build(&no_identity, &project()).is_err());
    }

    #[test]
    fn validity_is_capped() {
        let args = CreateArgs {
            list: true,
            valid_for: Some(MAX_TTL + Duration::from_secs(1)),
            ..CreateArgs::default()
        };
        assert!(build(&args, &project()).unwrap().to_jwt().is_err());
    }

    #[test]
    fn some_grant_is_required() {
        assert!(build(&CreateArgs::default(), &project()).is_err());
    }
}
