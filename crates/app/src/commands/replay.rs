use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};

use super::CommandContext;
use crate::output::{Table, print_json};
use crate::services::replay::{ReplayClient, ReplayInfo};

#[derive(Subcommand, Debug)]
pub enum ReplayCommand {
    /// List recorded sessions
    List(ListArgs),
    /// Start playing a recording into a room
    Load(LoadArgs),
    /// Move a running playback
    Seek(SeekArgs),
    /// Stop a running playback
    Close(PlaybackArg),
    /// Delete a recording
    Delete(ReplayArg),
}

#[derive(Args, Debug)]
pub struct ListArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
pub struct LoadArgs {
    #[arg(long)]
    id: String,
    /// Room to play into
    #[arg(long)]
    room: String,
    /// Where to start, e.g. 90s
    #[arg(long, value_parser = humantime::parse_duration)]
    offset: Option<Duration>,
}

#[derive(Args, Debug)]
pub struct SeekArgs {
    #[arg(long)]
    playback_id: String,
    #[arg(long, value_parser = humantime::parse_duration)]
    offset: Duration,
}

#[derive(Args, Debug)]
pub struct PlaybackArg {
    #[arg(long)]
    playback_id: String,
}

#[derive(Args, Debug)]
pub struct ReplayArg {
    #[arg(long)]
    id: String,
}

fn millis(offset: Option<Duration>) -> i64 {
    offset
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

pub fn handle(ctx: &CommandContext, command: ReplayCommand) -> Result<()> {
    let (_, twirp) = ctx.connect()?;
    let client = ReplayClient::new(twirp);
    match command {
        ReplayCommand::List(args) => {
            let replays = client.list().context("unable to list replays")?;
            if args.json {
                return print_json(&replays);
            }
            replays_table(&replays).print();
            Ok(())
        }
        ReplayCommand::Load(args) => {
            let loaded = client
                .load(&args.id, &args.room, millis(args.offset))
                .context("unable to load replay")?;
            println!("Playback {} started in room {}", loaded.playback_id, args.room);
            Ok(())
        }
        ReplayCommand::Seek(args) => {
            client
                .seek(&args.playback_id, millis(Some(args.offset)))
                .context("unable to seek replay")?;
            println!(
                "Playback {} moved to {}",
                args.playback_id,
                humantime::format_duration(args.offset)
            );
            Ok(())
        }
        ReplayCommand::Close(args) => {
            client
                .close(&args.playback_id)
                .context("unable to close replay")?;
            println!("Closed playback {}", args.playback_id);
            Ok(())
        }
        ReplayCommand::Delete(args) => {
            client.delete(&args.id).context("unable to delete replay")?;
            println!("Deleted replay {}", args.id);
            Ok(())
        }
    }
}

fn replays_table(replays: &[ReplayInfo]) -> Table {
    let mut table = Table::new(["ID", "Room", "Started", "Duration"]);
    for r in replays {
        let started = chrono::DateTime::from_timestamp(r.start_time, 0)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        let duration = Duration::from_secs(u64::try_from(r.duration).unwrap_or(0));
        table.row([
            r.replay_id.clone(),
            r.room_name.clone(),
            started,
            humantime::format_duration(duration).to_string(),
        ]);
    }
    table
}
