use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use serde_json::Value;

use super::CommandContext;
use crate::error::CliError;
use crate::output::{Table, print_json};
use crate::services::egress::{EgressClient, EgressInfo};
use crate::services::read_request_file;

#[derive(Subcommand, Debug)]
pub enum EgressCommand {
    /// Start a room composite recording from a JSON request
    Start(StartArgs),
    /// List recordings and streams
    List(ListArgs),
    /// Stop a running egress
    Stop(StopArgs),
}

#[derive(Args, Debug)]
pub struct StartArgs {
    /// JSON request file, `-` for stdin
    request: String,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    #[arg(long)]
    room: Option<String>,
    /// Only running egresses
    #[arg(long)]
    active: bool,
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
pub struct StopArgs {
    #[arg(long)]
    id: String,
}

pub fn handle(ctx: &CommandContext, command: EgressCommand) -> Result<()> {
    let (_, twirp) = ctx.connect()?;
    let client = EgressClient::new(twirp);
    match command {
        EgressCommand::Start(args) => {
            let request: Value = read_request_file(&args.request)?;
            let room = request.get("room_name").and_then(Value::as_str).unwrap_or("");
            if room.is_empty() {
                return Err(CliError::Input("request needs a room_name".into()).into());
            }
            let info = client
                .start_room_composite(&request)
                .context("unable to start egress")?;
            println!("Started egress {} for room {}", info.egress_id, info.room_name);
            Ok(())
        }
        EgressCommand::List(args) => {
            let items = client
                .list(args.room.as_deref(), args.active)
                .context("unable to list egress")?;
            if args.json {
                return print_json(&items);
            }
            egress_table(&items).print();
            Ok(())
        }
        EgressCommand::Stop(args) => {
            let info = client.stop(&args.id).context("unable to stop egress")?;
            println!("Stopped egress {} ({})", info.egress_id, info.status);
            Ok(())
        }
    }
}

fn timestamp(nanos: i64) -> String {
    if nanos <= 0 {
        return String::new();
    }
    chrono::DateTime::from_timestamp_nanos(nanos)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

fn egress_table(items: &[EgressInfo]) -> Table {
    let mut table = Table::new(["ID", "Room", "Status", "Started", "Ended", "Error"]);
    for e in items {
        table.row([
            e.egress_id.clone(),
            e.room_name.clone(),
            e.status.clone(),
            timestamp(e.started_at),
            timestamp(e.ended_at),
            e.error.clone(),
        ]);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_timestamps_stay_blank() {
        let table = egress_table(&[EgressInfo {
            egress_id: "EG_1".into(),
            started_at: 1_000_000_000,
            ..EgressInfo::default()
        }]);
        assert_eq!(table.rows()[0][3], "1970-01-01 00:00:01");
        assert_eq!(table.rows()[0][4], "");
    }
}
