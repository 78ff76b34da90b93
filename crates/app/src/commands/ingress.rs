use anyhow::{Context, Result};
use clap::{Args, Subcommand};

use super::CommandContext;
use crate::error::CliError;
use crate::output::{Table, print_json};
use crate::services::ingress::{
    CreateIngressRequest, IngressClient, IngressInfo, UpdateIngressRequest,
};
use crate::services::read_request_file;

const INPUT_TYPES: [&str; 3] = ["RTMP_INPUT", "WHIP_INPUT", "URL_INPUT"];

#[derive(Subcommand, Debug)]
pub enum IngressCommand {
    /// Create an ingress endpoint
    Create(CreateArgs),
    /// Change an ingress endpoint
    Update(UpdateArgs),
    /// List ingress endpoints
    List(ListArgs),
    /// Delete an ingress endpoint
    Delete(IdArg),
}

#[derive(Args, Debug, Default)]
pub struct CreateArgs {
    /// JSON request file, `-` for stdin; flags override its fields
    request: Option<String>,
    /// rtmp, whip or url
    #[arg(long)]
    input_type: Option<String>,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    room: Option<String>,
    #[arg(long)]
    identity: Option<String>,
    #[arg(long)]
    participant_name: Option<String>,
    /// Source to pull, for url inputs
    #[arg(long)]
    url: Option<String>,
    #[arg(long)]
    transcode: Option<bool>,
}

#[derive(Args, Debug)]
pub struct UpdateArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    room: Option<String>,
    #[arg(long)]
    identity: Option<String>,
    #[arg(long)]
    participant_name: Option<String>,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    #[arg(long)]
    room: Option<String>,
    #[arg(long)]
    id: Option<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
pub struct IdArg {
    #[arg(long)]
    id: String,
}

fn input_type(raw: &str) -> Result<String, CliError> {
    let upper = raw.to_ascii_uppercase();
    let normalized = if upper.ends_with("_INPUT") {
        upper
    } else {
        format!("{upper}_INPUT")
    };
    if INPUT_TYPES.contains(&normalized.as_str()) {
        Ok(normalized)
    } else {
        Err(CliError::Input(format!(
            "unknown input type `{raw}`; expected rtmp, whip or url"
        )))
    }
}

fn create_request(args: CreateArgs) -> Result<CreateIngressRequest> {
    let mut request: CreateIngressRequest = match &args.request {
        Some(path) => read_request_file(path)?,
        None => CreateIngressRequest::default(),
    };
    if let Some(kind) = args.input_type {
        request.input_type = kind;
    }
    if let Some(name) = args.name {
        request.name = name;
    }
    if let Some(room) = args.room {
        request.room_name = room;
    }
    if let Some(identity) = args.identity {
        request.participant_identity = identity;
    }
    if let Some(name) = args.participant_name {
        request.participant_name = name;
    }
    if args.url.is_some() {
        request.url = args.url;
    }
    if args.transcode.is_some() {
        request.enable_transcoding = args.transcode;
    }
    if request.input_type.is_empty() {
        return Err(CliError::Input("missing required flag --input-type".into()).into());
    }
    request.input_type = input_type(&request.input_type)?;
    if request.input_type == "URL_INPUT" && request.url.is_none() {
        return Err(CliError::Input("url inputs need --url".into()).into());
    }
    if request.room_name.is_empty() || request.participant_identity.is_empty() {
        return Err(CliError::Input("--room and --identity are required".into()).into());
    }
    Ok(request)
}

pub fn handle(ctx: &CommandContext, command: IngressCommand) -> Result<()> {
    let (_, twirp) = ctx.connect()?;
    let client = IngressClient::new(twirp);
    match command {
        IngressCommand::Create(args) => {
            let request = create_request(args)?;
            let info = client
                .create(&request)
                .context("unable to create ingress")?;
            println!("Created ingress {}", info.ingress_id);
            if !info.url.is_empty() {
                println!("URL: {}", info.url);
            }
            if !info.stream_key.is_empty() {
                println!("Stream key: {}", info.stream_key);
            }
            Ok(())
        }
        IngressCommand::Update(args) => {
            let info = client
                .update(&UpdateIngressRequest {
                    ingress_id: args.id,
                    name: args.name,
                    room_name: args.room,
                    participant_identity: args.identity,
                    participant_name: args.participant_name,
                })
                .context("unable to update ingress")?;
            println!("Updated ingress {}", info.ingress_id);
            Ok(())
        }
        IngressCommand::List(args) => {
            let items = client
                .list(args.room.as_deref(), args.id.as_deref())
                .context("unable to list ingress")?;
            if args.json {
                return print_json(&items);
            }
            ingress_table(&items).print();
            Ok(())
        }
        IngressCommand::Delete(args) => {
            let info = client
                .delete(&args.id)
                .context("unable to delete ingress")?;
            println!("Deleted ingress {}", info.ingress_id);
            Ok(())
        }
    }
}

fn ingress_table(items: &[IngressInfo]) -> Table {
    let mut table = Table::new(["ID", "Name", "Room", "Type", "Status", "Error"]);
    for i in items {
        let error = i.state.as_ref().map(|s| s.error.clone()).unwrap_or_default();
        table.row([
            i.ingress_id.clone(),
            i.name.clone(),
            i.room_name.clone(),
            i.input_type.clone(),
            i.status().to_string(),
            error,
        ]);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_type_accepts_short_names() {
        assert_eq!(input_type("rtmp").unwrap(), "RTMP_INPUT");
        assert_eq!(input_type("WHIP_INPUT").unwrap(), "WHIP_INPUT");
        assert!(input_type("srt").is_err());
    }

    #[test]
    fn url_input_requires_a_source() {
        let args = CreateArgs {
            input_type: Some("url".into()),
            room: Some("r".into()),
            identity: Some("cam".into()),
            ..CreateArgs::default()
        };
        assert!(create_request(args).is_err());
    }

    #[test]
    fn inactive_state_is_reported() {
        let table = ingress_table(&[IngressInfo {
            ingress_id: "IN_1".into(),
            ..IngressInfo::default()
        }]);
        assert_eq!(table.rows()[0][4], "ENDPOINT_INACTIVE");
    }
}
