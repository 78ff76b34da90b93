use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use serde_json::json;

use super::CommandContext;
use crate::error::CliError;
use crate::output::{Table, print_json, yes_no};
use crate::services::read_request_file;
use crate::services::sip::{
    CreateSipParticipantRequest, SipClient, SipDispatchRule, SipInboundTrunk, SipOutboundTrunk,
};

#[derive(Subcommand, Debug)]
pub enum SipCommand {
    /// Trunks that accept incoming calls
    Inbound {
        #[command(subcommand)]
        command: InboundCommand,
    },
    /// Trunks used to place calls
    Outbound {
        #[command(subcommand)]
        command: OutboundCommand,
    },
    /// Rules routing incoming calls to rooms
    Dispatch {
        #[command(subcommand)]
        command: DispatchCommand,
    },
    /// Phone participants
    Participant {
        #[command(subcommand)]
        command: ParticipantCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum InboundCommand {
    Create(InboundArgs),
    List(JsonArg),
    Update(InboundUpdateArgs),
    Delete(IdArg),
}

#[derive(Subcommand, Debug)]
pub enum OutboundCommand {
    Create(OutboundArgs),
    List(JsonArg),
    Update(OutboundUpdateArgs),
    Delete(IdArg),
}

#[derive(Subcommand, Debug)]
pub enum DispatchCommand {
    Create(DispatchArgs),
    List(JsonArg),
    Update(DispatchUpdateArgs),
    Delete(IdArg),
}

#[derive(Subcommand, Debug)]
pub enum ParticipantCommand {
    /// Dial a number and bring the callee into a room
    Create(ParticipantCreateArgs),
    /// Transfer a phone participant to another number
    Transfer(TransferArgs),
}

#[derive(Args, Debug)]
pub struct JsonArg {
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
pub struct IdArg {
    #[arg(long)]
    id: String,
}

#[derive(Args, Debug, Default)]
pub struct InboundArgs {
    /// JSON request file, `-` for stdin; flags override its fields
    request: Option<String>,
    #[arg(long)]
    name: Option<String>,
    /// Number, may be repeated
    #[arg(long = "number")]
    numbers: Vec<String>,
    /// Address or CIDR allowed to call, may be repeated
    #[arg(long = "allowed-address")]
    allowed_addresses: Vec<String>,
    #[arg(long = "allowed-number")]
    allowed_numbers: Vec<String>,
    #[arg(long)]
    auth_user: Option<String>,
    #[arg(long)]
    auth_pass: Option<String>,
}

#[derive(Args, Debug)]
pub struct InboundUpdateArgs {
    #[arg(long)]
    id: String,
    #[command(flatten)]
    fields: InboundArgs,
}

#[derive(Args, Debug, Default)]
pub struct OutboundArgs {
    request: Option<String>,
    #[arg(long)]
    name: Option<String>,
    /// SIP server host
    #[arg(long)]
    address: Option<String>,
    /// udp, tcp or tls
    #[arg(long)]
    transport: Option<String>,
    #[arg(long = "number")]
    numbers: Vec<String>,
    #[arg(long)]
    auth_user: Option<String>,
    #[arg(long)]
    auth_pass: Option<String>,
}

#[derive(Args, Debug)]
pub struct OutboundUpdateArgs {
    #[arg(long)]
    id: String,
    #[command(flatten)]
    fields: OutboundArgs,
}

#[derive(Args, Debug, Default)]
pub struct DispatchArgs {
    request: Option<String>,
    #[arg(long)]
    name: Option<String>,
    /// Trunk id, may be repeated; every trunk when omitted
    #[arg(long = "trunk")]
    trunks: Vec<String>,
    /// Send every caller to this room
    #[arg(long, conflicts_with = "individual")]
    direct: Option<String>,
    /// Give every caller a room named with this prefix
    #[arg(long)]
    individual: Option<String>,
    #[arg(long)]
    pin: Option<String>,
    #[arg(long)]
    hide_phone_number: bool,
}

#[derive(Args, Debug)]
pub struct DispatchUpdateArgs {
    #[arg(long)]
    id: String,
    #[command(flatten)]
    fields: DispatchArgs,
}

#[derive(Args, Debug)]
pub struct ParticipantCreateArgs {
    request: Option<String>,
    #[arg(long)]
    trunk: Option<String>,
    /// Number to dial
    #[arg(long)]
    call: Option<String>,
    #[arg(long)]
    room: Option<String>,
    #[arg(long)]
    identity: Option<String>,
    #[arg(long)]
    name: Option<String>,
    /// Caller number to present
    #[arg(long)]
    number: Option<String>,
    /// Return only once the callee picked up
    #[arg(long)]
    wait: bool,
    /// How long to wait for the call, e.g. 45s
    #[arg(long, value_parser = humantime::parse_duration)]
    timeout: Option<Duration>,
}

#[derive(Args, Debug)]
pub struct TransferArgs {
    #[arg(long)]
    room: String,
    #[arg(long)]
    identity: String,
    /// tel: or sip: uri
    #[arg(long)]
    to: String,
    /// Play a dial tone while transferring
    #[arg(long)]
    dialtone: bool,
}

fn load<T: serde::de::DeserializeOwned + Default>(request: &Option<String>) -> Result<T> {
    match request {
        Some(path) => Ok(read_request_file(path)?),
        None => Ok(T::default()),
    }
}

fn set(field: &mut String, value: &Option<String>) {
    if let Some(value) = value {
        *field = value.clone();
    }
}

fn extend(field: &mut Vec<String>, values: &[String]) {
    if !values.is_empty() {
        *field = values.to_vec();
    }
}

fn inbound_trunk(args: &InboundArgs) -> Result<SipInboundTrunk> {
    let mut trunk: SipInboundTrunk = load(&args.request)?;
    set(&mut trunk.name, &args.name);
    extend(&mut trunk.numbers, &args.numbers);
    extend(&mut trunk.allowed_addresses, &args.allowed_addresses);
    extend(&mut trunk.allowed_numbers, &args.allowed_numbers);
    set(&mut trunk.auth_username, &args.auth_user);
    set(&mut trunk.auth_password, &args.auth_pass);
    Ok(trunk)
}

fn outbound_trunk(args: &OutboundArgs) -> Result<SipOutboundTrunk> {
    let mut trunk: SipOutboundTrunk = load(&args.request)?;
    set(&mut trunk.name, &args.name);
    set(&mut trunk.address, &args.address);
    set(&mut trunk.transport, &args.transport);
    extend(&mut trunk.numbers, &args.numbers);
    set(&mut trunk.auth_username, &args.auth_user);
    set(&mut trunk.auth_password, &args.auth_pass);
    Ok(trunk)
}

fn dispatch_rule(args: &DispatchArgs) -> Result<SipDispatchRule> {
    let mut rule: SipDispatchRule = load(&args.request)?;
    set(&mut rule.name, &args.name);
    extend(&mut rule.trunk_ids, &args.trunks);
    let pin = args.pin.clone().unwrap_or_default();
    if let Some(room) = &args.direct {
        rule.rule = json!({ "dispatch_rule_direct": { "room_name": room, "pin": pin } });
    } else if let Some(prefix) = &args.individual {
        rule.rule = json!({ "dispatch_rule_individual": { "room_prefix": prefix, "pin": pin } });
    }
    if args.hide_phone_number {
        rule.hide_phone_number = true;
    }
    Ok(rule)
}

pub fn handle(ctx: &CommandContext, command: SipCommand) -> Result<()> {
    let (_, twirp) = ctx.connect()?;
    let client = SipClient::new(twirp);
    match command {
        SipCommand::Inbound { command } => inbound(&client, command),
        SipCommand::Outbound { command } => outbound(&client, command),
        SipCommand::Dispatch { command } => dispatch(&client, command),
        SipCommand::Participant { command } => participant(&client, command),
    }
}

fn inbound(client: &SipClient, command: InboundCommand) -> Result<()> {
    match command {
        InboundCommand::Create(args) => {
            let trunk = inbound_trunk(&args)?;
            if trunk.numbers.is_empty() && trunk.allowed_addresses.is_empty() {
                return Err(CliError::Input(
                    "an inbound trunk needs --number or --allowed-address".into(),
                )
                .into());
            }
            let created = client
                .create_inbound_trunk(&trunk)
                .context("unable to create inbound trunk")?;
            println!("Created inbound trunk {}", created.sip_trunk_id);
            Ok(())
        }
        InboundCommand::List(args) => {
            let trunks = client
                .list_inbound_trunks()
                .context("unable to list inbound trunks")?;
            if args.json {
                return print_json(&trunks);
            }
            let mut table = Table::new(["ID", "Name", "Numbers", "Allowed Addresses", "Authenticated"]);
            for t in &trunks {
                table.row([
                    t.sip_trunk_id.clone(),
                    t.name.clone(),
                    t.numbers.join(", "),
                    t.allowed_addresses.join(", "),
                    yes_no(!t.auth_username.is_empty()).to_string(),
                ]);
            }
            table.print();
            Ok(())
        }
        InboundCommand::Update(args) => {
            let mut trunk = inbound_trunk(&args.fields)?;
            trunk.sip_trunk_id = args.id;
            let updated = client
                .update_inbound_trunk(&trunk)
                .context("unable to update inbound trunk")?;
            println!("Updated inbound trunk {}", updated.sip_trunk_id);
            Ok(())
        }
        InboundCommand::Delete(args) => delete_trunk(client, &args.id),
    }
}

fn outbound(client: &SipClient, command: OutboundCommand) -> Result<()> {
    match command {
        OutboundCommand::Create(args) => {
            let trunk = outbound_trunk(&args)?;
            if trunk.address.is_empty() {
                return Err(CliError::Input("an outbound trunk needs --address".into()).into());
            }
            let created = client
                .create_outbound_trunk(&trunk)
                .context("unable to create outbound trunk")?;
            println!("Created outbound trunk {}", created.sip_trunk_id);
            Ok(())
        }
        OutboundCommand::List(args) => {
            let trunks = client
                .list_outbound_trunks()
                .context("unable to list outbound trunks")?;
            if args.json {
                return print_json(&trunks);
            }
            let mut table = Table::new(["ID", "Name", "Address", "Transport", "Numbers"]);
            for t in &trunks {
                table.row([
                    t.sip_trunk_id.clone(),
                    t.name.clone(),
                    t.address.clone(),
                    t.transport.clone(),
                    t.numbers.join(", "),
                ]);
            }
            table.print();
            Ok(())
        }
        OutboundCommand::Update(args) => {
            let mut trunk = outbound_trunk(&args.fields)?;
            trunk.sip_trunk_id = args.id;
            let updated = client
                .update_outbound_trunk(&trunk)
                .context("unable to update outbound trunk")?;
            println!("Updated outbound trunk {}", updated.sip_trunk_id);
            Ok(())
        }
        OutboundCommand::Delete(args) => delete_trunk(client, &args.id),
    }
}

fn delete_trunk(client: &SipClient, id: &str) -> Result<()> {
    client
        .delete_trunk(id)
        .context("unable to delete trunk")?;
    println!("Deleted trunk {id}");
    Ok(())
}

fn dispatch(client: &SipClient, command: DispatchCommand) -> Result<()> {
    match command {
        DispatchCommand::Create(args) => {
            let rule = dispatch_rule(&args)?;
            if rule.rule.is_null() {
                return Err(CliError::Input(
                    "a dispatch rule needs --direct or --individual".into(),
                )
                .into());
            }
            let created = client
                .create_dispatch_rule(&rule)
                .context("unable to create dispatch rule")?;
            println!("Created dispatch rule {}", created.sip_dispatch_rule_id);
            Ok(())
        }
        DispatchCommand::List(args) => {
            let rules = client
                .list_dispatch_rules()
                .context("unable to list dispatch rules")?;
            if args.json {
                return print_json(&rules);
            }
            let mut table = Table::new(["ID", "Name", "Trunks", "Type", "Hide Number"]);
            for r in &rules {
                let trunks = if r.trunk_ids.is_empty() {
                    "<any>".to_string()
                } else {
                    r.trunk_ids.join(", ")
                };
                table.row([
                    r.sip_dispatch_rule_id.clone(),
                    r.name.clone(),
                    trunks,
                    r.kind().to_string(),
                    yes_no(r.hide_phone_number).to_string(),
                ]);
            }
            table.print();
            Ok(())
        }
        DispatchCommand::Update(args) => {
            let mut rule = dispatch_rule(&args.fields)?;
            rule.sip_dispatch_rule_id = args.id;
            let updated = client
                .update_dispatch_rule(&rule)
                .context("unable to update dispatch rule")?;
            println!("Updated dispatch rule {}", updated.sip_dispatch_rule_id);
            Ok(())
        }
        DispatchCommand::Delete(args) => {
            client
                .delete_dispatch_rule(&args.id)
                .context("unable to delete dispatch rule")?;
            println!("Deleted dispatch rule {}", args.id);
            Ok(())
        }
    }
}

fn participant(client: &SipClient, command: ParticipantCommand) -> Result<()> {
    match command {
        ParticipantCommand::Create(args) => {
            let mut request: CreateSipParticipantRequest = load(&args.request)?;
            set(&mut request.sip_trunk_id, &args.trunk);
            set(&mut request.sip_call_to, &args.call);
            set(&mut request.room_name, &args.room);
            set(&mut request.participant_identity, &args.identity);
            set(&mut request.participant_name, &args.name);
            set(&mut request.sip_number, &args.number);
            request.wait_until_answered |= args.wait;
            let missing: Vec<&str> = [
                ("--trunk", &request.sip_trunk_id),
                ("--call", &request.sip_call_to),
                ("--room", &request.room_name),
            ]
            .into_iter()
            .filter(|(_, value)| value.is_empty())
            .map(|(flag, _)| flag)
            .collect();
            if !missing.is_empty() {
                return Err(CliError::Input(format!("missing {}", missing.join(", "))).into());
            }
            let info = client
                .create_participant(&request, args.timeout)
                .context("unable to create SIP participant")?;
            println!(
                "Created SIP participant {} in room {} (call {})",
                info.participant_identity, info.room_name, info.sip_call_id
            );
            Ok(())
        }
        ParticipantCommand::Transfer(args) => {
            client
                .transfer_participant(&args.room, &args.identity, &args.to, args.dialtone)
                .context("unable to transfer SIP participant")?;
            println!("Transferred {} to {}", args.identity, args.to);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_request_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trunk.json");
        std::fs::write(
            &path,
            r#"{"name":"from-file","numbers":["+15550100"],"auth_username":"u"}"#,
        )
        .unwrap();
        let trunk = inbound_trunk(&InboundArgs {
            request: Some(path.to_string_lossy().into_owned()),
            name: Some("from-flag".into()),
            ..InboundArgs::default()
        })
        .unwrap();
        assert_eq!(trunk.name, "from-flag");
        assert_eq!(trunk.numbers, vec!["+15550100".to_string()]);
        assert_eq!(trunk.auth_username, "u");
    }

    #[test]
    fn direct_rule_shape() {
        let rule = dispatch_rule(&DispatchArgs {
            direct: Some("lobby".into()),
            trunks: vec!["ST_1".into()],
            ..DispatchArgs::default()
        })
        .unwrap();
        assert_eq!(rule.kind(), "Direct");
        assert_eq!(rule.rule["dispatch_rule_direct"]["room_name"], "lobby");
        assert_eq!(rule.trunk_ids, vec!["ST_1".to_string()]);
    }
}
