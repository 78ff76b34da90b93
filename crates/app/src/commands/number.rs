use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use tracing::warn;

use super::CommandContext;
use crate::error::CliError;
use crate::output::{Table, print_json};
use crate::prompt::{Flow, FlowResult, Outcome, Prompter, run_flow};
use crate::services::phone::{PhoneNumber, PhoneNumberClient, SearchQuery};

#[derive(Subcommand, Debug)]
pub enum NumberCommand {
    /// Search numbers available for purchase
    Search(SearchArgs),
    /// Buy numbers, optionally routing them through a dispatch rule
    Purchase(PurchaseArgs),
    /// List the project's numbers
    List(JsonArg),
    /// Show one number
    Get(GetArgs),
    /// Route a number through a dispatch rule
    Update(UpdateArgs),
    /// Give numbers back
    Release(ReleaseArgs),
}

#[derive(Args, Debug)]
pub struct JsonArg {
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
pub struct SearchArgs {
    /// ISO country code, e.g. US
    #[arg(long)]
    country_code: String,
    #[arg(long)]
    area_code: Option<String>,
    #[arg(long)]
    limit: Option<u32>,
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
pub struct PurchaseArgs {
    /// E.164 number, may be repeated
    #[arg(long = "number", required = true)]
    numbers: Vec<String>,
    #[arg(long)]
    dispatch_rule: Option<String>,
}

#[derive(Args, Debug)]
pub struct GetArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
pub struct UpdateArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    dispatch_rule: String,
}

#[derive(Args, Debug)]
pub struct ReleaseArgs {
    /// Number id, may be repeated
    #[arg(long = "id", required = true)]
    ids: Vec<String>,
    /// Skip the confirmation
    #[arg(short, long)]
    yes: bool,
}

pub async fn handle(ctx: &CommandContext, command: NumberCommand) -> Result<()> {
    let (_, twirp) = ctx.connect()?;
    let client = PhoneNumberClient::new(twirp);
    match command {
        NumberCommand::Search(args) => {
            let query = SearchQuery {
                country_code: args.country_code,
                area_code: args.area_code,
                limit: args.limit,
            };
            let found = tokio::task::spawn_blocking(move || client.search(&query))
                .await
                .context("search task failed")?
                .context("unable to search phone numbers")?;
            if args.json {
                return print_json(&found);
            }
            let mut table = Table::new(["Number", "Type", "Locality", "Region", "Capabilities"]);
            for n in &found {
                table.row([
                    n.e164_format.clone(),
                    n.number_type.clone(),
                    n.locality.clone(),
                    n.region.clone(),
                    n.capabilities.join(", "),
                ]);
            }
            table.print();
            Ok(())
        }
        NumberCommand::Purchase(args) => {
            let purchased = client.purchase(args.numbers, args.dispatch_rule).await?;
            for n in &purchased {
                println!("Purchased {} ({})", n.e164_format, n.id);
            }
            Ok(())
        }
        NumberCommand::List(args) => {
            let numbers = client.list().await?;
            if args.json {
                return print_json(&numbers);
            }
            numbers_table(&numbers).print();
            Ok(())
        }
        NumberCommand::Get(args) => {
            let number = client.get(&args.id).await?;
            if args.json {
                return print_json(&number);
            }
            numbers_table(std::slice::from_ref(&number)).print();
            Ok(())
        }
        NumberCommand::Update(args) => {
            let number = client.update(&args.id, &args.dispatch_rule).await?;
            println!(
                "Number {} now routes through {}",
                number.e164_format,
                number.sip_dispatch_rule_ids.join(", ")
            );
            Ok(())
        }
        NumberCommand::Release(args) => {
            let prompter = ctx.prompter.as_ref();
            let mut flow = ReleaseFlow {
                client,
                ids: args.ids,
                skip_confirm: args.yes,
            };
            let outcome = tokio::task::block_in_place(|| run_flow(&mut flow, prompter))?;
            match outcome {
                FlowResult::Completed(()) => Ok(()),
                FlowResult::Declined => {
                    warn!("release declined");
                    Ok(())
                }
                FlowResult::Cancelled => Err(CliError::Cancelled.into()),
            }
        }
    }
}

struct ReleaseFlow {
    client: PhoneNumberClient,
    ids: Vec<String>,
    skip_confirm: bool,
}

impl Flow for ReleaseFlow {
    type Output = ();

    fn confirm(&mut self, prompter: &dyn Prompter) -> Result<Outcome<bool>> {
        if self.skip_confirm {
            return Ok(Outcome::Value(true));
        }
        prompter.confirm(
            &format!("Release {} number(s)? This cannot be undone", self.ids.len()),
            false,
        )
    }

    fn execute(&mut self) -> Result<()> {
        self.client
            .release(&self.ids)
            .context("unable to release phone numbers")?;
        Ok(())
    }

    fn render(&self, _output: &()) -> Result<()> {
        println!("Released {}", self.ids.join(", "));
        Ok(())
    }
}

fn numbers_table(numbers: &[PhoneNumber]) -> Table {
    let mut table = Table::new(["ID", "Number", "Status", "Dispatch Rules"]);
    for n in numbers {
        let rules = if n.sip_dispatch_rule_ids.is_empty() {
            "-".to_string()
        } else {
            n.sip_dispatch_rule_ids.join(", ")
        };
        table.row([n.id.clone(), n.e164_format.clone(), n.status.clone(), rules]);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrouted_numbers_show_a_dash() {
        let table = numbers_table(&[
            PhoneNumber {
                id: "PN_1".into(),
                e164_format: "+15550100".into(),
                sip_dispatch_rule_ids: vec!["SDR_a".into(), "SDR_b".into()],
                ..PhoneNumber::default()
            },
            PhoneNumber {
                id: "PN_2".into(),
                ..PhoneNumber::default()
            },
        ]);
        assert_eq!(table.rows()[0][3], "SDR_a, SDR_b");
        assert_eq!(table.rows()[1][3], "-");
    }
}
