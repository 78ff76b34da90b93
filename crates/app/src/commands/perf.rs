use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use livekit_loadtester::{
    AgentLoadParams, AgentLoadReport, Layout, LoadTest, LoadTestError, Loopback, LoopbackConfig,
    MediaConnector, Params, Report, Resolution, SUITE_DURATION, SuiteResult, TokenIssuer,
    TokenRequest, VideoCodec, agent_load,
};
use tracing::warn;

use super::CommandContext;
use crate::output::{Table, expand_template};
use crate::resolver::ProjectContext;
use crate::token::{AccessToken, RoomAgentDispatch, RoomConfiguration, VideoGrant};

const TESTER_TOKEN_TTL: Duration = Duration::from_secs(60 * 60);

/// Every tester talks to an in-process loopback network, never to the
/// project's media server.
const SIMULATED_NETWORK: &str = "in-process simulated network";

#[derive(Subcommand, Debug)]
pub enum PerfCommand {
    /// Publish and subscribe from many simulated participants.
    ///
    /// Media flows over an in-process simulated network shaped by the
    /// "Simulated network" flags; the project's server is only used to
    /// sign tester tokens.
    LoadTest(LoadTestArgs),
    /// Measure how quickly a dispatched agent joins new rooms, on the
    /// in-process simulated network
    AgentLoadTest(AgentLoadTestArgs),
}

#[derive(Args, Debug)]
pub struct LoadTestArgs {
    /// Room to load; `{.}` expands to random hex
    #[arg(long, default_value = "load-test-{.}")]
    room: String,
    /// How long to run, e.g. 1m; runs until interrupted when omitted
    #[arg(long, value_parser = humantime::parse_duration)]
    duration: Option<Duration>,
    /// speaker, 3x3, 4x4 or 5x5
    #[arg(long, default_value = "speaker")]
    layout: Layout,
    #[arg(long, default_value_t = 0)]
    video_publishers: usize,
    #[arg(long, default_value_t = 0)]
    audio_publishers: usize,
    #[arg(long, default_value_t = 0)]
    subscribers: usize,
    /// Testers started per second
    #[arg(long, default_value_t = livekit_loadtester::params::DEFAULT_NUM_PER_SECOND)]
    num_per_second: f64,
    /// high, medium or low
    #[arg(long, default_value = "high")]
    video_resolution: Resolution,
    /// h264 or vp8; publishers alternate when omitted
    #[arg(long)]
    video_codec: Option<VideoCodec>,
    #[arg(long)]
    no_simulcast: bool,
    /// Rotate the active speaker between publishers
    #[arg(long)]
    simulate_speakers: bool,
    /// Video bitrate in bits per second
    #[arg(long)]
    video_bitrate: Option<u32>,
    /// Run the fixed suite of publisher/subscriber configurations
    #[arg(long, conflicts_with = "find_max")]
    suite: bool,
    /// Find the most subscribers whose average latency stays under this bound
    #[arg(long, value_parser = humantime::parse_duration)]
    find_max: Option<Duration>,
    /// Upper bound for --find-max
    #[arg(long, default_value_t = 1000)]
    max_subscribers: usize,
    #[command(flatten)]
    network: NetworkArgs,
}

/// Conditions of the in-process media connector.
#[derive(Args, Debug)]
#[command(next_help_heading = "Simulated network")]
pub struct NetworkArgs {
    /// Fraction of packets lost, 0 to 1
    #[arg(long, default_value_t = 0.0)]
    loss: f64,
    /// Fraction of packets delivered out of order, 0 to 1
    #[arg(long, default_value_t = 0.0)]
    reorder: f64,
    /// One-way delay, e.g. 40ms
    #[arg(long, value_parser = humantime::parse_duration)]
    latency: Option<Duration>,
    /// Extra delay for every participant in the room
    #[arg(long, value_parser = humantime::parse_duration)]
    latency_per_participant: Option<Duration>,
    /// How long a dispatched agent takes to join
    #[arg(long, value_parser = humantime::parse_duration)]
    agent_join_delay: Option<Duration>,
    #[arg(long)]
    seed: Option<u64>,
}

impl NetworkArgs {
    fn connector(&self) -> Arc<dyn MediaConnector> {
        let defaults = LoopbackConfig::default();
        Arc::new(Loopback::new(LoopbackConfig {
            loss: self.loss,
            reorder: self.reorder,
            latency: self.latency.unwrap_or(defaults.latency),
            latency_per_participant: self
                .latency_per_participant
                .unwrap_or(defaults.latency_per_participant),
            agent_join_delay: self.agent_join_delay.unwrap_or(defaults.agent_join_delay),
            seed: self.seed.unwrap_or(defaults.seed),
            ..defaults
        }))
    }
}

#[derive(Args, Debug)]
pub struct AgentLoadTestArgs {
    /// Agent to dispatch into every room
    #[arg(long)]
    agent_name: String,
    #[arg(long, default_value_t = 1)]
    rooms: usize,
    #[arg(long, default_value = "agent-load")]
    room_prefix: String,
    /// Rooms opened per second
    #[arg(long, default_value_t = livekit_loadtester::params::DEFAULT_NUM_PER_SECOND)]
    num_per_second: f64,
    /// Give up on a room after this long
    #[arg(long, value_parser = humantime::parse_duration, default_value = "30s")]
    join_timeout: Duration,
    /// Keep each room open this long after the agent joined
    #[arg(long, value_parser = humantime::parse_duration, default_value = "0s")]
    hold: Duration,
    #[command(flatten)]
    network: NetworkArgs,
}

/// Signs tester join tokens with the project's key pair.
struct ProjectTokens {
    api_key: String,
    api_secret: String,
}

impl ProjectTokens {
    fn new(project: &ProjectContext) -> Self {
        Self {
            api_key: project.api_key.clone(),
            api_secret: project.api_secret.clone(),
        }
    }
}

impl TokenIssuer for ProjectTokens {
    fn issue(&self, request: &TokenRequest) -> livekit_loadtester::Result<String> {
        let grant = VideoGrant {
            room_join: true,
            room: request.room.clone(),
            can_publish: Some(request.can_publish),
            can_subscribe: Some(request.can_subscribe),
            ..VideoGrant::default()
        };
        let mut token = AccessToken::new(&self.api_key, &self.api_secret)
            .with_identity(request.identity.clone())
            .with_video(grant)
            .with_ttl(TESTER_TOKEN_TTL);
        if let Some(agent) = &request.agent {
            token = token.with_room_config(RoomConfiguration {
                agents: vec![RoomAgentDispatch {
                    agent_name: agent.clone(),
                    metadata: String::new(),
                }],
            });
        }
        token.to_jwt().map_err(|err| LoadTestError::Token {
            identity: request.identity.clone(),
            message: err.to_string(),
        })
    }
}

pub async fn handle(ctx: &CommandContext, command: PerfCommand) -> Result<()> {
    let project = ctx.project(false)?;
    let tokens: Arc<dyn TokenIssuer> = Arc::new(ProjectTokens::new(&project));
    match command {
        PerfCommand::LoadTest(args) => load_test(ctx, &project, tokens, args).await,
        PerfCommand::AgentLoadTest(args) => {
            let params = AgentLoadParams {
                url: project.url.clone(),
                room_prefix: args.room_prefix,
                agent_name: args.agent_name,
                rooms: args.rooms,
                num_per_second: args.num_per_second,
                join_timeout: args.join_timeout,
                hold: args.hold,
            };
            let report = agent_load::run(
                &params,
                args.network.connector(),
                tokens,
                ctx.shutdown.subscribe(),
            )
            .await
            .context("unable to run agent load test")?;
            let mut table = Table::new(AgentLoadReport::headers());
            for row in report.rows() {
                table.row(row);
            }
            table.print();
            println!("{}", report.summary_line());
            Ok(())
        }
    }
}

fn load_params(project: &ProjectContext, args: &LoadTestArgs) -> Params {
    Params {
        url: project.url.clone(),
        room: expand_template(&args.room),
        duration: args.duration.unwrap_or(Duration::ZERO),
        layout: args.layout,
        video_publishers: args.video_publishers,
        audio_publishers: args.audio_publishers,
        subscribers: args.subscribers,
        num_per_second: args.num_per_second,
        resolution: args.video_resolution,
        codec: args.video_codec,
        simulcast: !args.no_simulcast,
        simulate_speakers: args.simulate_speakers,
        video_bitrate: args.video_bitrate,
        ..Params::default()
    }
}

async fn load_test(
    ctx: &CommandContext,
    project: &ProjectContext,
    tokens: Arc<dyn TokenIssuer>,
    args: LoadTestArgs,
) -> Result<()> {
    let params = load_params(project, &args);
    let room = params.room.clone();
    let test = LoadTest::new(params, args.network.connector(), tokens);
    let cancel = ctx.shutdown.subscribe();

    if args.suite {
        let duration = args.duration.unwrap_or(SUITE_DURATION);
        let results = test
            .run_suite(duration, cancel)
            .await
            .context("unable to run load test suite")?;
        suite_table(&results).print();
        return Ok(());
    }

    if let Some(max_latency) = args.find_max {
        let found = test
            .find_max(max_latency, args.max_subscribers, cancel)
            .await
            .context("unable to find maximum subscribers")?;
        println!(
            "Max subscribers within {}: {found}",
            humantime::format_duration(max_latency)
        );
        return Ok(());
    }

    println!("Running load test in room {room} on the {SIMULATED_NETWORK}");
    let report = test.run(cancel).await.context("unable to run load test")?;
    for error in &report.total.errors {
        warn!(%error, "tester failed");
    }
    report_table(&report).print();
    Ok(())
}

fn report_table(report: &Report) -> Table {
    let mut table = Table::new(Report::headers());
    for row in report.rows() {
        table.row(row);
    }
    table
}

fn suite_table(results: &[SuiteResult]) -> Table {
    let mut table = Table::new(SuiteResult::headers());
    for result in results {
        table.row(result.row());
    }
    table
}
