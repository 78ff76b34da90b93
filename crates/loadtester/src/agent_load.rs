//! Opens rooms that each dispatch an agent and times how long the agent
//! takes to show up.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::engine::until;
use crate::error::{LoadTestError, Result};
use crate::params::{CONNECT_ATTEMPTS, CONNECT_RETRY_INTERVAL, DEFAULT_NUM_PER_SECOND};
use crate::report::trim_decimal;
use crate::tester::{connect_with_retry, stopped};
use crate::transport::{ConnectRequest, MediaConnector, MediaEvent, TokenIssuer, TokenRequest};

pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize)]
pub struct AgentLoadParams {
    pub url: String,
    pub room_prefix: String,
    pub agent_name: String,
    pub rooms: usize,
    pub num_per_second: f64,
    pub join_timeout: Duration,
    /// How long each room stays open after its agent joined.
    pub hold: Duration,
}

impl Default for AgentLoadParams {
    fn default() -> Self {
        Self {
            url: String::new(),
            room_prefix: "agent-load".into(),
            agent_name: String::new(),
            rooms: 1,
            num_per_second: DEFAULT_NUM_PER_SECOND,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            hold: Duration::ZERO,
        }
    }
}

impl AgentLoadParams {
    pub fn validate(&self) -> Result<()> {
        if self.agent_name.trim().is_empty() {
            return Err(LoadTestError::Params("agent name is required".into()));
        }
        if self.rooms == 0 {
            return Err(LoadTestError::Params("at least one room is required".into()));
        }
        if !(self.num_per_second.is_finite() && self.num_per_second > 0.0) {
            return Err(LoadTestError::Params(format!(
                "num-per-second must be positive, got {}",
                self.num_per_second
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoomResult {
    pub room: String,
    pub join_latency: Option<Duration>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentLoadReport {
    pub rooms: Vec<RoomResult>,
}

impl AgentLoadReport {
    pub fn joined(&self) -> usize {
        self.rooms.iter().filter(|r| r.join_latency.is_some()).count()
    }

    pub fn average(&self) -> Option<Duration> {
        let latencies: Vec<_> = self.rooms.iter().filter_map(|r| r.join_latency).collect();
        let count = u32::try_from(latencies.len()).ok().filter(|n| *n > 0)?;
        Some(latencies.iter().sum::<Duration>() / count)
    }

    pub fn slowest(&self) -> Option<Duration> {
        self.rooms.iter().filter_map(|r| r.join_latency).max()
    }

    pub fn headers() -> [&'static str; 3] {
        ["Room", "Agent Joined", "Error"]
    }

    pub fn rows(&self) -> Vec<Vec<String>> {
        self.rooms
            .iter()
            .map(|r| {
                vec![
                    r.room.clone(),
                    r.join_latency.map(millis).unwrap_or_else(|| "-".into()),
                    r.error.clone().unwrap_or_default(),
                ]
            })
            .collect()
    }

    pub fn summary_line(&self) -> String {
        let mut line = format!("{}/{} agents joined", self.joined(), self.rooms.len());
        if let (Some(avg), Some(max)) = (self.average(), self.slowest()) {
            line.push_str(&format!(", avg {}, max {}", millis(avg), millis(max)));
        }
        line
    }
}

fn millis(d: Duration) -> String {
    format!("{}ms", trim_decimal(d.as_secs_f64() * 1000.0, 1))
}

pub async fn run(
    params: &AgentLoadParams,
    connector: Arc<dyn MediaConnector>,
    tokens: Arc<dyn TokenIssuer>,
    mut cancel: watch::Receiver<bool>,
) -> Result<AgentLoadReport> {
    params.validate()?;
    let per_tick = (params.num_per_second.ceil() as usize).max(1);
    let mut results: Vec<Option<RoomResult>> = vec![None; params.rooms];
    let mut running = JoinSet::new();
    let mut ticker = tokio::time::interval_at(
        Instant::now() + Duration::from_secs(1),
        Duration::from_secs(1),
    );
    let mut released = 0;
    info!(rooms = params.rooms, agent = %params.agent_name, "starting agent load test");

    while released < params.rooms || !running.is_empty() {
        tokio::select! {
            _ = stopped(&mut cancel) => break,
            _ = ticker.tick(), if released < params.rooms => {
                let end = (released + per_tick).min(params.rooms);
                for index in released..end {
                    let room = format!("{}-{index}", params.room_prefix);
                    running.spawn(open_room(
                        index,
                        room,
                        params.clone(),
                        connector.clone(),
                        tokens.clone(),
                        cancel.clone(),
                    ));
                }
                released = end;
            }
            Some(joined) = running.join_next(), if !running.is_empty() => {
                if let Ok((index, result)) = joined {
                    results[index] = Some(result);
                }
            }
        }
    }
    running.abort_all();
    while let Some(joined) = running.join_next().await {
        if let Ok((index, result)) = joined {
            results[index] = Some(result);
        }
    }

    let rooms = results
        .into_iter()
        .enumerate()
        .map(|(index, result)| {
            result.unwrap_or_else(|| RoomResult {
                room: format!("{}-{index}", params.room_prefix),
                join_latency: None,
                error: Some("cancelled".into()),
            })
        })
        .collect();
    Ok(AgentLoadReport { rooms })
}

async fn open_room(
    index: usize,
    room: String,
    params: AgentLoadParams,
    connector: Arc<dyn MediaConnector>,
    tokens: Arc<dyn TokenIssuer>,
    mut cancel: watch::Receiver<bool>,
) -> (usize, RoomResult) {
    let mut result = RoomResult {
        room: room.clone(),
        join_latency: None,
        error: None,
    };
    match wait_for_agent(&room, &params, connector.as_ref(), tokens.as_ref(), &mut cancel).await {
        Ok(latency) => result.join_latency = Some(latency),
        Err(err) => {
            warn!(%room, error = %err, "agent did not join");
            result.error = Some(err.to_string());
        }
    }
    (index, result)
}

async fn wait_for_agent(
    room: &str,
    params: &AgentLoadParams,
    connector: &dyn MediaConnector,
    tokens: &dyn TokenIssuer,
    cancel: &mut watch::Receiver<bool>,
) -> Result<Duration> {
    let identity = format!("{room}-caller");
    let token = tokens.issue(&TokenRequest {
        room: room.to_string(),
        identity: identity.clone(),
        can_publish: true,
        can_subscribe: true,
        agent: Some(params.agent_name.clone()),
    })?;
    let request = ConnectRequest {
        url: params.url.clone(),
        room: room.to_string(),
        identity,
        token,
        auto_subscribe: true,
        agent_dispatch: Some(params.agent_name.clone()),
    };
    let session =
        connect_with_retry(connector, request, CONNECT_ATTEMPTS, CONNECT_RETRY_INTERVAL, cancel)
            .await?;
    let started = Instant::now();
    let deadline = started + params.join_timeout;

    let outcome = loop {
        let event = tokio::select! {
            _ = stopped(cancel) => break Err(LoadTestError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => {
                break Err(LoadTestError::Media(format!(
                    "no agent joined within {}s",
                    params.join_timeout.as_secs()
                )));
            }
            event = session.next_event() => event,
        };
        match event {
            Some(MediaEvent::ParticipantJoined { identity, is_agent: true }) => {
                debug!(room, agent = %identity, "agent joined");
                break Ok(started.elapsed());
            }
            Some(_) => continue,
            None => break Err(LoadTestError::Media("session closed".into())),
        }
    };

    if outcome.is_ok() && !params.hold.is_zero() {
        tokio::select! {
            _ = stopped(cancel) => {}
            _ = until(Some(Instant::now() + params.hold)) => {}
        }
    }
    session.close().await;
    outcome
}
