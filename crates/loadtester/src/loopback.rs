//! In-process stand-in for an SFU. Testers connected to the same
//! [`Loopback`] exchange synthetic packets with configurable loss,
//! reordering and delay.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{LoadTestError, Result};
use crate::quality::Quality;
use crate::transport::{
    ConnectRequest, MediaConnector, MediaEvent, MediaSession, TrackKind, TrackSpec,
};

#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    /// Probability that one forwarded packet is lost.
    pub loss: f64,
    /// Probability that one forwarded packet is held back behind the next.
    pub reorder: f64,
    pub latency: Duration,
    /// Extra delay per participant in the room, to emulate a loaded server.
    pub latency_per_participant: Duration,
    pub agent_join_delay: Duration,
    /// The first N connects fail.
    pub connect_failures: u32,
    pub min_speaker_interval: Duration,
    pub seed: u64,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            loss: 0.0,
            reorder: 0.0,
            latency: Duration::ZERO,
            latency_per_participant: Duration::ZERO,
            agent_join_delay: Duration::from_millis(500),
            connect_failures: 0,
            min_speaker_interval: Duration::from_secs(1),
            seed: 7,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopbackStats {
    pub connects: u64,
    pub failed_connects: u64,
    pub packets_forwarded: u64,
    pub keyframe_requests: u64,
    pub speaker_events: u64,
}

#[derive(Debug, Default)]
struct Counters {
    connects: AtomicU64,
    failed_connects: AtomicU64,
    packets_forwarded: AtomicU64,
    keyframe_requests: AtomicU64,
    speaker_events: AtomicU64,
}

struct HeldPacket {
    sequence: u64,
    payload_len: usize,
    sent_at: Instant,
}

struct Peer {
    tx: mpsc::UnboundedSender<MediaEvent>,
    auto_subscribe: bool,
    qualities: HashMap<String, Quality>,
    held: HashMap<String, HeldPacket>,
}

struct Track {
    sid: String,
    publisher: String,
    kind: TrackKind,
}

#[derive(Default)]
struct Room {
    peers: HashMap<String, Peer>,
    tracks: Vec<Track>,
    agents: usize,
}

impl Room {
    fn broadcast(&self, except: &str, event: &MediaEvent) {
        for (identity, peer) in &self.peers {
            if identity != except {
                let _ = peer.tx.send(event.clone());
            }
        }
    }

    fn participant_count(&self) -> usize {
        self.peers.len() + self.agents
    }
}

struct State {
    rooms: HashMap<String, Room>,
    failures_left: u32,
    next_track: u64,
    rng: StdRng,
}

struct Inner {
    config: LoopbackConfig,
    state: Mutex<State>,
    counters: Counters,
}

#[derive(Clone)]
pub struct Loopback {
    inner: Arc<Inner>,
}

impl Default for Loopback {
    fn default() -> Self {
        Self::new(LoopbackConfig::default())
    }
}

impl Loopback {
    pub fn new(config: LoopbackConfig) -> Self {
        let state = State {
            rooms: HashMap::new(),
            failures_left: config.connect_failures,
            next_track: 0,
            rng: StdRng::seed_from_u64(config.seed),
        };
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(state),
                counters: Counters::default(),
            }),
        }
    }

    pub fn stats(&self) -> LoopbackStats {
        let c = &self.inner.counters;
        LoopbackStats {
            connects: c.connects.load(Ordering::Relaxed),
            failed_connects: c.failed_connects.load(Ordering::Relaxed),
            packets_forwarded: c.packets_forwarded.load(Ordering::Relaxed),
            keyframe_requests: c.keyframe_requests.load(Ordering::Relaxed),
            speaker_events: c.speaker_events.load(Ordering::Relaxed),
        }
    }

    pub fn participants(&self, room: &str) -> usize {
        self.inner
            .state
            .lock()
            .rooms
            .get(room)
            .map(Room::participant_count)
            .unwrap_or(0)
    }

    fn join_agent(&self, room: &str, agent: &str) {
        let mut state = self.inner.state.lock();
        let Some(room_state) = state.rooms.get_mut(room) else {
            return;
        };
        room_state.agents += 1;
        let event = MediaEvent::ParticipantJoined {
            identity: format!("agent-{agent}"),
            is_agent: true,
        };
        room_state.broadcast("", &event);
        debug!(room, agent, "agent joined");
    }

    fn leave(&self, room: &str, identity: &str) {
        let mut state = self.inner.state.lock();
        let Some(room_state) = state.rooms.get_mut(room) else {
            return;
        };
        room_state.peers.remove(identity);
        let (gone, kept): (Vec<Track>, Vec<Track>) = std::mem::take(&mut room_state.tracks)
            .into_iter()
            .partition(|t| t.publisher == identity);
        room_state.tracks = kept;
        for track in gone {
            room_state.broadcast(identity, &MediaEvent::TrackUnpublished { track_sid: track.sid });
        }
        if room_state.peers.is_empty() {
            state.rooms.remove(room);
        }
    }
}

#[async_trait]
impl MediaConnector for Loopback {
    async fn connect(&self, request: ConnectRequest) -> Result<Arc<dyn MediaSession>> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.inner.state.lock();
            if state.failures_left > 0 {
                state.failures_left -= 1;
                self.inner.counters.failed_connects.fetch_add(1, Ordering::Relaxed);
                return Err(LoadTestError::Media("simulated connect failure".into()));
            }
            let room = state.rooms.entry(request.room.clone()).or_default();
            if room.peers.contains_key(&request.identity) {
                return Err(LoadTestError::Media(format!(
                    "identity {} already in room {}",
                    request.identity, request.room
                )));
            }
            let mut qualities = HashMap::new();
            if request.auto_subscribe {
                for track in &room.tracks {
                    qualities.insert(track.sid.clone(), Quality::High);
                    let _ = tx.send(MediaEvent::TrackSubscribed {
                        track_sid: track.sid.clone(),
                        publisher: track.publisher.clone(),
                        kind: track.kind,
                    });
                }
            }
            room.broadcast(
                &request.identity,
                &MediaEvent::ParticipantJoined {
                    identity: request.identity.clone(),
                    is_agent: false,
                },
            );
            room.peers.insert(
                request.identity.clone(),
                Peer {
                    tx,
                    auto_subscribe: request.auto_subscribe,
                    qualities,
                    held: HashMap::new(),
                },
            );
        }
        self.inner.counters.connects.fetch_add(1, Ordering::Relaxed);

        if let Some(agent) = request.agent_dispatch.clone() {
            let sfu = self.clone();
            let room = request.room.clone();
            let delay = self.inner.config.agent_join_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                sfu.join_agent(&room, &agent);
            });
        }

        Ok(Arc::new(LoopbackSession {
            sfu: self.clone(),
            room: request.room,
            identity: request.identity,
            rx: tokio::sync::Mutex::new(rx),
        }))
    }

    fn min_speaker_interval(&self) -> Duration {
        self.inner.config.min_speaker_interval
    }
}

struct LoopbackSession {
    sfu: Loopback,
    room: String,
    identity: String,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MediaEvent>>,
}

fn layer_payload(kind: TrackKind, quality: Quality, payload_len: usize) -> usize {
    match (kind, quality) {
        (TrackKind::Video, Quality::Medium) => payload_len / 2,
        (TrackKind::Video, Quality::Low) => payload_len / 4,
        _ => payload_len,
    }
}

#[async_trait]
impl MediaSession for LoopbackSession {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn publish(&self, track: TrackSpec) -> Result<String> {
        let mut state = self.sfu.inner.state.lock();
        state.next_track += 1;
        let sid = format!("TR_{}", state.next_track);
        let room = state
            .rooms
            .get_mut(&self.room)
            .ok_or_else(|| LoadTestError::Media("not connected".into()))?;
        for (identity, peer) in room.peers.iter_mut() {
            if identity == &self.identity || !peer.auto_subscribe {
                continue;
            }
            peer.qualities.insert(sid.clone(), Quality::High);
            let _ = peer.tx.send(MediaEvent::TrackSubscribed {
                track_sid: sid.clone(),
                publisher: self.identity.clone(),
                kind: track.kind,
            });
        }
        room.tracks.push(Track {
            sid: sid.clone(),
            publisher: self.identity.clone(),
            kind: track.kind,
        });
        debug!(identity = %self.identity, track = %track.name, %sid, "published");
        Ok(sid)
    }

    async fn send(&self, track_sid: &str, sequence: u64, payload_len: usize) -> Result<()> {
        let config = &self.sfu.inner.config;
        let mut guard = self.sfu.inner.state.lock();
        let state = &mut *guard;
        let Some(room) = state.rooms.get_mut(&self.room) else {
            return Err(LoadTestError::Media("not connected".into()));
        };
        let kind = room
            .tracks
            .iter()
            .find(|t| t.sid == track_sid)
            .map(|t| t.kind)
            .ok_or_else(|| LoadTestError::Media(format!("unknown track {track_sid}")))?;
        let delay = config.latency + config.latency_per_participant * room.participant_count() as u32;
        let now = Instant::now();
        let sent_at = now.checked_sub(delay).unwrap_or(now);
        let mut forwarded = 0;
        for (identity, peer) in room.peers.iter_mut() {
            if identity == &self.identity {
                continue;
            }
            let Some(quality) = peer.qualities.get(track_sid).copied() else {
                continue;
            };
            if quality == Quality::Off || state.rng.random_bool(config.loss.clamp(0.0, 1.0)) {
                continue;
            }
            let packet = |sequence, payload_len, sent_at| MediaEvent::Packet {
                track_sid: track_sid.to_string(),
                sequence,
                payload_len: layer_payload(kind, quality, payload_len),
                sent_at: Some(sent_at),
            };
            if !peer.held.contains_key(track_sid)
                && state.rng.random_bool(config.reorder.clamp(0.0, 1.0))
            {
                peer.held.insert(
                    track_sid.to_string(),
                    HeldPacket {
                        sequence,
                        payload_len,
                        sent_at,
                    },
                );
                continue;
            }
            let _ = peer.tx.send(packet(sequence, payload_len, sent_at));
            forwarded += 1;
            if let Some(held) = peer.held.remove(track_sid) {
                let _ = peer.tx.send(packet(held.sequence, held.payload_len, held.sent_at));
                forwarded += 1;
            }
        }
        self.sfu
            .inner
            .counters
            .packets_forwarded
            .fetch_add(forwarded, Ordering::Relaxed);
        Ok(())
    }

    async fn next_event(&self) -> Option<MediaEvent> {
        self.rx.lock().await.recv().await
    }

    async fn set_quality(&self, track_sid: &str, quality: Quality) -> Result<()> {
        let mut state = self.sfu.inner.state.lock();
        let peer = state
            .rooms
            .get_mut(&self.room)
            .and_then(|room| room.peers.get_mut(&self.identity))
            .ok_or_else(|| LoadTestError::Media("not connected".into()))?;
        peer.qualities.insert(track_sid.to_string(), quality);
        Ok(())
    }

    async fn request_keyframe(&self, _track_sid: &str) -> Result<()> {
        self.sfu
            .inner
            .counters
            .keyframe_requests
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn simulate_speaker(&self) -> Result<()> {
        let state = self.sfu.inner.state.lock();
        let room = state
            .rooms
            .get(&self.room)
            .ok_or_else(|| LoadTestError::Media("not connected".into()))?;
        room.broadcast(
            "",
            &MediaEvent::ActiveSpeaker {
                identity: self.identity.clone(),
            },
        );
        self.sfu
            .inner
            .counters
            .speaker_events
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn close(&self) {
        self.sfu.leave(&self.room, &self.identity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MediaProfile;

    fn request(identity: &str, subscribe: bool) -> ConnectRequest {
        ConnectRequest {
            url: "loopback://".into(),
            room: "r".into(),
            identity: identity.into(),
            token: String::new(),
            auto_subscribe: subscribe,
            agent_dispatch: None,
        }
    }

    fn audio() -> TrackSpec {
        TrackSpec {
            name: "audio".into(),
            kind: TrackKind::Audio,
            codec: None,
            simulcast: false,
            profile: MediaProfile::audio(),
        }
    }

    #[tokio::test]
    async fn packets_reach_subscribers_only() {
        let sfu = Loopback::default();
        let publisher = sfu.connect(request("pub", false)).await.unwrap();
        let subscriber = sfu.connect(request("sub", true)).await.unwrap();
        let sid = publisher.publish(audio()).await.unwrap();
        publisher.send(&sid, 1, 100).await.unwrap();

        assert!(matches!(
            subscriber.next_event().await,
            Some(MediaEvent::TrackSubscribed { ref track_sid, .. }) if track_sid == &sid
        ));
        match subscriber.next_event().await {
            Some(MediaEvent::Packet {
                sequence,
                payload_len,
                ..
            }) => {
                assert_eq!(sequence, 1);
                assert_eq!(payload_len, 100);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(sfu.stats().packets_forwarded, 1);
        assert_eq!(sfu.participants("r"), 2);

        subscriber.set_quality(&sid, Quality::Off).await.unwrap();
        publisher.send(&sid, 2, 100).await.unwrap();
        assert_eq!(sfu.stats().packets_forwarded, 1);

        subscriber.close().await;
        publisher.close().await;
        assert_eq!(sfu.participants("r"), 0);
    }

    #[tokio::test]
    async fn configured_failures_and_duplicates() {
        let sfu = Loopback::new(LoopbackConfig {
            connect_failures: 1,
            ..LoopbackConfig::default()
        });
        assert!(sfu.connect(request("a", true)).await.is_err());
        let _a = sfu.connect(request("a", true)).await.unwrap();
        assert!(sfu.connect(request("a", true)).await.is_err());
        assert_eq!(sfu.stats().failed_connects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dispatched_agent_joins_after_delay() {
        let sfu = Loopback::default();
        let mut req = request("caller", true);
        req.agent_dispatch = Some("support".into());
        let session = sfu.connect(req).await.unwrap();
        let event = session.next_event().await;
        assert_eq!(
            event,
            Some(MediaEvent::ParticipantJoined {
                identity: "agent-support".into(),
                is_agent: true
            })
        );
        assert_eq!(sfu.participants("r"), 2);
    }
}
