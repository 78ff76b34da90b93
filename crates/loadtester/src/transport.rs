//! The seam between the load tester and a real-time media client.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::time::Instant;

use crate::error::Result;
use crate::params::{Resolution, VideoCodec};
use crate::quality::Quality;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Packet cadence of a synthetic looping sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaProfile {
    pub packets_per_second: u32,
    pub payload_bytes: usize,
}

impl MediaProfile {
    pub fn audio() -> Self {
        Self {
            packets_per_second: 50,
            payload_bytes: 120,
        }
    }

    pub fn video(resolution: Resolution, bitrate: Option<u32>) -> Self {
        let (packets_per_second, payload_bytes) = match resolution {
            Resolution::High => (90, 1100),
            Resolution::Medium => (60, 900),
            Resolution::Low => (30, 600),
        };
        let payload_bytes = bitrate
            .map(|bps| (bps as usize / 8 / packets_per_second as usize).max(1))
            .unwrap_or(payload_bytes);
        Self {
            packets_per_second,
            payload_bytes,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(1) / self.packets_per_second.max(1)
    }
}

#[derive(Debug, Clone)]
pub struct TrackSpec {
    pub name: String,
    pub kind: TrackKind,
    pub codec: Option<VideoCodec>,
    pub simulcast: bool,
    pub profile: MediaProfile,
}

#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub url: String,
    pub room: String,
    pub identity: String,
    pub token: String,
    pub auto_subscribe: bool,
    /// Agent the token dispatches into the room, if any.
    pub agent_dispatch: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    TrackSubscribed {
        track_sid: String,
        publisher: String,
        kind: TrackKind,
    },
    TrackUnpublished {
        track_sid: String,
    },
    Packet {
        track_sid: String,
        sequence: u64,
        payload_len: usize,
        /// Sender clock, present only when the sample carries a test timestamp.
        sent_at: Option<Instant>,
    },
    ParticipantJoined {
        identity: String,
        is_agent: bool,
    },
    ActiveSpeaker {
        identity: String,
    },
    Disconnected {
        reason: String,
    },
}

/// One connected participant.
#[async_trait]
pub trait MediaSession: Send + Sync {
    fn identity(&self) -> &str;

    async fn publish(&self, track: TrackSpec) -> Result<String>;

    async fn send(&self, track_sid: &str, sequence: u64, payload_len: usize) -> Result<()>;

    /// `None` once the session is closed.
    async fn next_event(&self) -> Option<MediaEvent>;

    async fn set_quality(&self, track_sid: &str, quality: Quality) -> Result<()>;

    async fn request_keyframe(&self, track_sid: &str) -> Result<()>;

    async fn simulate_speaker(&self) -> Result<()>;

    async fn close(&self);
}

#[async_trait]
pub trait MediaConnector: Send + Sync {
    async fn connect(&self, request: ConnectRequest) -> Result<Arc<dyn MediaSession>>;

    /// Shortest gap the connector accepts between speaker simulations.
    fn min_speaker_interval(&self) -> Duration {
        Duration::from_secs(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRequest {
    pub room: String,
    pub identity: String,
    pub can_publish: bool,
    pub can_subscribe: bool,
    pub agent: Option<String>,
}

/// Mints join tokens for testers.
pub trait TokenIssuer: Send + Sync {
    fn issue(&self, request: &TokenRequest) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitrate_override_sizes_payloads() {
        let default = MediaProfile::video(Resolution::High, None);
        assert_eq!(default.payload_bytes, 1100);
        let capped = MediaProfile::video(Resolution::Low, Some(240_000));
        assert_eq!(capped.payload_bytes, 1000);
        assert_eq!(MediaProfile::audio().interval(), Duration::from_millis(20));
    }
}
