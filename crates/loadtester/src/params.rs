use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

use crate::error::LoadTestError;

/// How a subscriber lays out remote video, which bounds how many tracks it
/// watches and at what quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum Layout {
    #[default]
    Speaker,
    Grid3x3,
    Grid4x4,
    Grid5x5,
}

impl Layout {
    /// Video tracks a subscriber keeps enabled.
    pub fn capacity(self) -> usize {
        match self {
            Self::Speaker => 6,
            Self::Grid3x3 => 9,
            Self::Grid4x4 => 16,
            Self::Grid5x5 => 25,
        }
    }
}

impl FromStr for Layout {
    type Err = LoadTestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "speaker" => Ok(Self::Speaker),
            "3x3" => Ok(Self::Grid3x3),
            "4x4" => Ok(Self::Grid4x4),
            "5x5" => Ok(Self::Grid5x5),
            other => Err(LoadTestError::Params(format!(
                "unknown layout `{other}` (expected speaker, 3x3, 4x4 or 5x5)"
            ))),
        }
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Speaker => "speaker",
            Self::Grid3x3 => "3x3",
            Self::Grid4x4 => "4x4",
            Self::Grid5x5 => "5x5",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum Resolution {
    #[default]
    High,
    Medium,
    Low,
}

impl FromStr for Resolution {
    type Err = LoadTestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            other => Err(LoadTestError::Params(format!(
                "unknown video resolution `{other}` (expected high, medium or low)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VideoCodec {
    H264,
    Vp8,
}

impl FromStr for VideoCodec {
    type Err = LoadTestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "h264" => Ok(Self::H264),
            "vp8" => Ok(Self::Vp8),
            other => Err(LoadTestError::Params(format!(
                "unknown video codec `{other}` (expected h264 or vp8)"
            ))),
        }
    }
}

impl fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::H264 => "h264",
            Self::Vp8 => "vp8",
        })
    }
}

pub const DEFAULT_NUM_PER_SECOND: f64 = 5.0;
pub const CONNECT_ATTEMPTS: u32 = 10;
pub const CONNECT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Serialize)]
pub struct Params {
    pub url: String,
    pub room: String,
    /// Zero runs until cancelled.
    pub duration: Duration,
    pub layout: Layout,
    pub video_publishers: usize,
    pub audio_publishers: usize,
    pub subscribers: usize,
    pub num_per_second: f64,
    pub resolution: Resolution,
    /// `None` alternates h264 and vp8 across publishers.
    pub codec: Option<VideoCodec>,
    pub simulcast: bool,
    pub simulate_speakers: bool,
    pub video_bitrate: Option<u32>,
    pub identity_prefix: String,
    pub connect_attempts: u32,
    pub connect_retry_interval: Duration,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            url: String::new(),
            room: String::new(),
            duration: Duration::ZERO,
            layout: Layout::default(),
            video_publishers: 0,
            audio_publishers: 0,
            subscribers: 0,
            num_per_second: DEFAULT_NUM_PER_SECOND,
            resolution: Resolution::default(),
            codec: None,
            simulcast: true,
            simulate_speakers: false,
            video_bitrate: None,
            identity_prefix: "tester".into(),
            connect_attempts: CONNECT_ATTEMPTS,
            connect_retry_interval: CONNECT_RETRY_INTERVAL,
        }
    }
}

impl Params {
    pub fn validate(&self) -> Result<(), LoadTestError> {
        if self.room.trim().is_empty() {
            return Err(LoadTestError::Params("room is required".into()));
        }
        if self.tester_count() == 0 {
            return Err(LoadTestError::Params(
                "at least one publisher or subscriber is required".into(),
            ));
        }
        if !(self.num_per_second.is_finite() && self.num_per_second > 0.0) {
            return Err(LoadTestError::Params(format!(
                "num-per-second must be positive, got {}",
                self.num_per_second
            )));
        }
        if self.connect_attempts == 0 {
            return Err(LoadTestError::Params("connect attempts must be at least 1".into()));
        }
        Ok(())
    }

    pub fn publisher_count(&self) -> usize {
        self.video_publishers.max(self.audio_publishers)
    }

    pub fn tester_count(&self) -> usize {
        self.publisher_count() + self.subscribers
    }

    /// Testers released per ramp tick.
    pub fn per_tick(&self) -> usize {
        (self.num_per_second.ceil() as usize).max(1)
    }

    /// Video tracks one subscriber keeps. Without simulcast there is no
    /// layer to pick, so every track is watched.
    pub fn watched_video_tracks(&self) -> usize {
        if self.simulcast {
            self.video_publishers.min(self.layout.capacity())
        } else {
            self.video_publishers
        }
    }

    pub fn expected_tracks_per_subscriber(&self) -> usize {
        self.audio_publishers + self.watched_video_tracks()
    }

    pub fn codec_for(&self, publisher_index: usize) -> VideoCodec {
        self.codec.unwrap_or(if publisher_index % 2 == 0 {
            VideoCodec::H264
        } else {
            VideoCodec::Vp8
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parsing_and_counts() {
        assert_eq!("3x3".parse::<Layout>().unwrap(), Layout::Grid3x3);
        assert!("2x2".parse::<Layout>().is_err());
        assert_eq!("VP8".parse::<VideoCodec>().unwrap(), VideoCodec::Vp8);

        let params = Params {
            room: "load".into(),
            layout: Layout::Grid3x3,
            video_publishers: 4,
            audio_publishers: 2,
            subscribers: 8,
            num_per_second: 2.5,
            ..Params::default()
        };
        params.validate().unwrap();
        assert_eq!(params.tester_count(), 12);
        assert_eq!(params.per_tick(), 3);
        assert_eq!(params.expected_tracks_per_subscriber(), 6);
        assert_eq!(params.codec_for(0), VideoCodec::H264);
        assert_eq!(params.codec_for(1), VideoCodec::Vp8);
    }

    #[test]
    fn speaker_layout_caps_watched_video() {
        let params = Params {
            room: "load".into(),
            video_publishers: 10,
            subscribers: 1,
            ..Params::default()
        };
        assert_eq!(params.watched_video_tracks(), 6);
        let no_simulcast = Params {
            simulcast: false,
            ..params
        };
        assert_eq!(no_simulcast.watched_video_tracks(), 10);
    }

    #[test]
    fn invalid_params_are_rejected() {
        assert!(Params::default().validate().is_err());
        let params = Params {
            room: "r".into(),
            subscribers: 1,
            num_per_second: 0.0,
            ..Params::default()
        };
        assert!(params.validate().is_err());
    }
}
