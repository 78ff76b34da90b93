//! One virtual participant.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::error::{LoadTestError, Result};
use crate::params::{Layout, Params, Resolution, VideoCodec};
use crate::quality::{self, Quality};
use crate::stats::{ReorderWindow, TesterStats, TrackStats};
use crate::transport::{
    ConnectRequest, MediaConnector, MediaEvent, MediaProfile, MediaSession, TokenIssuer,
    TokenRequest, TrackKind, TrackSpec,
};

#[derive(Debug, Clone)]
pub struct TesterConfig {
    pub identity: String,
    pub url: String,
    pub room: String,
    pub video: Option<VideoCodec>,
    pub audio: bool,
    pub subscribe: bool,
    pub layout: Layout,
    pub simulcast: bool,
    pub resolution: Resolution,
    pub video_bitrate: Option<u32>,
    pub expected_tracks: usize,
    pub connect_attempts: u32,
    pub connect_retry_interval: Duration,
}

impl TesterConfig {
    pub fn publisher(params: &Params, index: usize) -> Self {
        Self {
            identity: format!("{}_pub_{index}", params.identity_prefix),
            video: (index < params.video_publishers).then(|| params.codec_for(index)),
            audio: index < params.audio_publishers,
            subscribe: false,
            expected_tracks: 0,
            ..Self::base(params)
        }
    }

    pub fn subscriber(params: &Params, index: usize) -> Self {
        Self {
            identity: format!("{}_sub_{index}", params.identity_prefix),
            subscribe: true,
            expected_tracks: params.expected_tracks_per_subscriber(),
            ..Self::base(params)
        }
    }

    fn base(params: &Params) -> Self {
        Self {
            identity: String::new(),
            url: params.url.clone(),
            room: params.room.clone(),
            video: None,
            audio: false,
            subscribe: false,
            layout: params.layout,
            simulcast: params.simulcast,
            resolution: params.resolution,
            video_bitrate: params.video_bitrate,
            expected_tracks: 0,
            connect_attempts: params.connect_attempts,
            connect_retry_interval: params.connect_retry_interval,
        }
    }

    pub fn is_publisher(&self) -> bool {
        self.video.is_some() || self.audio
    }
}

/// Resolves when `stop` flips to true; never when its sender is gone.
pub(crate) async fn stopped(stop: &mut watch::Receiver<bool>) {
    if stop.wait_for(|flag| *flag).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Connect with up to `attempts` tries, `interval` apart.
pub(crate) async fn connect_with_retry(
    connector: &dyn MediaConnector,
    request: ConnectRequest,
    attempts: u32,
    interval: Duration,
    stop: &mut watch::Receiver<bool>,
) -> Result<Arc<dyn MediaSession>> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match connector.connect(request.clone()).await {
            Ok(session) => return Ok(session),
            Err(err) if attempt >= attempts => {
                return Err(LoadTestError::Connect {
                    identity: request.identity,
                    attempts,
                    message: err.to_string(),
                });
            }
            Err(err) => {
                debug!(identity = %request.identity, attempt, error = %err, "connect failed, retrying");
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = stopped(stop) => return Err(LoadTestError::Cancelled),
        }
    }
}

pub struct Tester {
    config: TesterConfig,
    stats: TesterStats,
    session: Mutex<Option<Arc<dyn MediaSession>>>,
}

impl Tester {
    pub fn new(config: TesterConfig) -> Self {
        Self {
            config,
            stats: TesterStats::default(),
            session: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &TesterConfig {
        &self.config
    }

    pub fn stats(&self) -> &TesterStats {
        &self.stats
    }

    pub fn session(&self) -> Option<Arc<dyn MediaSession>> {
        self.session.lock().clone()
    }

    pub fn summary(&self) -> crate::report::Summary {
        self.stats
            .summary(&self.config.identity, self.config.expected_tracks)
    }

    /// Connect, publish, receive until `stop` or disconnect. Failures are
    /// recorded on the tester's stats as well as returned.
    pub async fn run(
        self: Arc<Self>,
        connector: Arc<dyn MediaConnector>,
        tokens: Arc<dyn TokenIssuer>,
        mut stop: watch::Receiver<bool>,
    ) -> Result<()> {
        let result = self.run_inner(connector, tokens, &mut stop).await;
        if let Err(err) = &result
            && !matches!(err, LoadTestError::Cancelled)
        {
            warn!(identity = %self.config.identity, error = %err, "tester failed");
            self.stats.set_error(err.to_string());
        }
        self.stats.mark_finished();
        let session = self.session.lock().take();
        if let Some(session) = session {
            session.close().await;
        }
        result
    }

    async fn run_inner(
        &self,
        connector: Arc<dyn MediaConnector>,
        tokens: Arc<dyn TokenIssuer>,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let cfg = &self.config;
        let token = tokens.issue(&TokenRequest {
            room: cfg.room.clone(),
            identity: cfg.identity.clone(),
            can_publish: cfg.is_publisher(),
            can_subscribe: cfg.subscribe,
            agent: None,
        })?;
        let request = ConnectRequest {
            url: cfg.url.clone(),
            room: cfg.room.clone(),
            identity: cfg.identity.clone(),
            token,
            auto_subscribe: cfg.subscribe,
            agent_dispatch: None,
        };
        let session = connect_with_retry(
            connector.as_ref(),
            request,
            cfg.connect_attempts,
            cfg.connect_retry_interval,
            stop,
        )
        .await?;
        *self.session.lock() = Some(session.clone());
        self.stats.mark_connected();
        debug!(identity = %cfg.identity, "tester connected");

        let mut publishers = JoinSet::new();
        for spec in self.tracks() {
            let sid = session.publish(spec.clone()).await?;
            publishers.spawn(publish_loop(session.clone(), sid, spec.profile, stop.clone()));
        }

        let outcome = self.receive(session.as_ref(), stop).await;
        publishers.abort_all();
        outcome
    }

    fn tracks(&self) -> Vec<TrackSpec> {
        let cfg = &self.config;
        let mut specs = Vec::new();
        if cfg.audio {
            specs.push(TrackSpec {
                name: "audio".into(),
                kind: TrackKind::Audio,
                codec: None,
                simulcast: false,
                profile: MediaProfile::audio(),
            });
        }
        if let Some(codec) = cfg.video {
            specs.push(TrackSpec {
                name: format!("video-{codec}"),
                kind: TrackKind::Video,
                codec: Some(codec),
                simulcast: cfg.simulcast,
                profile: MediaProfile::video(cfg.resolution, cfg.video_bitrate),
            });
        }
        specs
    }

    async fn receive(
        &self,
        session: &dyn MediaSession,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let mut windows: HashMap<String, ReorderWindow> = HashMap::new();
        loop {
            let event = tokio::select! {
                _ = stopped(stop) => return Ok(()),
                event = session.next_event() => event,
            };
            let Some(event) = event else {
                return Ok(());
            };
            match event {
                MediaEvent::TrackSubscribed { track_sid, kind, .. } if self.config.subscribe => {
                    self.on_subscribed(session, &track_sid, kind).await?;
                }
                MediaEvent::Packet {
                    track_sid,
                    sequence,
                    payload_len,
                    sent_at,
                } => {
                    let Some(track) = self.stats.track(&track_sid) else {
                        continue;
                    };
                    let verdict = windows.entry(track_sid.clone()).or_default().observe(sequence);
                    if verdict.duplicate {
                        continue;
                    }
                    let latency = sent_at.map(|at| Instant::now().saturating_duration_since(at));
                    track.record_packet(payload_len, latency);
                    if verdict.out_of_order {
                        track.record_out_of_order();
                    }
                    if verdict.dropped > 0 {
                        track.record_dropped(verdict.dropped);
                        if track.kind == TrackKind::Video {
                            session.request_keyframe(&track_sid).await?;
                        }
                    }
                }
                MediaEvent::Disconnected { reason } => {
                    return Err(LoadTestError::Media(format!("disconnected: {reason}")));
                }
                MediaEvent::ActiveSpeaker { identity } => {
                    debug!(tester = %self.config.identity, speaker = %identity, "active speaker");
                }
                _ => {}
            }
        }
    }

    async fn on_subscribed(
        &self,
        session: &dyn MediaSession,
        track_sid: &str,
        kind: TrackKind,
    ) -> Result<()> {
        let quality = match kind {
            TrackKind::Audio => Quality::High,
            TrackKind::Video if self.config.simulcast => {
                quality::choose(self.config.layout, self.stats.video_qualities())
            }
            TrackKind::Video => Quality::High,
        };
        if kind == TrackKind::Video {
            if let Some((width, height)) = quality.dimensions() {
                debug!(track_sid, width, height, "subscribing");
            }
            session.set_quality(track_sid, quality).await?;
        }
        if quality == Quality::Off {
            return Ok(());
        }
        self.stats.add_track(track_sid, TrackStats::new(kind, quality));
        if kind == TrackKind::Video {
            session.request_keyframe(track_sid).await?;
        }
        Ok(())
    }
}

async fn publish_loop(
    session: Arc<dyn MediaSession>,
    track_sid: String,
    profile: MediaProfile,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(profile.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sequence = 0u64;
    loop {
        tokio::select! {
            _ = stopped(&mut stop) => return,
            _ = ticker.tick() => {}
        }
        sequence += 1;
        if let Err(err) = session.send(&track_sid, sequence, profile.payload_bytes).await {
            debug!(%track_sid, error = %err, "publish stopped");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{Loopback, LoopbackConfig};

    struct NoToken;

    impl TokenIssuer for NoToken {
        fn issue(&self, _request: &TokenRequest) -> Result<String> {
            Ok(String::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn connect_retries_then_gives_up() {
        let sfu = Loopback::new(LoopbackConfig {
            connect_failures: 3,
            ..LoopbackConfig::default()
        });
        let params = Params {
            room: "r".into(),
            subscribers: 1,
            connect_attempts: 3,
            ..Params::default()
        };
        let tester = Arc::new(Tester::new(TesterConfig::subscriber(&params, 0)));
        let (_tx, rx) = watch::channel(false);
        let started = Instant::now();
        let err = tester
            .clone()
            .run(Arc::new(sfu.clone()), Arc::new(NoToken), rx)
            .await
            .unwrap_err();
        assert!(matches!(err, LoadTestError::Connect { attempts: 3, .. }));
        assert_eq!(started.elapsed(), Duration::from_secs(2));
        assert_eq!(tester.summary().errors.len(), 1);

        // the fourth attempt would have succeeded
        let (_tx, rx) = watch::channel(false);
        let retry = Arc::new(Tester::new(TesterConfig::subscriber(&params, 1)));
        let handle = tokio::spawn(retry.clone().run(Arc::new(sfu.clone()), Arc::new(NoToken), rx));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(retry.stats().is_connected());
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn subscriber_measures_publisher_tracks() {
        let sfu = Loopback::new(LoopbackConfig {
            latency: Duration::from_millis(30),
            ..LoopbackConfig::default()
        });
        let params = Params {
            room: "r".into(),
            video_publishers: 1,
            audio_publishers: 1,
            subscribers: 1,
            ..Params::default()
        };
        let (tx, rx) = watch::channel(false);
        let subscriber = Arc::new(Tester::new(TesterConfig::subscriber(&params, 0)));
        let publisher = Arc::new(Tester::new(TesterConfig::publisher(&params, 0)));
        let sub = tokio::spawn(subscriber.clone().run(Arc::new(sfu.clone()), Arc::new(NoToken), rx.clone()));
        tokio::time::sleep(Duration::from_millis(10)).await;
        let publ = tokio::spawn(publisher.clone().run(Arc::new(sfu.clone()), Arc::new(NoToken), rx));
        tokio::time::sleep(Duration::from_secs(2)).await;
        tx.send_replace(true);
        sub.await.unwrap().unwrap();
        publ.await.unwrap().unwrap();

        let summary = subscriber.summary();
        assert_eq!(summary.expected_tracks, 2);
        assert_eq!(summary.tracks, 2);
        assert!(summary.packets > 100, "packets {}", summary.packets);
        assert_eq!(summary.dropped, 0);
        assert_eq!(summary.avg_latency(), Duration::from_millis(30));
        assert_eq!(sfu.participants("r"), 0);
        assert!(sfu.stats().keyframe_requests >= 1);
    }
}
