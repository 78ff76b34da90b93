//! Ramp, run and measure a room full of testers.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::Result;
use crate::params::Params;
use crate::report::{Report, Summary, format_bitrate, trim_decimal};
use crate::speaker::{DEFAULT_SPEAKER_PAUSE, SpeakerSimulator};
use crate::tester::{Tester, TesterConfig, stopped};
use crate::transport::{MediaConnector, TokenIssuer};

pub const SUITE_DURATION: Duration = Duration::from_secs(15);

/// (publishers, subscribers) pairs run by the suite.
pub const SUITE: [(usize, usize); 6] = [(1, 10), (1, 50), (5, 50), (10, 100), (10, 500), (50, 50)];

pub(crate) async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[derive(Clone)]
pub struct LoadTest {
    params: Params,
    connector: Arc<dyn MediaConnector>,
    tokens: Arc<dyn TokenIssuer>,
}

impl LoadTest {
    pub fn new(
        params: Params,
        connector: Arc<dyn MediaConnector>,
        tokens: Arc<dyn TokenIssuer>,
    ) -> Self {
        Self {
            params,
            connector,
            tokens,
        }
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    fn with_params(&self, params: Params) -> Self {
        Self {
            params,
            ..self.clone()
        }
    }

    fn testers(&self) -> Vec<Arc<Tester>> {
        let publishers = (0..self.params.publisher_count())
            .map(|i| TesterConfig::publisher(&self.params, i));
        let subscribers =
            (0..self.params.subscribers).map(|i| TesterConfig::subscriber(&self.params, i));
        publishers
            .chain(subscribers)
            .map(|config| Arc::new(Tester::new(config)))
            .collect()
    }

    /// Runs until the duration elapses or `cancel` fires. A cancelled test
    /// still reports what it measured.
    pub async fn run(&self, mut cancel: watch::Receiver<bool>) -> Result<Report> {
        self.params.validate()?;
        let testers = self.testers();
        let total = testers.len();
        let per_tick = self.params.per_tick();
        let (stop_tx, stop_rx) = watch::channel(false);

        let start = Instant::now();
        let deadline = (!self.params.duration.is_zero()).then(|| start + self.params.duration);
        let mut ticker = tokio::time::interval_at(start + Duration::from_secs(1), Duration::from_secs(1));
        let mut speakers = self.params.simulate_speakers.then(|| {
            SpeakerSimulator::start(
                testers.clone(),
                DEFAULT_SPEAKER_PAUSE,
                self.connector.min_speaker_interval(),
            )
        });

        info!(
            room = %self.params.room,
            testers = total,
            per_second = per_tick,
            "starting load test"
        );
        let mut running = JoinSet::new();
        let mut released = 0;
        loop {
            tokio::select! {
                _ = stopped(&mut cancel) => {
                    info!("load test cancelled");
                    break;
                }
                _ = until(deadline) => break,
                _ = ticker.tick(), if released < total => {
                    let batch = &testers[released..(released + per_tick).min(total)];
                    for tester in batch {
                        running.spawn(tester.clone().run(
                            self.connector.clone(),
                            self.tokens.clone(),
                            stop_rx.clone(),
                        ));
                    }
                    released += batch.len();
                    debug!(released, total, "testers released");
                }
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    if let Ok(Err(err)) = joined {
                        debug!(error = %err, "tester ended");
                    }
                    if released == total && running.is_empty() {
                        break;
                    }
                }
            }
        }

        stop_tx.send_replace(true);
        while running.join_next().await.is_some() {}
        if let Some(speakers) = speakers.as_mut() {
            speakers.stop().await;
        }

        let report = Report::from_summaries(testers.iter().map(|t| t.summary()).collect());
        info!(
            tracks = report.total.tracks,
            expected = report.total.expected_tracks,
            packets = report.total.packets,
            "load test finished"
        );
        Ok(report)
    }

    /// Runs each [`SUITE`] configuration with fresh testers.
    pub async fn run_suite(
        &self,
        duration: Duration,
        cancel: watch::Receiver<bool>,
    ) -> Result<Vec<SuiteResult>> {
        let mut results = Vec::new();
        for (publishers, subscribers) in SUITE {
            if *cancel.borrow() {
                break;
            }
            let params = Params {
                room: format!("{}-{publishers}x{subscribers}", self.params.room),
                duration,
                video_publishers: publishers,
                audio_publishers: publishers,
                subscribers,
                ..self.params.clone()
            };
            let report = self.with_params(params).run(cancel.clone()).await?;
            results.push(SuiteResult {
                publishers,
                subscribers,
                summary: report.total,
            });
        }
        Ok(results)
    }

    /// Largest subscriber count, up to `limit`, whose average latency stays
    /// within `max_latency`. Zero if even one subscriber is too slow.
    pub async fn find_max(
        &self,
        max_latency: Duration,
        limit: usize,
        cancel: watch::Receiver<bool>,
    ) -> Result<usize> {
        let mut passing = 0;
        let mut failing = None;
        let mut subscribers = 1;
        while failing.is_none() && passing < limit {
            subscribers = subscribers.min(limit);
            if *cancel.borrow() {
                return Ok(passing);
            }
            if self.trial(subscribers, max_latency, cancel.clone()).await? {
                passing = subscribers;
                subscribers *= 2;
            } else {
                failing = Some(subscribers);
            }
        }
        let Some(mut failing) = failing else {
            return Ok(passing);
        };
        while failing - passing > 1 {
            if *cancel.borrow() {
                break;
            }
            let mid = passing + (failing - passing) / 2;
            if self.trial(mid, max_latency, cancel.clone()).await? {
                passing = mid;
            } else {
                failing = mid;
            }
        }
        Ok(passing)
    }

    async fn trial(
        &self,
        subscribers: usize,
        max_latency: Duration,
        cancel: watch::Receiver<bool>,
    ) -> Result<bool> {
        let duration = if self.params.duration.is_zero() {
            SUITE_DURATION
        } else {
            self.params.duration
        };
        let params = Params {
            subscribers,
            duration,
            ..self.params.clone()
        };
        let report = self.with_params(params).run(cancel).await?;
        let latency = report.total.avg_latency();
        let passed = latency <= max_latency && report.total.errors.is_empty();
        info!(subscribers, latency_ms = latency.as_millis() as u64, passed, "trial finished");
        Ok(passed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SuiteResult {
    pub publishers: usize,
    pub subscribers: usize,
    pub summary: Summary,
}

impl SuiteResult {
    pub fn headers() -> [&'static str; 6] {
        ["Pubs", "Subs", "Tracks", "Bitrate", "Latency", "Dropped"]
    }

    pub fn row(&self) -> Vec<String> {
        let s = &self.summary;
        vec![
            self.publishers.to_string(),
            self.subscribers.to_string(),
            format!("{}/{}", s.tracks, s.expected_tracks),
            format_bitrate(s.bitrate_bps()),
            format!("{}ms", trim_decimal(s.avg_latency().as_secs_f64() * 1000.0, 1)),
            format!("{}%", trim_decimal(s.dropped_pct(), 2)),
        ]
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::loopback::{Loopback, LoopbackConfig};
    use crate::transport::{ConnectRequest, MediaSession, TokenRequest};

    struct NoToken;

    impl TokenIssuer for NoToken {
        fn issue(&self, _request: &TokenRequest) -> Result<String> {
            Ok(String::new())
        }
    }

    struct Recording {
        sfu: Loopback,
        started: Instant,
        connects: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl MediaConnector for Recording {
        async fn connect(&self, request: ConnectRequest) -> Result<Arc<dyn MediaSession>> {
            self.connects.lock().push(self.started.elapsed());
            self.sfu.connect(request).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ramp_releases_per_second_batches() {
        let recording = Arc::new(Recording {
            sfu: Loopback::default(),
            started: Instant::now(),
            connects: Mutex::new(Vec::new()),
        });
        let params = Params {
            room: "ramp".into(),
            subscribers: 12,
            num_per_second: 5.0,
            duration: Duration::from_secs(5),
            ..Params::default()
        };
        let test = LoadTest::new(params, recording.clone(), Arc::new(NoToken));
        let (_cancel, rx) = watch::channel(false);
        let report = test.run(rx).await.unwrap();

        let connects = recording.connects.lock().clone();
        let at = |secs| connects.iter().filter(|t| **t == Duration::from_secs(secs)).count();
        assert_eq!(connects.len(), 12);
        assert_eq!((at(1), at(2), at(3)), (5, 5, 2));
        assert_eq!(report.testers.len(), 12);
        assert!(report.total.errors.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_still_reports() {
        let params = Params {
            room: "cancel".into(),
            audio_publishers: 1,
            subscribers: 2,
            ..Params::default()
        };
        let test = LoadTest::new(params, Arc::new(Loopback::default()), Arc::new(NoToken));
        let (cancel, rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            cancel.send_replace(true);
        });
        let report = test.run(rx).await.unwrap();
        assert_eq!(report.total.expected_tracks, 2);
        assert_eq!(report.total.tracks, 2);
        assert!(report.total.packets > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn find_max_stops_at_latency_bound() {
        let sfu = Loopback::new(LoopbackConfig {
            latency_per_participant: Duration::from_millis(10),
            ..LoopbackConfig::default()
        });
        let params = Params {
            room: "max".into(),
            audio_publishers: 1,
            video_publishers: 1,
            num_per_second: 100.0,
            duration: Duration::from_secs(3),
            ..Params::default()
        };
        let test = LoadTest::new(params, Arc::new(sfu), Arc::new(NoToken));
        let (_cancel, rx) = watch::channel(false);
        // publisher plus n subscribers: latency is 10ms per head
        let max = test
            .find_max(Duration::from_millis(95), 64, rx)
            .await
            .unwrap();
        assert_eq!(max, 8);
    }

    #[test]
    fn suite_rows_line_up_with_headers() {
        let result = SuiteResult {
            publishers: 1,
            subscribers: 10,
            summary: Summary {
                tracks: 20,
                expected_tracks: 20,
                ..Summary::default()
            },
        };
        assert_eq!(result.row().len(), SuiteResult::headers().len());
        assert_eq!(result.row()[2], "20/20");
    }
}
