use std::sync::Arc;
use std::time::Duration;

use rand::seq::IndexedRandom;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::tester::Tester;

pub const DEFAULT_SPEAKER_PAUSE: Duration = Duration::from_secs(5);

/// Periodically makes one connected publisher the active speaker.
pub struct SpeakerSimulator {
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl SpeakerSimulator {
    /// The period never drops below what the connector accepts.
    pub fn start(testers: Vec<Arc<Tester>>, pause: Duration, min_interval: Duration) -> Self {
        let (stop, mut stopped) = watch::channel(false);
        let period = pause + min_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = stopped.wait_for(|flag| *flag) => return,
                    _ = ticker.tick() => {}
                }
                let candidates: Vec<_> = testers
                    .iter()
                    .filter(|t| t.config().is_publisher() && t.stats().is_connected())
                    .filter_map(|t| t.session())
                    .collect();
                let Some(session) = candidates.choose(&mut rand::rng()).cloned() else {
                    continue;
                };
                if let Err(err) = session.simulate_speaker().await {
                    debug!(identity = session.identity(), error = %err, "speaker simulation failed");
                }
            }
        });
        Self {
            stop,
            task: Some(task),
        }
    }

    /// Safe to call more than once.
    pub async fn stop(&mut self) {
        self.stop.send_replace(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for SpeakerSimulator {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::Loopback;
    use crate::params::Params;
    use crate::tester::TesterConfig;
    use crate::transport::{MediaConnector, TokenIssuer, TokenRequest};

    struct NoToken;

    impl TokenIssuer for NoToken {
        fn issue(&self, _request: &TokenRequest) -> crate::error::Result<String> {
            Ok(String::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn picks_connected_publishers_each_period() {
        let sfu = Loopback::default();
        let params = Params {
            room: "r".into(),
            audio_publishers: 2,
            ..Params::default()
        };
        let (_tx, rx) = watch::channel(false);
        let testers: Vec<_> = (0..2)
            .map(|i| Arc::new(Tester::new(TesterConfig::publisher(&params, i))))
            .collect();
        for tester in &testers {
            let connector: Arc<dyn MediaConnector> = Arc::new(sfu.clone());
            tokio::spawn(tester.clone().run(connector, Arc::new(NoToken), rx.clone()));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut sim = SpeakerSimulator::start(
            testers,
            Duration::from_secs(2),
            sfu.min_speaker_interval(),
        );
        tokio::time::sleep(Duration::from_millis(9_100)).await;
        sim.stop().await;
        sim.stop().await;
        assert_eq!(sfu.stats().speaker_events, 3);
    }
}
