use std::sync::Arc;
use std::time::Duration;

use livekit_loadtester::{
    Layout, LoadTest, Loopback, LoopbackConfig, Params, Result, TokenIssuer, TokenRequest,
};
use tokio::sync::watch;

struct StaticToken;

impl TokenIssuer for StaticToken {
    fn issue(&self, request: &TokenRequest) -> Result<String> {
        Ok(format!("token-for-{}", request.identity))
    }
}

#[tokio::test(start_paused = true)]
async fn grid_layout_subscribes_every_video_track() {
    let params = Params {
        room: "grid".into(),
        layout: Layout::Grid3x3,
        video_publishers: 4,
        subscribers: 8,
        num_per_second: 5.0,
        duration: Duration::from_secs(6),
        ..Params::default()
    };
    let test = LoadTest::new(params, Arc::new(Loopback::default()), Arc::new(StaticToken));
    let (_cancel, rx) = watch::channel(false);
    let report = test.run(rx).await.unwrap();

    assert_eq!(report.total.expected_tracks, 32);
    assert_eq!(report.total.tracks, 32);
    assert_eq!(report.total.dropped, 0);
    assert!(report.total.errors.is_empty());
    // eight subscriber rows plus the total
    assert_eq!(report.rows().len(), 9);
    assert_eq!(report.rows()[8][1], "32/32");
}

#[tokio::test(start_paused = true)]
async fn lossy_network_shows_in_totals() {
    let sfu = Loopback::new(LoopbackConfig {
        loss: 0.05,
        reorder: 0.05,
        latency: Duration::from_millis(40),
        ..LoopbackConfig::default()
    });
    let params = Params {
        room: "lossy".into(),
        video_publishers: 2,
        audio_publishers: 2,
        subscribers: 3,
        duration: Duration::from_secs(5),
        ..Params::default()
    };
    let test = LoadTest::new(params, Arc::new(sfu.clone()), Arc::new(StaticToken));
    let (_cancel, rx) = watch::channel(false);
    let report = test.run(rx).await.unwrap();
    let total = &report.total;

    assert!(total.dropped > 0);
    assert!(total.out_of_order > 0);
    assert!((total.dropped_pct() + total.success_pct() - 100.0).abs() < 1e-9);
    let packets: u64 = report.testers.iter().map(|t| t.packets).sum();
    let dropped: u64 = report.testers.iter().map(|t| t.dropped).sum();
    assert_eq!(total.packets, packets);
    assert_eq!(total.dropped, dropped);
    // held packets arrive late, so the average can only grow
    assert!(total.avg_latency() >= Duration::from_millis(40));
    assert!(sfu.stats().keyframe_requests > 4);
}
