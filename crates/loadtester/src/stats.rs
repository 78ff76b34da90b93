//! Per-track receive statistics. Counters are written only by the owning
//! tester's receive loop and read once when a snapshot is taken.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;

use crate::quality::{Quality, QualityCounts};
use crate::report::Summary;
use crate::transport::TrackKind;

/// Sequence numbers trail this far behind the newest before they count as lost.
pub const REORDER_WINDOW: u64 = 16;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Observed {
    pub out_of_order: bool,
    pub dropped: u64,
    pub duplicate: bool,
}

/// Turns arrival order into in-order/late/lost verdicts.
#[derive(Debug, Clone)]
pub struct ReorderWindow {
    size: u64,
    highest: Option<u64>,
    missing: BTreeSet<u64>,
}

impl Default for ReorderWindow {
    fn default() -> Self {
        Self::new(REORDER_WINDOW)
    }
}

impl ReorderWindow {
    pub fn new(size: u64) -> Self {
        Self {
            size: size.max(1),
            highest: None,
            missing: BTreeSet::new(),
        }
    }

    pub fn observe(&mut self, sequence: u64) -> Observed {
        let mut verdict = Observed::default();
        let Some(highest) = self.highest else {
            self.highest = Some(sequence);
            return verdict;
        };
        if sequence > highest {
            self.missing.extend(highest + 1..sequence);
            self.highest = Some(sequence);
            let floor = sequence.saturating_sub(self.size);
            let still_waiting = self.missing.split_off(&floor);
            verdict.dropped = self.missing.len() as u64;
            self.missing = still_waiting;
        } else if self.missing.remove(&sequence) {
            verdict.out_of_order = true;
        } else {
            verdict.duplicate = true;
        }
        verdict
    }

    pub fn pending(&self) -> usize {
        self.missing.len()
    }
}

#[derive(Debug)]
pub struct TrackStats {
    pub kind: TrackKind,
    pub quality: Quality,
    pub started_at: Instant,
    packets: AtomicU64,
    bytes: AtomicU64,
    latency_sum_us: AtomicU64,
    latency_count: AtomicU64,
    out_of_order: AtomicU64,
    dropped: AtomicU64,
}

impl TrackStats {
    pub fn new(kind: TrackKind, quality: Quality) -> Self {
        Self {
            kind,
            quality,
            started_at: Instant::now(),
            packets: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            latency_sum_us: AtomicU64::new(0),
            latency_count: AtomicU64::new(0),
            out_of_order: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn record_packet(&self, payload_len: usize, latency: Option<Duration>) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(payload_len as u64, Ordering::Relaxed);
        if let Some(latency) = latency {
            self.latency_sum_us
                .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
            self.latency_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_out_of_order(&self) {
        self.out_of_order.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, count: u64) {
        self.dropped.fetch_add(count, Ordering::Relaxed);
    }

    fn add_to(&self, summary: &mut Summary) {
        summary.tracks += 1;
        summary.packets += self.packets.load(Ordering::Relaxed);
        summary.bytes += self.bytes.load(Ordering::Relaxed);
        summary.out_of_order += self.out_of_order.load(Ordering::Relaxed);
        summary.dropped += self.dropped.load(Ordering::Relaxed);
        summary.latency_sum += Duration::from_micros(self.latency_sum_us.load(Ordering::Relaxed));
        summary.latency_count += self.latency_count.load(Ordering::Relaxed);
    }
}

/// Everything one tester measured.
#[derive(Debug, Default)]
pub struct TesterStats {
    tracks: RwLock<HashMap<String, Arc<TrackStats>>>,
    connected_at: Mutex<Option<Instant>>,
    finished_at: Mutex<Option<Instant>>,
    error: Mutex<Option<String>>,
}

impl TesterStats {
    pub fn add_track(&self, track_sid: &str, stats: TrackStats) -> Arc<TrackStats> {
        let stats = Arc::new(stats);
        self.tracks
            .write()
            .insert(track_sid.to_string(), stats.clone());
        stats
    }

    pub fn track(&self, track_sid: &str) -> Option<Arc<TrackStats>> {
        self.tracks.read().get(track_sid).cloned()
    }

    pub fn video_qualities(&self) -> QualityCounts {
        self.tracks
            .read()
            .values()
            .filter(|t| t.kind == TrackKind::Video)
            .map(|t| t.quality)
            .collect()
    }

    pub fn mark_connected(&self) {
        *self.connected_at.lock() = Some(Instant::now());
    }

    pub fn mark_finished(&self) {
        self.finished_at.lock().get_or_insert_with(Instant::now);
    }

    pub fn is_connected(&self) -> bool {
        self.connected_at.lock().is_some() && self.finished_at.lock().is_none()
    }

    pub fn set_error(&self, message: impl Into<String>) {
        *self.error.lock() = Some(message.into());
    }

    pub fn summary(&self, name: &str, expected_tracks: usize) -> Summary {
        let mut summary = Summary {
            name: name.to_string(),
            expected_tracks,
            ..Summary::default()
        };
        for track in self.tracks.read().values() {
            track.add_to(&mut summary);
        }
        if let Some(connected) = *self.connected_at.lock() {
            let end = self.finished_at.lock().unwrap_or_else(Instant::now);
            summary.elapsed = end.saturating_duration_since(connected);
        }
        if let Some(err) = self.error.lock().clone() {
            summary.errors.push(err);
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_classifies_arrivals() {
        let mut window = ReorderWindow::new(4);
        assert_eq!(window.observe(1), Observed::default());
        assert_eq!(window.observe(2), Observed::default());
        // 3 and 4 missing for now
        assert_eq!(window.observe(5).dropped, 0);
        assert_eq!(window.pending(), 2);
        assert!(window.observe(3).out_of_order);
        assert!(window.observe(3).duplicate);
        // 4 falls out of the window once 9 arrives
        let verdict = window.observe(9);
        assert_eq!(verdict.dropped, 1);
        assert_eq!(window.pending(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn summary_sums_tracks() {
        let stats = TesterStats::default();
        stats.mark_connected();
        let audio = stats.add_track("TR_a", TrackStats::new(TrackKind::Audio, Quality::High));
        let video = stats.add_track("TR_v", TrackStats::new(TrackKind::Video, Quality::Low));
        audio.record_packet(100, Some(Duration::from_millis(10)));
        video.record_packet(1000, None);
        video.record_dropped(2);
        video.record_out_of_order();
        tokio::time::advance(Duration::from_secs(2)).await;
        stats.mark_finished();

        let summary = stats.summary("sub_0", 3);
        assert_eq!(summary.tracks, 2);
        assert_eq!(summary.packets, 2);
        assert_eq!(summary.bytes, 1100);
        assert_eq!(summary.dropped, 2);
        assert_eq!(summary.out_of_order, 1);
        assert_eq!(summary.latency_count, 1);
        assert_eq!(summary.elapsed, Duration::from_secs(2));
        assert_eq!(stats.video_qualities().low, 1);
    }
}
