use std::time::Duration;

use serde::Serialize;

/// Counters of one tester, or of many once merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Summary {
    pub name: String,
    pub expected_tracks: usize,
    pub tracks: usize,
    pub packets: u64,
    pub bytes: u64,
    pub out_of_order: u64,
    pub dropped: u64,
    pub latency_sum: Duration,
    pub latency_count: u64,
    pub elapsed: Duration,
    pub errors: Vec<String>,
}

impl Summary {
    pub fn merge(&mut self, other: &Summary) {
        self.expected_tracks += other.expected_tracks;
        self.tracks += other.tracks;
        self.packets += other.packets;
        self.bytes += other.bytes;
        self.out_of_order += other.out_of_order;
        self.dropped += other.dropped;
        self.latency_sum += other.latency_sum;
        self.latency_count += other.latency_count;
        self.elapsed = self.elapsed.max(other.elapsed);
        self.errors.extend(other.errors.iter().cloned());
    }

    fn total_expected_packets(&self) -> u64 {
        self.packets + self.dropped
    }

    fn pct(&self, value: u64) -> f64 {
        match self.total_expected_packets() {
            0 => 0.0,
            total => value as f64 * 100.0 / total as f64,
        }
    }

    pub fn out_of_order_pct(&self) -> f64 {
        self.pct(self.out_of_order)
    }

    pub fn dropped_pct(&self) -> f64 {
        self.pct(self.dropped)
    }

    pub fn success_pct(&self) -> f64 {
        self.pct(self.packets)
    }

    pub fn avg_latency(&self) -> Duration {
        match self.latency_count {
            0 => Duration::ZERO,
            n => Duration::from_nanos((self.latency_sum.as_nanos() / u128::from(n)) as u64),
        }
    }

    pub fn bitrate_bps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            0.0
        } else {
            self.bytes as f64 * 8.0 / secs
        }
    }
}

/// `12.50` -> `12.5`, `3.00` -> `3`.
pub fn trim_decimal(value: f64, precision: usize) -> String {
    let text = format!("{value:.precision$}");
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        text
    }
}

pub fn format_bitrate(bps: f64) -> String {
    if bps >= 1_000_000.0 {
        format!("{}mbps", trim_decimal(bps / 1_000_000.0, 1))
    } else if bps >= 1_000.0 {
        format!("{}kbps", trim_decimal(bps / 1_000.0, 1))
    } else {
        format!("{}bps", trim_decimal(bps, 0))
    }
}

fn format_count_pct(value: u64, pct: f64) -> String {
    format!("{value} ({}%)", trim_decimal(pct, 2))
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Report {
    pub testers: Vec<Summary>,
    pub total: Summary,
}

impl Report {
    pub fn from_summaries(testers: Vec<Summary>) -> Self {
        let mut total = Summary {
            name: "Total".into(),
            ..Summary::default()
        };
        for tester in &testers {
            total.merge(tester);
        }
        Self { testers, total }
    }

    pub fn headers() -> [&'static str; 6] {
        ["Tester", "Tracks", "Bitrate", "Latency", "Total OOO", "Total Dropped"]
    }

    fn row(summary: &Summary) -> Vec<String> {
        vec![
            summary.name.clone(),
            format!("{}/{}", summary.tracks, summary.expected_tracks),
            format_bitrate(summary.bitrate_bps()),
            format!("{}ms", trim_decimal(summary.avg_latency().as_secs_f64() * 1000.0, 1)),
            format_count_pct(summary.out_of_order, summary.out_of_order_pct()),
            format_count_pct(summary.dropped, summary.dropped_pct()),
        ]
    }

    /// Subscribing testers then the total row.
    pub fn rows(&self) -> Vec<Vec<String>> {
        self.testers
            .iter()
            .filter(|s| s.expected_tracks > 0 || s.tracks > 0)
            .chain(std::iter::once(&self.total))
            .map(Self::row)
            .collect()
    }
}
