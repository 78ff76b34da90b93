use serde::Serialize;

use crate::params::Layout;

/// Simulcast layer a subscriber asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Quality {
    High,
    Medium,
    Low,
    Off,
}

impl Quality {
    /// Target dimensions, `None` when the subscription is disabled.
    pub fn dimensions(self) -> Option<(u32, u32)> {
        match self {
            Self::High => Some((1280, 720)),
            Self::Medium => Some((640, 360)),
            Self::Low => Some((320, 180)),
            Self::Off => None,
        }
    }
}

/// Enabled video subscriptions of one tester, by layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QualityCounts {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

impl QualityCounts {
    pub fn add(&mut self, quality: Quality) {
        match quality {
            Quality::High => self.high += 1,
            Quality::Medium => self.medium += 1,
            Quality::Low => self.low += 1,
            Quality::Off => {}
        }
    }

}

impl FromIterator<Quality> for QualityCounts {
    fn from_iter<I: IntoIterator<Item = Quality>>(qualities: I) -> Self {
        let mut counts = Self::default();
        for q in qualities {
            counts.add(q);
        }
        counts
    }
}

/// Layer for the next remote video track given what is already watched.
pub fn choose(layout: Layout, existing: QualityCounts) -> Quality {
    match layout {
        Layout::Speaker if existing.high == 0 => Quality::High,
        Layout::Speaker if existing.low < 5 => Quality::Low,
        Layout::Speaker => Quality::Off,
        Layout::Grid3x3 if existing.medium < 9 => Quality::Medium,
        Layout::Grid4x4 if existing.low < 16 => Quality::Low,
        Layout::Grid5x5 if existing.low < 25 => Quality::Low,
        _ => Quality::Off,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(layout: Layout, n: usize) -> Vec<Quality> {
        let mut counts = QualityCounts::default();
        (0..n)
            .map(|_| {
                let q = choose(layout, counts);
                counts.add(q);
                q
            })
            .collect()
    }

    #[test]
    fn speaker_layout_one_high_five_low() {
        let picks = fill(Layout::Speaker, 8);
        assert_eq!(picks[0], Quality::High);
        assert!(picks[1..6].iter().all(|q| *q == Quality::Low));
        assert_eq!(&picks[6..], &[Quality::Off, Quality::Off]);
    }

    #[test]
    fn grids_fill_to_capacity() {
        for (layout, quality) in [
            (Layout::Grid3x3, Quality::Medium),
            (Layout::Grid4x4, Quality::Low),
            (Layout::Grid5x5, Quality::Low),
        ] {
            let cap = layout.capacity();
            let picks = fill(layout, cap + 1);
            assert!(picks[..cap].iter().all(|q| *q == quality), "{layout}");
            assert_eq!(picks[cap], Quality::Off);
        }
        assert_eq!(Quality::Medium.dimensions(), Some((640, 360)));
        assert_eq!(Quality::Off.dimensions(), None);
    }
}
