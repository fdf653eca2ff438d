//! Median clock offset estimated from peers' version timestamps.
//!
//! Each peer contributes at most one sample. The offset is the median of the
//! collected `peer_time - local_time` differences and is ignored once it
//! exceeds the maximum allowed adjustment.

use std::collections::{HashSet, VecDeque};

use cfnode_types::Timestamp;
use parking_lot::Mutex;

/// Maximum samples retained.
pub const MAX_TIME_SAMPLES: usize = 200;
/// Offsets beyond this (seconds) are not applied.
pub const MAX_ALLOWED_OFFSET_SECS: i64 = 70 * 60;
/// Samples needed before any offset is applied.
pub const MIN_TIME_SAMPLES: usize = 5;

#[derive(Default)]
struct Samples {
    sources: HashSet<String>,
    offsets: VecDeque<i64>,
    offset_secs: i64,
}

/// Clock offset estimator.
#[derive(Default)]
pub struct MedianTime {
    inner: Mutex<Samples>,
}

impl MedianTime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `peer_time` as observed from `source` at local time `now`.
    pub fn add_sample(&self, source: &str, peer_time: Timestamp, now: Timestamp) {
        let mut inner = self.inner.lock();
        if !inner.sources.insert(source.to_string()) {
            return;
        }
        let offset = peer_time.as_secs() as i64 - now.as_secs() as i64;
        if inner.offsets.len() == MAX_TIME_SAMPLES {
            inner.offsets.pop_front();
        }
        inner.offsets.push_back(offset);

        if inner.offsets.len() < MIN_TIME_SAMPLES {
            return;
        }
        let mut sorted: Vec<i64> = inner.offsets.iter().copied().collect();
        sorted.sort_unstable();
        let median = sorted[sorted.len() / 2];
        if median.abs() <= MAX_ALLOWED_OFFSET_SECS {
            inner.offset_secs = median;
        } else {
            inner.offset_secs = 0;
            tracing::warn!(median, "peer clocks disagree with ours; check the system time");
        }
    }

    /// Current offset in seconds.
    pub fn offset_secs(&self) -> i64 {
        self.inner.lock().offset_secs
    }

    /// `now` adjusted by the current offset.
    pub fn adjusted(&self, now: Timestamp) -> Timestamp {
        let offset = self.offset_secs();
        if offset >= 0 {
            now.plus_secs(offset as u64)
        } else {
            now.minus_secs(offset.unsigned_abs())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn median_applies_after_enough_samples() {
        let time = MedianTime::new();
        let now = Timestamp::new(1_000_000);
        for (i, offset) in [10u64, 20, 30, 40].iter().enumerate() {
            time.add_sample(&format!("peer{i}"), now.plus_secs(*offset), now);
        }
        assert_eq!(time.offset_secs(), 0);
        time.add_sample("peer5", now.plus_secs(50), now);
        assert_eq!(time.offset_secs(), 30);
        assert_eq!(time.adjusted(now), now.plus_secs(30));
    }

    #[test]
    fn one_sample_per_source() {
        let time = MedianTime::new();
        let now = Timestamp::new(1_000);
        time.add_sample("a", now, now);
        time.add_sample("a", now.plus_secs(100), now);
        time.add_sample("b", now, now);
        time.add_sample("c", now, now);
        time.add_sample("d", now.plus_secs(100), now);
        time.add_sample("e", now.plus_secs(100), now);
        // Counting the repeat would tip the median to 100.
        assert_eq!(time.offset_secs(), 0);
    }

    #[test]
    fn wild_offsets_are_ignored() {
        let time = MedianTime::new();
        let now = Timestamp::new(10_000_000);
        for i in 0..5 {
            time.add_sample(&format!("p{i}"), now.plus_secs(10 * 60 * 60), now);
        }
        assert_eq!(time.offset_secs(), 0);
    }
}
