//! Per-source delta tracking for cumulative counters.
//!
//! Backends expose counters that only ever grow (modulo wraparound of their
//! fixed-width representation). The exporter reports how much each counter
//! advanced since the previous scrape, so the tracker keeps the last reading
//! per key and subtracts it from the next one.
//!
//! # Policy
//!
//! - Subtraction is done with `u64::wrapping_sub`, so a single rollover of a
//!   backend counter from `a` to `b < a` yields `(u64::MAX - a) + b + 1`.
//! - The first reading for a key has no baseline and is reported as-is: the
//!   raw cumulative value is the delta.
//! - A reading type may detect a backend restart through
//!   [`Counters::restarted_since`]; the raw value is then reported instead of
//!   a huge wrapped delta.
//! - Gauges are not differenced; implementations copy them from the current
//!   reading.

use ahash::AHashMap as HashMap;
use std::hash::Hash;

/// A reading made of cumulative counters (and optionally gauges).
pub trait Counters: Clone {
    /// Field-wise `self - previous` for counters, wrapping on overflow.
    /// Gauge fields keep the value from `self`.
    fn wrapping_delta(&self, previous: &Self) -> Self;

    /// Whether the backend restarted between `previous` and `self`.
    ///
    /// Sources without a reset signal keep the default.
    fn restarted_since(&self, _previous: &Self) -> bool {
        false
    }
}

impl Counters for u64 {
    fn wrapping_delta(&self, previous: &Self) -> Self {
        self.wrapping_sub(*previous)
    }
}

/// How a delta was derived, mostly useful for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaKind {
    /// No previous reading for this key.
    First,
    /// Regular difference against the previous reading.
    Delta,
    /// The backend restarted; the raw reading is reported.
    Reset,
}

/// Last-observed readings per key.
///
/// Not meant for concurrent use: callers wrap it in a lock owned by a single
/// collector and hold that lock only for the duration of [`update`].
///
/// [`update`]: DeltaTracker::update
#[derive(Debug, Clone)]
pub struct DeltaTracker<K, R> {
    last: HashMap<K, R>,
}

impl<K, R> Default for DeltaTracker<K, R> {
    fn default() -> Self {
        Self {
            last: HashMap::new(),
        }
    }
}

impl<K, R> DeltaTracker<K, R>
where
    K: Eq + Hash,
    R: Counters,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `current` as the new baseline for `key` and returns the delta.
    pub fn update(&mut self, key: K, current: R) -> R {
        self.update_with_kind(key, current).0
    }

    /// Like [`update`](Self::update), also telling how the delta was derived.
    pub fn update_with_kind(&mut self, key: K, current: R) -> (R, DeltaKind) {
        let (delta, kind) = match self.last.get(&key) {
            None => (current.clone(), DeltaKind::First),
            Some(previous) if current.restarted_since(previous) => {
                (current.clone(), DeltaKind::Reset)
            }
            Some(previous) => (current.wrapping_delta(previous), DeltaKind::Delta),
        };
        self.last.insert(key, current);
        (delta, kind)
    }

    /// Last reading stored for `key`.
    pub fn last(&self, key: &K) -> Option<&R> {
        self.last.get(key)
    }

    /// Drops the baseline of a key that is no longer observed.
    pub fn forget(&mut self, key: &K) -> Option<R> {
        self.last.remove(key)
    }

    /// Keeps only the baselines for which `keep` returns true.
    pub fn retain(&mut self, mut keep: impl FnMut(&K) -> bool) {
        self.last.retain(|k, _| keep(k));
    }

    pub fn len(&self) -> usize {
        self.last.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Stats {
        hits: u64,
        used: u64,
        uptime: u64,
    }

    impl Counters for Stats {
        fn wrapping_delta(&self, previous: &Self) -> Self {
            Self {
                hits: self.hits.wrapping_sub(previous.hits),
                ..self.clone()
            }
        }

        fn restarted_since(&self, previous: &Self) -> bool {
            self.uptime < previous.uptime
        }
    }

    #[test]
    fn test_first_observation_reports_raw_value() {
        let mut tracker = DeltaTracker::new();
        let (delta, kind) = tracker.update_with_kind((), 100u64);
        assert_eq!(delta, 100);
        assert_eq!(kind, DeltaKind::First);
    }

    #[test]
    fn test_successive_readings() {
        let mut tracker = DeltaTracker::new();
        tracker.update((), 100u64);
        assert_eq!(tracker.update((), 140u64), 40);
        assert_eq!(tracker.update((), 140u64), 0);
    }

    #[test]
    fn test_wraparound() {
        let mut tracker = DeltaTracker::new();
        let a = u64::MAX - 5;
        let b = 10u64;
        tracker.update((), a);
        assert_eq!(tracker.update((), b), (u64::MAX - a) + b + 1);
        assert_eq!(tracker.update((), b), 0);
    }

    #[test]
    fn test_keys_are_independent() {
        let mut tracker = DeltaTracker::new();
        tracker.update("eth0", 10u64);
        tracker.update("eth1", 1000u64);
        assert_eq!(tracker.update("eth0", 15u64), 5);
        assert_eq!(tracker.update("eth1", 1500u64), 500);
        assert_eq!(tracker.update("eth2", 7u64), 7);
        assert_eq!(tracker.len(), 3);
    }

    #[test]
    fn test_reset_reports_raw_value() {
        let mut tracker = DeltaTracker::new();
        tracker.update(
            (),
            Stats {
                hits: 5000,
                used: 1,
                uptime: 300,
            },
        );
        let (delta, kind) = tracker.update_with_kind(
            (),
            Stats {
                hits: 12,
                used: 2,
                uptime: 4,
            },
        );
        assert_eq!(kind, DeltaKind::Reset);
        assert_eq!(delta.hits, 12);
        assert_eq!(delta.used, 2);
    }

    #[test]
    fn test_gauges_pass_through() {
        let mut tracker = DeltaTracker::new();
        tracker.update(
            (),
            Stats {
                hits: 10,
                used: 500,
                uptime: 1,
            },
        );
        let delta = tracker.update(
            (),
            Stats {
                hits: 25,
                used: 300,
                uptime: 2,
            },
        );
        assert_eq!(delta.hits, 15);
        assert_eq!(delta.used, 300);
    }

    #[test]
    fn test_forget_makes_next_reading_first() {
        let mut tracker = DeltaTracker::new();
        tracker.update("a", 10u64);
        tracker.forget(&"a");
        assert!(tracker.is_empty());
        assert_eq!(tracker.update_with_kind("a", 12u64), (12, DeltaKind::First));

        tracker.update("b", 1u64);
        tracker.retain(|k| *k == "b");
        assert!(tracker.last(&"a").is_none());
        assert_eq!(tracker.last(&"b"), Some(&1));
    }
}
