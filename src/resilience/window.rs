//! Bucketed sliding window of call outcomes.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Number of buckets a window is split into.
const BUCKETS: u64 = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Bucket {
    start: u64,
    successes: u32,
    failures: u32,
}

/// Successes and failures observed over the last `window_ms`.
///
/// Outcomes older than the window fall out a bucket at a time, so the effective
/// window is between 90% and 100% of its configured length.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlidingWindow {
    buckets: VecDeque<Bucket>,
}

impl SlidingWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, success: bool, now: u64, window_ms: u64) {
        self.prune(now, window_ms);
        let width = (window_ms / BUCKETS).max(1);
        let start = now - now % width;
        if self.buckets.back().map_or(true, |b| b.start != start) {
            self.buckets.push_back(Bucket {
                start,
                ..Bucket::default()
            });
        }
        let Some(bucket) = self.buckets.back_mut() else {
            return;
        };
        if success {
            bucket.successes = bucket.successes.saturating_add(1);
        } else {
            bucket.failures = bucket.failures.saturating_add(1);
        }
    }

    /// `(successes, failures)` inside the window.
    pub fn totals(&self, now: u64, window_ms: u64) -> (u32, u32) {
        self.live(now, window_ms)
            .fold((0, 0), |(s, f), b| {
                (s.saturating_add(b.successes), f.saturating_add(b.failures))
            })
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
    }

    fn live(&self, now: u64, window_ms: u64) -> impl Iterator<Item = &Bucket> {
        self.buckets
            .iter()
            .filter(move |b| b.start.saturating_add(window_ms) > now)
    }

    fn prune(&mut self, now: u64, window_ms: u64) {
        while self
            .buckets
            .front()
            .is_some_and(|b| b.start.saturating_add(window_ms) <= now)
        {
            self.buckets.pop_front();
        }
    }
}
