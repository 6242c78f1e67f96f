//! Byte rate over a sliding window of one-second slots.
//!
//! Time is passed in so the engine's tick drives expiry.

use std::collections::VecDeque;
use std::time::Instant;

const RATE_WINDOW_SECS: u64 = 5;

#[derive(Debug, Clone)]
pub struct RateTracker {
    started: Instant,
    total_bytes: u64,
    /// (second since `started`, bytes in that second), oldest first.
    slots: VecDeque<(u64, u64)>,
}

impl RateTracker {
    pub fn new(now: Instant) -> Self {
        Self {
            started: now,
            total_bytes: 0,
            slots: VecDeque::with_capacity(RATE_WINDOW_SECS as usize + 1),
        }
    }

    fn second(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.started).as_secs()
    }

    pub fn record(&mut self, bytes: usize, now: Instant) {
        let second = self.second(now);
        self.total_bytes += bytes as u64;
        match self.slots.back_mut() {
            Some((slot, count)) if *slot == second => *count += bytes as u64,
            _ => self.slots.push_back((second, bytes as u64)),
        }
        self.expire(second);
    }

    /// Drops slots that have left the window.
    pub fn sample(&mut self, now: Instant) {
        let second = self.second(now);
        self.expire(second);
    }

    fn expire(&mut self, current: u64) {
        while let Some(&(slot, _)) = self.slots.front() {
            if slot + RATE_WINDOW_SECS > current {
                break;
            }
            self.slots.pop_front();
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Bytes per second over the last few seconds, or since creation when
    /// younger than the window.
    pub fn rate(&self, now: Instant) -> u64 {
        let current = self.second(now);
        let first = (current + 1).saturating_sub(RATE_WINDOW_SECS);
        let bytes: u64 = self
            .slots
            .iter()
            .filter(|(slot, _)| *slot >= first && *slot <= current)
            .map(|(_, count)| count)
            .sum();
        let elapsed = now
            .saturating_duration_since(self.started)
            .as_secs_f64()
            - first as f64;
        if elapsed <= 0.0 {
            return 0;
        }
        (bytes as f64 / elapsed) as u64
    }
}
