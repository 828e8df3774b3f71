//! Sliding-window command rate limiter (flood detection)

use std::collections::VecDeque;

use killswitch_core::time::secs_to_ns;

/// Result of recording one arrival
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { count: usize },
    Limited { count: usize },
}

/// Counts command arrivals inside a sliding window. Every arrival counts,
/// including ones later rejected, so a flood of garbage still trips it.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    window_ns: u64,
    max_commands: usize,
    arrivals: VecDeque<u64>,
}

impl RateLimiter {
    pub fn new(window_secs: u64, max_commands: usize) -> Self {
        Self {
            window_ns: secs_to_ns(window_secs),
            max_commands,
            arrivals: VecDeque::new(),
        }
    }

    /// Record an arrival at `now_ns`
    pub fn record(&mut self, now_ns: u64) -> RateDecision {
        let cutoff = now_ns.saturating_sub(self.window_ns);
        while self.arrivals.front().is_some_and(|&t| t < cutoff) {
            self.arrivals.pop_front();
        }
        self.arrivals.push_back(now_ns);

        let count = self.arrivals.len();
        if count > self.max_commands {
            RateDecision::Limited { count }
        } else {
            RateDecision::Allowed { count }
        }
    }

    pub fn window_secs(&self) -> u64 {
        self.window_ns / killswitch_core::NANOS_PER_SEC
    }
}
