//! Per-sender flood limiter
//!
//! Caps how much *new* content a single sender can push into the mesh per
//! minute. CRITICAL traffic is never limited.

use std::collections::{HashMap, VecDeque};

use crate::packet::{NodeId, Urgency};

/// Sliding window length.
const WINDOW_MS: u64 = 60_000;

/// Sliding-window counter per sender.
#[derive(Debug)]
pub struct FloodLimiter {
    max_per_window: u32,
    windows: HashMap<NodeId, VecDeque<u64>>,
}

impl FloodLimiter {
    /// `max_per_window == 0` disables limiting.
    pub fn new(max_per_window: u32) -> Self {
        Self {
            max_per_window,
            windows: HashMap::new(),
        }
    }

    /// Count one new packet from `sender`; `false` means drop it.
    pub fn admit(&mut self, sender: &str, urgency: Urgency, now_ms: u64) -> bool {
        if self.max_per_window == 0 || urgency == Urgency::Critical {
            return true;
        }

        let window = self.windows.entry(sender.to_string()).or_default();
        let cutoff = now_ms.saturating_sub(WINDOW_MS);
        while window.front().is_some_and(|ts| *ts <= cutoff) {
            window.pop_front();
        }
        if window.len() >= self.max_per_window as usize {
            return false;
        }
        window.push_back(now_ms);
        true
    }

    /// Forget senders with no activity inside the window.
    pub fn cleanup(&mut self, now_ms: u64) -> usize {
        let cutoff = now_ms.saturating_sub(WINDOW_MS);
        let before = self.windows.len();
        self.windows
            .retain(|_, window| window.back().is_some_and(|ts| *ts > cutoff));
        before - self.windows.len()
    }

    /// Number of senders currently tracked.
    pub fn tracked_senders(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: u64 = 1_700_000_000_000;

    #[test]
    fn test_limits_after_threshold() {
        let mut limiter = FloodLimiter::new(3);
        for i in 0..3 {
            assert!(limiter.admit("N1", Urgency::Low, T0 + i));
        }
        assert!(!limiter.admit("N1", Urgency::Low, T0 + 10));
        // Other senders unaffected
        assert!(limiter.admit("N2", Urgency::Low, T0 + 10));
    }

    #[test]
    fn test_window_slides() {
        let mut limiter = FloodLimiter::new(1);
        assert!(limiter.admit("N1", Urgency::High, T0));
        assert!(!limiter.admit("N1", Urgency::High, T0 + 30_000));
        assert!(limiter.admit("N1", Urgency::High, T0 + WINDOW_MS + 1));
    }

    #[test]
    fn test_critical_and_disabled_bypass() {
        let mut limiter = FloodLimiter::new(1);
        assert!(limiter.admit("N1", Urgency::Medium, T0));
        assert!(limiter.admit("N1", Urgency::Critical, T0));
        assert!(limiter.admit("N1", Urgency::Critical, T0));

        let mut disabled = FloodLimiter::new(0);
        for _ in 0..100 {
            assert!(disabled.admit("N1", Urgency::Low, T0));
        }
    }

    #[test]
    fn test_cleanup_drops_idle_senders() {
        let mut limiter = FloodLimiter::new(5);
        limiter.admit("N1", Urgency::Low, T0);
        limiter.admit("N2", Urgency::Low, T0 + WINDOW_MS);
        assert_eq!(limiter.cleanup(T0 + WINDOW_MS + 1), 1);
        assert_eq!(limiter.tracked_senders(), 1);
    }
}
