//! Unknown-face admission filter.
//!
//! Unmatched faces carry no stable identity, so there is nothing to dedup
//! on. Instead every unknown capture in a tracking session shares one
//! cooldown: after an admission, further unknown detections are dropped
//! until the window has strictly elapsed. With several strangers in frame
//! only one of them is captured per window.

use std::time::{Duration, Instant};

/// Minimum gap between two admitted unknown-face captures.
pub const UNKNOWN_COOLDOWN: Duration = Duration::from_secs(10);

/// Global cooldown gate keyed on nothing but the last admission instant.
#[derive(Debug, Clone)]
pub struct UnknownCooldown {
    window: Duration,
    last_admitted_at: Option<Instant>,
}

impl Default for UnknownCooldown {
    fn default() -> Self {
        Self::new(UNKNOWN_COOLDOWN)
    }
}

impl UnknownCooldown {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_admitted_at: None,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn last_admitted_at(&self) -> Option<Instant> {
        self.last_admitted_at
    }

    /// Whether an unknown detection at `now` may be persisted.
    pub fn would_admit(&self, now: Instant) -> bool {
        match self.last_admitted_at {
            None => true,
            Some(at) => now.saturating_duration_since(at) > self.window,
        }
    }

    /// Start a new window at `now`. Call once the capture has been stored.
    pub fn record_admission(&mut self, now: Instant) {
        self.last_admitted_at = Some(now);
    }

    /// Check and start a window in one step.
    pub fn try_admit(&mut self, now: Instant) -> bool {
        if !self.would_admit(now) {
            return false;
        }
        self.record_admission(now);
        true
    }

    pub fn reset(&mut self) {
        self.last_admitted_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_detection_admitted() {
        let gate = UnknownCooldown::default();
        assert!(gate.would_admit(Instant::now()));
        assert!(gate.last_admitted_at().is_none());
    }

    #[test]
    fn test_cooldown_sequence() {
        // Detections at 0s, 4s and 11s: 0 and 11 are admitted.
        let t0 = Instant::now();
        let mut gate = UnknownCooldown::default();
        let admitted: Vec<u64> = [0u64, 4, 11]
            .into_iter()
            .filter(|&s| gate.try_admit(t0 + Duration::from_secs(s)))
            .collect();
        assert_eq!(admitted, vec![0, 11]);
    }

    #[test]
    fn test_window_boundary_is_strict() {
        let t0 = Instant::now();
        let mut gate = UnknownCooldown::default();
        gate.record_admission(t0);
        assert!(!gate.would_admit(t0 + Duration::from_secs(10)));
        assert!(gate.would_admit(t0 + Duration::from_millis(10_001)));
    }

    #[test]
    fn test_would_admit_does_not_start_window() {
        let t0 = Instant::now();
        let mut gate = UnknownCooldown::default();
        assert!(gate.would_admit(t0));
        assert!(gate.would_admit(t0 + Duration::from_secs(1)));
        gate.record_admission(t0 + Duration::from_secs(1));
        assert!(!gate.would_admit(t0 + Duration::from_secs(2)));
    }

    #[test]
    fn test_reset() {
        let t0 = Instant::now();
        let mut gate = UnknownCooldown::default();
        assert!(gate.try_admit(t0));
        gate.reset();
        assert!(gate.try_admit(t0));
    }
}
