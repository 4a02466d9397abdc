//! Recognition dedup cache.
//!
//! The tracking loop samples the camera every few seconds, so a person who
//! stays in frame is recognized on every tick. The cache remembers who has
//! already been handed to the transition engine and suppresses repeats until
//! a fixed TTL (measured from first admission, never extended) runs out.
//! After expiry the same person can trigger a fresh entry, which is how a
//! real leave-and-return gets logged.
//!
//! Admission is a pure function of `(now, map)`: callers pass a monotonic
//! [`Instant`] and nothing is mutated behind their back.

use crate::types::PersonRef;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Default suppression window after a person is first admitted.
pub const DEDUP_TTL: Duration = Duration::from_secs(5 * 60);

/// TTL map from person to the instant they were admitted.
#[derive(Debug, Clone)]
pub struct RecognitionCache {
    ttl: Duration,
    admitted: HashMap<PersonRef, Instant>,
}

impl Default for RecognitionCache {
    fn default() -> Self {
        Self::new(DEDUP_TTL)
    }
}

impl RecognitionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            admitted: HashMap::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// True while `person` is inside its suppression window at `now`.
    pub fn is_suppressed(&self, person: &PersonRef, now: Instant) -> bool {
        self.admitted
            .get(person)
            .is_some_and(|&at| now.saturating_duration_since(at) < self.ttl)
    }

    /// Admit `person` at `now` unless already covered by a live entry.
    ///
    /// Returns `true` when the caller should forward the recognition to the
    /// transition engine. The TTL starts from this call.
    pub fn admit(&mut self, person: PersonRef, now: Instant) -> bool {
        if self.is_suppressed(&person, now) {
            return false;
        }
        self.admitted.insert(person, now);
        true
    }

    /// Drop `person` so the next recognition is admitted again.
    pub fn forget(&mut self, person: &PersonRef) -> bool {
        self.admitted.remove(person).is_some()
    }

    /// Remove every entry whose TTL has elapsed. Returns how many were removed.
    pub fn purge_expired(&mut self, now: Instant) -> usize {
        let ttl = self.ttl;
        let before = self.admitted.len();
        self.admitted
            .retain(|_, &mut at| now.saturating_duration_since(at) < ttl);
        before - self.admitted.len()
    }

    pub fn len(&self) -> usize {
        self.admitted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.admitted.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_repeat_within_ttl_is_suppressed() {
        let t0 = Instant::now();
        let mut cache = RecognitionCache::default();
        let s = PersonRef::student(1);

        assert!(cache.admit(s, t0));
        assert!(!cache.admit(s, t0 + secs(1)));
        assert!(!cache.admit(s, t0 + secs(299)));
    }

    #[test]
    fn test_readmitted_after_ttl() {
        let t0 = Instant::now();
        let mut cache = RecognitionCache::default();
        let s = PersonRef::student(1);

        assert!(cache.admit(s, t0));
        assert!(!cache.admit(s, t0 + secs(1)));
        assert!(cache.admit(s, t0 + secs(301)));
    }

    #[test]
    fn test_ttl_is_not_sliding() {
        let t0 = Instant::now();
        let mut cache = RecognitionCache::new(secs(10));
        let s = PersonRef::teacher(4);

        assert!(cache.admit(s, t0));
        // Suppressed sightings must not push the expiry out.
        for n in 1..10 {
            assert!(!cache.admit(s, t0 + secs(n)));
        }
        assert!(cache.admit(s, t0 + secs(10)));
    }

    #[test]
    fn test_keys_are_per_kind() {
        let t0 = Instant::now();
        let mut cache = RecognitionCache::default();

        assert!(cache.admit(PersonRef::student(5), t0));
        assert!(cache.admit(PersonRef::teacher(5), t0));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_forget_allows_immediate_retry() {
        let t0 = Instant::now();
        let mut cache = RecognitionCache::default();
        let s = PersonRef::student(9);

        assert!(cache.admit(s, t0));
        assert!(cache.forget(&s));
        assert!(cache.admit(s, t0 + secs(1)));
    }

    #[test]
    fn test_purge_expired() {
        let t0 = Instant::now();
        let mut cache = RecognitionCache::new(secs(60));
        cache.admit(PersonRef::student(1), t0);
        cache.admit(PersonRef::student(2), t0 + secs(30));

        assert_eq!(cache.purge_expired(t0 + secs(61)), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.is_suppressed(&PersonRef::student(2), t0 + secs(61)));
        assert_eq!(cache.purge_expired(t0 + secs(91)), 1);
        assert!(cache.is_empty());
    }
}
