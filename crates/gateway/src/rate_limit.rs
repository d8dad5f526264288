//! Fixed-window rate-limit store (C5), bounded by LRU eviction.
//!
//! Used for both the per-IP connect-rate window (C3) and the per-account
//! message-rate window (C6). Unlike `request_throttle.rs`'s `DashMap`, this
//! store lives inside a single-writer room actor, so a plain `IndexMap`
//! suffices: insertion order doubles as recency order, letting the oldest
//! entry be evicted in O(1) once the map grows past its cap.

use std::time::{Duration, Instant};

use indexmap::IndexMap;

/// A fixed window: how many hits have landed since it opened.
#[derive(Debug, Clone, Copy)]
struct RateWindow {
    window_start: Instant,
    count: u32,
}

/// Outcome of a [`RateLimitStore::check`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Denied { retry_after_ms: u64 },
}

/// Bounded fixed-window counter store, keyed by an arbitrary hashable key
/// (account id or client IP).
pub struct RateLimitStore<K> {
    windows: IndexMap<K, RateWindow>,
    window: Duration,
    max_count: u32,
    capacity: usize,
}

impl<K: std::hash::Hash + Eq + Clone> RateLimitStore<K> {
    pub fn new(window: Duration, max_count: u32, capacity: usize) -> Self {
        Self {
            windows: IndexMap::new(),
            window,
            max_count,
            capacity: capacity.max(1),
        }
    }

    /// Check and record a hit for `key` at `now`. Evicts the oldest entry if
    /// the map would grow past `capacity`.
    pub fn check_at(&mut self, key: K, now: Instant) -> RateDecision {
        if let Some(existing) = self.windows.get_mut(&key) {
            let elapsed = now.saturating_duration_since(existing.window_start);
            if elapsed >= self.window {
                existing.window_start = now;
                existing.count = 1;
                return RateDecision::Allowed;
            }
            if existing.count < self.max_count {
                existing.count += 1;
                return RateDecision::Allowed;
            }
            let retry_after = self.window.saturating_sub(elapsed);
            return RateDecision::Denied {
                retry_after_ms: retry_after.as_millis() as u64,
            };
        }

        if self.windows.len() >= self.capacity {
            self.windows.shift_remove_index(0);
        }
        self.windows.insert(key, RateWindow {
            window_start: now,
            count: 1,
        });
        RateDecision::Allowed
    }

    pub fn check(&mut self, key: K) -> RateDecision {
        self.check_at(key, Instant::now())
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_max_count_then_denies() {
        let mut store = RateLimitStore::new(Duration::from_secs(10), 2, 16);
        let now = Instant::now();
        assert_eq!(store.check_at("a", now), RateDecision::Allowed);
        assert_eq!(store.check_at("a", now), RateDecision::Allowed);
        assert_eq!(
            store.check_at("a", now),
            RateDecision::Denied { retry_after_ms: 10_000 }
        );
    }

    #[test]
    fn window_resets_after_elapsed() {
        let mut store = RateLimitStore::new(Duration::from_secs(10), 1, 16);
        let now = Instant::now();
        assert_eq!(store.check_at("a", now), RateDecision::Allowed);
        assert_eq!(
            store.check_at("a", now + Duration::from_secs(1)),
            RateDecision::Denied { retry_after_ms: 9_000 }
        );
        assert_eq!(
            store.check_at("a", now + Duration::from_secs(11)),
            RateDecision::Allowed
        );
    }

    #[test]
    fn evicts_oldest_key_past_capacity() {
        let mut store = RateLimitStore::new(Duration::from_secs(10), 5, 2);
        let now = Instant::now();
        store.check_at("a", now);
        store.check_at("b", now);
        assert_eq!(store.len(), 2);
        store.check_at("c", now);
        assert_eq!(store.len(), 2);
        assert!(!store.windows.contains_key("a"));
        assert!(store.windows.contains_key("b"));
        assert!(store.windows.contains_key("c"));
    }

    #[test]
    fn keys_are_independent() {
        let mut store = RateLimitStore::new(Duration::from_secs(10), 1, 16);
        let now = Instant::now();
        assert_eq!(store.check_at("a", now), RateDecision::Allowed);
        assert_eq!(store.check_at("b", now), RateDecision::Allowed);
    }
}
