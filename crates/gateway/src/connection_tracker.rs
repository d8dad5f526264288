//! Per-user and per-room connection counting for the C3 handshake caps.
//!
//! Mirrors `state.rs`'s `clients: RwLock<HashMap<...>>` registry shape,
//! generalized to track counts instead of full connection records — the
//! handshake only needs "how many are there", not "who are they".

use std::collections::HashMap;

use tokio::sync::RwLock;

#[derive(Default)]
pub struct ConnectionTracker {
    per_user: RwLock<HashMap<String, u32>>,
}

impl ConnectionTracker {
    /// Returns the room-wide connection total.
    pub async fn total(&self) -> usize {
        self.per_user.read().await.values().map(|&n| n as usize).sum()
    }

    /// Returns the current connection count for `account_id`.
    pub async fn count_for(&self, account_id: &str) -> u32 {
        self.per_user.read().await.get(account_id).copied().unwrap_or(0)
    }

    /// Records a new connection for `account_id`.
    pub async fn acquire(&self, account_id: &str) {
        *self.per_user.write().await.entry(account_id.to_string()).or_insert(0) += 1;
    }

    /// Releases a connection for `account_id`, dropping the entry once its
    /// count reaches zero.
    pub async fn release(&self, account_id: &str) {
        let mut guard = self.per_user.write().await;
        if let Some(count) = guard.get_mut(account_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                guard.remove(account_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tracks_total_and_per_user_counts() {
        let tracker = ConnectionTracker::default();
        tracker.acquire("1").await;
        tracker.acquire("1").await;
        tracker.acquire("2").await;
        assert_eq!(tracker.total().await, 3);
        assert_eq!(tracker.count_for("1").await, 2);

        tracker.release("1").await;
        assert_eq!(tracker.count_for("1").await, 1);
        assert_eq!(tracker.total().await, 2);

        tracker.release("1").await;
        assert_eq!(tracker.count_for("1").await, 0);
        assert_eq!(tracker.total().await, 1);
    }
}
