//! Per-socket liveness heartbeat (C4).
//!
//! Spawned alongside a connection the same way `ws.rs`'s write loop is:
//! one `tokio::spawn`ed task per socket, stopped via a `CancellationToken`
//! when the connection tears down.

use std::{sync::Arc, time::Duration};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A running heartbeat task and the means to report an observed pong and to
/// stop it.
pub struct Heartbeat {
    cancel: CancellationToken,
    pong_notify: Arc<Notify>,
}

impl Heartbeat {
    /// Spawns the heartbeat task. Every `ping_interval`, `send_ping` is
    /// invoked; if no call to [`Heartbeat::on_pong`] lands within
    /// `pong_timeout` of that ping, `on_timeout` runs once and the task
    /// stops. `pong_timeout` is expected to be `>= ping_interval` (enforced
    /// by config validation, not re-checked here).
    pub fn spawn(
        conn_id: String,
        ping_interval: Duration,
        pong_timeout: Duration,
        send_ping: impl Fn() + Send + 'static,
        on_timeout: impl FnOnce() + Send + 'static,
    ) -> Self {
        let cancel = CancellationToken::new();
        let pong_notify = Arc::new(Notify::new());

        let task_cancel = cancel.clone();
        let task_pong_notify = Arc::clone(&pong_notify);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ping_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = task_cancel.cancelled() => {
                        debug!(conn_id = %conn_id, "heartbeat: stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        send_ping();
                        tokio::select! {
                            () = task_cancel.cancelled() => {
                                debug!(conn_id = %conn_id, "heartbeat: stopped");
                                return;
                            }
                            () = task_pong_notify.notified() => {}
                            () = tokio::time::sleep(pong_timeout) => {
                                debug!(conn_id = %conn_id, "heartbeat: pong timeout");
                                on_timeout();
                                return;
                            }
                        }
                    }
                }
            }
        });

        Self { cancel, pong_notify }
    }

    /// Call when a pong frame arrives for this socket.
    pub fn on_pong(&self) {
        self.pong_notify.notify_one();
    }

    /// Idempotent: stopping an already-stopped heartbeat is a no-op.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn pong_within_timeout_keeps_the_connection_alive() {
        let pings = Arc::new(AtomicU32::new(0));
        let timeouts = Arc::new(AtomicU32::new(0));
        let pings_clone = Arc::clone(&pings);
        let timeouts_clone = Arc::clone(&timeouts);

        let heartbeat = Heartbeat::spawn(
            "conn-1".into(),
            Duration::from_millis(100),
            Duration::from_millis(200),
            move || {
                pings_clone.fetch_add(1, Ordering::SeqCst);
            },
            move || {
                timeouts_clone.fetch_add(1, Ordering::SeqCst);
            },
        );

        tokio::time::advance(Duration::from_millis(100)).await;
        tokio::task::yield_now().await;
        assert_eq!(pings.load(Ordering::SeqCst), 1);
        heartbeat.on_pong();

        tokio::time::advance(Duration::from_millis(100)).await;
        tokio::task::yield_now().await;
        assert_eq!(pings.load(Ordering::SeqCst), 2);
        assert_eq!(timeouts.load(Ordering::SeqCst), 0);

        heartbeat.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn missed_pong_triggers_timeout() {
        let timeouts = Arc::new(AtomicU32::new(0));
        let timeouts_clone = Arc::clone(&timeouts);

        let heartbeat = Heartbeat::spawn(
            "conn-2".into(),
            Duration::from_millis(100),
            Duration::from_millis(150),
            || {},
            move || {
                timeouts_clone.fetch_add(1, Ordering::SeqCst);
            },
        );

        tokio::time::advance(Duration::from_millis(260)).await;
        tokio::task::yield_now().await;
        assert_eq!(timeouts.load(Ordering::SeqCst), 1);

        heartbeat.stop();
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let heartbeat = Heartbeat::spawn(
            "conn-3".into(),
            Duration::from_secs(30),
            Duration::from_secs(60),
            || {},
            || {},
        );
        heartbeat.stop();
        heartbeat.stop();
    }
}
