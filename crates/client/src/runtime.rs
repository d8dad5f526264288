//! The client effects runtime (C9): serializes event application over the
//! pure reducer and executes the commands it returns.
//!
//! Events are processed one at a time through a single `tokio::sync::Mutex`
//! so the reducer's "at most one pending" invariant is never raced by two
//! concurrent callers. The reconnect timer is the one piece of state the
//! runtime itself owns: it always reads the *current* endpoint from the
//! state at fire-time rather than capturing it when the timer was scheduled,
//! so an intervening `ui.connect` to a different endpoint is honored.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{
    command::Command,
    event::Event,
    reducer::reduce,
    state::ReducerState,
};

/// Side effects the reducer asked for. Implemented once against the real
/// identity provider / HTTP client / websocket, and with an in-memory fake
/// in tests.
#[async_trait]
pub trait Effects: Send + Sync {
    async fn get_identity(&self, interactive: bool, clear_pref: bool);
    async fn exchange(&self, endpoint: String, access_token: String);
    async fn channel_open(&self, endpoint: String, token: String);
    async fn channel_close(&self, code: u16, reason: String);
    async fn reconnect_cancel(&self);
    async fn reconnect_schedule(&self, delay_ms: u64, fire: Box<dyn FnOnce() + Send>);
    async fn telemetry(&self, event: &'static str, fields: serde_json::Value);
    async fn raise(&self, message: String, code: Option<&'static str>);
}

/// Drives the reducer, serializing event application and dispatching the
/// resulting commands to an [`Effects`] implementation.
pub struct Runtime<E> {
    effects: Arc<E>,
    state: Mutex<ReducerState>,
}

impl<E: Effects + 'static> Runtime<E> {
    pub fn new(effects: Arc<E>) -> Arc<Self> {
        Arc::new(Self { effects, state: Mutex::new(ReducerState::default()) })
    }

    /// The current public-facing state, for UI rendering.
    pub async fn public_state(self: &Arc<Self>) -> crate::state::ClientConnState {
        self.state.lock().await.public.clone()
    }

    /// Applies `event` and runs every command the reducer emits, in order.
    pub async fn dispatch(self: &Arc<Self>, event: Event) {
        let commands = {
            let mut guard = self.state.lock().await;
            let (next, commands) = reduce(&guard, event);
            *guard = next;
            commands
        };
        for command in commands {
            self.run_command(command).await;
        }
    }

    async fn run_command(self: &Arc<Self>, command: Command) {
        match command {
            Command::GetIdentity { interactive, clear_pref } => {
                self.effects.get_identity(interactive, clear_pref).await;
            },
            Command::Exchange { endpoint, access_token } => {
                self.effects.exchange(endpoint, access_token).await;
            },
            Command::ChannelOpen { endpoint, token } => {
                self.effects.channel_open(endpoint, token).await;
            },
            Command::ChannelClose { code, reason } => {
                self.effects.channel_close(code, reason).await;
            },
            Command::ReconnectCancel => {
                self.effects.reconnect_cancel().await;
            },
            Command::ReconnectSchedule { delay_ms } => {
                let runtime = Arc::clone(self);
                self.effects
                    .reconnect_schedule(
                        delay_ms,
                        Box::new(move || {
                            tokio::spawn(async move {
                                // Read the endpoint live, at fire-time: a
                                // `ui.connect` issued after scheduling and
                                // before firing must win.
                                let endpoint = {
                                    let guard = runtime.state.lock().await;
                                    guard.pending.as_ref().and_then(crate::state::Pending::endpoint).map(str::to_string)
                                        .or_else(|| guard.public.endpoint().map(str::to_string))
                                };
                                if let Some(endpoint) = endpoint {
                                    runtime.dispatch(Event::TimerReconnectFired { endpoint }).await;
                                }
                            });
                        }),
                    )
                    .await;
            },
            Command::Telemetry { event, fields } => {
                self.effects.telemetry(event, fields).await;
            },
            Command::Raise { message, code } => {
                self.effects.raise(message, code).await;
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex as StdMutex};

    use super::*;

    #[derive(Default)]
    struct RecordingEffects {
        calls: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl Effects for RecordingEffects {
        async fn get_identity(&self, interactive: bool, clear_pref: bool) {
            self.calls.lock().unwrap().push(format!("get_identity({interactive},{clear_pref})"));
        }
        async fn exchange(&self, endpoint: String, _access_token: String) {
            self.calls.lock().unwrap().push(format!("exchange({endpoint})"));
        }
        async fn channel_open(&self, endpoint: String, _token: String) {
            self.calls.lock().unwrap().push(format!("channel_open({endpoint})"));
        }
        async fn channel_close(&self, code: u16, reason: String) {
            self.calls.lock().unwrap().push(format!("channel_close({code},{reason})"));
        }
        async fn reconnect_cancel(&self) {
            self.calls.lock().unwrap().push("reconnect_cancel".into());
        }
        async fn reconnect_schedule(&self, delay_ms: u64, _fire: Box<dyn FnOnce() + Send>) {
            self.calls.lock().unwrap().push(format!("reconnect_schedule({delay_ms})"));
        }
        async fn telemetry(&self, event: &'static str, _fields: serde_json::Value) {
            self.calls.lock().unwrap().push(format!("telemetry({event})"));
        }
        async fn raise(&self, message: String, _code: Option<&'static str>) {
            self.calls.lock().unwrap().push(format!("raise({message})"));
        }
    }

    #[tokio::test]
    async fn sign_in_dispatches_get_identity() {
        let effects = Arc::new(RecordingEffects::default());
        let runtime = Runtime::new(Arc::clone(&effects));
        runtime.dispatch(Event::UiSignIn).await;
        assert_eq!(effects.calls.lock().unwrap().as_slice(), ["get_identity(true,false)"]);
    }

    #[tokio::test]
    async fn events_serialize_through_a_single_mutex() {
        let effects = Arc::new(RecordingEffects::default());
        let runtime = Runtime::new(Arc::clone(&effects));
        let a = Arc::clone(&runtime);
        let b = Arc::clone(&runtime);
        let (_, _) = tokio::join!(a.dispatch(Event::UiSignIn), b.dispatch(Event::UiSignOut));
        // No panic, no lost update: both events were applied in some order.
        assert_eq!(effects.calls.lock().unwrap().len(), 2);
    }
}
